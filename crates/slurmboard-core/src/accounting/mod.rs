//! Accounting tool adapter.
//!
//! The site's batch-accounting CLI is the only upstream data source. The
//! `AccountingSource` trait abstracts it so the pipeline can run against the
//! real subprocess or the mock in tests; `SacctSource` is the production
//! implementation with rate limiting, a subprocess timeout and exponential
//! backoff on failure.

pub mod mock;
mod rate;

pub use mock::MockSource;
pub use rate::TokenBucket;

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::{ACCOUNTING_FIELDS, RawJobRow};
use crate::units::normalize_username;

/// A source of raw accounting rows for one cluster.
pub trait AccountingSource {
    /// Completed jobs with an end time in `[start, end)`, both UTC dates,
    /// optionally restricted to one user.
    fn fetch(
        &mut self,
        start: NaiveDate,
        end: NaiveDate,
        user: Option<&str>,
    ) -> Result<Vec<RawJobRow>>;

    /// Distinct normalized usernames with any job in `[start, end)`. Used by
    /// discovery.
    fn fetch_users(&mut self, start: NaiveDate, end: NaiveDate) -> Result<Vec<String>>;
}

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Delay before retry `attempt` (1-based): 2s, 4s, 8s, ... capped at 60s.
fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u32 << (attempt - 1).min(16);
    (BACKOFF_BASE * factor).min(BACKOFF_CAP)
}

struct CallOutcome {
    exit_code: Option<i32>,
    timed_out: bool,
    stdout: String,
    stderr: String,
    duration: Duration,
}

/// Production adapter invoking the accounting binary as a subprocess.
pub struct SacctSource {
    cluster: String,
    binary: PathBuf,
    bucket: TokenBucket,
    timeout: Duration,
}

impl SacctSource {
    pub fn new(
        cluster: &str,
        binary: impl Into<PathBuf>,
        calls_per_minute: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            cluster: cluster.to_string(),
            binary: binary.into(),
            bucket: TokenBucket::per_minute(calls_per_minute),
            timeout,
        }
    }

    /// Runs one subprocess invocation with the configured timeout. The child
    /// is killed and reaped if it outlives the deadline.
    fn run_once(&self, args: &[String]) -> std::io::Result<CallOutcome> {
        let started = Instant::now();
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let Some(mut out_pipe) = child.stdout.take() else {
            return Err(std::io::Error::other("child stdout was not captured"));
        };
        let Some(mut err_pipe) = child.stderr.take() else {
            return Err(std::io::Error::other("child stderr was not captured"));
        };

        // Drain the pipes off-thread so a chatty child never deadlocks
        // against the try_wait polling below.
        let out_reader = std::thread::spawn(move || {
            let mut buf = String::new();
            out_pipe.read_to_string(&mut buf).map(|_| buf)
        });
        let err_reader = std::thread::spawn(move || {
            let mut buf = String::new();
            err_pipe.read_to_string(&mut buf).map(|_| buf)
        });

        let deadline = started + self.timeout;
        let mut timed_out = false;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }
            if Instant::now() >= deadline {
                timed_out = true;
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
            std::thread::sleep(Duration::from_millis(100));
        };

        let stdout = out_reader
            .join()
            .map_err(|_| std::io::Error::other("stdout reader panicked"))??;
        let stderr = err_reader
            .join()
            .map_err(|_| std::io::Error::other("stderr reader panicked"))??;

        Ok(CallOutcome {
            exit_code: status.and_then(|s| s.code()),
            timed_out,
            stdout,
            stderr,
            duration: started.elapsed(),
        })
    }

    /// Rate-limited, retried invocation. Returns stdout on success.
    fn call(
        &mut self,
        phase: &str,
        start: NaiveDate,
        end: NaiveDate,
        args: Vec<String>,
    ) -> Result<String> {
        let mut last_message = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            self.bucket.acquire();

            let outcome = match self.run_once(&args) {
                Ok(o) => o,
                Err(e) => {
                    // spawn failure (binary missing, fork error): still transient
                    warn!(
                        cluster = %self.cluster,
                        phase,
                        attempt,
                        error = %e,
                        "accounting invocation failed to start"
                    );
                    last_message = e.to_string();
                    if attempt < MAX_ATTEMPTS {
                        std::thread::sleep(backoff_delay(attempt));
                    }
                    continue;
                }
            };

            info!(
                cluster = %self.cluster,
                phase,
                start = %start,
                end = %end,
                exit_code = outcome.exit_code,
                duration_ms = outcome.duration.as_millis() as u64,
                "accounting call"
            );

            if !outcome.timed_out && outcome.exit_code == Some(0) {
                return Ok(outcome.stdout);
            }

            last_message = if outcome.timed_out {
                format!("timed out after {:?}", self.timeout)
            } else {
                let mut msg = outcome.stderr.trim().to_string();
                msg.truncate(200);
                format!("exit code {:?}: {}", outcome.exit_code, msg)
            };
            warn!(
                cluster = %self.cluster,
                phase,
                attempt,
                error = %last_message,
                "accounting call failed"
            );
            if attempt < MAX_ATTEMPTS {
                std::thread::sleep(backoff_delay(attempt));
            }
        }

        Err(Error::Fetch {
            attempts: MAX_ATTEMPTS,
            message: last_message,
        })
    }

    fn window_args(start: NaiveDate, end: NaiveDate, fields: &str) -> Vec<String> {
        vec![
            "-a".to_string(),
            "-n".to_string(),
            "-P".to_string(),
            "-S".to_string(),
            start.format("%Y-%m-%d").to_string(),
            "-E".to_string(),
            end.format("%Y-%m-%d").to_string(),
            "-o".to_string(),
            fields.to_string(),
        ]
    }
}

impl AccountingSource for SacctSource {
    fn fetch(
        &mut self,
        start: NaiveDate,
        end: NaiveDate,
        user: Option<&str>,
    ) -> Result<Vec<RawJobRow>> {
        let mut args = Self::window_args(start, end, ACCOUNTING_FIELDS);
        if let Some(u) = user {
            args.push("-u".to_string());
            args.push(u.to_string());
        }

        let stdout = self.call("fetch", start, end, args)?;
        let mut rows = Vec::new();
        let mut malformed = 0usize;
        for line in stdout.lines() {
            if line.is_empty() {
                continue;
            }
            match RawJobRow::parse(line) {
                Some(row) => rows.push(row),
                None => malformed += 1,
            }
        }
        if malformed > 0 {
            warn!(
                cluster = %self.cluster,
                malformed,
                "skipped rows with unexpected field count"
            );
        }
        Ok(rows)
    }

    fn fetch_users(&mut self, start: NaiveDate, end: NaiveDate) -> Result<Vec<String>> {
        let args = Self::window_args(start, end, "User");
        let stdout = self.call("discover", start, end, args)?;
        let mut users: Vec<String> = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(normalize_username)
            .collect();
        users.sort();
        users.dedup();
        Ok(users)
    }
}
