//! Canned accounting source for tests.
//!
//! Rows are registered with the date they should be attributed to; `fetch`
//! filters on the requested window and optional user exactly like the real
//! tool, and every call is recorded so tests can assert on windows and rate
//! of invocation.

use chrono::NaiveDate;

use super::AccountingSource;
use crate::error::{Error, Result};
use crate::model::RawJobRow;
use crate::units::normalize_username;

/// One recorded `fetch`/`fetch_users` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub user: Option<String>,
}

/// In-memory accounting source.
#[derive(Debug, Default)]
pub struct MockSource {
    rows: Vec<(NaiveDate, RawJobRow)>,
    fail_remaining: u32,
    pub calls: Vec<MockCall>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a row, attributed to `date` for window filtering.
    pub fn add_row(&mut self, date: NaiveDate, row: RawJobRow) {
        self.rows.push((date, row));
    }

    /// Makes the next `n` calls fail with a fetch error.
    pub fn fail_next(&mut self, n: u32) {
        self.fail_remaining = n;
    }

    fn check_failure(&mut self) -> Result<()> {
        if self.fail_remaining > 0 {
            self.fail_remaining -= 1;
            return Err(Error::Fetch {
                attempts: 1,
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    /// Convenience constructor for a completed-job row in the accounting
    /// tool's pipe-delimited field order.
    #[allow(clippy::too_many_arguments)]
    pub fn job_row(
        job_id: &str,
        user: &str,
        state: &str,
        elapsed_secs: u64,
        cpus: u64,
        nodes: u64,
        req_mem: &str,
        max_rss: &str,
        ave_rss: &str,
        tres: &str,
        end: NaiveDate,
    ) -> RawJobRow {
        let end_ts = format!("{}T12:00:00", end.format("%Y-%m-%d"));
        RawJobRow {
            job_id: job_id.to_string(),
            user: user.to_string(),
            state: state.to_string(),
            elapsed_raw: elapsed_secs.to_string(),
            alloc_cpus: cpus.to_string(),
            nnodes: nodes.to_string(),
            req_mem: req_mem.to_string(),
            max_rss: max_rss.to_string(),
            ave_rss: ave_rss.to_string(),
            alloc_tres: tres.to_string(),
            submit: end_ts.clone(),
            start: end_ts.clone(),
            end: end_ts,
        }
    }
}

impl AccountingSource for MockSource {
    fn fetch(
        &mut self,
        start: NaiveDate,
        end: NaiveDate,
        user: Option<&str>,
    ) -> Result<Vec<RawJobRow>> {
        self.calls.push(MockCall {
            start,
            end,
            user: user.map(str::to_string),
        });
        self.check_failure()?;

        Ok(self
            .rows
            .iter()
            .filter(|(date, row)| {
                *date >= start
                    && *date < end
                    && user.is_none_or(|u| normalize_username(&row.user) == u)
            })
            .map(|(_, row)| row.clone())
            .collect())
    }

    fn fetch_users(&mut self, start: NaiveDate, end: NaiveDate) -> Result<Vec<String>> {
        self.calls.push(MockCall {
            start,
            end,
            user: None,
        });
        self.check_failure()?;

        let mut users: Vec<String> = self
            .rows
            .iter()
            .filter(|(date, _)| *date >= start && *date < end)
            .map(|(_, row)| normalize_username(&row.user))
            .filter(|u| !u.is_empty())
            .collect();
        users.sort();
        users.dedup();
        Ok(users)
    }
}
