//! slurmboardd - cluster usage poller.
//!
//! Runs one poll tick for a cluster: lock, ingest the next window from the
//! accounting tool, fold into the shared rollup store and rebuild the
//! leaderboards. Scheduling repeated ticks is left to cron; the process
//! exits 0 on success, 3 when another poller holds the cluster lock, 1 on
//! any other failure.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use slurmboard_core::accounting::SacctSource;
use slurmboard_core::{Error, PollConfig, run_tick};

/// Cluster usage leaderboard poller.
#[derive(Parser)]
#[command(name = "slurmboardd", about = "Cluster usage leaderboard poller", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one poll tick for a cluster.
    Poll(PollArgs),
}

#[derive(clap::Args)]
struct PollArgs {
    /// Cluster name; owns clusters/<name>/ under the storage root.
    #[arg(long)]
    cluster: String,

    /// Shared storage root directory.
    #[arg(long)]
    root: PathBuf,

    /// First day of history to backfill.
    #[arg(long, default_value = "2020-01-01")]
    backfill_start: NaiveDate,

    /// Accounting tool calls allowed per minute.
    #[arg(long, default_value = "2")]
    rate_limit: u32,

    /// Perform exactly one tick and exit. Always on; looping is an external
    /// concern (cron). Disable attempts are rejected.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    once: bool,

    /// Home-directory tree to scan for candidate usernames.
    #[arg(long)]
    homes: Option<PathBuf>,

    /// Accounting binary to invoke.
    #[arg(long, default_value = "sacct")]
    sacct_bin: PathBuf,

    /// Accounting subprocess timeout in seconds.
    #[arg(long, default_value = "120")]
    timeout_secs: u64,

    /// Expected jobs per (cluster, month); sizes the dedupe filters.
    #[arg(long, default_value = "2000000")]
    expected_jobs: u64,

    /// Minimum job count before a user appears on leaderboards.
    #[arg(long, default_value = "3")]
    min_jobs: u64,

    /// Maximum targeted (user, month) backfill units drained per tick.
    #[arg(long, default_value = "12")]
    max_targeted_user_months: usize,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Installs the JSON log formatter. Every line is single-line JSON with the
/// event fields flattened to the top level.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("slurmboardd={}", level).parse().unwrap())
        .add_directive(format!("slurmboard_core={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .init();
}

/// Maps the engine error to the documented process exit code.
fn exit_code(err: &Error) -> i32 {
    match err {
        Error::LockHeld => 3,
        _ => 1,
    }
}

fn run_poll(args: PollArgs) -> i32 {
    info!(
        cluster = %args.cluster,
        root = %args.root.display(),
        backfill_start = %args.backfill_start,
        rate_limit = args.rate_limit,
        "slurmboardd {} starting",
        env!("CARGO_PKG_VERSION")
    );
    if !args.once {
        warn!("--once=false is not supported; running a single tick anyway");
    }

    // Graceful shutdown: the tick finishes its in-flight rename and skips
    // the remaining optional phases.
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!("failed to set signal handler: {}", e);
    }

    let cfg = PollConfig {
        cluster: args.cluster.clone(),
        root: args.root.clone(),
        backfill_start: args.backfill_start,
        homes: args.homes.clone(),
        expected_jobs: args.expected_jobs,
        min_jobs: args.min_jobs,
        max_targeted_user_months: args.max_targeted_user_months,
    };
    let mut source = SacctSource::new(
        &args.cluster,
        &args.sacct_bin,
        args.rate_limit,
        Duration::from_secs(args.timeout_secs),
    );

    match run_tick(&cfg, &mut source, &shutdown) {
        Ok(report) => {
            info!(
                cluster = %args.cluster,
                mode = report.mode,
                month = %report.month,
                jobs_seen = report.jobs_seen,
                jobs_new = report.jobs_new,
                new_users = report.new_users_enqueued,
                targeted_units = report.targeted_units_applied,
                leaderboards = report.leaderboards_written,
                "poll finished"
            );
            0
        }
        Err(e @ Error::LockHeld) => {
            info!(cluster = %args.cluster, "{}", e);
            3
        }
        Err(e) => {
            error!(cluster = %args.cluster, error = %e, "poll failed");
            exit_code(&e)
        }
    }
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Poll(args) => {
            init_logging(args.verbose, args.quiet);
            std::process::exit(run_poll(args));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn poll_args_parse_with_defaults() {
        let cli = Cli::parse_from([
            "slurmboardd",
            "poll",
            "--cluster",
            "fram",
            "--root",
            "/data/slurmboard",
        ]);
        let Command::Poll(args) = cli.command;
        assert_eq!(args.cluster, "fram");
        assert_eq!(args.rate_limit, 2);
        assert!(args.once);
        assert_eq!(args.timeout_secs, 120);
        assert_eq!(args.min_jobs, 3);
        assert_eq!(args.sacct_bin, PathBuf::from("sacct"));
        assert_eq!(
            args.backfill_start,
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()
        );
    }

    #[test]
    fn lock_held_maps_to_exit_3() {
        assert_eq!(exit_code(&Error::LockHeld), 3);
        assert_eq!(
            exit_code(&Error::Fetch {
                attempts: 5,
                message: "boom".to_string()
            }),
            1
        );
    }
}
