//! One poller tick: the orchestrator.
//!
//! Everything a single invocation does, in order: take the cluster lock,
//! pick a window from the cursor, fetch and normalize, fold into the rollup
//! store, run discovery and drain targeted backfills, rebuild leaderboards,
//! advance the cursor. The lock is held for the whole tick and released by
//! drop on every exit path.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::accounting::AccountingSource;
use crate::cursor::{self, InProgress, Window};
use crate::discovery::{self, BackfillQueue};
use crate::error::Result;
use crate::leaderboard;
use crate::lock::ClusterLock;
use crate::model::NormalizedRecord;
use crate::month::Month;
use crate::normalize::normalize;
use crate::store::{RollupStore, StatePaths};

/// Engine-side configuration for one cluster's poller.
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub cluster: String,
    pub root: PathBuf,
    pub backfill_start: chrono::NaiveDate,
    pub homes: Option<PathBuf>,
    pub expected_jobs: u64,
    pub min_jobs: u64,
    /// Cap on targeted (user, month) units drained per tick.
    pub max_targeted_user_months: usize,
}

/// Summary of one completed tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub mode: &'static str,
    pub month: Month,
    pub jobs_seen: usize,
    pub jobs_new: usize,
    pub new_users_enqueued: usize,
    pub targeted_units_applied: usize,
    pub leaderboards_written: usize,
}

fn normalize_batch(rows: &[crate::model::RawJobRow]) -> Vec<NormalizedRecord> {
    rows.iter().filter_map(normalize).collect()
}

/// Runs one tick against the current wall clock.
pub fn run_tick(
    cfg: &PollConfig,
    source: &mut dyn AccountingSource,
    shutdown: &AtomicBool,
) -> Result<TickReport> {
    run_tick_at(cfg, source, shutdown, Utc::now())
}

/// Tick body with an injectable clock.
pub fn run_tick_at(
    cfg: &PollConfig,
    source: &mut dyn AccountingSource,
    shutdown: &AtomicBool,
    now: DateTime<Utc>,
) -> Result<TickReport> {
    let paths = StatePaths::new(&cfg.root, &cfg.cluster);
    let today = now.date_naive();

    // held until this function returns, on every path
    let _lock = ClusterLock::acquire(&paths.lock_file())?;

    let store = RollupStore::open(paths.clone(), cfg.expected_jobs)?;
    let mut cur = cursor::load_cursor(&paths, cfg.backfill_start)?;

    let window = cur.next_window(today);
    let (start, end) = window.bounds();
    let mode = match window {
        Window::Backfill(_) => "backfill",
        Window::CurrentMonth { .. } => "current-month",
    };
    info!(
        cluster = %cfg.cluster,
        phase = "window",
        mode,
        month = %window.month(),
        start = %start,
        end = %end,
        "tick window selected"
    );

    cur.in_progress = Some(InProgress {
        month: window.month(),
        phase: "fetch".to_string(),
    });
    cursor::save_cursor(&paths, &cur)?;

    let rows = source.fetch(start, end, None)?;

    cur.in_progress = Some(InProgress {
        month: window.month(),
        phase: "apply".to_string(),
    });
    cursor::save_cursor(&paths, &cur)?;

    let records = normalize_batch(&rows);
    let outcome = store.apply(window.month(), &records)?;
    info!(
        cluster = %cfg.cluster,
        phase = "apply",
        month = %window.month(),
        jobs_seen = outcome.jobs_seen,
        jobs_new = outcome.jobs_new,
        "window applied"
    );

    cur.complete_window(window, today);
    cursor::save_cursor(&paths, &cur)?;

    let mut report = TickReport {
        mode,
        month: window.month(),
        jobs_seen: outcome.jobs_seen,
        jobs_new: outcome.jobs_new,
        new_users_enqueued: 0,
        targeted_units_applied: 0,
        leaderboards_written: 0,
    };

    if shutdown.load(Ordering::SeqCst) {
        warn!(cluster = %cfg.cluster, "shutdown requested, skipping discovery");
        return Ok(report);
    }

    // discovery: enqueue unknown users, then drain within this tick's budget
    let mut queue = BackfillQueue::load(&paths)?;
    let new_users = discovery::discover_new_users(
        &store,
        source,
        &queue,
        cfg.homes.as_deref(),
        cfg.backfill_start,
        today,
    )?;
    for user in &new_users {
        info!(cluster = %cfg.cluster, phase = "discover", user = %user, "new user found");
        queue.enqueue_user(user, cfg.backfill_start, today);
    }
    report.new_users_enqueued = new_users.len();
    if !new_users.is_empty() {
        queue.save(&paths)?;
    }

    while report.targeted_units_applied < cfg.max_targeted_user_months
        && !shutdown.load(Ordering::SeqCst)
    {
        let Some(unit) = queue.units.pop_front() else {
            break;
        };
        let (start, end) = (unit.month.first_day(), unit.month.end_exclusive());
        let rows = source.fetch(start, end, Some(&unit.user))?;
        let records = normalize_batch(&rows);
        let outcome = store.apply(unit.month, &records)?;
        info!(
            cluster = %cfg.cluster,
            phase = "targeted-backfill",
            user = %unit.user,
            month = %unit.month,
            jobs_new = outcome.jobs_new,
            "targeted window applied"
        );
        // persist the shrunken queue after the unit's data is safe
        queue.save(&paths)?;
        report.targeted_units_applied += 1;
    }

    if shutdown.load(Ordering::SeqCst) {
        warn!(cluster = %cfg.cluster, "shutdown requested, skipping leaderboards");
        return Ok(report);
    }

    report.leaderboards_written = leaderboard::rebuild(&paths, cfg.min_jobs, now)?;

    info!(
        cluster = %cfg.cluster,
        phase = "tick",
        mode = report.mode,
        month = %report.month,
        jobs_seen = report.jobs_seen,
        jobs_new = report.jobs_new,
        new_users = report.new_users_enqueued,
        targeted_units = report.targeted_units_applied,
        leaderboards = report.leaderboards_written,
        "tick complete"
    );
    Ok(report)
}
