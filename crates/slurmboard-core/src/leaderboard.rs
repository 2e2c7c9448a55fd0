//! Leaderboard builder: merges every cluster's rollups into ranked tables.
//!
//! Reads all cluster subtrees under the root (foreign clusters strictly
//! read-only), applies the opt-out and minimum-jobs policies, and writes one
//! JSON artifact per (window, metric) pair into the root leaderboards
//! directory.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use tracing::{debug, info};

use crate::error::Result;
use crate::model::{ClusterAggregate, Leaderboard, LeaderboardRow, UserMonth};
use crate::month::Month;
use crate::store::{self, StatePaths};

/// The five ranked metrics, in file-name order.
pub const METRICS: [&str; 5] = [
    "clock_hours",
    "elapsed_hours",
    "gpu_clock_hours",
    "gpu_elapsed_hours",
    "failed_jobs",
];

/// The three ranking windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Alltime,
    Rolling30d,
    Rolling365d,
}

impl WindowKind {
    pub const ALL: [WindowKind; 3] = [
        WindowKind::Alltime,
        WindowKind::Rolling30d,
        WindowKind::Rolling365d,
    ];

    pub fn name(self) -> &'static str {
        match self {
            WindowKind::Alltime => "alltime",
            WindowKind::Rolling30d => "rolling-30d",
            WindowKind::Rolling365d => "rolling-365d",
        }
    }

    fn days(self) -> Option<i64> {
        match self {
            WindowKind::Alltime => None,
            WindowKind::Rolling30d => Some(30),
            WindowKind::Rolling365d => Some(365),
        }
    }
}

/// Per-user totals for one window, summed across clusters.
type WindowTotals = BTreeMap<String, UserMonth>;

fn aggregate_as_usermonth(username: &str, agg: &ClusterAggregate) -> UserMonth {
    UserMonth {
        username: username.to_string(),
        jobs: agg.counts.jobs,
        gpu_jobs: agg.counts.gpu_jobs,
        failed_jobs: agg.counts.failed_jobs,
        elapsed_hours: agg.totals.elapsed_hours,
        clock_hours: agg.totals.clock_hours,
        gpu_elapsed_hours: agg.totals.gpu_elapsed_hours,
        gpu_clock_hours: agg.totals.gpu_clock_hours,
        sum_req_mem_mb: agg.totals.sum_req_mem_mb,
        sum_avg_mem_mb: agg.totals.sum_avg_mem_mb,
        sum_max_mem_mb: agg.totals.sum_max_mem_mb,
    }
}

/// Names of every cluster subtree under the root.
fn list_clusters(paths: &StatePaths) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(paths.clusters_root()) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut clusters: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    clusters.sort();
    Ok(clusters)
}

/// Usernames excluded from every published table.
fn load_optout(paths: &StatePaths) -> BTreeSet<String> {
    let Ok(data) = std::fs::read_to_string(paths.optout_file()) else {
        return BTreeSet::new();
    };
    data.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| crate::units::normalize_username(l))
        .collect()
}

/// All-time totals: the per-user aggregate files, each cluster contributing
/// its own slice only (the reconstruction invariant makes this equivalent to
/// summing the monthly rollups).
fn alltime_totals(paths: &StatePaths, clusters: &[String]) -> Result<WindowTotals> {
    let mut totals: WindowTotals = BTreeMap::new();
    for cluster in clusters {
        let cluster_paths = paths.for_cluster(cluster);
        let entries = match std::fs::read_dir(cluster_paths.users_dir()) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            let Some(agg) = store::read_user_aggregate(&path) else {
                continue;
            };
            if let Some(slice) = agg.clusters.get(cluster) {
                totals
                    .entry(agg.username.clone())
                    .or_insert_with(|| UserMonth::new(&agg.username))
                    .add(&aggregate_as_usermonth(&agg.username, slice));
            }
        }
    }
    Ok(totals)
}

/// Months each cluster contributes to a rolling window: months overlapping
/// `[today - days, today]`, plus — for the 30-day table — the two most
/// recent months with any data, so a month boundary never empties it.
fn rolling_months(
    paths: &StatePaths,
    clusters: &[String],
    window: WindowKind,
    today: NaiveDate,
) -> Result<BTreeSet<Month>> {
    let days = window.days().unwrap_or(0);
    let window_start = today - Duration::days(days);

    let mut all_data_months: BTreeSet<Month> = BTreeSet::new();
    for cluster in clusters {
        let dir = paths.for_cluster(cluster).monthly_dir();
        all_data_months.extend(store::months_in_dir(&dir)?);
    }

    let mut selected: BTreeSet<Month> = all_data_months
        .iter()
        .copied()
        .filter(|m| m.overlaps(window_start, today))
        .collect();

    if window == WindowKind::Rolling30d {
        selected.extend(all_data_months.iter().rev().take(2));
    }
    Ok(selected)
}

/// Rolling-window totals summed from the selected monthly rollups.
fn rolling_totals(
    paths: &StatePaths,
    clusters: &[String],
    months: &BTreeSet<Month>,
) -> WindowTotals {
    let mut totals: WindowTotals = BTreeMap::new();
    for cluster in clusters {
        let cluster_paths = paths.for_cluster(cluster);
        for month in months {
            let Some(rollup) = store::read_monthly_rollup(&cluster_paths.monthly_file(*month))
            else {
                continue;
            };
            for user in &rollup.users {
                totals
                    .entry(user.username.clone())
                    .or_insert_with(|| UserMonth::new(&user.username))
                    .add(user);
            }
        }
    }
    totals
}

/// Ranks one metric: descending by value, ascending username on ties,
/// contiguous 1-based ranks.
fn rank_rows(
    totals: &WindowTotals,
    metric: &str,
    optout: &BTreeSet<String>,
    min_jobs: u64,
) -> Vec<LeaderboardRow> {
    let mut rows: Vec<LeaderboardRow> = totals
        .values()
        .filter(|u| u.jobs >= min_jobs && !optout.contains(&u.username))
        .map(|u| LeaderboardRow {
            rank: 0,
            user: u.username.clone(),
            value: u.metric(metric),
        })
        .collect();
    rows.sort_by(|a, b| {
        b.value
            .partial_cmp(&a.value)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.user.cmp(&b.user))
    });
    for (i, row) in rows.iter_mut().enumerate() {
        row.rank = (i + 1) as u64;
    }
    rows
}

/// Rebuilds all fifteen leaderboard files. Returns the number written.
pub fn rebuild(paths: &StatePaths, min_jobs: u64, now: DateTime<Utc>) -> Result<usize> {
    let clusters = list_clusters(paths)?;
    let optout = load_optout(paths);
    let today = now.date_naive();
    let asof = now.to_rfc3339_opts(SecondsFormat::Secs, true);

    std::fs::create_dir_all(paths.leaderboards_dir())?;

    let mut written = 0usize;
    for window in WindowKind::ALL {
        let totals = match window {
            WindowKind::Alltime => alltime_totals(paths, &clusters)?,
            _ => {
                let months = rolling_months(paths, &clusters, window, today)?;
                debug!(window = window.name(), months = months.len(), "rolling window months");
                rolling_totals(paths, &clusters, &months)
            }
        };
        for metric in METRICS {
            let board = Leaderboard {
                asof: asof.clone(),
                window: window.name().to_string(),
                metric: metric.to_string(),
                rows: rank_rows(&totals, metric, &optout, min_jobs),
            };
            let file = paths
                .leaderboards_dir()
                .join(format!("{}_{}.json", window.name(), metric));
            store::write_json_atomic(&file, &board)?;
            written += 1;
        }
    }
    info!(files = written, clusters = clusters.len(), "leaderboards rebuilt");
    Ok(written)
}
