//! Rollup store: monthly per-user accumulators and per-user all-time files.
//!
//! All persistence goes through write-to-temp-then-rename in the same
//! directory. One `apply` persists in the mandated order — monthly rollup,
//! then touched user aggregates, then the dedupe set — so the monthly file is
//! always the source of truth and user files stay rederivable from it.

mod paths;

pub use paths::StatePaths;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::dedupe::{DEFAULT_FP_RATE, DedupeSet};
use crate::error::{Error, Result};
use crate::model::{MonthlyRollup, NormalizedRecord, UserAggregate, UserMonth};
use crate::month::Month;

/// `<name>.tmp` next to the target, so the rename never crosses a
/// filesystem boundary.
pub(crate) fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// `<name>.bad` next to the target; the latest corruption wins.
fn bad_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".bad");
    path.with_file_name(name)
}

/// Pretty-printed JSON via temp file + rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp_path = tmp_sibling(path);
    let mut file = std::fs::File::create(&tmp_path)?;
    serde_json::to_writer_pretty(&mut file, value)?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Reads a JSON artifact. `Ok(None)` when the file does not exist,
/// `Err(Error::Corrupt)` when it exists but does not parse.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&data).map(Some).map_err(|e| Error::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Moves a corrupt artifact aside so the next writer starts clean.
fn quarantine(path: &Path) {
    if !path.exists() {
        return;
    }
    let bad = bad_sibling(path);
    match std::fs::rename(path, &bad) {
        Ok(()) => warn!(path = %path.display(), "quarantined corrupt file to .bad"),
        Err(e) => warn!(path = %path.display(), error = %e, "failed to quarantine corrupt file"),
    }
}

/// Outcome of one `apply` batch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApplyOutcome {
    pub jobs_seen: usize,
    pub jobs_new: usize,
    pub touched_users: Vec<String>,
}

/// Writer for one cluster's rollup subtree. The caller serializes access via
/// the cluster lock; this type assumes it is the only writer.
pub struct RollupStore {
    paths: StatePaths,
    expected_jobs: u64,
}

impl RollupStore {
    /// Opens the store: creates the layout and removes stale `*.tmp` files
    /// left by a crashed writer (the recovery sweep).
    pub fn open(paths: StatePaths, expected_jobs: u64) -> Result<Self> {
        paths.ensure_layout()?;
        sweep_tmp_files(&paths.cluster_dir());
        Ok(Self {
            paths,
            expected_jobs,
        })
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    /// Whether an all-time aggregate exists for the user on this cluster.
    pub fn user_known(&self, username: &str) -> bool {
        self.paths.user_file(username).exists()
    }

    /// Loads the month's dedupe set and rollup accumulators together.
    ///
    /// Corruption of either file quarantines both: the dedupe set and the
    /// monthly rollup advance in lockstep, so a surviving half would either
    /// double-count (stale rollup) or drop jobs forever (stale dedupe).
    fn load_month_state(&self, month: Month) -> Result<(DedupeSet, BTreeMap<String, UserMonth>)> {
        let bloom_path = self.paths.bloom_file(month);
        let monthly_path = self.paths.monthly_file(month);
        let mut corrupt = false;

        let dedupe = match DedupeSet::load(&bloom_path) {
            Ok(d) => Some(d),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(Error::Corrupt { path, reason }) => {
                warn!(path = %path.display(), reason, "corrupt dedupe set");
                corrupt = true;
                None
            }
            Err(e) => return Err(e),
        };

        let rollup = match read_json::<MonthlyRollup>(&monthly_path) {
            Ok(r) => r,
            Err(Error::Corrupt { path, reason }) => {
                warn!(path = %path.display(), reason, "corrupt monthly rollup");
                corrupt = true;
                None
            }
            Err(e) => return Err(e),
        };

        if corrupt {
            quarantine(&bloom_path);
            quarantine(&monthly_path);
            return Ok((
                DedupeSet::with_capacity(self.expected_jobs, DEFAULT_FP_RATE),
                BTreeMap::new(),
            ));
        }

        let dedupe =
            dedupe.unwrap_or_else(|| DedupeSet::with_capacity(self.expected_jobs, DEFAULT_FP_RATE));
        let users = rollup
            .map(|r| {
                r.users
                    .into_iter()
                    .map(|u| (u.username.clone(), u))
                    .collect()
            })
            .unwrap_or_default();
        Ok((dedupe, users))
    }

    fn load_user_aggregate(&self, username: &str) -> Result<UserAggregate> {
        let path = self.paths.user_file(username);
        match read_json::<UserAggregate>(&path) {
            Ok(Some(agg)) => Ok(agg),
            Ok(None) => Ok(UserAggregate::new(username)),
            Err(Error::Corrupt { path: p, reason }) => {
                // user files are rederivable from monthly rollups; start
                // clean and let the next targeted backfill repopulate
                warn!(path = %p.display(), reason, "corrupt user aggregate");
                quarantine(&path);
                Ok(UserAggregate::new(username))
            }
            Err(e) => Err(e),
        }
    }

    /// Folds a batch of normalized records into the month, skipping JobIDs
    /// the dedupe set has already seen. Persists monthly rollup, then user
    /// aggregates, then the dedupe set; nothing is written when the batch
    /// contains no new jobs.
    pub fn apply(&self, month: Month, records: &[NormalizedRecord]) -> Result<ApplyOutcome> {
        let (mut dedupe, mut users) = self.load_month_state(month)?;

        let mut deltas: BTreeMap<String, UserMonth> = BTreeMap::new();
        let mut jobs_new = 0usize;

        for rec in records {
            if dedupe.add(&rec.job_id) {
                continue;
            }
            jobs_new += 1;
            users
                .entry(rec.username.clone())
                .or_insert_with(|| UserMonth::new(&rec.username))
                .add_record(rec);
            deltas
                .entry(rec.username.clone())
                .or_insert_with(|| UserMonth::new(&rec.username))
                .add_record(rec);
        }

        let outcome = ApplyOutcome {
            jobs_seen: records.len(),
            jobs_new,
            touched_users: deltas.keys().cloned().collect(),
        };

        if jobs_new == 0 {
            debug!(month = %month, jobs_seen = outcome.jobs_seen, "no new jobs, nothing persisted");
            return Ok(outcome);
        }

        let asof = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

        // (1) monthly rollup: the source of truth
        let rollup = MonthlyRollup {
            asof: asof.clone(),
            month: month.to_string(),
            users: users.into_values().collect(),
        };
        write_json_atomic(&self.paths.monthly_file(month), &rollup)?;

        // (2) per-user all-time files, deltas only
        for (username, delta) in &deltas {
            let mut agg = self.load_user_aggregate(username)?;
            agg.clusters
                .entry(self.paths.cluster().to_string())
                .or_default()
                .add_delta(delta, &asof);
            write_json_atomic(&self.paths.user_file(username), &agg)?;
        }

        // (3) dedupe set last: a crash before this point re-observes the
        // batch next tick instead of losing it
        dedupe.save(&self.paths.bloom_file(month))?;

        Ok(outcome)
    }

    /// Months with a persisted rollup, sorted ascending.
    pub fn months_with_data(&self) -> Result<Vec<Month>> {
        months_in_dir(&self.paths.monthly_dir())
    }
}

/// Recursively removes `*.tmp` files under `dir`; files only, directories
/// are never touched.
fn sweep_tmp_files(dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            sweep_tmp_files(&path);
        } else if path.extension().is_some_and(|ext| ext == "tmp") {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed stale temp file"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove temp file"),
            }
        }
    }
}

/// Month keys of the `YYYY-MM.json` files in a rollup directory. Foreign or
/// malformed names are ignored.
pub fn months_in_dir(dir: &Path) -> Result<Vec<Month>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut months: Vec<Month> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                path.file_stem()?.to_str()?.parse().ok()
            } else {
                None
            }
        })
        .collect();
    months.sort();
    Ok(months)
}

/// Read-only load of a monthly rollup, tolerating absence and corruption.
/// Used by the leaderboard merge, which must never mutate foreign clusters.
pub fn read_monthly_rollup(path: &Path) -> Option<MonthlyRollup> {
    match read_json(path) {
        Ok(r) => r,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable monthly rollup, skipped");
            None
        }
    }
}

/// Read-only load of a user aggregate, same tolerance as above.
pub fn read_user_aggregate(path: &Path) -> Option<UserAggregate> {
    match read_json(path) {
        Ok(r) => r,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable user aggregate, skipped");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RawJobRow;
    use crate::normalize::normalize;
    use tempfile::tempdir;

    fn records(lines: &[&str]) -> Vec<NormalizedRecord> {
        lines
            .iter()
            .filter_map(|l| RawJobRow::parse(l))
            .filter_map(|r| normalize(&r))
            .collect()
    }

    fn scenario_rows() -> Vec<NormalizedRecord> {
        records(&[
            "1|alice|COMPLETED|3600|4|1|4000Mc|2G|1G|billing=4|s|st|e",
            "2|alice|FAILED|1800|2|1|8Gn|0|0||s|st|e",
            "3|bob|COMPLETED|7200|1|1|1Gn|0|0|gres/gpu=2|s|st|e",
            "3.batch|bob|COMPLETED|7200|1|1|1Gn|0|0|gres/gpu=2|s|st|e",
        ])
    }

    fn open_store(root: &Path) -> RollupStore {
        RollupStore::open(StatePaths::new(root, "fram"), 10_000).unwrap()
    }

    fn month() -> Month {
        "2024-02".parse().unwrap()
    }

    #[test]
    fn apply_aggregates_the_basic_scenario() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        let recs = scenario_rows();
        // the step row was dropped during normalization
        assert_eq!(recs.len(), 3);

        let outcome = store.apply(month(), &recs).unwrap();
        assert_eq!(outcome.jobs_new, 3);
        assert_eq!(outcome.touched_users, ["alice", "bob"]);

        let rollup = read_monthly_rollup(&store.paths().monthly_file(month())).unwrap();
        assert_eq!(rollup.month, "2024-02");
        assert_eq!(rollup.users.len(), 2);

        let alice = &rollup.users[0];
        assert_eq!(alice.username, "alice");
        assert_eq!(alice.jobs, 2);
        assert_eq!(alice.gpu_jobs, 0);
        assert_eq!(alice.failed_jobs, 1);
        assert_eq!(alice.elapsed_hours, 1.5);
        assert_eq!(alice.clock_hours, 5.0);
        assert_eq!(alice.gpu_clock_hours, 0.0);
        assert_eq!(alice.sum_req_mem_mb, 24000.0);
        assert_eq!(alice.sum_avg_mem_mb, 1000.0);
        assert_eq!(alice.sum_max_mem_mb, 2000.0);

        let bob = &rollup.users[1];
        assert_eq!(bob.jobs, 1);
        assert_eq!(bob.gpu_jobs, 1);
        assert_eq!(bob.failed_jobs, 0);
        assert_eq!(bob.elapsed_hours, 2.0);
        assert_eq!(bob.clock_hours, 2.0);
        assert_eq!(bob.gpu_elapsed_hours, 2.0);
        assert_eq!(bob.gpu_clock_hours, 4.0);
        assert_eq!(bob.sum_req_mem_mb, 1000.0);

        let agg = read_user_aggregate(&store.paths().user_file("alice")).unwrap();
        let fram = &agg.clusters["fram"];
        assert_eq!(fram.counts.jobs, 2);
        assert_eq!(fram.totals.clock_hours, 5.0);
    }

    #[test]
    fn reapply_is_idempotent_and_byte_identical() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let recs = scenario_rows();

        store.apply(month(), &recs).unwrap();
        let monthly = std::fs::read(store.paths().monthly_file(month())).unwrap();
        let alice = std::fs::read(store.paths().user_file("alice")).unwrap();
        let bloom = std::fs::read(store.paths().bloom_file(month())).unwrap();

        let second = store.apply(month(), &recs).unwrap();
        assert_eq!(second.jobs_seen, 3);
        assert_eq!(second.jobs_new, 0);

        assert_eq!(monthly, std::fs::read(store.paths().monthly_file(month())).unwrap());
        assert_eq!(alice, std::fs::read(store.paths().user_file("alice")).unwrap());
        assert_eq!(bloom, std::fs::read(store.paths().bloom_file(month())).unwrap());
    }

    #[test]
    fn dedupe_records_every_applied_job() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        store.apply(month(), &scenario_rows()).unwrap();

        let dedupe = DedupeSet::load(&store.paths().bloom_file(month())).unwrap();
        for id in ["1", "2", "3"] {
            assert!(dedupe.contains(id), "job {} missing from dedupe", id);
        }
        assert_eq!(dedupe.inserted(), 3);
    }

    #[test]
    fn incremental_apply_only_adds_new_jobs() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        store.apply(month(), &scenario_rows()).unwrap();

        // overlapping re-fetch: two old jobs plus one new one
        let mut batch = scenario_rows();
        batch.extend(records(&[
            "4|alice|COMPLETED|3600|1|1|1Gn|0|0||s|st|e",
        ]));
        let outcome = store.apply(month(), &batch).unwrap();
        assert_eq!(outcome.jobs_new, 1);
        assert_eq!(outcome.touched_users, ["alice"]);

        let rollup = read_monthly_rollup(&store.paths().monthly_file(month())).unwrap();
        let alice = rollup.users.iter().find(|u| u.username == "alice").unwrap();
        assert_eq!(alice.jobs, 3);
        assert_eq!(alice.clock_hours, 6.0);
    }

    #[test]
    fn aggregate_equals_sum_of_monthly_rollups() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let feb: Month = "2024-02".parse().unwrap();
        let mar: Month = "2024-03".parse().unwrap();

        store.apply(feb, &scenario_rows()).unwrap();
        store
            .apply(mar, &records(&["10|alice|COMPLETED|7200|2|1|1Gn|0|0||s|st|e"]))
            .unwrap();

        let mut expect = UserMonth::new("alice");
        for m in [feb, mar] {
            let rollup = read_monthly_rollup(&store.paths().monthly_file(m)).unwrap();
            if let Some(u) = rollup.users.iter().find(|u| u.username == "alice") {
                expect.add(u);
            }
        }

        let agg = read_user_aggregate(&store.paths().user_file("alice")).unwrap();
        let fram = &agg.clusters["fram"];
        assert_eq!(fram.counts.jobs, expect.jobs);
        assert_eq!(fram.counts.failed_jobs, expect.failed_jobs);
        assert_eq!(fram.totals.elapsed_hours, expect.elapsed_hours);
        assert_eq!(fram.totals.clock_hours, expect.clock_hours);
        assert_eq!(fram.totals.sum_req_mem_mb, expect.sum_req_mem_mb);
    }

    #[test]
    fn corrupt_dedupe_quarantines_the_month_pair() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        store.apply(month(), &scenario_rows()).unwrap();

        // clobber the bloom header
        std::fs::write(store.paths().bloom_file(month()), b"garbage").unwrap();

        // the re-fetch of the whole month rebuilds both files from scratch
        let outcome = store.apply(month(), &scenario_rows()).unwrap();
        assert_eq!(outcome.jobs_new, 3);

        let rollup = read_monthly_rollup(&store.paths().monthly_file(month())).unwrap();
        let alice = rollup.users.iter().find(|u| u.username == "alice").unwrap();
        // not double counted
        assert_eq!(alice.jobs, 2);

        let bloom_bad = store.paths().bloom_file(month());
        let monthly_bad = store.paths().monthly_file(month());
        assert!(bad_exists(&bloom_bad));
        assert!(bad_exists(&monthly_bad));
    }

    fn bad_exists(path: &Path) -> bool {
        bad_sibling(path).exists()
    }

    #[test]
    fn open_sweeps_stale_temp_files() {
        let dir = tempdir().unwrap();
        let paths = StatePaths::new(dir.path(), "fram");
        paths.ensure_layout().unwrap();
        let stale_monthly = tmp_sibling(&paths.monthly_file(month()));
        let stale_user = tmp_sibling(&paths.user_file("alice"));
        std::fs::write(&stale_monthly, b"{").unwrap();
        std::fs::write(&stale_user, b"{").unwrap();

        let _store = RollupStore::open(paths, 10_000).unwrap();
        assert!(!stale_monthly.exists());
        assert!(!stale_user.exists());
    }

    #[test]
    fn months_with_data_lists_sorted_keys() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let mar: Month = "2024-03".parse().unwrap();
        let jan: Month = "2024-01".parse().unwrap();
        store.apply(mar, &scenario_rows()).unwrap();
        store
            .apply(jan, &records(&["20|bob|COMPLETED|60|1|1|1Gn|0|0||s|st|e"]))
            .unwrap();

        assert_eq!(store.months_with_data().unwrap(), [jan, mar]);
    }
}
