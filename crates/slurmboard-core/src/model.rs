//! Record shapes shared across the ingestion pipeline.
//!
//! `RawJobRow` is the accounting tool's pipe-delimited line split into named
//! fields; `NormalizedRecord` is the transient per-job form the rollup store
//! consumes. The persisted JSON shapes (monthly rollups, user aggregates,
//! leaderboards) live here too so every writer and reader agrees on them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Field order requested from the accounting tool with `-o`.
pub const ACCOUNTING_FIELDS: &str =
    "JobID,User,State,ElapsedRaw,AllocCPUS,NNodes,ReqMem,MaxRSS,AveRSS,AllocTRES,Submit,Start,End";

const FIELD_COUNT: usize = 13;

/// One raw accounting row, fields still unparsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawJobRow {
    pub job_id: String,
    pub user: String,
    pub state: String,
    pub elapsed_raw: String,
    pub alloc_cpus: String,
    pub nnodes: String,
    pub req_mem: String,
    pub max_rss: String,
    pub ave_rss: String,
    pub alloc_tres: String,
    pub submit: String,
    pub start: String,
    pub end: String,
}

impl RawJobRow {
    /// Splits one pipe-delimited line into a row. Lines with the wrong field
    /// count are not rows (header noise, truncated output) and yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() != FIELD_COUNT {
            return None;
        }
        Some(Self {
            job_id: fields[0].to_string(),
            user: fields[1].to_string(),
            state: fields[2].to_string(),
            elapsed_raw: fields[3].to_string(),
            alloc_cpus: fields[4].to_string(),
            nnodes: fields[5].to_string(),
            req_mem: fields[6].to_string(),
            max_rss: fields[7].to_string(),
            ave_rss: fields[8].to_string(),
            alloc_tres: fields[9].to_string(),
            submit: fields[10].to_string(),
            start: fields[11].to_string(),
            end: fields[12].to_string(),
        })
    }
}

/// A normalized job record. Transient: never persisted, only folded into
/// accumulators.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub job_id: String,
    pub username: String,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub elapsed_hours: f64,
    pub alloc_cpus: u64,
    pub nnodes: u64,
    pub clock_hours: f64,
    pub gpu_count: u64,
    pub gpu_elapsed_hours: f64,
    pub gpu_clock_hours: f64,
    pub req_mem_mb: f64,
    pub avg_mem_mb: f64,
    pub max_mem_mb: f64,
    pub failed: bool,
}

/// Per-user accumulator within one monthly rollup.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserMonth {
    pub username: String,
    pub jobs: u64,
    pub gpu_jobs: u64,
    pub failed_jobs: u64,
    pub elapsed_hours: f64,
    pub clock_hours: f64,
    pub gpu_elapsed_hours: f64,
    pub gpu_clock_hours: f64,
    pub sum_req_mem_mb: f64,
    pub sum_avg_mem_mb: f64,
    pub sum_max_mem_mb: f64,
}

impl UserMonth {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            ..Self::default()
        }
    }

    /// Folds one job into the accumulator. Counters only ever grow.
    pub fn add_record(&mut self, rec: &NormalizedRecord) {
        self.jobs += 1;
        if rec.gpu_count > 0 {
            self.gpu_jobs += 1;
        }
        if rec.failed {
            self.failed_jobs += 1;
        }
        self.elapsed_hours += rec.elapsed_hours;
        self.clock_hours += rec.clock_hours;
        self.gpu_elapsed_hours += rec.gpu_elapsed_hours;
        self.gpu_clock_hours += rec.gpu_clock_hours;
        self.sum_req_mem_mb += rec.req_mem_mb;
        self.sum_avg_mem_mb += rec.avg_mem_mb;
        self.sum_max_mem_mb += rec.max_mem_mb;
    }

    /// Adds another accumulator's values into this one (delta application).
    pub fn add(&mut self, other: &UserMonth) {
        self.jobs += other.jobs;
        self.gpu_jobs += other.gpu_jobs;
        self.failed_jobs += other.failed_jobs;
        self.elapsed_hours += other.elapsed_hours;
        self.clock_hours += other.clock_hours;
        self.gpu_elapsed_hours += other.gpu_elapsed_hours;
        self.gpu_clock_hours += other.gpu_clock_hours;
        self.sum_req_mem_mb += other.sum_req_mem_mb;
        self.sum_avg_mem_mb += other.sum_avg_mem_mb;
        self.sum_max_mem_mb += other.sum_max_mem_mb;
    }

    /// Value of one additive metric by its leaderboard name.
    pub fn metric(&self, name: &str) -> f64 {
        match name {
            "clock_hours" => self.clock_hours,
            "elapsed_hours" => self.elapsed_hours,
            "gpu_clock_hours" => self.gpu_clock_hours,
            "gpu_elapsed_hours" => self.gpu_elapsed_hours,
            "failed_jobs" => self.failed_jobs as f64,
            _ => 0.0,
        }
    }
}

/// Persisted per-(cluster, month) rollup. Usernames are unique and sorted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyRollup {
    pub asof: String,
    pub month: String,
    pub users: Vec<UserMonth>,
}

/// Job counters inside a user aggregate.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregateCounts {
    pub jobs: u64,
    pub gpu_jobs: u64,
    pub failed_jobs: u64,
}

/// Hour/memory totals inside a user aggregate.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregateTotals {
    pub elapsed_hours: f64,
    pub clock_hours: f64,
    pub gpu_elapsed_hours: f64,
    pub gpu_clock_hours: f64,
    pub sum_req_mem_mb: f64,
    pub sum_avg_mem_mb: f64,
    pub sum_max_mem_mb: f64,
}

/// Per-cluster slice of a user's all-time aggregate. Only the owning
/// cluster's poller ever writes its own slice.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClusterAggregate {
    pub asof: String,
    pub counts: AggregateCounts,
    pub totals: AggregateTotals,
}

impl ClusterAggregate {
    /// Applies a monthly delta. Invariant: totals stay equal to the sum of
    /// this user's monthly rollup entries on this cluster.
    pub fn add_delta(&mut self, delta: &UserMonth, asof: &str) {
        self.counts.jobs += delta.jobs;
        self.counts.gpu_jobs += delta.gpu_jobs;
        self.counts.failed_jobs += delta.failed_jobs;
        self.totals.elapsed_hours += delta.elapsed_hours;
        self.totals.clock_hours += delta.clock_hours;
        self.totals.gpu_elapsed_hours += delta.gpu_elapsed_hours;
        self.totals.gpu_clock_hours += delta.gpu_clock_hours;
        self.totals.sum_req_mem_mb += delta.sum_req_mem_mb;
        self.totals.sum_avg_mem_mb += delta.sum_avg_mem_mb;
        self.totals.sum_max_mem_mb += delta.sum_max_mem_mb;
        self.asof = asof.to_string();
    }

    pub fn metric(&self, name: &str) -> f64 {
        match name {
            "clock_hours" => self.totals.clock_hours,
            "elapsed_hours" => self.totals.elapsed_hours,
            "gpu_clock_hours" => self.totals.gpu_clock_hours,
            "gpu_elapsed_hours" => self.totals.gpu_elapsed_hours,
            "failed_jobs" => self.counts.failed_jobs as f64,
            _ => 0.0,
        }
    }
}

/// Persisted per-(cluster, user) all-time file. The map is keyed by cluster
/// name; a BTreeMap keeps serialization order stable across rewrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAggregate {
    pub schema_version: u32,
    pub username: String,
    pub clusters: BTreeMap<String, ClusterAggregate>,
}

impl UserAggregate {
    pub const SCHEMA_VERSION: u32 = 1;

    pub fn new(username: &str) -> Self {
        Self {
            schema_version: Self::SCHEMA_VERSION,
            username: username.to_string(),
            clusters: BTreeMap::new(),
        }
    }
}

/// One ranked leaderboard row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardRow {
    pub rank: u64,
    pub user: String,
    pub value: f64,
}

/// Persisted leaderboard artifact for one (window, metric) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leaderboard {
    pub asof: String,
    pub window: String,
    pub metric: String,
    pub rows: Vec<LeaderboardRow>,
}
