//! slurmboard-core — ingestion and aggregation engine for cluster usage
//! leaderboards.
//!
//! Provides:
//! - `accounting` — batch-accounting CLI adapter, rate limiting, mock source
//! - `normalize` / `units` — raw row parsing into normalized job records
//! - `dedupe` — file-backed bloom filter keyed by JobID
//! - `store` — monthly rollups and per-user all-time files, atomic writes
//! - `cursor` — backfill / current-month state machine
//! - `discovery` — new-user enumeration and targeted backfill queue
//! - `leaderboard` — cross-cluster ranked tables
//! - `poller` — the single-tick orchestrator the daemon drives
//!
//! The engine is single-threaded per cluster; all cross-host coordination
//! goes through `lock` and the atomic-rename persistence in `store`.

pub mod accounting;
pub mod cursor;
pub mod dedupe;
pub mod discovery;
pub mod error;
pub mod leaderboard;
pub mod lock;
pub mod model;
pub mod month;
pub mod normalize;
pub mod poller;
pub mod store;
pub mod units;

pub use error::{Error, Result};
pub use month::Month;
pub use poller::{PollConfig, TickReport, run_tick};
