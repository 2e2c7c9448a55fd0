//! Raw row → normalized record.
//!
//! Job steps (dotted JobIDs) are discarded outright; rows with an
//! unparseable elapsed time are logged and skipped; memory fields degrade to
//! zero contributions without rejecting the row.

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, warn};

use crate::model::{NormalizedRecord, RawJobRow};
use crate::units::{self, ReqMemPer};

/// Job states counted as failures. CANCELLED is deliberate, not a failure.
const FAILED_STATES: [&str; 5] = [
    "FAILED",
    "NODE_FAIL",
    "OUT_OF_MEMORY",
    "PREEMPTED",
    "TIMEOUT",
];

/// Classifies a state string. The tool may append a qualifier
/// (`CANCELLED by 1234`), so only the first token matters.
fn is_failed_state(state: &str) -> bool {
    let first = state.split_whitespace().next().unwrap_or("");
    FAILED_STATES.contains(&first)
}

/// End timestamps come as `YYYY-MM-DDTHH:MM:SS` in UTC; `Unknown` or empty
/// is normal for in-flight jobs.
fn parse_end_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Produces a `NormalizedRecord` from a raw row, or `None` when the row is
/// not an ingestible job (a step, a row without a user, or one whose elapsed
/// time cannot be read).
pub fn normalize(row: &RawJobRow) -> Option<NormalizedRecord> {
    // steps carry a dotted id and duplicate their parent's resources
    if row.job_id.contains('.') {
        return None;
    }

    let username = units::normalize_username(&row.user);
    if username.is_empty() {
        debug!(job_id = %row.job_id, "row without a user, skipped");
        return None;
    }

    let Ok(elapsed_secs) = row.elapsed_raw.trim().parse::<u64>() else {
        warn!(
            job_id = %row.job_id,
            elapsed_raw = %row.elapsed_raw,
            "unparseable ElapsedRaw, row skipped"
        );
        return None;
    };
    let elapsed_hours = elapsed_secs as f64 / 3600.0;

    let alloc_cpus = row.alloc_cpus.trim().parse::<u64>().unwrap_or(0);
    let nnodes = row.nnodes.trim().parse::<u64>().unwrap_or(0);

    let gpu_count = units::gpu_count(&row.alloc_tres);

    let req_mem_mb = match units::parse_req_mem(&row.req_mem) {
        Some((mb, ReqMemPer::Cpu)) => mb * alloc_cpus as f64,
        Some((mb, ReqMemPer::Node)) => mb * nnodes as f64,
        None => 0.0,
    };

    Some(NormalizedRecord {
        job_id: row.job_id.clone(),
        username,
        end_timestamp: parse_end_timestamp(row.end.trim()),
        elapsed_hours,
        alloc_cpus,
        nnodes,
        clock_hours: alloc_cpus as f64 * elapsed_hours,
        gpu_count,
        gpu_elapsed_hours: if gpu_count > 0 { elapsed_hours } else { 0.0 },
        gpu_clock_hours: gpu_count as f64 * elapsed_hours,
        req_mem_mb,
        avg_mem_mb: units::parse_mem_mb(&row.ave_rss).unwrap_or(0.0),
        max_mem_mb: units::parse_mem_mb(&row.max_rss).unwrap_or(0.0),
        failed: is_failed_state(&row.state),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(line: &str) -> RawJobRow {
        RawJobRow::parse(line).unwrap()
    }

    #[test]
    fn basic_cpu_job() {
        let rec = normalize(&row(
            "1|alice|COMPLETED|3600|4|1|4000Mc|2G|1G|billing=4|s|st|2024-02-10T08:00:00",
        ))
        .unwrap();
        assert_eq!(rec.username, "alice");
        assert_eq!(rec.elapsed_hours, 1.0);
        assert_eq!(rec.clock_hours, 4.0);
        assert_eq!(rec.gpu_count, 0);
        assert_eq!(rec.gpu_clock_hours, 0.0);
        // 4000 MB per CPU × 4 CPUs
        assert_eq!(rec.req_mem_mb, 16000.0);
        assert_eq!(rec.max_mem_mb, 2000.0);
        assert_eq!(rec.avg_mem_mb, 1000.0);
        assert!(!rec.failed);
        assert!(rec.end_timestamp.is_some());
    }

    #[test]
    fn gpu_job_derives_gpu_hours() {
        let rec = normalize(&row(
            "3|bob|COMPLETED|7200|1|1|1Gn|0|0|gres/gpu=2|s|st|e",
        ))
        .unwrap();
        assert_eq!(rec.gpu_count, 2);
        assert_eq!(rec.elapsed_hours, 2.0);
        assert_eq!(rec.gpu_elapsed_hours, 2.0);
        assert_eq!(rec.gpu_clock_hours, 4.0);
        assert_eq!(rec.req_mem_mb, 1000.0);
        assert!(rec.end_timestamp.is_none());
    }

    #[test]
    fn steps_are_dropped() {
        assert!(normalize(&row(
            "3.batch|bob|COMPLETED|7200|1|1|1Gn|0|0|gres/gpu=2|s|st|e"
        ))
        .is_none());
        assert!(normalize(&row(
            "17.extern|bob|COMPLETED|7200|1|1|1Gn|0|0||s|st|e"
        ))
        .is_none());
    }

    #[test]
    fn unparseable_elapsed_drops_row() {
        assert!(normalize(&row("4|carol|COMPLETED|oops|1|1|1Gn|0|0||s|st|e")).is_none());
    }

    #[test]
    fn unparseable_memory_degrades_to_zero() {
        let rec = normalize(&row("5|carol|COMPLETED|60|2|1|weird|bad|worse||s|st|e")).unwrap();
        assert_eq!(rec.req_mem_mb, 0.0);
        assert_eq!(rec.avg_mem_mb, 0.0);
        assert_eq!(rec.max_mem_mb, 0.0);
        assert_eq!(rec.clock_hours, 2.0 * 60.0 / 3600.0);
    }

    #[test]
    fn failure_states() {
        for state in ["FAILED", "NODE_FAIL", "OUT_OF_MEMORY", "PREEMPTED", "TIMEOUT"] {
            let line = format!("9|dave|{}|60|1|1|1Gn|0|0||s|st|e", state);
            assert!(normalize(&row(&line)).unwrap().failed, "{}", state);
        }
        for state in ["COMPLETED", "CANCELLED", "CANCELLED by 1234"] {
            let line = format!("9|dave|{}|60|1|1|1Gn|0|0||s|st|e", state);
            assert!(!normalize(&row(&line)).unwrap().failed, "{}", state);
        }
    }

    #[test]
    fn realm_is_stripped_from_username() {
        let rec = normalize(&row("6|Eve@CLUSTER.LOCAL|COMPLETED|60|1|1|1Gn|0|0||s|st|e")).unwrap();
        assert_eq!(rec.username, "eve");
    }
}
