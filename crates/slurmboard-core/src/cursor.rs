//! Backfill cursor: which month to fetch next.
//!
//! Per cluster, the cursor walks historic months from `backfill_start`
//! forward exactly once (ColdStart), then switches to re-fetching the
//! current month incrementally (Caught-up). Closed months are never fetched
//! again except through targeted per-user backfill.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::month::Month;
use crate::store::{self, StatePaths};

/// Phase annotation stored while a window is being processed. Observational
/// only; recovery never branches on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InProgress {
    pub month: Month,
    pub phase: String,
}

/// Persisted per-cluster cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub last_complete_month: Option<Month>,
    pub in_progress: Option<InProgress>,
    pub coldstart_done: bool,
    pub backfill_start: NaiveDate,
}

/// The window one tick should fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// One closed historic month, `[first, first-of-next)`.
    Backfill(Month),
    /// The open current month, `[first-of-month, tomorrow)`.
    CurrentMonth { month: Month, start: NaiveDate, end: NaiveDate },
}

impl Window {
    pub fn month(&self) -> Month {
        match self {
            Window::Backfill(m) => *m,
            Window::CurrentMonth { month, .. } => *month,
        }
    }

    pub fn bounds(&self) -> (NaiveDate, NaiveDate) {
        match self {
            Window::Backfill(m) => (m.first_day(), m.end_exclusive()),
            Window::CurrentMonth { start, end, .. } => (*start, *end),
        }
    }
}

impl Cursor {
    pub fn new(backfill_start: NaiveDate) -> Self {
        Self {
            last_complete_month: None,
            in_progress: None,
            coldstart_done: false,
            backfill_start,
        }
    }

    /// Whether every month before the current one has been ingested.
    pub fn caught_up(&self, today: NaiveDate) -> bool {
        match self.last_complete_month {
            Some(m) => m.succ() >= Month::from_date(today),
            None => {
                // a backfill start in the current month means there is no
                // history to walk
                Month::from_date(self.backfill_start) >= Month::from_date(today)
            }
        }
    }

    /// Picks the window for the next tick.
    pub fn next_window(&self, today: NaiveDate) -> Window {
        let current = Month::from_date(today);
        if self.caught_up(today) {
            Window::CurrentMonth {
                month: current,
                start: current.first_day(),
                end: today + Duration::days(1),
            }
        } else {
            let next = match self.last_complete_month {
                Some(m) => m.succ(),
                None => Month::from_date(self.backfill_start),
            };
            Window::Backfill(next)
        }
    }

    /// Records a finished window and refreshes `coldstart_done`.
    pub fn complete_window(&mut self, window: Window, today: NaiveDate) {
        if let Window::Backfill(m) = window {
            self.last_complete_month = Some(m);
        }
        self.in_progress = None;
        if self.caught_up(today) {
            self.coldstart_done = true;
        }
    }
}

/// Loads the cursor, falling back to a fresh one. A corrupt cursor file is
/// recoverable state (the dedupe sets make re-fetching idempotent), so it is
/// quarantined implicitly by being overwritten on the next save.
pub fn load_cursor(paths: &StatePaths, backfill_start: NaiveDate) -> Result<Cursor> {
    match store::read_json::<Cursor>(&paths.cursor_file()) {
        Ok(Some(cursor)) => Ok(cursor),
        Ok(None) => Ok(Cursor::new(backfill_start)),
        Err(crate::error::Error::Corrupt { path, reason }) => {
            tracing::warn!(path = %path.display(), reason, "corrupt cursor, restarting backfill");
            Ok(Cursor::new(backfill_start))
        }
        Err(e) => Err(e),
    }
}

pub fn save_cursor(paths: &StatePaths, cursor: &Cursor) -> Result<()> {
    store::write_json_atomic(&paths.cursor_file(), cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn cold_start_walks_months_from_backfill_start() {
        let today = d(2024, 4, 15);
        let mut cursor = Cursor::new(d(2024, 1, 1));

        let w1 = cursor.next_window(today);
        assert_eq!(w1, Window::Backfill("2024-01".parse().unwrap()));
        assert_eq!(w1.bounds(), (d(2024, 1, 1), d(2024, 2, 1)));
        cursor.complete_window(w1, today);
        assert!(!cursor.coldstart_done);

        let w2 = cursor.next_window(today);
        assert_eq!(w2, Window::Backfill("2024-02".parse().unwrap()));
        cursor.complete_window(w2, today);

        let w3 = cursor.next_window(today);
        assert_eq!(w3, Window::Backfill("2024-03".parse().unwrap()));
        cursor.complete_window(w3, today);
        // March is the month before April: coldstart is done
        assert!(cursor.coldstart_done);

        match cursor.next_window(today) {
            Window::CurrentMonth { month, start, end } => {
                assert_eq!(month, "2024-04".parse().unwrap());
                assert_eq!(start, d(2024, 4, 1));
                assert_eq!(end, d(2024, 4, 16));
            }
            w => panic!("expected current-month window, got {:?}", w),
        }
    }

    #[test]
    fn caught_up_cursor_stays_on_current_month() {
        let today = d(2024, 4, 15);
        let mut cursor = Cursor::new(d(2024, 1, 1));
        cursor.last_complete_month = Some("2024-03".parse().unwrap());

        let w = cursor.next_window(today);
        assert!(matches!(w, Window::CurrentMonth { .. }));
        cursor.complete_window(w, today);
        // completing a current-month window never advances last_complete_month
        assert_eq!(cursor.last_complete_month, Some("2024-03".parse().unwrap()));
        assert!(matches!(
            cursor.next_window(today),
            Window::CurrentMonth { .. }
        ));
    }

    #[test]
    fn backfill_start_in_current_month_skips_cold_start() {
        let today = d(2024, 4, 15);
        let cursor = Cursor::new(d(2024, 4, 1));
        assert!(cursor.caught_up(today));
        assert!(matches!(
            cursor.next_window(today),
            Window::CurrentMonth { .. }
        ));
    }

    #[test]
    fn month_boundary_reopens_one_backfill_step() {
        // caught up through March; on May 1st, April must be backfilled
        let mut cursor = Cursor::new(d(2024, 1, 1));
        cursor.last_complete_month = Some("2024-03".parse().unwrap());
        cursor.coldstart_done = true;

        let today = d(2024, 5, 1);
        let w = cursor.next_window(today);
        assert_eq!(w, Window::Backfill("2024-04".parse().unwrap()));
        cursor.complete_window(w, today);
        assert!(matches!(
            cursor.next_window(today),
            Window::CurrentMonth { .. }
        ));
    }

    #[test]
    fn cursor_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let paths = StatePaths::new(dir.path(), "fram");
        paths.ensure_layout().unwrap();

        let mut cursor = Cursor::new(d(2024, 1, 1));
        cursor.last_complete_month = Some("2024-02".parse().unwrap());
        cursor.in_progress = Some(InProgress {
            month: "2024-03".parse().unwrap(),
            phase: "fetch".to_string(),
        });
        save_cursor(&paths, &cursor).unwrap();

        let loaded = load_cursor(&paths, d(2024, 1, 1)).unwrap();
        assert_eq!(loaded, cursor);
    }

    #[test]
    fn corrupt_cursor_restarts_cleanly() {
        let dir = tempdir().unwrap();
        let paths = StatePaths::new(dir.path(), "fram");
        paths.ensure_layout().unwrap();
        std::fs::write(paths.cursor_file(), b"not json").unwrap();

        let loaded = load_cursor(&paths, d(2024, 1, 1)).unwrap();
        assert_eq!(loaded, Cursor::new(d(2024, 1, 1)));
    }
}
