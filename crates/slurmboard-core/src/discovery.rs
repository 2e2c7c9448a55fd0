//! Username discovery and targeted backfill queueing.
//!
//! Candidates come from two directions: entries of the shared home-directory
//! tree and the accounting tool's own distinct-user projection. Users with no
//! all-time aggregate yet are expanded into per-(user, month) backfill units
//! on an on-disk FIFO queue; each tick drains a bounded number of units so a
//! burst of new users cannot starve the regular window.

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::accounting::AccountingSource;
use crate::error::Result;
use crate::month::Month;
use crate::store::{self, RollupStore, StatePaths};
use crate::units::normalize_username;

/// Accounts that exist on every node but never run jobs.
const SYSTEM_ACCOUNTS: &[&str] = &[
    "adm", "backup", "bin", "daemon", "ftp", "games", "halt", "irc", "lp", "mail", "man",
    "munge", "news", "nobody", "ntp", "operator", "postfix", "proxy", "root", "shutdown",
    "slurm", "sshd", "sync", "sys", "uucp", "www-data",
];

/// Filters obvious non-human accounts: the static list, service-account
/// prefixes, Windows-style machine accounts, and anything that does not look
/// like a login name.
pub fn is_system_account(name: &str) -> bool {
    if SYSTEM_ACCOUNTS.contains(&name) {
        return true;
    }
    if name.starts_with("systemd-") || name.ends_with('$') {
        return true;
    }
    !is_login_shape(name)
}

/// `^[a-z_][a-z0-9_-]*$` without pulling in a regex engine.
fn is_login_shape(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// One targeted backfill unit: re-fetch a single month for a single user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillUnit {
    pub user: String,
    pub month: Month,
}

/// Persisted FIFO of pending targeted backfills.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillQueue {
    pub schema_version: u32,
    pub units: VecDeque<BackfillUnit>,
}

impl Default for BackfillQueue {
    fn default() -> Self {
        Self {
            schema_version: 1,
            units: VecDeque::new(),
        }
    }
}

impl BackfillQueue {
    pub fn load(paths: &StatePaths) -> Result<Self> {
        match store::read_json::<BackfillQueue>(&paths.queue_file()) {
            Ok(Some(queue)) => Ok(queue),
            Ok(None) => Ok(Self::default()),
            Err(crate::error::Error::Corrupt { path, reason }) => {
                // the queue is re-derivable from discovery; start empty
                warn!(path = %path.display(), reason, "corrupt backfill queue, dropped");
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, paths: &StatePaths) -> Result<()> {
        store::write_json_atomic(&paths.queue_file(), self)
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn contains_user(&self, user: &str) -> bool {
        self.units.iter().any(|u| u.user == user)
    }

    /// Appends one unit per month from `from` through the month of `today`.
    pub fn enqueue_user(&mut self, user: &str, from: NaiveDate, today: NaiveDate) {
        let first = Month::from_date(from);
        let last = Month::from_date(today);
        for month in first.through(last) {
            self.units.push_back(BackfillUnit {
                user: user.to_string(),
                month,
            });
        }
    }

    /// Removes and returns up to `budget` units from the front.
    pub fn drain_budget(&mut self, budget: usize) -> Vec<BackfillUnit> {
        let take = budget.min(self.units.len());
        self.units.drain(..take).collect()
    }
}

/// Enumerates candidate usernames and returns the normalized ones that have
/// no aggregate on this cluster yet, excluding users already queued.
pub fn discover_new_users(
    store: &RollupStore,
    source: &mut dyn AccountingSource,
    queue: &BackfillQueue,
    homes: Option<&Path>,
    backfill_start: NaiveDate,
    today: NaiveDate,
) -> Result<Vec<String>> {
    let mut candidates: BTreeSet<String> = BTreeSet::new();

    if let Some(homes) = homes {
        match std::fs::read_dir(homes) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    if let Some(name) = entry.file_name().to_str() {
                        candidates.insert(normalize_username(name));
                    }
                }
            }
            Err(e) => {
                debug!(path = %homes.display(), error = %e, "home directory listing unavailable");
            }
        }
    }

    // exclusive end: include jobs from today itself
    for user in source.fetch_users(backfill_start, today + Duration::days(1))? {
        candidates.insert(user);
    }

    Ok(candidates
        .into_iter()
        .filter(|name| !name.is_empty() && !is_system_account(name))
        .filter(|name| !store.user_known(name) && !queue.contains_user(name))
        .collect())
}
