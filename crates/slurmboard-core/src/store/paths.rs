//! On-disk layout under the shared storage root.
//!
//! ```text
//! <root>/
//!   clusters/<cluster>/
//!     state/poll_cursor.json
//!     state/backfill_queue.json
//!     state/seen/YYYY-MM.bloom
//!     state/lock
//!     agg/rollups/monthly/YYYY-MM.json
//!     agg/users/<username>.json
//!   leaderboards/<window>_<metric>.json
//!   config/optout.txt
//! ```

use std::path::{Path, PathBuf};

use crate::month::Month;

/// Path builder for one cluster's subtree plus the shared root artifacts.
#[derive(Debug, Clone)]
pub struct StatePaths {
    root: PathBuf,
    cluster: String,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>, cluster: &str) -> Self {
        Self {
            root: root.into(),
            cluster: cluster.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Directory holding every cluster subtree.
    pub fn clusters_root(&self) -> PathBuf {
        self.root.join("clusters")
    }

    pub fn cluster_dir(&self) -> PathBuf {
        self.clusters_root().join(&self.cluster)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.cluster_dir().join("state")
    }

    pub fn seen_dir(&self) -> PathBuf {
        self.state_dir().join("seen")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir().join("lock")
    }

    pub fn cursor_file(&self) -> PathBuf {
        self.state_dir().join("poll_cursor.json")
    }

    pub fn queue_file(&self) -> PathBuf {
        self.state_dir().join("backfill_queue.json")
    }

    pub fn bloom_file(&self, month: Month) -> PathBuf {
        self.seen_dir().join(format!("{}.bloom", month))
    }

    pub fn monthly_dir(&self) -> PathBuf {
        self.cluster_dir().join("agg").join("rollups").join("monthly")
    }

    pub fn monthly_file(&self, month: Month) -> PathBuf {
        self.monthly_dir().join(format!("{}.json", month))
    }

    pub fn users_dir(&self) -> PathBuf {
        self.cluster_dir().join("agg").join("users")
    }

    pub fn user_file(&self, username: &str) -> PathBuf {
        self.users_dir()
            .join(format!("{}.json", sanitize_filename(username)))
    }

    pub fn leaderboards_dir(&self) -> PathBuf {
        self.root.join("leaderboards")
    }

    pub fn optout_file(&self) -> PathBuf {
        self.root.join("config").join("optout.txt")
    }

    /// Creates every directory this cluster's poller writes into.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.seen_dir())?;
        std::fs::create_dir_all(self.monthly_dir())?;
        std::fs::create_dir_all(self.users_dir())?;
        std::fs::create_dir_all(self.leaderboards_dir())?;
        Ok(())
    }

    /// The same layout rooted at a sibling cluster, for read-only merges.
    pub fn for_cluster(&self, cluster: &str) -> Self {
        Self::new(&self.root, cluster)
    }
}

/// Usernames become file names; anything outside a conservative set is
/// replaced so a hostile name cannot escape the users directory.
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_contract() {
        let p = StatePaths::new("/data", "fram");
        let m: Month = "2024-02".parse().unwrap();
        assert_eq!(
            p.cursor_file(),
            Path::new("/data/clusters/fram/state/poll_cursor.json")
        );
        assert_eq!(
            p.bloom_file(m),
            Path::new("/data/clusters/fram/state/seen/2024-02.bloom")
        );
        assert_eq!(
            p.monthly_file(m),
            Path::new("/data/clusters/fram/agg/rollups/monthly/2024-02.json")
        );
        assert_eq!(
            p.user_file("alice"),
            Path::new("/data/clusters/fram/agg/users/alice.json")
        );
        assert_eq!(p.lock_file(), Path::new("/data/clusters/fram/state/lock"));
        assert_eq!(p.leaderboards_dir(), Path::new("/data/leaderboards"));
        assert_eq!(p.optout_file(), Path::new("/data/config/optout.txt"));
    }

    #[test]
    fn hostile_usernames_cannot_escape() {
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("a/b"), "a_b");
        assert_eq!(sanitize_filename(".."), "_");
        assert_eq!(sanitize_filename(""), "_");
        assert_eq!(sanitize_filename("alice-01"), "alice-01");
    }
}
