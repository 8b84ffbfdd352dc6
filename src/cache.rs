use std::time::{Duration, Instant};

use crate::config::Config;
use crate::model::Repository;

/// How long a fetched repository list is reused before refreshing.
pub const REPO_CACHE_TTL: Duration = Duration::from_secs(600);
/// Maximum repositories scanned per cycle.
pub const MAX_REPOS_PER_CYCLE: usize = 30;

/// Last successfully fetched, filtered repository list plus the rotation cursor.
#[derive(Debug, Default)]
pub struct RepoCache {
    repos: Vec<Repository>,
    fetched_at: Option<Instant>,
    offset: usize,
}

impl RepoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn repos(&self) -> &[Repository] {
        &self.repos
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Non-empty and younger than the TTL.
    pub fn is_fresh(&self, now: Instant) -> bool {
        match self.fetched_at {
            Some(at) if !self.repos.is_empty() => now.saturating_duration_since(at) < REPO_CACHE_TTL,
            _ => false,
        }
    }

    /// Swap in a freshly fetched list and restart the rotation.
    pub fn replace(&mut self, repos: Vec<Repository>, now: Instant) {
        self.repos = repos;
        self.fetched_at = Some(now);
        self.offset = 0;
    }

    /// Force a refresh on next use.
    pub fn clear(&mut self) {
        self.repos.clear();
        self.fetched_at = None;
    }

    /// The repositories to scan this cycle: all of them when they fit under
    /// `cap`, otherwise a wrapping window of `cap` starting at the cursor,
    /// after which the cursor advances by `cap`.
    pub fn next_batch(&mut self, cap: usize) -> Vec<Repository> {
        let len = self.repos.len();
        if len <= cap {
            return self.repos.clone();
        }
        let start = self.offset % len;
        let batch = self
            .repos
            .iter()
            .cycle()
            .skip(start)
            .take(cap)
            .cloned()
            .collect();
        self.offset = (start + cap) % len;
        batch
    }
}

/// Apply the allowlist (when non-empty) or else the blocklist, preserving order.
pub fn apply_filters(repos: Vec<Repository>, cfg: &Config) -> Vec<Repository> {
    if !cfg.allowlist.is_empty() {
        repos
            .into_iter()
            .filter(|r| cfg.allowlist.contains(&r.full_name))
            .collect()
    } else if !cfg.blocklist.is_empty() {
        repos
            .into_iter()
            .filter(|r| !cfg.blocklist.contains(&r.full_name))
            .collect()
    } else {
        repos
    }
}
