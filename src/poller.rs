//! One poll cycle: refresh or reuse the repository list, scan a bounded
//! batch, advance watermarks, and emit a capped number of notifications.
//!
//! Watermarks are committed before any notification goes out, so a failure
//! while notifying can drop a notification but never repeat one.
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::cache::{apply_filters, RepoCache, MAX_REPOS_PER_CYCLE};
use crate::config::Config;
use crate::github::ActionsApi;
use crate::model::{RunNotice, WorkflowRun};
use crate::notifier::NotificationSink;
use crate::state::{StateError, StateStore};

/// Individual notifications per cycle before collapsing the rest into a summary.
pub const MAX_NOTIFICATIONS_PER_CYCLE: usize = 5;

/// What a single cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Repositories whose runs were requested.
    pub repos_scanned: usize,
    /// Repositories that got their first watermark this cycle.
    pub seeded: Vec<String>,
    pub notified: usize,
    /// Count carried by the summary notification, when the cap was hit.
    pub summarized: Option<usize>,
}

pub struct Poller {
    config: Config,
    state: Arc<StateStore>,
    api: Arc<dyn ActionsApi>,
    sink: Arc<dyn NotificationSink>,
    cache: RepoCache,
}

impl Poller {
    pub fn new(
        config: Config,
        state: Arc<StateStore>,
        api: Arc<dyn ActionsApi>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            config,
            state,
            api,
            sink,
            cache: RepoCache::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Swap configuration; the repository list is refetched so new filters apply.
    pub fn set_config(&mut self, config: Config) {
        self.config = config;
        self.clear_repo_cache();
    }

    /// Force a fresh repository list fetch on the next cycle.
    pub fn clear_repo_cache(&mut self) {
        self.cache.clear();
    }

    pub fn cache(&self) -> &RepoCache {
        &self.cache
    }

    pub async fn poll_once(&mut self) -> Result<CycleReport, StateError> {
        self.poll_at(Instant::now()).await
    }

    #[instrument(skip_all)]
    pub async fn poll_at(&mut self, now: Instant) -> Result<CycleReport, StateError> {
        let mut report = CycleReport::default();
        if !self.state.has_token() {
            return Ok(report);
        }

        self.refresh_repositories(now).await;
        if self.cache.repos().is_empty() {
            return Ok(report);
        }
        let batch = self.cache.next_batch(MAX_REPOS_PER_CYCLE);

        for repo in &batch {
            let full_name = repo.full_name.as_str();
            let Some((owner, name)) = repo.owner_and_name() else {
                warn!(repo = full_name, "skipping repository with unexpected name");
                continue;
            };
            let last_seen = self.state.get(full_name);
            report.repos_scanned += 1;

            let runs = self.api.list_completed_runs(owner, name, last_seen).await;
            let Some(max_id) = runs.iter().map(|run| run.id).max() else {
                continue;
            };
            self.state.set(full_name, max_id)?;

            if last_seen == 0 {
                info!(repo = full_name, run_id = max_id, "seeded repository");
                report.seeded.push(full_name.to_string());
                continue;
            }

            let notifiable: Vec<&WorkflowRun> =
                runs.iter().filter(|run| run.is_notifiable()).collect();
            for (i, run) in notifiable.iter().enumerate() {
                if report.notified >= MAX_NOTIFICATIONS_PER_CYCLE {
                    let remaining = notifiable.len() - i;
                    if let Err(err) = self.sink.notify_summary(remaining).await {
                        warn!(?err, remaining, "failed to deliver summary notification");
                    }
                    report.summarized = Some(remaining);
                    info!(
                        sent = report.notified,
                        remaining, "notification cap reached; ending cycle"
                    );
                    return Ok(report);
                }

                let notice = RunNotice::from_run(full_name, run);
                if let Err(err) = self.sink.notify_run(&notice).await {
                    warn!(?err, repo = full_name, run_id = run.id, "failed to deliver notification");
                }
                report.notified += 1;
            }
        }

        if report.notified > 0 {
            info!(sent = report.notified, "sent notification(s) this cycle");
        }
        Ok(report)
    }

    /// Refetch the repository list when the cache is stale. A failed fetch
    /// keeps the previous list.
    async fn refresh_repositories(&mut self, now: Instant) {
        if self.cache.is_fresh(now) {
            return;
        }
        let fetched = self.api.list_repositories().await;
        if fetched.is_empty() {
            debug!(
                cached = self.cache.repos().len(),
                "repository list unavailable; keeping cached list"
            );
            return;
        }
        let repos = apply_filters(fetched, &self.config);
        info!(count = repos.len(), "refreshed repository list");
        self.cache.replace(repos, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Conclusion, Identity, Repository};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct FakeApi {
        repos: Mutex<Vec<Repository>>,
        runs: Mutex<HashMap<String, Vec<WorkflowRun>>>,
        repo_calls: Mutex<usize>,
    }

    #[async_trait]
    impl ActionsApi for FakeApi {
        async fn get_identity(&self) -> Identity {
            Identity::User("octocat".into())
        }

        async fn list_repositories(&self) -> Vec<Repository> {
            *self.repo_calls.lock().unwrap() += 1;
            self.repos.lock().unwrap().clone()
        }

        async fn list_completed_runs(
            &self,
            owner: &str,
            name: &str,
            since_id: u64,
        ) -> Vec<WorkflowRun> {
            let runs = self.runs.lock().unwrap();
            runs.get(&format!("{owner}/{name}"))
                .map(|r| r.iter().filter(|run| run.id > since_id).cloned().collect())
                .unwrap_or_default()
        }
    }

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn notify_run(&self, _notice: &RunNotice) -> Result<()> {
            Err(anyhow!("display unavailable"))
        }

        async fn notify_summary(&self, _count: usize) -> Result<()> {
            Err(anyhow!("display unavailable"))
        }
    }

    fn run(id: u64, conclusion: &str) -> WorkflowRun {
        WorkflowRun {
            id,
            name: Some("CI".into()),
            head_branch: Some("main".into()),
            conclusion: Some(Conclusion::from(conclusion.to_string())),
            html_url: Some(format!("https://example/{id}")),
        }
    }

    fn store(td: &TempDir, token: &str) -> Arc<StateStore> {
        let store = Arc::new(StateStore::open(td.path().join("state.json")));
        store.set_token(token).unwrap();
        store
    }

    #[tokio::test]
    async fn no_token_is_a_noop() {
        let td = tempdir().unwrap();
        let api = Arc::new(FakeApi::default());
        api.repos.lock().unwrap().push(Repository::new("a/b"));
        let mut poller = Poller::new(
            Config::default(),
            store(&td, ""),
            api.clone(),
            Arc::new(FailingSink),
        );
        assert_eq!(poller.poll_once().await.unwrap(), CycleReport::default());
        assert_eq!(*api.repo_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn sink_failures_do_not_roll_back_watermarks() {
        let td = tempdir().unwrap();
        let state = store(&td, "t");
        state.set("a/b", 1).unwrap();
        let api = Arc::new(FakeApi::default());
        api.repos.lock().unwrap().push(Repository::new("a/b"));
        api.runs
            .lock()
            .unwrap()
            .insert("a/b".into(), vec![run(3, "failure"), run(2, "success")]);

        let mut poller = Poller::new(Config::default(), state.clone(), api, Arc::new(FailingSink));
        let report = poller.poll_once().await.unwrap();
        assert_eq!(report.notified, 2);
        assert_eq!(state.get("a/b"), 3);

        let report = poller.poll_once().await.unwrap();
        assert_eq!(report.notified, 0);
    }

    #[tokio::test]
    async fn cache_is_reused_within_ttl_and_kept_on_failed_refresh() {
        let td = tempdir().unwrap();
        let api = Arc::new(FakeApi::default());
        api.repos.lock().unwrap().push(Repository::new("a/b"));
        let mut poller = Poller::new(
            Config::default(),
            store(&td, "t"),
            api.clone(),
            Arc::new(FailingSink),
        );

        let t0 = Instant::now();
        poller.poll_at(t0).await.unwrap();
        poller.poll_at(t0 + std::time::Duration::from_secs(60)).await.unwrap();
        assert_eq!(*api.repo_calls.lock().unwrap(), 1);

        api.repos.lock().unwrap().clear();
        let later = t0 + crate::cache::REPO_CACHE_TTL;
        let report = poller.poll_at(later).await.unwrap();
        assert_eq!(*api.repo_calls.lock().unwrap(), 2);
        assert_eq!(report.repos_scanned, 1);
        assert_eq!(poller.cache().repos(), &[Repository::new("a/b")]);
    }

    #[tokio::test]
    async fn malformed_names_are_skipped() {
        let td = tempdir().unwrap();
        let api = Arc::new(FakeApi::default());
        api.repos
            .lock()
            .unwrap()
            .extend([Repository::new("no-slash"), Repository::new("a/b")]);
        let mut poller = Poller::new(
            Config::default(),
            store(&td, "t"),
            api,
            Arc::new(FailingSink),
        );
        let report = poller.poll_once().await.unwrap();
        assert_eq!(report.repos_scanned, 1);
    }

    #[tokio::test]
    async fn set_config_refilters_on_next_cycle() {
        let td = tempdir().unwrap();
        let api = Arc::new(FakeApi::default());
        api.repos
            .lock()
            .unwrap()
            .extend([Repository::new("a/b"), Repository::new("a/c")]);
        let mut poller = Poller::new(
            Config::default(),
            store(&td, "t"),
            api,
            Arc::new(FailingSink),
        );
        assert_eq!(poller.poll_once().await.unwrap().repos_scanned, 2);

        poller.set_config(Config {
            blocklist: vec!["a/c".into()],
            ..Config::default()
        });
        assert_eq!(poller.poll_once().await.unwrap().repos_scanned, 1);
    }
}
