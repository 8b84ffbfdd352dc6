use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, ACCEPT, LINK};
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::model::{Identity, Repository, WorkflowRun};
use crate::rate::RateGate;
use crate::state::StateStore;

pub const REPOS_PER_PAGE: u32 = 100;
pub const RUNS_PER_PAGE: u32 = 25;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const API_VERSION: &str = "2022-11-28";

static NEXT_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<([^>]+)>\s*;\s*rel="next""#).expect("valid link regex"));

/// The provider operations the poll engine depends on. Implementations never
/// surface errors: failures are logged and reported as "no data".
#[async_trait]
pub trait ActionsApi: Send + Sync {
    /// Login of the authenticated user. A rejected credential is reported
    /// apart from a provider that could not be reached.
    async fn get_identity(&self) -> Identity;

    /// Every repository visible to the user, most recently pushed first.
    async fn list_repositories(&self) -> Vec<Repository>;

    /// Recent completed runs; when `since_id > 0` only ids above it are returned.
    async fn list_completed_runs(&self, owner: &str, name: &str, since_id: u64)
        -> Vec<WorkflowRun>;
}

#[derive(Clone)]
pub struct GitHubClient {
    http: Client,
    base_url: Url,
    state: Arc<StateStore>,
    rate: Arc<RateGate>,
}

impl fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Why a request produced no usable response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Unauthorized,
    Unavailable,
}

#[derive(Deserialize)]
struct UserResponse {
    login: String,
}

#[derive(Deserialize)]
struct RunsResponse {
    #[serde(default)]
    workflow_runs: Vec<WorkflowRun>,
}

impl GitHubClient {
    pub fn new(mut base_url: Url, state: Arc<StateStore>, rate: Arc<RateGate>) -> Result<Self> {
        // `join` replaces the last path segment unless the base ends in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder()
            .user_agent(concat!("gha-notifier/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            state,
            rate,
        })
    }

    pub fn rate_gate(&self) -> &RateGate {
        &self.rate
    }

    pub fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid API path {path}"))
    }

    pub fn build_request(&self, url: Url) -> Result<reqwest::Request> {
        let mut req = self
            .http
            .get(url)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION);
        let token = self.state.token();
        if !token.is_empty() {
            req = req.bearer_auth(token);
        }
        req.build().context("failed to build API request")
    }

    /// Issue a GET, honouring the rate gate.
    async fn get(&self, url: Url) -> Result<Response, Failure> {
        if !self.rate.may_proceed() {
            return Err(Failure::Unavailable);
        }
        let request = match self.build_request(url) {
            Ok(request) => request,
            Err(err) => {
                error!(?err, "API request not sent");
                return Err(Failure::Unavailable);
            }
        };
        debug!(url = %request.url(), "sending API request");
        let res = match self.http.execute(request).await {
            Ok(res) => res,
            Err(err) => {
                error!(%err, "API request failed");
                return Err(Failure::Unavailable);
            }
        };

        let (remaining, reset_at) = rate_headers(res.headers());
        self.rate.record(remaining, reset_at);

        if res.status() == StatusCode::UNAUTHORIZED {
            error!("token rejected (401)");
            return Err(Failure::Unauthorized);
        }
        if !res.status().is_success() {
            let status = res.status();
            let url = res.url().clone();
            let body = res.text().await.unwrap_or_default();
            warn!(%status, %url, body = %body, "API error");
            return Err(Failure::Unavailable);
        }
        Ok(res)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: Url,
    ) -> Result<(T, HeaderMap), Failure> {
        let res = self.get(url).await?;
        let headers = res.headers().clone();
        match res.json::<T>().await {
            Ok(body) => Ok((body, headers)),
            Err(err) => {
                warn!(%err, "invalid API response body");
                Err(Failure::Unavailable)
            }
        }
    }

    pub async fn get_identity(&self) -> Identity {
        let Ok(url) = self.endpoint("user") else {
            return Identity::Unavailable;
        };
        match self.get_json::<UserResponse>(url).await {
            Ok((user, _)) => Identity::User(user.login),
            Err(Failure::Unauthorized) => Identity::Unauthorized,
            Err(Failure::Unavailable) => Identity::Unavailable,
        }
    }

    pub async fn list_repositories(&self) -> Vec<Repository> {
        let mut repos = Vec::new();
        let mut next = match self.endpoint("user/repos") {
            Ok(mut url) => {
                url.query_pairs_mut()
                    .append_pair("per_page", &REPOS_PER_PAGE.to_string())
                    .append_pair("sort", "pushed");
                Some(url)
            }
            Err(err) => {
                error!(?err, "cannot build repository list URL");
                None
            }
        };

        // Later pages carry their query in the link itself.
        while let Some(url) = next.take() {
            let Ok((page, headers)) = self.get_json::<Vec<Repository>>(url).await else {
                break;
            };
            repos.extend(page);
            next = next_page_url(&headers);
        }
        repos
    }

    pub async fn list_completed_runs(
        &self,
        owner: &str,
        name: &str,
        since_id: u64,
    ) -> Vec<WorkflowRun> {
        let mut url = match self.endpoint(&format!("repos/{owner}/{name}/actions/runs")) {
            Ok(url) => url,
            Err(err) => {
                warn!(?err, owner, name, "cannot build runs URL");
                return Vec::new();
            }
        };
        url.query_pairs_mut()
            .append_pair("status", "completed")
            .append_pair("per_page", &RUNS_PER_PAGE.to_string());

        let Ok((body, _)) = self.get_json::<RunsResponse>(url).await else {
            return Vec::new();
        };
        let mut runs = body.workflow_runs;
        if since_id > 0 {
            runs.retain(|run| run.id > since_id);
        }
        runs
    }
}

#[async_trait]
impl ActionsApi for GitHubClient {
    async fn get_identity(&self) -> Identity {
        GitHubClient::get_identity(self).await
    }

    async fn list_repositories(&self) -> Vec<Repository> {
        GitHubClient::list_repositories(self).await
    }

    async fn list_completed_runs(
        &self,
        owner: &str,
        name: &str,
        since_id: u64,
    ) -> Vec<WorkflowRun> {
        GitHubClient::list_completed_runs(self, owner, name, since_id).await
    }
}

/// Parse `X-RateLimit-Remaining` / `X-RateLimit-Reset`; unparsable values count as absent.
pub fn rate_headers(headers: &HeaderMap) -> (Option<u64>, Option<i64>) {
    let read = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let remaining = read("x-ratelimit-remaining").and_then(|v| v.trim().parse().ok());
    let reset_at = read("x-ratelimit-reset").and_then(|v| v.trim().parse::<f64>().ok());
    (remaining, reset_at.map(|v| v as i64))
}

/// Extract the `rel="next"` target from a `Link` header.
pub fn next_page_url(headers: &HeaderMap) -> Option<Url> {
    let link = headers.get(LINK)?.to_str().ok()?;
    let caps = NEXT_LINK.captures(link)?;
    Url::parse(&caps[1]).ok()
}
