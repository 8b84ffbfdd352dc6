//! Background worker: runs poll cycles back to back on a timer, wakes early on
//! request, and owns the authentication flow.
//!
//! Requests travel over a buffered channel, so a wake sent while a cycle is
//! running is picked up as soon as the cycle ends. Shutdown is observed at
//! every sleep boundary and before each cycle; an in-flight request is left to
//! finish on its own timeout.
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::github::ActionsApi;
use crate::model::Identity;
use crate::poller::Poller;
use crate::state::StateStore;

pub const STATUS_DISCONNECTED: &str = "Disconnected";
pub const STATUS_AUTHENTICATING: &str = "Authenticating...";
pub const STATUS_TOKEN_EXPIRED: &str = "Token expired";
pub const STATUS_AUTH_FAILED: &str = "Auth failed";
pub const STATUS_CONFIG_RELOADED: &str = "Config reloaded";
pub const STATUS_PROVIDER_UNAVAILABLE: &str = "Error: provider unavailable";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    PollNow,
    Reauthenticate,
    ReloadConfig(Config),
}

/// Supplies a fresh credential when the worker is asked to reauthenticate.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn acquire(&self) -> Option<String>;
}

/// Reads the token from an environment variable at acquisition time.
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    var: String,
}

impl EnvCredentials {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentials {
    async fn acquire(&self) -> Option<String> {
        std::env::var(&self.var).ok()
    }
}

/// Control surface for a running [`Worker`].
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    status: watch::Receiver<String>,
}

impl WorkerHandle {
    pub fn poll_now(&self) {
        self.send(Command::PollNow);
    }

    pub fn request_auth(&self) {
        self.send(Command::Reauthenticate);
    }

    pub fn reload_config(&self, config: Config) {
        self.send(Command::ReloadConfig(config));
    }

    pub fn shutdown(&self) {
        info!("shutting down");
        self.shutdown.cancel();
    }

    pub fn status(&self) -> String {
        self.status.borrow().clone()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("worker already stopped; dropping command");
        }
    }
}

pub struct Worker {
    poller: Poller,
    api: Arc<dyn ActionsApi>,
    state: Arc<StateStore>,
    credentials: Arc<dyn CredentialProvider>,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
    shutdown: CancellationToken,
    status: watch::Sender<String>,
    user: Option<String>,
}

enum Wake {
    Shutdown,
    Timer,
    Command(Option<Command>),
}

/// Build a worker and the handle that controls it.
pub fn worker(
    poller: Poller,
    api: Arc<dyn ActionsApi>,
    state: Arc<StateStore>,
    credentials: Arc<dyn CredentialProvider>,
) -> (Worker, WorkerHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(STATUS_DISCONNECTED.to_string());
    let shutdown = CancellationToken::new();
    let worker = Worker {
        poller,
        api,
        state,
        credentials,
        commands: rx,
        commands_open: true,
        shutdown: shutdown.clone(),
        status: status_tx,
        user: None,
    };
    let handle = WorkerHandle {
        commands: tx,
        shutdown,
        status: status_rx,
    };
    (worker, handle)
}

impl Worker {
    pub async fn run(mut self) {
        info!("starting poll worker");
        self.validate_stored_token().await;

        let mut auth_requested = false;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            while let Ok(command) = self.commands.try_recv() {
                auth_requested |= self.apply(command);
            }
            if auth_requested {
                auth_requested = false;
                self.authenticate().await;
            }
            if self.shutdown.is_cancelled() {
                break;
            }

            if self.state.has_token() {
                self.cycle().await;
            }

            let interval = Duration::from_secs(self.poller.config().poll_interval);
            let wake = tokio::select! {
                _ = self.shutdown.cancelled() => Wake::Shutdown,
                command = self.commands.recv(), if self.commands_open => Wake::Command(command),
                _ = sleep(interval) => Wake::Timer,
            };
            match wake {
                Wake::Shutdown => break,
                Wake::Timer => {}
                Wake::Command(Some(command)) => auth_requested |= self.apply(command),
                Wake::Command(None) => self.commands_open = false,
            }
        }
        info!("poll worker stopped");
    }

    /// Returns true when the command asks for authentication.
    fn apply(&mut self, command: Command) -> bool {
        match command {
            Command::PollNow => false,
            Command::Reauthenticate => true,
            Command::ReloadConfig(config) => {
                self.poller.set_config(config);
                info!("config reloaded");
                self.publish(STATUS_CONFIG_RELOADED);
                false
            }
        }
    }

    async fn cycle(&mut self) {
        if self.user.is_none() {
            // The last identity check got no answer; retry before polling.
            self.validate_stored_token().await;
            if self.user.is_none() {
                return;
            }
        }
        match self.poller.poll_once().await {
            Ok(report) => {
                debug!(?report, "poll cycle finished");
                let errored = self.status.borrow().starts_with("Error:");
                if errored {
                    if let Some(user) = self.user.clone() {
                        self.publish(&format!("Connected as {user}"));
                    }
                }
            }
            Err(err) => {
                error!(%err, "poll error");
                self.publish(&format!("Error: {err}"));
            }
        }
    }

    async fn validate_stored_token(&mut self) {
        if !self.state.has_token() {
            self.publish(STATUS_DISCONNECTED);
            return;
        }
        match self.api.get_identity().await {
            Identity::User(user) => self.set_connected(user),
            Identity::Unauthorized => {
                self.clear_token();
                self.set_disconnected(STATUS_TOKEN_EXPIRED);
            }
            Identity::Unavailable => {
                warn!("could not validate stored token; keeping it");
                self.set_disconnected(STATUS_PROVIDER_UNAVAILABLE);
            }
        }
    }

    async fn authenticate(&mut self) {
        self.publish(STATUS_AUTHENTICATING);
        let token = self
            .credentials
            .acquire()
            .await
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        let Some(token) = token else {
            info!("authentication cancelled; no token supplied");
            self.set_disconnected(STATUS_AUTH_FAILED);
            return;
        };
        if !token.starts_with("ghp_") && !token.starts_with("github_pat_") {
            warn!("token does not match the expected personal access token format");
        }
        if let Err(err) = self.state.set_token(&token) {
            error!(%err, "failed to store token");
            self.set_disconnected(&format!("Auth error: {err}"));
            return;
        }

        match self.api.get_identity().await {
            Identity::User(user) => {
                self.poller.clear_repo_cache();
                self.set_connected(user);
            }
            Identity::Unauthorized => {
                error!("token validation failed; the provider rejected the token");
                self.clear_token();
                self.set_disconnected(STATUS_AUTH_FAILED);
            }
            Identity::Unavailable => {
                warn!("could not validate new token; keeping it");
                self.set_disconnected(STATUS_PROVIDER_UNAVAILABLE);
            }
        }
    }

    fn clear_token(&self) {
        if let Err(err) = self.state.set_token("") {
            error!(%err, "failed to clear token");
        }
    }

    fn set_connected(&mut self, user: String) {
        info!(user = %user, "connected");
        self.publish(&format!("Connected as {user}"));
        self.user = Some(user);
    }

    fn set_disconnected(&mut self, reason: &str) {
        info!(reason, "disconnected");
        self.user = None;
        self.publish(reason);
    }

    fn publish(&self, status: &str) {
        self.status.send_replace(status.to_string());
    }
}
