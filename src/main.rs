use anyhow::{bail, Context, Result};
use clap::Parser;
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gha_notifier::config;
use gha_notifier::github::GitHubClient;
use gha_notifier::model::Identity;
use gha_notifier::notifier;
use gha_notifier::poller::Poller;
use gha_notifier::rate::RateGate;
use gha_notifier::state::StateStore;
use gha_notifier::worker::{self, EnvCredentials, WorkerHandle};

const TOKEN_VAR: &str = "GITHUB_TOKEN";

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Watch GitHub Actions workflow runs and notify on completion"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Personal access token; replaces the stored token (falls back to $GITHUB_TOKEN)
    #[arg(long)]
    token: Option<String>,

    /// Run a single poll cycle and exit
    #[arg(long)]
    once: bool,

    /// Print an example config and exit
    #[arg(long)]
    example_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.example_config {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load_or_default(Some(&args.config));
    cfg.ensure_dirs()?;

    let state = Arc::new(StateStore::open(cfg.state_path()));
    let token = args.token.clone().or_else(|| std::env::var(TOKEN_VAR).ok());
    if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
        state.set_token(token.trim())?;
    }

    let base_url = Url::parse(&cfg.api_base).context("invalid api_base")?;
    let client = Arc::new(GitHubClient::new(base_url, state.clone(), Arc::new(RateGate::new()))?);
    let sink = notifier::from_command(cfg.notify_command.as_deref())?;
    let mut poller = Poller::new(cfg.clone(), state.clone(), client.clone(), sink);

    if args.once {
        let user = match client.get_identity().await {
            Identity::User(user) => user,
            Identity::Unauthorized => bail!("no valid token; pass --token or set {TOKEN_VAR}"),
            Identity::Unavailable => bail!("GitHub API unavailable; try again later"),
        };
        info!(user = %user, "connected");
        let report = poller.poll_once().await?;
        info!(?report, "poll cycle finished");
        return Ok(());
    }

    let (worker, handle) = worker::worker(
        poller,
        client,
        state.clone(),
        Arc::new(EnvCredentials::new(TOKEN_VAR)),
    );
    if !state.has_token() {
        handle.request_auth();
    }

    info!(config = %args.config.display(), "starting gha-notifier");
    let task = tokio::spawn(worker.run());
    wait_for_signals(&handle, &args.config).await;
    handle.shutdown();
    task.await.context("poll worker panicked")?;
    Ok(())
}

/// Block until ctrl-c. On unix, SIGHUP reloads the config, SIGUSR1 polls now
/// and SIGUSR2 requests reauthentication.
#[cfg(unix)]
async fn wait_for_signals(handle: &WorkerHandle, config_path: &Path) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut hup, mut usr1, mut usr2) = match (
        signal(SignalKind::hangup()),
        signal(SignalKind::user_defined1()),
        signal(SignalKind::user_defined2()),
    ) {
        (Ok(hup), Ok(usr1), Ok(usr2)) => (hup, usr1, usr2),
        _ => {
            error!("failed to install signal handlers; only ctrl-c is honoured");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return,
            _ = hup.recv() => match config::load(Some(config_path)) {
                Ok(cfg) => handle.reload_config(cfg),
                Err(err) => error!(%err, "config reload failed; keeping current config"),
            },
            _ = usr1.recv() => handle.poll_now(),
            _ = usr2.recv() => handle.request_auth(),
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(_handle: &WorkerHandle, _config_path: &Path) {
    let _ = tokio::signal::ctrl_c().await;
}
