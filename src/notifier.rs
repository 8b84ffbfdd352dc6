//! Notification sinks: where run completions end up once the poller decides
//! they are worth reporting.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::process::Command;
use tracing::info;

use crate::model::{Conclusion, RunNotice};

pub const SUMMARY_TITLE: &str = "GitHub Actions";

/// Delivers notifications. Errors are reported back but callers treat them
/// as non-fatal.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_run(&self, notice: &RunNotice) -> Result<()>;

    /// `count` further notifiable runs were not shown individually this cycle.
    async fn notify_summary(&self, count: usize) -> Result<()>;
}

pub fn run_title(notice: &RunNotice) -> String {
    let tag = if notice.conclusion == Conclusion::Success {
        "[PASS]"
    } else {
        "[FAIL]"
    };
    format!("{tag} {}", notice.repo)
}

pub fn run_body(notice: &RunNotice) -> String {
    let outcome = if notice.conclusion == Conclusion::Success {
        "passed"
    } else {
        "FAILED"
    };
    format!("{} on {} {outcome}", notice.workflow, notice.branch)
}

pub fn summary_body(count: usize) -> String {
    format!("...and {count} more workflow run(s) completed.")
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify_run(&self, notice: &RunNotice) -> Result<()> {
        info!(
            url = %notice.url,
            "{} - {}",
            run_title(notice),
            run_body(notice)
        );
        Ok(())
    }

    async fn notify_summary(&self, count: usize) -> Result<()> {
        info!("{SUMMARY_TITLE} - {}", summary_body(count));
        Ok(())
    }
}

/// Spawns an external program (e.g. `notify-send`) with title and body appended.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    program: String,
    args: Vec<String>,
}

impl CommandNotifier {
    pub fn new(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("notify command is empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    async fn run(&self, title: &str, body: &str) -> Result<()> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(title)
            .arg(body)
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("failed to spawn {}", self.program))?;
        if !status.success() {
            return Err(anyhow!("{} exited with {}", self.program, status));
        }
        info!(title, body, "notification sent");
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for CommandNotifier {
    async fn notify_run(&self, notice: &RunNotice) -> Result<()> {
        let mut body = run_body(notice);
        if !notice.url.is_empty() {
            body.push('\n');
            body.push_str(&notice.url);
        }
        self.run(&run_title(notice), &body).await
    }

    async fn notify_summary(&self, count: usize) -> Result<()> {
        self.run(SUMMARY_TITLE, &summary_body(count)).await
    }
}

/// Pick the sink configured by `notify_command`, falling back to the log.
pub fn from_command(command: Option<&[String]>) -> Result<Arc<dyn NotificationSink>> {
    match command {
        Some(argv) => Ok(Arc::new(CommandNotifier::new(argv)?)),
        None => Ok(Arc::new(LogNotifier)),
    }
}
