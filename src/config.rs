//! Configuration loader and validator for the workflow-run notifier.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info};

pub const DEFAULT_API_BASE: &str = "https://api.github.com/";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration. Every key is optional; missing keys take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Seconds between poll cycles.
    pub poll_interval: u64,
    /// When non-empty, only these `owner/name` repositories are polled.
    pub allowlist: Vec<String>,
    /// Repositories to skip. Ignored when `allowlist` is non-empty.
    pub blocklist: Vec<String>,
    pub data_dir: String,
    pub api_base: String,
    /// Optional argv used to deliver notifications; title and body are appended.
    pub notify_command: Option<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: 30,
            allowlist: Vec::new(),
            blocklist: Vec::new(),
            data_dir: "./data".into(),
            api_base: DEFAULT_API_BASE.into(),
            notify_command: None,
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.data_dir)
    }

    pub fn state_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("state.json")
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
/// - If the file does not exist, the defaults are written there and returned.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    if !path.exists() {
        let cfg = Config::default();
        save(path, &cfg)?;
        return Ok(cfg);
    }
    let content = fs::read_to_string(path)?;
    let cfg: Config = if content.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(&content)?
    };
    validate(&cfg)?;
    Ok(cfg)
}

/// Like [`load`], but a broken file is logged and replaced by the defaults.
pub fn load_or_default(path: Option<&Path>) -> Config {
    load(path).unwrap_or_else(|err| {
        error!(%err, "failed to load config; using defaults");
        Config::default()
    })
}

pub fn save(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, serde_yaml::to_string(cfg)?)?;
    info!(path = %path.display(), "config saved");
    Ok(())
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.poll_interval == 0 {
        return Err(ConfigError::Invalid("poll_interval must be > 0"));
    }
    if cfg.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("data_dir must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.api_base).is_err() {
        return Err(ConfigError::Invalid("api_base must be an absolute URL"));
    }
    if let Some(cmd) = &cfg.notify_command {
        if cmd.first().map_or(true, |program| program.trim().is_empty()) {
            return Err(ConfigError::Invalid("notify_command must name a program"));
        }
    }
    Ok(())
}

/// Returns a documented example configuration.
pub fn example() -> &'static str {
    r#"# Seconds between poll cycles.
poll_interval: 30

# Only poll these repositories (takes precedence over blocklist).
allowlist:
  - octo-org/api
  - octo-org/web

# Never poll these repositories.
blocklist:
  - octo-org/archive

data_dir: "./data"
api_base: "https://api.github.com/"

# Deliver notifications through an external command; title and body are appended.
notify_command:
  - notify-send
  - --app-name=gha-notifier
"#
}
