//! Persistent token and per-repository watermarks.
//!
//! All access goes through one mutex: a mutation and its persist happen under
//! the same lock, so readers never observe a value that is ahead of a write in
//! flight from another caller. The file is replaced atomically (temp file,
//! fsync, rename, directory fsync); a crash mid-write leaves the previous
//! committed file readable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("state encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// On-disk document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateData {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub last_seen_run_ids: BTreeMap<String, u64>,
}

#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    data: Mutex<StateData>,
}

impl StateStore {
    /// Open the store at `path`. A missing file yields empty state; an
    /// unreadable or corrupt one is logged and also yields empty state.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match load(&path) {
            Ok(Some(data)) => data,
            Ok(None) => StateData::default(),
            Err(err) => {
                error!(path = %path.display(), %err, "failed to load state; starting empty");
                StateData::default()
            }
        };
        Self {
            path,
            data: Mutex::new(data),
        }
    }

    pub fn token(&self) -> String {
        self.lock().token.clone()
    }

    pub fn has_token(&self) -> bool {
        !self.lock().token.is_empty()
    }

    pub fn set_token(&self, token: &str) -> Result<(), StateError> {
        let mut data = self.lock();
        data.token = token.to_string();
        persist(&self.path, &data)
    }

    /// Last-seen run id for `repo`; 0 when the repository was never seen.
    pub fn get(&self, repo: &str) -> u64 {
        self.lock().last_seen_run_ids.get(repo).copied().unwrap_or(0)
    }

    /// Raise the watermark for `repo` to `run_id` and persist.
    ///
    /// Values at or below the current watermark are ignored. On a persist
    /// failure the in-memory watermark stays raised and the error is returned.
    pub fn set(&self, repo: &str, run_id: u64) -> Result<(), StateError> {
        let mut data = self.lock();
        let current = data.last_seen_run_ids.get(repo).copied().unwrap_or(0);
        if run_id <= current {
            debug!(repo, run_id, current, "ignoring non-increasing watermark");
            return Ok(());
        }
        data.last_seen_run_ids.insert(repo.to_string(), run_id);
        persist(&self.path, &data)
    }

    pub fn snapshot(&self) -> StateData {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, StateData> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn load(path: &Path) -> Result<Option<StateData>, StateError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StateError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let data = serde_json::from_slice(&bytes)?;
    info!(path = %path.display(), "loaded state");
    Ok(Some(data))
}

fn persist(path: &Path, data: &StateData) -> Result<(), StateError> {
    let body = serde_json::to_vec_pretty(data)?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let io_err = |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    };
    fs::create_dir_all(&dir).map_err(io_err)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state.json".into());
    let tmp = dir.join(format!("{file_name}.{}.tmp", Uuid::new_v4()));

    let written = write_synced(&tmp, &body).and_then(|()| fs::rename(&tmp, path));
    if let Err(source) = written {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(source));
    }
    fsync_dir(&dir).map_err(io_err)
}

fn write_synced(path: &Path, body: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(body)?;
    file.sync_all()
}

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> io::Result<()> {
    OpenOptions::new().read(true).open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
