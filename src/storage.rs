//! Durable registry state. Two files live under the base directory:
//!
//! - `state.json`: the live process list, rewritten after every registry
//!   mutation so launch parameters survive a daemon crash;
//! - `snapshot.json`: an explicit `save` snapshot with a `was_online` flag
//!   per entry, replayed by `resurrect`.
//!
//! Both are written atomically (tmp file + rename) and a corrupted file is
//! quarantined instead of aborting startup.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::process::{GitBinding, ManagedProcess, RestartConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessList {
    pub next_id: u64,
    pub processes: Vec<ManagedProcess>,
}

impl Default for ProcessList {
    fn default() -> Self {
        Self {
            next_id: 1,
            processes: Vec::new(),
        }
    }
}

/// One record per managed process in a `save` snapshot: the spec portion
/// plus whether the process was running when the snapshot was taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub restart: RestartConfig,
    #[serde(default)]
    pub git: Option<GitBinding>,
    #[serde(default)]
    pub watch: bool,
    pub was_online: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub entries: Vec<SnapshotEntry>,
}

pub fn load_process_list(path: &Path) -> Result<ProcessList> {
    match load_or_quarantine::<ProcessList>(path)? {
        Some(list) => Ok(list),
        None => Ok(ProcessList::default()),
    }
}

pub fn save_process_list(path: &Path, list: &ProcessList) -> Result<()> {
    let payload = serde_json::to_vec_pretty(list)?;
    write_atomic(path, &payload)
}

/// `Ok(None)` when no snapshot has ever been saved.
pub fn load_snapshot(path: &Path) -> Result<Option<Snapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    Ok(load_or_quarantine::<Snapshot>(path)?)
}

pub fn save_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let payload = serde_json::to_vec_pretty(snapshot)?;
    write_atomic(path, &payload)
}

fn load_or_quarantine<T>(path: &Path) -> Result<Option<T>>
where
    T: for<'de> Deserialize<'de>,
{
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(None);
    }

    match serde_json::from_str::<T>(&content) {
        Ok(value) => Ok(Some(value)),
        Err(error) => {
            let backup = quarantine_path(path);
            if let Err(rename_err) = fs::rename(path, &backup) {
                warn!(
                    "failed to move corrupted file {} -> {}: {rename_err}",
                    path.display(),
                    backup.display()
                );
            } else {
                warn!(
                    "{} is corrupted ({error}), moved to {}",
                    path.display(),
                    backup.display()
                );
            }
            Ok(None)
        }
    }
}

fn write_atomic(path: &Path, payload: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, payload)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    replace_file(&tmp_path, path)
}

fn quarantine_path(path: &Path) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    path.with_extension(format!("corrupt-{suffix}.json"))
}

fn replace_file(tmp_path: &Path, path: &Path) -> Result<()> {
    match fs::rename(tmp_path, path) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            #[cfg(windows)]
            {
                if path.exists() {
                    fs::remove_file(path)
                        .with_context(|| format!("failed to remove {}", path.display()))?;
                    fs::rename(tmp_path, path)
                        .with_context(|| format!("failed to replace {}", path.display()))?;
                    return Ok(());
                }
            }

            Err(rename_err).with_context(|| format!("failed to replace {}", path.display()))
        }
    }
}
