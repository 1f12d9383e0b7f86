use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemusError {
    #[error("process not found: {0}")]
    ProcessNotFound(String),
    #[error("duplicate process name: {0}")]
    DuplicateProcessName(String),
    #[error("invalid process name: {0}")]
    InvalidProcessName(String),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("working directory does not exist: {0}")]
    WorkingDirMissing(PathBuf),
    #[error("git-bound process {0} needs --cwd pointing at a local checkout")]
    GitWorkdirRequired(String),
    #[error("daemon is already running")]
    DaemonAlreadyRunning,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
