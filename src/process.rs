use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Lifecycle state of a managed process. `Errored` is terminal until an
/// operator issues an explicit restart.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Launching,
    Online,
    Stopping,
    Errored,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Launching => "launching",
            ProcessState::Online => "online",
            ProcessState::Stopping => "stopping",
            ProcessState::Errored => "errored",
        };
        write!(f, "{value}")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Stopped,
}

/// Restart policy knobs. `max_restarts == 0` means the crash budget is
/// unlimited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestartConfig {
    #[serde(default)]
    pub max_restarts: u32,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_min_uptime_ms")]
    pub min_uptime_ms: u64,
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: 16,
            restart_delay_ms: default_restart_delay_ms(),
            min_uptime_ms: default_min_uptime_ms(),
            kill_timeout_ms: default_kill_timeout_ms(),
        }
    }
}

fn default_restart_delay_ms() -> u64 {
    1000
}

fn default_min_uptime_ms() -> u64 {
    1000
}

fn default_kill_timeout_ms() -> u64 {
    1600
}

/// Binding to a tracked git repository. The working directory of the process
/// is the local checkout the poller pulls into.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitBinding {
    pub repo_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub last_commit: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_poll_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSpec {
    pub command: String,
    pub name: Option<String>,
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub git: Option<GitBinding>,
    #[serde(default)]
    pub watch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedProcess {
    pub id: u64,
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub restart: RestartConfig,
    #[serde(default)]
    pub git: Option<GitBinding>,
    #[serde(default)]
    pub watch: bool,
    pub state: ProcessState,
    pub desired: DesiredState,
    pub pid: Option<u32>,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub unstable_exits: u32,
    #[serde(default)]
    pub last_started_at_ms: Option<u64>,
    #[serde(default)]
    pub last_exit_code: Option<i32>,
    #[serde(default)]
    pub cpu_percent: f32,
    #[serde(default)]
    pub memory_bytes: u64,
    #[serde(default)]
    pub last_sample_at_ms: Option<u64>,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
}

impl ManagedProcess {
    pub fn target_label(&self) -> String {
        format!("{} ({})", self.name, self.id)
    }

    /// True while an OS process is (or is supposed to be) attached.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            ProcessState::Launching | ProcessState::Online | ProcessState::Stopping
        )
    }

    /// Milliseconds the current incarnation has been up, measured from the
    /// last successful spawn.
    pub fn uptime_ms(&self, now_ms: u64) -> u64 {
        match (self.state, self.last_started_at_ms) {
            (ProcessState::Online | ProcessState::Stopping, Some(started)) => {
                now_ms.saturating_sub(started)
            }
            _ => 0,
        }
    }
}

/// Delivered by the per-child exit watcher (or synthesized by the resource
/// monitor when a tracked PID vanishes).
#[derive(Debug, Clone)]
pub struct ProcessExitEvent {
    pub name: String,
    pub pid: u32,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub wait_error: bool,
}

pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::{
        now_epoch_ms, DesiredState, ManagedProcess, ProcessState, RestartConfig, StartSpec,
    };
    use std::collections::HashMap;
    use std::path::PathBuf;

    #[test]
    fn state_display_matches_wire_names() {
        assert_eq!(ProcessState::Stopped.to_string(), "stopped");
        assert_eq!(ProcessState::Launching.to_string(), "launching");
        assert_eq!(ProcessState::Online.to_string(), "online");
        assert_eq!(ProcessState::Stopping.to_string(), "stopping");
        assert_eq!(ProcessState::Errored.to_string(), "errored");
    }

    #[test]
    fn uptime_is_zero_unless_running() {
        let mut process = fixture();
        let now = now_epoch_ms();
        process.state = ProcessState::Stopped;
        process.last_started_at_ms = Some(now.saturating_sub(5000));
        assert_eq!(process.uptime_ms(now), 0);

        process.state = ProcessState::Online;
        assert!(process.uptime_ms(now) >= 5000);
    }

    #[test]
    fn start_spec_defaults_fill_missing_fields() {
        let spec: StartSpec =
            serde_json::from_str(r#"{"command":"node server.js","name":null,"cwd":null}"#)
                .expect("minimal spec should deserialize");
        assert_eq!(spec.restart, RestartConfig::default());
        assert!(spec.git.is_none());
        assert!(!spec.watch);
        assert!(spec.env.is_empty());
    }

    fn fixture() -> ManagedProcess {
        ManagedProcess {
            id: 1,
            name: "api".to_string(),
            command: "node".to_string(),
            args: vec!["server.js".to_string()],
            cwd: None,
            env: HashMap::new(),
            restart: RestartConfig::default(),
            git: None,
            watch: false,
            state: ProcessState::Stopped,
            desired: DesiredState::Stopped,
            pid: None,
            restart_count: 0,
            unstable_exits: 0,
            last_started_at_ms: None,
            last_exit_code: None,
            cpu_percent: 0.0,
            memory_bytes: 0,
            last_sample_at_ms: None,
            stdout_log: PathBuf::from("/tmp/api.out.log"),
            stderr_log: PathBuf::from("/tmp/api.err.log"),
        }
    }
}
