//! Process supervisor: spawns and terminates OS processes, wires their
//! stdout/stderr into per-process log files, reaps exit events and drives the
//! restart policy engine against the registry.
//!
//! The supervisor is owned exclusively by the daemon loop, which serializes
//! every mutation. Slow operations (waiting out a kill timeout, git traffic)
//! run in detached tasks; their outcomes come back as events. Replies to
//! mutating commands are parked as continuations keyed by process name and
//! released when the exit watcher confirms the transition, so a command
//! returns only after its state change has actually been applied.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
#[cfg(unix)]
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
#[cfg(unix)]
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::errors::RemusError;
use crate::gitwatch::GitPollJob;
use crate::logging::{self, open_log_writers, ProcessLogs};
use crate::process::{
    now_epoch_ms, DesiredState, ManagedProcess, ProcessExitEvent, ProcessState, StartSpec,
};
use crate::registry::{validate_name, Registry};
use crate::restart::{self, Decision};
use crate::storage::{self, ProcessList, Snapshot, SnapshotEntry};

/// Resolved when the requested transition has been fully applied.
pub type Completion = oneshot::Sender<Result<ManagedProcess>>;

/// A remote commit that needs to be pulled and rolled out.
#[derive(Debug, Clone)]
pub struct GitUpdate {
    pub name: String,
    pub workdir: PathBuf,
    pub branch: String,
    pub commit: String,
}

/// What to do once a stopping process has actually exited.
enum Continuation {
    Reply(Completion),
    Restart(Completion),
    Delete(Completion),
    GitRestart { commit: String },
}

pub struct Supervisor {
    config: AppConfig,
    registry: Registry,
    exit_tx: UnboundedSender<ProcessExitEvent>,
    /// Armed crash restarts, name -> due epoch ms. Removing an entry cancels
    /// the pending restart.
    pending_restarts: HashMap<String, u64>,
    continuations: HashMap<String, Vec<Continuation>>,
    /// Next git poll per online git-bound process, name -> due epoch ms.
    git_next_poll: HashMap<String, u64>,
    /// PIDs inherited from a previous daemon incarnation, cleaned by
    /// `reap_stale`.
    stale_pids: Vec<(u32, u64)>,
}

impl Supervisor {
    pub fn new(config: AppConfig, exit_tx: UnboundedSender<ProcessExitEvent>) -> Result<Self> {
        let list = storage::load_process_list(&config.state_path)?;
        let mut registry = Registry::new(list.next_id);
        let mut stale_pids = Vec::new();

        for mut process in list.processes {
            if let Some(pid) = process.pid {
                stale_pids.push((pid, process.restart.kill_timeout_ms));
            }
            process.pid = None;
            process.state = ProcessState::Stopped;
            process.desired = DesiredState::Stopped;
            process.restart_count = 0;
            process.unstable_exits = 0;
            process.cpu_percent = 0.0;
            process.memory_bytes = 0;
            process.last_sample_at_ms = None;
            registry.insert(process);
        }

        Ok(Self {
            config,
            registry,
            exit_tx,
            pending_restarts: HashMap::new(),
            continuations: HashMap::new(),
            git_next_poll: HashMap::new(),
            stale_pids,
        })
    }

    /// Terminate children left over from a previous daemon run before
    /// anything new is launched.
    pub async fn reap_stale(&mut self) {
        for (pid, kill_timeout_ms) in std::mem::take(&mut self.stale_pids) {
            if process_exists(pid) {
                warn!("cleaning stale pid {pid} from previous daemon run");
                let _ = terminate_pid(pid, Duration::from_millis(kill_timeout_ms.max(100))).await;
            }
        }
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn list(&self) -> Vec<ManagedProcess> {
        self.registry.list()
    }

    pub fn get(&self, target: &str) -> Result<ManagedProcess> {
        let name = self.registry.resolve(target)?;
        self.registry
            .get(&name)
            .cloned()
            .ok_or_else(|| RemusError::ProcessNotFound(target.to_string()).into())
    }

    pub fn logs_for(&self, target: &str) -> Result<ProcessLogs> {
        let process = self.get(target)?;
        Ok(ProcessLogs {
            stdout: process.stdout_log,
            stderr: process.stderr_log,
        })
    }

    pub fn resolve_targets(&self, target: &str) -> Result<Vec<String>> {
        self.registry.resolve_many(target)
    }

    /// Register a process (and launch it unless it is git-bound). When the
    /// command is just the name of an already-registered process, this starts
    /// that process instead.
    pub async fn start(&mut self, spec: StartSpec) -> Result<ManagedProcess> {
        let trimmed = spec.command.trim().to_string();
        if spec.name.is_none() && spec.git.is_none() && self.registry.contains(&trimmed) {
            return self.start_existing(&trimmed).await;
        }

        let (command, args) = parse_command_line(&spec.command)?;

        let name = match spec.name {
            Some(given) => {
                validate_name(&given)?;
                if self.registry.contains(&given) {
                    return Err(RemusError::DuplicateProcessName(given).into());
                }
                given
            }
            None => self.registry.auto_name(&command),
        };

        if let Some(cwd) = &spec.cwd {
            if !cwd.is_dir() {
                return Err(RemusError::WorkingDirMissing(cwd.clone()).into());
            }
        }
        let git_bound = spec.git.is_some();
        if git_bound && spec.cwd.is_none() {
            return Err(RemusError::GitWorkdirRequired(name).into());
        }

        let logs = logging::process_logs(&self.config.log_dir, &name);
        let process = ManagedProcess {
            id: self.registry.allocate_id(),
            name: name.clone(),
            command,
            args,
            cwd: spec.cwd,
            env: spec.env,
            restart: spec.restart,
            git: spec.git,
            watch: spec.watch,
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
            stdout_log: logs.stdout,
            stderr_log: logs.stderr,
        };
        self.registry.insert(process.clone());

        if git_bound {
            // Created stopped so the operator can inject configuration before
            // the first launch; polling starts once the process is started.
            info!("registered git-bound process {} (stopped)", process.target_label());
            self.save()?;
            return Ok(process);
        }

        self.start_existing(&name).await
    }

    /// Launch a registered process: stopped/errored -> launching -> online.
    pub async fn start_existing(&mut self, name: &str) -> Result<ManagedProcess> {
        let mut process = self
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| RemusError::ProcessNotFound(name.to_string()))?;

        match process.state {
            ProcessState::Online => return Ok(process),
            ProcessState::Stopping => {
                anyhow::bail!("process {} is still stopping", process.target_label())
            }
            _ => {}
        }

        process.state = ProcessState::Launching;
        match self.spawn_child(&process).await {
            Ok(pid) => {
                process.pid = Some(pid);
                process.state = ProcessState::Online;
                process.desired = DesiredState::Running;
                process.last_started_at_ms = Some(now_epoch_ms());
                process.last_exit_code = None;
                info!("started process {} with pid {pid}", process.target_label());

                if process.git.is_some() {
                    self.git_next_poll.insert(name.to_string(), now_epoch_ms());
                }
                self.registry.insert(process.clone());
                self.save()?;
                Ok(process)
            }
            Err(err) => {
                process.pid = None;
                process.state = ProcessState::Stopped;
                self.registry.insert(process);
                self.save()?;
                Err(err)
            }
        }
    }

    /// Idempotent: stopping an already-stopped process succeeds without any
    /// state change. A stop during a pending backoff restart cancels it, and a
    /// stop during an in-flight restart cancels the relaunch.
    pub fn stop(&mut self, name: &str, done: Completion) {
        self.pending_restarts.remove(name);
        self.git_next_poll.remove(name);
        self.cancel_parked_restarts(name);

        let (state, pid, kill_timeout_ms) = {
            let Some(process) = self.registry.get_mut(name) else {
                let _ = done.send(Err(RemusError::ProcessNotFound(name.to_string()).into()));
                return;
            };
            process.desired = DesiredState::Stopped;
            (process.state, process.pid, process.restart.kill_timeout_ms)
        };

        match (state, pid) {
            (ProcessState::Stopped, _) => {
                self.persist();
                self.reply_with_current(name, done);
            }
            (ProcessState::Errored, _) | (ProcessState::Launching, None) => {
                if let Some(process) = self.registry.get_mut(name) {
                    process.state = ProcessState::Stopped;
                    process.unstable_exits = 0;
                }
                self.persist();
                self.reply_with_current(name, done);
            }
            (ProcessState::Stopping, _) => {
                self.park(name, Continuation::Reply(done));
            }
            (_, Some(pid)) => {
                if let Some(process) = self.registry.get_mut(name) {
                    process.state = ProcessState::Stopping;
                }
                self.park(name, Continuation::Reply(done));
                self.persist();
                spawn_terminator(pid, kill_timeout_ms);
            }
            (_, None) => {
                if let Some(process) = self.registry.get_mut(name) {
                    process.state = ProcessState::Stopped;
                }
                self.persist();
                self.reply_with_current(name, done);
            }
        }
    }

    /// Stop followed immediately by start with the stored spec, bypassing the
    /// crash-backoff path. `restart_count` is untouched: it only tracks crash
    /// cycles.
    pub async fn restart(&mut self, name: &str, done: Completion) {
        self.pending_restarts.remove(name);

        let (state, pid, kill_timeout_ms) = {
            let Some(process) = self.registry.get_mut(name) else {
                let _ = done.send(Err(RemusError::ProcessNotFound(name.to_string()).into()));
                return;
            };
            process.unstable_exits = 0;
            process.desired = DesiredState::Running;
            (process.state, process.pid, process.restart.kill_timeout_ms)
        };

        match (state, pid) {
            (ProcessState::Stopping, _) => {
                self.park(name, Continuation::Restart(done));
            }
            (_, Some(pid)) => {
                if let Some(process) = self.registry.get_mut(name) {
                    process.state = ProcessState::Stopping;
                }
                self.park(name, Continuation::Restart(done));
                self.persist();
                spawn_terminator(pid, kill_timeout_ms);
            }
            (_, None) => {
                let _ = done.send(self.start_existing(name).await);
            }
        }
    }

    /// Stop (if needed) then remove from the registry.
    pub fn delete(&mut self, name: &str, done: Completion) {
        self.pending_restarts.remove(name);
        self.git_next_poll.remove(name);
        self.cancel_parked_restarts(name);

        let (state, pid, kill_timeout_ms) = {
            let Some(process) = self.registry.get_mut(name) else {
                let _ = done.send(Err(RemusError::ProcessNotFound(name.to_string()).into()));
                return;
            };
            process.desired = DesiredState::Stopped;
            (process.state, process.pid, process.restart.kill_timeout_ms)
        };

        match (state, pid) {
            (ProcessState::Stopping, _) => {
                self.park(name, Continuation::Delete(done));
            }
            (_, Some(pid)) => {
                if let Some(process) = self.registry.get_mut(name) {
                    process.state = ProcessState::Stopping;
                }
                self.park(name, Continuation::Delete(done));
                self.persist();
                spawn_terminator(pid, kill_timeout_ms);
            }
            (_, None) => {
                let removed = self
                    .registry
                    .remove(name)
                    .ok_or_else(|| RemusError::ProcessNotFound(name.to_string()).into());
                self.persist();
                let _ = done.send(removed);
            }
        }
    }

    /// Central state-machine step: an OS process exited (reported by its exit
    /// watcher or synthesized by the resource monitor).
    pub async fn handle_exit_event(&mut self, event: ProcessExitEvent) -> Result<()> {
        let supervised = {
            let Some(process) = self.registry.get_mut(&event.name) else {
                return Ok(());
            };
            // A stale watcher from an earlier incarnation must not touch the
            // current one.
            if process.pid != Some(event.pid) {
                return Ok(());
            }

            process.pid = None;
            process.last_exit_code = event.exit_code;
            process.cpu_percent = 0.0;
            process.memory_bytes = 0;

            process.state == ProcessState::Stopping || process.desired == DesiredState::Stopped
        };
        self.git_next_poll.remove(&event.name);

        if supervised {
            if let Some(process) = self.registry.get_mut(&event.name) {
                process.state = ProcessState::Stopped;
                process.unstable_exits = 0;
            }
            self.save()?;
            self.run_continuations(&event.name).await?;
            return Ok(());
        }

        // Unexpected exit while the process was supposed to be running.
        let uptime = self
            .registry
            .get(&event.name)
            .and_then(|process| process.last_started_at_ms)
            .map(|started| now_epoch_ms().saturating_sub(started))
            .unwrap_or(0);
        let cause = if event.wait_error {
            "lost track of the child".to_string()
        } else if event.success {
            "exited cleanly".to_string()
        } else {
            match event.exit_code {
                Some(code) => format!("exited with code {code}"),
                None => "was killed by a signal".to_string(),
            }
        };
        self.schedule_crash_recovery(&event.name, uptime, &cause)
    }

    /// Consume one unit of crash budget: arm the next backoff restart or mark
    /// the process errored when the budget is spent.
    fn schedule_crash_recovery(&mut self, name: &str, uptime_ms: u64, cause: &str) -> Result<()> {
        let decision = {
            let Some(process) = self.registry.get_mut(name) else {
                return Ok(());
            };
            let decision = restart::evaluate(
                &process.restart,
                process.restart_count,
                process.unstable_exits,
                uptime_ms,
            );
            match &decision {
                Decision::Restart { delay, next_streak } => {
                    process.restart_count = process.restart_count.saturating_add(1);
                    process.unstable_exits = *next_streak;
                    process.state = ProcessState::Launching;
                    warn!(
                        "process {} {cause}; restart {} in {}ms",
                        process.target_label(),
                        process.restart_count,
                        delay.as_millis()
                    );
                }
                Decision::GiveUp => {
                    process.state = ProcessState::Errored;
                    error!(
                        "process {} {cause} with its restart budget of {} spent; marking errored",
                        process.target_label(),
                        process.restart.max_restarts
                    );
                }
            }
            decision
        };

        if let Decision::Restart { delay, .. } = decision {
            let due = now_epoch_ms().saturating_add(delay.as_millis() as u64);
            self.pending_restarts.insert(name.to_string(), due);
        }
        self.save()
    }

    /// Fire backoff restarts whose delay has elapsed. Driven by a short
    /// daemon tick so delays are scheduled, never busy-waited.
    pub async fn run_due_restarts(&mut self) -> Result<()> {
        let now = now_epoch_ms();
        let due: Vec<String> = self
            .pending_restarts
            .iter()
            .filter(|(_, due_at)| **due_at <= now)
            .map(|(name, _)| name.clone())
            .collect();

        for name in due {
            self.pending_restarts.remove(&name);
            if let Err(err) = self.start_existing(&name).await {
                // A respawn failure burns budget like a crash; errored only
                // once the budget is spent.
                let cause = format!("failed to respawn: {err}");
                self.schedule_crash_recovery(&name, 0, &cause)?;
            }
        }
        Ok(())
    }

    /// Scan for git-bound online processes whose poll interval elapsed.
    /// `in_flight` suppresses overlapping checks for the same process.
    pub fn due_git_polls(&mut self, in_flight: &std::collections::HashSet<String>) -> Vec<GitPollJob> {
        let now = now_epoch_ms();
        let candidates: Vec<(String, String, String, PathBuf, u64, bool)> = self
            .registry
            .values()
            .filter(|process| process.state == ProcessState::Online)
            .filter_map(|process| {
                let git = process.git.as_ref()?;
                let cwd = process.cwd.clone()?;
                Some((
                    process.name.clone(),
                    git.repo_url.clone(),
                    git.branch.clone(),
                    cwd,
                    git.poll_interval_secs.max(1),
                    git.last_commit.is_none(),
                ))
            })
            .collect();

        let mut jobs = Vec::new();
        for (name, repo_url, branch, workdir, interval_secs, baseline) in candidates {
            if in_flight.contains(&name) {
                continue;
            }
            let due = self.git_next_poll.get(&name).copied().unwrap_or(now);
            if due > now {
                continue;
            }
            self.git_next_poll
                .insert(name.clone(), now.saturating_add(interval_secs.saturating_mul(1000)));
            jobs.push(GitPollJob {
                name,
                repo_url,
                branch,
                workdir,
                baseline,
            });
        }
        jobs
    }

    /// Record the local HEAD of a freshly started git-bound process.
    pub fn handle_git_baseline(&mut self, name: &str, commit: String) {
        if let Some(process) = self.registry.get_mut(name) {
            if let Some(git) = process.git.as_mut() {
                if git.last_commit.is_none() {
                    info!("git baseline for process {name}: {commit}");
                    git.last_commit = Some(commit);
                    self.persist();
                }
            }
        }
    }

    /// Compare a polled remote head against the stored commit. Returns the
    /// pull job when the tracked branch moved. A failed poll is transient:
    /// logged and retried next tick.
    pub fn handle_remote_head(&mut self, name: &str, result: Result<String>) -> Option<GitUpdate> {
        let head = match result {
            Ok(head) => head,
            Err(err) => {
                warn!("git poll failed for process {name}: {err}");
                return None;
            }
        };

        let process = self.registry.get(name)?;
        if process.state != ProcessState::Online {
            return None;
        }
        let git = process.git.as_ref()?;
        let workdir = process.cwd.clone()?;

        match git.last_commit.as_deref() {
            None => None, // baseline not recorded yet
            Some(last) if last == head => None,
            Some(last) => {
                info!("update detected for process {name}: {last} -> {head}");
                Some(GitUpdate {
                    name: name.to_string(),
                    workdir,
                    branch: git.branch.clone(),
                    commit: head,
                })
            }
        }
    }

    /// A pull finished: on success, gracefully restart with the updated code.
    /// The stored commit hash is only advanced once the restart succeeds, so
    /// a failed rollout is retried on the next poll.
    pub fn handle_pull_finished(&mut self, name: &str, commit: String, result: Result<()>) {
        if let Err(err) = result {
            warn!("git pull failed for process {name}: {err}");
            return;
        }

        let (state, pid, kill_timeout_ms) = {
            let Some(process) = self.registry.get(name) else {
                return;
            };
            (process.state, process.pid, process.restart.kill_timeout_ms)
        };

        match (state, pid) {
            (ProcessState::Online, Some(pid)) => {
                if let Some(process) = self.registry.get_mut(name) {
                    process.state = ProcessState::Stopping;
                }
                self.park(name, Continuation::GitRestart { commit });
                self.persist();
                spawn_terminator(pid, kill_timeout_ms);
            }
            _ => {
                warn!("skipping git rollout for process {name}: not online anymore");
            }
        }
    }

    /// Point-in-time snapshot of every process spec plus its "was online"
    /// flag, written atomically for later `resurrect`.
    pub fn save_snapshot(&self) -> Result<usize> {
        let entries: Vec<SnapshotEntry> = self
            .registry
            .list()
            .into_iter()
            .map(|process| SnapshotEntry {
                was_online: process.is_active() && process.desired == DesiredState::Running,
                name: process.name,
                command: process.command,
                args: process.args,
                cwd: process.cwd,
                env: process.env,
                restart: process.restart,
                git: process.git,
                watch: process.watch,
            })
            .collect();
        let count = entries.len();
        storage::save_snapshot(&self.config.snapshot_path, &Snapshot { entries })?;
        Ok(count)
    }

    /// Replay the snapshot: start everything flagged "was online" unless a
    /// process of the same name is already running. Per-entry failures are
    /// logged, never fatal.
    pub async fn resurrect(&mut self) -> Result<String> {
        let Some(snapshot) = storage::load_snapshot(&self.config.snapshot_path)? else {
            return Ok("no snapshot found; nothing to resurrect".to_string());
        };

        let mut started = 0_usize;
        let mut skipped = 0_usize;
        let mut failed = 0_usize;

        for entry in snapshot.entries {
            if let Some(existing) = self.registry.get(&entry.name) {
                if existing.is_active() {
                    info!("resurrect: process {} is already running; skipping", entry.name);
                    skipped += 1;
                    continue;
                }
            } else {
                let logs = logging::process_logs(&self.config.log_dir, &entry.name);
                let process = ManagedProcess {
                    id: self.registry.allocate_id(),
                    name: entry.name.clone(),
                    command: entry.command,
                    args: entry.args,
                    cwd: entry.cwd,
                    env: entry.env,
                    restart: entry.restart,
                    git: entry.git,
                    watch: entry.watch,
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
                    stdout_log: logs.stdout,
                    stderr_log: logs.stderr,
                };
                self.registry.insert(process);
            }

            if entry.was_online {
                match self.start_existing(&entry.name).await {
                    Ok(_) => started += 1,
                    Err(err) => {
                        failed += 1;
                        error!("resurrect failed to start process {}: {err}", entry.name);
                    }
                }
            }
        }

        self.save()?;
        Ok(format!(
            "resurrected {started} process(es), {skipped} already running, {failed} failed"
        ))
    }

    /// Truncate log files for one target or every process.
    pub fn flush(&self, target: Option<&str>) -> Result<String> {
        let names = self.registry.resolve_many(target.unwrap_or("all"))?;
        let mut flushed = 0_usize;
        for name in &names {
            if let Some(process) = self.registry.get(name) {
                logging::flush_logs(&ProcessLogs {
                    stdout: process.stdout_log.clone(),
                    stderr: process.stderr_log.clone(),
                })?;
                flushed += 1;
            }
        }
        Ok(format!("flushed logs for {flushed} process(es)"))
    }

    /// Graceful daemon shutdown: stop every live process honoring its own
    /// kill timeout.
    pub async fn shutdown_all(&mut self) -> Result<()> {
        self.pending_restarts.clear();
        self.git_next_poll.clear();
        for (_, parked) in self.continuations.drain() {
            for continuation in parked {
                match continuation {
                    Continuation::Reply(done)
                    | Continuation::Restart(done)
                    | Continuation::Delete(done) => {
                        let _ = done.send(Err(anyhow::anyhow!("daemon is shutting down")));
                    }
                    Continuation::GitRestart { .. } => {}
                }
            }
        }

        let names: Vec<String> = self.registry.list().into_iter().map(|p| p.name).collect();
        for name in names {
            let live = self
                .registry
                .get(&name)
                .and_then(|process| process.pid.map(|pid| (pid, process.restart.kill_timeout_ms)));
            if let Some((pid, kill_timeout_ms)) = live {
                let _ = terminate_pid(pid, Duration::from_millis(kill_timeout_ms.max(100))).await;
            }
            if let Some(process) = self.registry.get_mut(&name) {
                process.pid = None;
                if process.state != ProcessState::Errored {
                    process.state = ProcessState::Stopped;
                }
                process.cpu_percent = 0.0;
                process.memory_bytes = 0;
            }
        }
        self.save()
    }

    fn park(&mut self, name: &str, continuation: Continuation) {
        self.continuations
            .entry(name.to_string())
            .or_default()
            .push(continuation);
    }

    /// Drop parked relaunches so a later stop/delete cannot be answered with
    /// the process back online. Restart waiters get a cancellation error;
    /// a superseded git rollout is retried by the next poll.
    fn cancel_parked_restarts(&mut self, name: &str) {
        let Some(parked) = self.continuations.get_mut(name) else {
            return;
        };
        let mut kept = Vec::with_capacity(parked.len());
        for continuation in parked.drain(..) {
            match continuation {
                Continuation::Restart(done) => {
                    let _ = done.send(Err(anyhow::anyhow!(
                        "restart of process {name} cancelled by a later stop"
                    )));
                }
                Continuation::GitRestart { commit } => {
                    warn!("git rollout of process {name} to {commit} superseded by a stop");
                }
                other => kept.push(other),
            }
        }
        *parked = kept;
    }

    fn reply_with_current(&self, name: &str, done: Completion) {
        let result = self
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| RemusError::ProcessNotFound(name.to_string()).into());
        let _ = done.send(result);
    }

    async fn run_continuations(&mut self, name: &str) -> Result<()> {
        let Some(parked) = self.continuations.remove(name) else {
            return Ok(());
        };

        for continuation in parked {
            match continuation {
                Continuation::Reply(done) => {
                    self.reply_with_current(name, done);
                }
                Continuation::Restart(done) => {
                    let _ = done.send(self.start_existing(name).await);
                }
                Continuation::Delete(done) => {
                    let removed = self
                        .registry
                        .remove(name)
                        .ok_or_else(|| RemusError::ProcessNotFound(name.to_string()).into());
                    self.save()?;
                    let _ = done.send(removed);
                }
                Continuation::GitRestart { commit } => match self.start_existing(name).await {
                    Ok(_) => {
                        if let Some(process) = self.registry.get_mut(name) {
                            if let Some(git) = process.git.as_mut() {
                                git.last_commit = Some(commit.clone());
                            }
                        }
                        info!("process {name} rolled forward to commit {commit}");
                        self.save()?;
                    }
                    Err(err) => {
                        warn!("restart after git update failed for process {name}: {err}");
                    }
                },
            }
        }
        Ok(())
    }

    async fn spawn_child(&self, process: &ManagedProcess) -> Result<u32> {
        let logs = ProcessLogs {
            stdout: process.stdout_log.clone(),
            stderr: process.stderr_log.clone(),
        };
        let (stdout, stderr) = open_log_writers(&logs)?;

        let mut command = Command::new(&process.command);
        #[cfg(unix)]
        {
            // Children get their own process group so termination can target
            // the full tree.
            unsafe {
                command.pre_exec(|| {
                    if nix::libc::setpgid(0, 0) == 0 {
                        Ok(())
                    } else {
                        Err(std::io::Error::last_os_error())
                    }
                });
            }
        }
        command
            .args(&process.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        if let Some(cwd) = &process.cwd {
            command.current_dir(cwd);
        }
        if !process.env.is_empty() {
            command.envs(&process.env);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", process.command))?;
        let pid = child.id().context("spawned child has no pid")?;

        let tx = self.exit_tx.clone();
        let name = process.name.clone();
        tokio::spawn(async move {
            let event = match child.wait().await {
                Ok(status) => ProcessExitEvent {
                    name,
                    pid,
                    exit_code: status.code(),
                    success: status.success(),
                    wait_error: false,
                },
                Err(err) => {
                    error!("child wait failed: {err}");
                    ProcessExitEvent {
                        name,
                        pid,
                        exit_code: None,
                        success: false,
                        wait_error: true,
                    }
                }
            };
            let _ = tx.send(event);
        });

        Ok(pid)
    }

    fn save(&self) -> Result<()> {
        let list = ProcessList {
            next_id: self.registry.next_id(),
            processes: self.registry.list(),
        };
        storage::save_process_list(&self.config.state_path, &list)
    }

    fn persist(&self) {
        if let Err(err) = self.save() {
            error!("failed to persist process list: {err}");
        }
    }

    #[cfg(test)]
    pub fn force_restart_due(&mut self, name: &str) {
        if let Some(due) = self.pending_restarts.get_mut(name) {
            *due = 0;
        }
    }

    #[cfg(test)]
    pub fn has_pending_restart(&self, name: &str) -> bool {
        self.pending_restarts.contains_key(name)
    }
}

fn parse_command_line(command_line: &str) -> Result<(String, Vec<String>)> {
    let tokens = shell_words::split(command_line)
        .map_err(|err| RemusError::InvalidCommand(err.to_string()))?;

    if tokens.is_empty() {
        return Err(RemusError::InvalidCommand("command cannot be empty".to_string()).into());
    }

    let command = tokens[0].clone();
    let args = tokens[1..].to_vec();
    Ok((command, args))
}

/// Runs off the registry path; the exit watcher reports the actual death.
fn spawn_terminator(pid: u32, kill_timeout_ms: u64) {
    let timeout = Duration::from_millis(kill_timeout_ms.max(100));
    tokio::spawn(async move {
        if let Err(err) = terminate_pid(pid, timeout).await {
            warn!("failed to terminate pid {pid}: {err}");
        }
    });
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_exists(pid: u32) -> bool {
    use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};

    let mut system = System::new_all();
    system.refresh_processes(ProcessesToUpdate::Some(&[SysPid::from_u32(pid)]), true);
    system.process(SysPid::from_u32(pid)).is_some()
}

/// Graceful termination of a process group: signal, wait out the kill
/// timeout, then force-kill. Escalation is a warning, not a failure.
#[cfg(unix)]
async fn terminate_pid(pid: u32, timeout: Duration) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let os_pid = Pid::from_raw(pid as i32);
    let pgid = Pid::from_raw(-(pid as i32));

    let mut delivered = false;
    match kill(pgid, Signal::SIGTERM) {
        Ok(()) => delivered = true,
        Err(Errno::ESRCH) => {}
        Err(err) => {
            warn!("failed to signal process group of pid {pid}: {err}");
        }
    }

    if !delivered {
        match kill(os_pid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(()),
            Err(err) => {
                return Err(anyhow::anyhow!("failed to send SIGTERM to {pid}: {err}"));
            }
        }
    }

    let start = Instant::now();
    while start.elapsed() < timeout {
        if !process_exists(pid) {
            return Ok(());
        }
        sleep(Duration::from_millis(100)).await;
    }

    if process_exists(pid) {
        warn!(
            "kill timeout of {}ms exceeded for pid {pid}; escalating to SIGKILL",
            timeout.as_millis()
        );
        let _ = kill(pgid, Signal::SIGKILL);
        let _ = kill(os_pid, Signal::SIGKILL);
    }

    Ok(())
}

#[cfg(windows)]
async fn terminate_pid(pid: u32, timeout: Duration) -> Result<()> {
    use tokio::time::{sleep, timeout as tokio_timeout, Instant};

    if !process_exists(pid) {
        return Ok(());
    }

    let taskkill_timeout = timeout.max(Duration::from_secs(2));
    let pid_string = pid.to_string();
    tokio_timeout(
        taskkill_timeout,
        Command::new("taskkill")
            .args(["/PID", &pid_string, "/T"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status(),
    )
    .await
    .context("taskkill timed out during graceful stop")?
    .context("failed to run taskkill for graceful stop")?;

    let start = Instant::now();
    while start.elapsed() < timeout {
        if !process_exists(pid) {
            return Ok(());
        }
        sleep(Duration::from_millis(100)).await;
    }

    if process_exists(pid) {
        warn!("kill timeout exceeded for pid {pid}; escalating to forced taskkill");
        let force_status = tokio_timeout(
            taskkill_timeout,
            Command::new("taskkill")
                .args(["/PID", &pid_string, "/T", "/F"])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status(),
        )
        .await
        .context("taskkill timed out during forced stop")?
        .context("failed to run taskkill for forced stop")?;
        if !force_status.success() && process_exists(pid) {
            anyhow::bail!("failed to force-kill process {pid} with taskkill");
        }
    }

    Ok(())
}

#[cfg(not(any(unix, windows)))]
async fn terminate_pid(_pid: u32, _timeout: Duration) -> Result<()> {
    Ok(())
}
