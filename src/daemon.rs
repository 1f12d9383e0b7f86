//! Daemon runtime. A single task owns the supervisor and serializes every
//! mutation; client connections, exit watchers, the resource monitor and git
//! pollers all feed into it through channels. Read-only requests are answered
//! from a published snapshot without entering the supervisor loop at all.

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, Sender, UnboundedSender};
use tokio::sync::{oneshot, RwLock};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::errors::RemusError;
use crate::gitwatch::{self, GitEvent};
use crate::ipc::{self, IpcRequest, IpcResponse};
use crate::logging::ProcessLogs;
use crate::monitor::ResourceMonitor;
use crate::process::{ManagedProcess, ProcessExitEvent};
use crate::supervisor::Supervisor;

/// How often armed backoff restarts are checked for being due.
const RESTART_TICK: Duration = Duration::from_millis(250);
/// How often git-bound processes are scanned for an elapsed poll interval.
const GIT_TICK: Duration = Duration::from_secs(1);

struct ManagerCommand {
    request: IpcRequest,
    response_tx: oneshot::Sender<IpcResponse>,
}

/// Read-only view of the registry, republished after every mutation. Serves
/// list/info/log lookups without touching the supervisor.
#[derive(Clone, Default)]
pub struct DaemonSnapshot {
    processes: Arc<RwLock<Vec<ManagedProcess>>>,
}

impl DaemonSnapshot {
    async fn publish(&self, supervisor: &Supervisor) {
        *self.processes.write().await = supervisor.list();
    }

    async fn list(&self) -> Vec<ManagedProcess> {
        self.processes.read().await.clone()
    }

    async fn find(&self, target: &str) -> Option<ManagedProcess> {
        let processes = self.processes.read().await;
        let by_name = processes.iter().find(|process| process.name == target);
        if let Some(process) = by_name {
            return Some(process.clone());
        }
        let id = target.parse::<u64>().ok()?;
        processes.iter().find(|process| process.id == id).cloned()
    }
}

/// Run the daemon in the foreground until a shutdown request or Ctrl-C.
pub async fn run_foreground(config: AppConfig, resurrect_on_start: bool) -> Result<()> {
    config.ensure_layout()?;

    let listener = bind_listener(&config).await?;
    let bound_addr = listener
        .local_addr()
        .context("failed to resolve bound daemon address")?
        .to_string();
    config.write_addr_file(&bound_addr)?;
    info!("daemon listening on {bound_addr}");

    let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<ProcessExitEvent>();
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ManagerCommand>(64);
    let (git_tx, mut git_rx) = mpsc::unbounded_channel::<GitEvent>();
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    let mut supervisor = Supervisor::new(config.clone(), exit_tx.clone())?;
    supervisor.reap_stale().await;
    if resurrect_on_start {
        match supervisor.resurrect().await {
            Ok(message) => info!("startup resurrect: {message}"),
            Err(err) => error!("startup resurrect failed: {err}"),
        }
    }

    let snapshot = DaemonSnapshot::default();
    snapshot.publish(&supervisor).await;

    let mut monitor = ResourceMonitor::new();
    let mut monitor_tick = interval(Duration::from_secs(config.monitor_interval_secs));
    monitor_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut restart_tick = interval(RESTART_TICK);
    restart_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut git_tick = interval(GIT_TICK);
    git_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut git_in_flight: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("control connection from {peer}");
                        let cmd_tx = cmd_tx.clone();
                        let snapshot = snapshot.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_client(stream, cmd_tx, snapshot).await {
                                debug!("control connection ended with error: {err}");
                            }
                        });
                    }
                    Err(err) => warn!("failed to accept control connection: {err}"),
                }
            }
            Some(command) = cmd_rx.recv() => {
                execute_request(&mut supervisor, command.request, &shutdown_tx, command.response_tx).await;
                snapshot.publish(&supervisor).await;
            }
            Some(event) = exit_rx.recv() => {
                if let Err(err) = supervisor.handle_exit_event(event).await {
                    error!("failed to handle exit event: {err}");
                }
                snapshot.publish(&supervisor).await;
            }
            _ = restart_tick.tick() => {
                if let Err(err) = supervisor.run_due_restarts().await {
                    error!("restart tick failed: {err}");
                }
                snapshot.publish(&supervisor).await;
            }
            _ = git_tick.tick() => {
                for job in supervisor.due_git_polls(&git_in_flight) {
                    git_in_flight.insert(job.name.clone());
                    let git_tx = git_tx.clone();
                    tokio::spawn(async move {
                        let event = if job.baseline {
                            match gitwatch::local_head(&job.workdir).await {
                                Ok(commit) => GitEvent::Baseline { name: job.name, commit },
                                Err(err) => GitEvent::RemoteHead { name: job.name, result: Err(err) },
                            }
                        } else {
                            let result = gitwatch::remote_head(&job.repo_url, &job.branch).await;
                            GitEvent::RemoteHead { name: job.name, result }
                        };
                        let _ = git_tx.send(event);
                    });
                }
            }
            Some(event) = git_rx.recv() => {
                handle_git_event(&mut supervisor, event, &mut git_in_flight, &git_tx);
                snapshot.publish(&supervisor).await;
            }
            _ = monitor_tick.tick() => {
                let vanished = monitor.sample(supervisor.registry_mut());
                for (name, pid) in vanished {
                    warn!("pid {pid} of process {name} vanished without an exit event");
                    let event = ProcessExitEvent {
                        name,
                        pid,
                        exit_code: None,
                        success: false,
                        wait_error: true,
                    };
                    if let Err(err) = supervisor.handle_exit_event(event).await {
                        error!("failed to reconcile vanished pid: {err}");
                    }
                }
                snapshot.publish(&supervisor).await;
            }
            Some(()) = shutdown_rx.recv() => {
                info!("shutdown requested over control socket");
                break;
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    error!("failed to listen for ctrl-c: {err}");
                }
                info!("interrupt received; shutting down");
                break;
            }
        }
    }

    if let Err(err) = supervisor.shutdown_all().await {
        error!("shutdown cleanup failed: {err}");
    }
    config.remove_addr_file();
    info!("daemon stopped");
    Ok(())
}

async fn bind_listener(config: &AppConfig) -> Result<TcpListener> {
    // A reachable daemon on the discovered address means this one must not
    // start; a stale addr file alone does not.
    let advertised = config.discovered_daemon_addr();
    if ipc::send_request(&advertised, &IpcRequest::Ping).await.is_ok() {
        return Err(RemusError::DaemonAlreadyRunning.into());
    }

    TcpListener::bind(&config.daemon_addr)
        .await
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::AddrInUse {
                RemusError::DaemonAlreadyRunning.into()
            } else {
                anyhow::Error::from(err)
                    .context(format!("failed to bind daemon to {}", config.daemon_addr))
            }
        })
}

async fn handle_client(
    mut stream: TcpStream,
    cmd_tx: Sender<ManagerCommand>,
    snapshot: DaemonSnapshot,
) -> Result<()> {
    let request: IpcRequest = match ipc::read_json_line(&mut stream).await {
        Ok(request) => request,
        Err(err) => {
            let response = IpcResponse::error(format!("invalid request: {err}"));
            ipc::write_json_line(&mut stream, &response).await?;
            return Ok(());
        }
    };

    if let Some(response) = execute_snapshot_request(&request, &snapshot).await {
        return ipc::write_json_line(&mut stream, &response).await;
    }

    let (response_tx, response_rx) = oneshot::channel();
    let command = ManagerCommand {
        request,
        response_tx,
    };
    if cmd_tx.send(command).await.is_err() {
        let response = IpcResponse::error("daemon is shutting down");
        return ipc::write_json_line(&mut stream, &response).await;
    }

    let response = response_rx
        .await
        .unwrap_or_else(|_| IpcResponse::error("daemon dropped the request"));
    ipc::write_json_line(&mut stream, &response).await
}

/// Answer read-only requests from the published snapshot. Returns `None` for
/// anything that must go through the supervisor.
async fn execute_snapshot_request(
    request: &IpcRequest,
    snapshot: &DaemonSnapshot,
) -> Option<IpcResponse> {
    match request {
        IpcRequest::Ping => Some(IpcResponse::ok("pong")),
        IpcRequest::List => {
            let processes = snapshot.list().await;
            let mut response = IpcResponse::ok(format!("{} process(es)", processes.len()));
            response.processes = processes;
            Some(response)
        }
        IpcRequest::Info { target } => Some(match snapshot.find(target).await {
            Some(process) => {
                IpcResponse::ok(format!("process {}", process.target_label())).with_process(process)
            }
            None => IpcResponse::error(RemusError::ProcessNotFound(target.clone()).to_string()),
        }),
        IpcRequest::Logs { target } => Some(match snapshot.find(target).await {
            Some(process) => {
                let mut response =
                    IpcResponse::ok(format!("logs for {}", process.target_label()));
                response.logs = Some(ProcessLogs {
                    stdout: process.stdout_log.clone(),
                    stderr: process.stderr_log.clone(),
                });
                response.process = Some(process);
                response
            }
            None => IpcResponse::error(RemusError::ProcessNotFound(target.clone()).to_string()),
        }),
        _ => None,
    }
}

#[derive(Clone, Copy)]
enum LifecycleKind {
    Stop,
    Restart,
    Delete,
}

impl LifecycleKind {
    fn past_tense(self) -> &'static str {
        match self {
            LifecycleKind::Stop => "stopped",
            LifecycleKind::Restart => "restarted",
            LifecycleKind::Delete => "deleted",
        }
    }
}

async fn execute_request(
    supervisor: &mut Supervisor,
    request: IpcRequest,
    shutdown_tx: &Sender<()>,
    response_tx: oneshot::Sender<IpcResponse>,
) {
    match request {
        IpcRequest::Ping => respond(response_tx, IpcResponse::ok("pong")),
        IpcRequest::Shutdown => {
            let _ = shutdown_tx.try_send(());
            respond(response_tx, IpcResponse::ok("daemon shutting down"));
        }
        IpcRequest::Start { spec } => {
            let response = match supervisor.start(*spec).await {
                Ok(process) => {
                    let message = if process.pid.is_some() {
                        format!("started {}", process.target_label())
                    } else {
                        format!("registered {} (stopped)", process.target_label())
                    };
                    IpcResponse::ok(message).with_process(process)
                }
                Err(err) => IpcResponse::error(err.to_string()),
            };
            respond(response_tx, response);
        }
        IpcRequest::Stop { target } => {
            run_lifecycle(supervisor, LifecycleKind::Stop, &target, response_tx).await;
        }
        IpcRequest::Restart { target } => {
            run_lifecycle(supervisor, LifecycleKind::Restart, &target, response_tx).await;
        }
        IpcRequest::Delete { target } => {
            run_lifecycle(supervisor, LifecycleKind::Delete, &target, response_tx).await;
        }
        IpcRequest::List => {
            let processes = supervisor.list();
            let mut response = IpcResponse::ok(format!("{} process(es)", processes.len()));
            response.processes = processes;
            respond(response_tx, response);
        }
        IpcRequest::Info { target } => {
            let response = match supervisor.get(&target) {
                Ok(process) => IpcResponse::ok(format!("process {}", process.target_label()))
                    .with_process(process),
                Err(err) => IpcResponse::error(err.to_string()),
            };
            respond(response_tx, response);
        }
        IpcRequest::Logs { target } => {
            let response = match supervisor.logs_for(&target) {
                Ok(logs) => {
                    let mut response = IpcResponse::ok(format!("logs for {target}"));
                    response.logs = Some(logs);
                    response
                }
                Err(err) => IpcResponse::error(err.to_string()),
            };
            respond(response_tx, response);
        }
        IpcRequest::Save => {
            let response = match supervisor.save_snapshot() {
                Ok(count) => IpcResponse::ok(format!("saved {count} process(es)")),
                Err(err) => IpcResponse::error(err.to_string()),
            };
            respond(response_tx, response);
        }
        IpcRequest::Resurrect => {
            let response = match supervisor.resurrect().await {
                Ok(message) => IpcResponse::ok(message),
                Err(err) => IpcResponse::error(err.to_string()),
            };
            respond(response_tx, response);
        }
        IpcRequest::Flush { target } => {
            let response = match supervisor.flush(target.as_deref()) {
                Ok(message) => IpcResponse::ok(message),
                Err(err) => IpcResponse::error(err.to_string()),
            };
            respond(response_tx, response);
        }
    }
}

/// Fan a stop/restart/delete out to every resolved target and reply once all
/// transitions completed. Waiting happens in a detached task so the daemon
/// loop stays free to process the exit events that unblock the waiters.
async fn run_lifecycle(
    supervisor: &mut Supervisor,
    kind: LifecycleKind,
    target: &str,
    response_tx: oneshot::Sender<IpcResponse>,
) {
    let names = match supervisor.resolve_targets(target) {
        Ok(names) => names,
        Err(err) => {
            respond(response_tx, IpcResponse::error(err.to_string()));
            return;
        }
    };
    if names.is_empty() {
        respond(
            response_tx,
            IpcResponse::ok(format!("no processes to be {}", kind.past_tense())),
        );
        return;
    }

    let mut waiters = Vec::with_capacity(names.len());
    for name in &names {
        let (done_tx, done_rx) = oneshot::channel();
        match kind {
            LifecycleKind::Stop => supervisor.stop(name, done_tx),
            LifecycleKind::Restart => supervisor.restart(name, done_tx).await,
            LifecycleKind::Delete => supervisor.delete(name, done_tx),
        }
        waiters.push((name.clone(), done_rx));
    }

    let verb = kind.past_tense();
    let total = names.len();
    tokio::spawn(async move {
        let mut failures = Vec::new();
        let mut last = None;
        for (name, done_rx) in waiters {
            match done_rx.await {
                Ok(Ok(process)) => last = Some(process),
                Ok(Err(err)) => failures.push(format!("{name}: {err}")),
                Err(_) => failures.push(format!("{name}: daemon dropped the reply")),
            }
        }

        let response = if failures.is_empty() {
            match (last, total) {
                (Some(process), 1) => {
                    IpcResponse::ok(format!("{verb} {}", process.target_label()))
                        .with_process(process)
                }
                _ => IpcResponse::ok(format!("{verb} {total} process(es)")),
            }
        } else {
            IpcResponse::error(failures.join("; "))
        };
        respond(response_tx, response);
    });
}

fn handle_git_event(
    supervisor: &mut Supervisor,
    event: GitEvent,
    git_in_flight: &mut HashSet<String>,
    git_tx: &UnboundedSender<GitEvent>,
) {
    match event {
        GitEvent::Baseline { name, commit } => {
            git_in_flight.remove(&name);
            supervisor.handle_git_baseline(&name, commit);
        }
        GitEvent::RemoteHead { name, result } => {
            git_in_flight.remove(&name);
            if let Some(update) = supervisor.handle_remote_head(&name, result) {
                // The pull keeps the process marked busy until it reports back.
                git_in_flight.insert(name);
                let git_tx = git_tx.clone();
                tokio::spawn(async move {
                    let result = gitwatch::pull(&update.workdir, &update.branch).await;
                    let _ = git_tx.send(GitEvent::PullFinished {
                        name: update.name,
                        commit: update.commit,
                        result,
                    });
                });
            }
        }
        GitEvent::PullFinished {
            name,
            commit,
            result,
        } => {
            git_in_flight.remove(&name);
            supervisor.handle_pull_finished(&name, commit, result);
        }
    }
}

fn respond(response_tx: oneshot::Sender<IpcResponse>, response: IpcResponse) {
    let _ = response_tx.send(response);
}

/// Make sure a daemon is reachable, spawning a detached `remus daemon run`
/// when none answers.
pub async fn ensure_daemon_running(config: &AppConfig) -> Result<String> {
    let addr = config.discovered_daemon_addr();
    if ipc::send_request(&addr, &IpcRequest::Ping).await.is_ok() {
        return Ok(addr);
    }

    let exe = std::env::current_exe().context("failed to locate the remus binary")?;
    std::process::Command::new(exe)
        .args(["daemon", "run"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn the daemon")?;

    for _ in 0..50 {
        sleep(Duration::from_millis(100)).await;
        let addr = config.discovered_daemon_addr();
        if ipc::send_request(&addr, &IpcRequest::Ping).await.is_ok() {
            return Ok(addr);
        }
    }
    anyhow::bail!("daemon did not become reachable; check the daemon logs")
}
