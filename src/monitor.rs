//! Resource monitor: periodic CPU/memory sampling for every online process.
//! A PID that disappears between samples is reported back so the supervisor
//! can reconcile a missed exit.

use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};

use crate::process::{now_epoch_ms, ProcessState};
use crate::registry::Registry;

pub struct ResourceMonitor {
    system: System,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
        }
    }

    /// Refresh usage figures for all online processes in one sysinfo pass.
    /// Returns `(name, pid)` pairs whose PID no longer exists; the caller
    /// treats those as untracked exits.
    pub fn sample(&mut self, registry: &mut Registry) -> Vec<(String, u32)> {
        let tracked: Vec<SysPid> = registry
            .values()
            .filter(|process| process.state == ProcessState::Online)
            .filter_map(|process| process.pid.map(SysPid::from_u32))
            .collect();

        if !tracked.is_empty() {
            self.system
                .refresh_processes(ProcessesToUpdate::Some(&tracked), true);
        }

        let now = now_epoch_ms();
        let mut vanished = Vec::new();

        for process in registry.values_mut() {
            if process.state != ProcessState::Online {
                process.cpu_percent = 0.0;
                process.memory_bytes = 0;
                continue;
            }

            let Some(pid) = process.pid else {
                continue;
            };

            match self.system.process(SysPid::from_u32(pid)) {
                Some(info) => {
                    process.cpu_percent = info.cpu_usage();
                    process.memory_bytes = info.memory();
                    process.last_sample_at_ms = Some(now);
                }
                None => {
                    vanished.push((process.name.clone(), pid));
                }
            }
        }

        vanished
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use super::ResourceMonitor;
    use crate::process::{DesiredState, ManagedProcess, ProcessState, RestartConfig};
    use crate::registry::Registry;

    fn online_process(id: u64, name: &str, pid: u32) -> ManagedProcess {
        ManagedProcess {
            id,
            name: name.to_string(),
            command: "node".to_string(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            restart: RestartConfig::default(),
            git: None,
            watch: false,
            state: ProcessState::Online,
            desired: DesiredState::Running,
            pid: Some(pid),
            restart_count: 0,
            unstable_exits: 0,
            last_started_at_ms: None,
            last_exit_code: None,
            cpu_percent: 0.0,
            memory_bytes: 0,
            last_sample_at_ms: None,
            stdout_log: PathBuf::from(format!("/tmp/{name}.out.log")),
            stderr_log: PathBuf::from(format!("/tmp/{name}.err.log")),
        }
    }

    #[test]
    fn sample_updates_metrics_for_a_live_pid() {
        let mut registry = Registry::default();
        // The test process itself is always alive and owns some memory.
        registry.insert(online_process(1, "self", std::process::id()));

        let mut monitor = ResourceMonitor::new();
        let vanished = monitor.sample(&mut registry);

        assert!(vanished.is_empty());
        let process = registry.get("self").expect("process should exist");
        assert!(process.memory_bytes > 0, "live process should report memory");
        assert!(process.last_sample_at_ms.is_some());
    }

    #[test]
    fn sample_reports_vanished_pids() {
        let mut registry = Registry::default();
        // PIDs near u32::MAX do not exist on any supported platform.
        registry.insert(online_process(1, "ghost", u32::MAX - 1));

        let mut monitor = ResourceMonitor::new();
        let vanished = monitor.sample(&mut registry);

        assert_eq!(vanished, vec![("ghost".to_string(), u32::MAX - 1)]);
    }

    #[test]
    fn sample_zeroes_metrics_for_offline_processes() {
        let mut registry = Registry::default();
        let mut stopped = online_process(1, "idle", std::process::id());
        stopped.state = ProcessState::Stopped;
        stopped.cpu_percent = 55.5;
        stopped.memory_bytes = 1024;
        registry.insert(stopped);

        let mut monitor = ResourceMonitor::new();
        let vanished = monitor.sample(&mut registry);

        assert!(vanished.is_empty());
        let process = registry.get("idle").expect("process should exist");
        assert_eq!(process.cpu_percent, 0.0);
        assert_eq!(process.memory_bytes, 0);
    }
}
