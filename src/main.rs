mod cli;
mod config;
mod daemon;
mod errors;
mod gitwatch;
mod ipc;
mod logging;
mod monitor;
mod process;
mod registry;
mod restart;
mod storage;
mod supervisor;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{build_start_spec, Cli, Commands, DaemonCommands};
use crate::config::AppConfig;
use crate::ipc::{send_request, IpcRequest, IpcResponse};
use crate::process::{now_epoch_ms, ManagedProcess, RestartConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::load()?;

    match cli.command {
        Commands::Daemon { command } => match command {
            DaemonCommands::Run { no_resurrect } => {
                daemon::run_foreground(config, !no_resurrect).await
            }
            DaemonCommands::Stop => {
                let addr = config.discovered_daemon_addr();
                match send_request(&addr, &IpcRequest::Shutdown).await {
                    Ok(response) => {
                        println!("{}", response.message);
                        Ok(())
                    }
                    Err(_) => {
                        println!("daemon is not running");
                        Ok(())
                    }
                }
            }
        },
        Commands::Ping => {
            let addr = config.discovered_daemon_addr();
            match send_request(&addr, &IpcRequest::Ping).await {
                Ok(response) if response.ok => {
                    println!("daemon at {addr} answered: {}", response.message);
                    Ok(())
                }
                _ => anyhow::bail!("no daemon reachable at {addr}"),
            }
        }
        command => {
            let addr = daemon::ensure_daemon_running(&config).await?;
            let lines = match &command {
                Commands::Logs { lines, .. } => *lines,
                _ => 0,
            };
            let request = build_request(command)?;
            let response = send_request(&addr, &request).await?;
            render_response(&request, response, lines)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn build_request(command: Commands) -> Result<IpcRequest> {
    Ok(match command {
        Commands::Start {
            command,
            name,
            cwd,
            env,
            max_restarts,
            restart_delay_ms,
            min_uptime_ms,
            kill_timeout_ms,
            repo,
            branch,
            poll_interval,
            watch,
        } => {
            let restart = RestartConfig {
                max_restarts,
                restart_delay_ms,
                min_uptime_ms,
                kill_timeout_ms,
            };
            let spec = build_start_spec(
                command,
                name,
                cwd,
                env,
                restart,
                repo,
                branch,
                poll_interval,
                watch,
            )?;
            IpcRequest::Start {
                spec: Box::new(spec),
            }
        }
        Commands::Stop { target } => IpcRequest::Stop { target },
        Commands::Restart { target } => IpcRequest::Restart { target },
        Commands::Delete { target } => IpcRequest::Delete { target },
        Commands::List => IpcRequest::List,
        Commands::Info { target } => IpcRequest::Info { target },
        Commands::Logs { target, .. } => IpcRequest::Logs { target },
        Commands::Flush { target } => IpcRequest::Flush { target },
        Commands::Save => IpcRequest::Save,
        Commands::Resurrect => IpcRequest::Resurrect,
        Commands::Ping | Commands::Daemon { .. } => unreachable!("handled before dispatch"),
    })
}

fn render_response(request: &IpcRequest, response: IpcResponse, lines: usize) -> Result<()> {
    if !response.ok {
        anyhow::bail!("{}", response.message);
    }

    match request {
        IpcRequest::List => {
            print_process_table(&response.processes);
        }
        IpcRequest::Info { .. } => {
            if let Some(process) = &response.process {
                print_process_info(process);
            } else {
                println!("{}", response.message);
            }
        }
        IpcRequest::Logs { .. } => {
            if let Some(logs) = &response.logs {
                for (label, path) in [("stdout", &logs.stdout), ("stderr", &logs.stderr)] {
                    println!("==> {label}: {} <==", path.display());
                    for line in logging::read_last_lines(path, lines)? {
                        println!("{line}");
                    }
                    println!();
                }
            } else {
                println!("{}", response.message);
            }
        }
        _ => println!("{}", response.message),
    }
    Ok(())
}

fn print_process_table(processes: &[ManagedProcess]) {
    if processes.is_empty() {
        println!("no processes registered");
        return;
    }

    println!(
        "{:<4} {:<20} {:<10} {:<8} {:<8} {:<7} {:<9} {:<9} {}",
        "ID", "NAME", "STATE", "PID", "RESTARTS", "CPU%", "MEM", "UPTIME", "GIT"
    );
    let now = now_epoch_ms();
    for process in processes {
        let pid = process
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        let git = process
            .git
            .as_ref()
            .map(|git| git.branch.as_str())
            .unwrap_or("-");
        println!(
            "{:<4} {:<20} {:<10} {:<8} {:<8} {:<7.1} {:<9} {:<9} {}",
            process.id,
            process.name,
            process.state.to_string(),
            pid,
            process.restart_count,
            process.cpu_percent,
            format_memory(process.memory_bytes),
            format_uptime(process.uptime_ms(now)),
            git
        );
    }
}

fn print_process_info(process: &ManagedProcess) {
    let now = now_epoch_ms();
    println!("name:          {}", process.name);
    println!("id:            {}", process.id);
    println!("state:         {}", process.state);
    println!(
        "pid:           {}",
        process
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!(
        "command:       {} {}",
        process.command,
        process.args.join(" ")
    );
    if let Some(cwd) = &process.cwd {
        println!("cwd:           {}", cwd.display());
    }
    println!("uptime:        {}", format_uptime(process.uptime_ms(now)));
    let budget = match process.restart.max_restarts {
        0 => "unlimited".to_string(),
        max => max.to_string(),
    };
    println!("restarts:      {}/{budget}", process.restart_count);
    println!(
        "last exit:     {}",
        process
            .last_exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("cpu:           {:.1}%", process.cpu_percent);
    println!("memory:        {}", format_memory(process.memory_bytes));
    if let Some(git) = &process.git {
        println!("repo:          {}", git.repo_url);
        println!("branch:        {}", git.branch);
        println!("poll interval: {}s", git.poll_interval_secs);
        println!(
            "last commit:   {}",
            git.last_commit.as_deref().unwrap_or("-")
        );
    }
    if process.watch {
        println!("watch:         enabled");
    }
    println!("stdout log:    {}", process.stdout_log.display());
    println!("stderr log:    {}", process.stderr_log.display());
}

fn format_memory(bytes: u64) -> String {
    const MB: u64 = 1024 * 1024;
    if bytes == 0 {
        "-".to_string()
    } else if bytes < MB {
        format!("{:.1}kb", bytes as f64 / 1024.0)
    } else {
        format!("{:.1}mb", bytes as f64 / MB as f64)
    }
}

fn format_uptime(ms: u64) -> String {
    if ms == 0 {
        return "-".to_string();
    }
    let secs = ms / 1000;
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::{format_memory, format_uptime};

    #[test]
    fn memory_formatting_picks_sensible_units() {
        assert_eq!(format_memory(0), "-");
        assert_eq!(format_memory(512), "0.5kb");
        assert_eq!(format_memory(1024 * 1024), "1.0mb");
        assert_eq!(format_memory(1536 * 1024), "1.5mb");
    }

    #[test]
    fn uptime_formatting_scales_units() {
        assert_eq!(format_uptime(0), "-");
        assert_eq!(format_uptime(5_000), "5s");
        assert_eq!(format_uptime(120_000), "2m");
        assert_eq!(format_uptime(7_200_000), "2h");
        assert_eq!(format_uptime(172_800_000), "2d");
    }
}
