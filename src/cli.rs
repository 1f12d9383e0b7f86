//! Command line surface. Every subcommand except `daemon run` is a thin
//! client that talks to the daemon over the control socket.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::errors::RemusError;
use crate::process::{GitBinding, RestartConfig, StartSpec};

fn version_string() -> &'static str {
    option_env!("REMUS_BUILD_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"))
}

#[derive(Parser, Debug)]
#[command(
    name = "remus",
    version = version_string(),
    about = "Process manager: launch, monitor and restart long-running services"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register and launch a process, or start a previously registered one
    Start {
        /// Command line to run, or the name of a registered process
        command: String,
        /// Process name (derived from the command when omitted)
        #[arg(short, long)]
        name: Option<String>,
        /// Working directory for the child process
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Extra environment variables as KEY=VALUE (repeatable)
        #[arg(short, long, value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// Crash restart budget (0 = unlimited)
        #[arg(long, default_value_t = 16)]
        max_restarts: u32,
        /// Base delay between crash restarts, in milliseconds
        #[arg(long, default_value_t = 1000)]
        restart_delay_ms: u64,
        /// Uptime below which an exit counts as unstable, in milliseconds
        #[arg(long, default_value_t = 1000)]
        min_uptime_ms: u64,
        /// Grace period between SIGTERM and SIGKILL, in milliseconds
        #[arg(long, default_value_t = 1600)]
        kill_timeout_ms: u64,
        /// Git repository to poll for updates (requires --cwd)
        #[arg(long, value_name = "URL")]
        repo: Option<String>,
        /// Branch to track for --repo
        #[arg(long, default_value = "main")]
        branch: String,
        /// Poll interval for --repo, in seconds
        #[arg(long, default_value_t = 60)]
        poll_interval: u64,
        /// Mark the process for file watching
        #[arg(long)]
        watch: bool,
    },
    /// Stop a process (name, id or "all")
    Stop { target: String },
    /// Stop and start a process (name, id or "all")
    #[command(alias = "rs")]
    Restart { target: String },
    /// Stop a process and remove it from the registry
    #[command(alias = "rm")]
    Delete { target: String },
    /// List all managed processes
    #[command(aliases = ["ls", "ps"])]
    List,
    /// Show details for one process
    #[command(alias = "status")]
    Info { target: String },
    /// Print the tail of a process's logs
    #[command(alias = "log")]
    Logs {
        target: String,
        /// Number of lines to show from each stream
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
    },
    /// Truncate log files for one process or all of them
    Flush { target: Option<String> },
    /// Save the current process list for later resurrect
    Save,
    /// Relaunch everything that was online at the last save
    Resurrect,
    /// Check whether the daemon is reachable
    Ping,
    /// Daemon management
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum DaemonCommands {
    /// Run the daemon in the foreground
    Run {
        /// Skip replaying the saved snapshot on startup
        #[arg(long)]
        no_resurrect: bool,
    },
    /// Ask a running daemon to shut down
    Stop,
}

/// Build the start request the daemon understands from CLI arguments.
#[allow(clippy::too_many_arguments)]
pub fn build_start_spec(
    command: String,
    name: Option<String>,
    cwd: Option<PathBuf>,
    env: Vec<String>,
    restart: RestartConfig,
    repo: Option<String>,
    branch: String,
    poll_interval: u64,
    watch: bool,
) -> Result<StartSpec> {
    let mut env_map = HashMap::new();
    for pair in env {
        let (key, value) = parse_env_var(&pair)?;
        env_map.insert(key, value);
    }

    let git = repo.map(|repo_url| GitBinding {
        repo_url,
        branch,
        poll_interval_secs: poll_interval.max(1),
        last_commit: None,
    });

    Ok(StartSpec {
        command,
        name,
        cwd,
        env: env_map,
        restart,
        git,
        watch,
    })
}

fn parse_env_var(pair: &str) -> Result<(String, String)> {
    match pair.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(RemusError::InvalidCommand(format!(
            "environment variables must look like KEY=VALUE, got {pair:?}"
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{build_start_spec, parse_env_var, Cli, Commands, DaemonCommands};
    use crate::process::RestartConfig;

    #[test]
    fn start_parses_flags_and_defaults() {
        let cli = Cli::parse_from([
            "remus",
            "start",
            "node server.js",
            "--name",
            "api",
            "--env",
            "PORT=3000",
            "--max-restarts",
            "5",
        ]);

        match cli.command {
            Commands::Start {
                command,
                name,
                env,
                max_restarts,
                restart_delay_ms,
                branch,
                repo,
                ..
            } => {
                assert_eq!(command, "node server.js");
                assert_eq!(name.as_deref(), Some("api"));
                assert_eq!(env, vec!["PORT=3000"]);
                assert_eq!(max_restarts, 5);
                assert_eq!(restart_delay_ms, 1000);
                assert_eq!(branch, "main");
                assert!(repo.is_none());
            }
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn aliases_resolve_to_their_subcommands() {
        assert!(matches!(
            Cli::parse_from(["remus", "ls"]).command,
            Commands::List
        ));
        assert!(matches!(
            Cli::parse_from(["remus", "rs", "api"]).command,
            Commands::Restart { .. }
        ));
        assert!(matches!(
            Cli::parse_from(["remus", "rm", "2"]).command,
            Commands::Delete { .. }
        ));
        assert!(matches!(
            Cli::parse_from(["remus", "daemon", "run", "--no-resurrect"]).command,
            Commands::Daemon {
                command: DaemonCommands::Run { no_resurrect: true }
            }
        ));
    }

    #[test]
    fn build_start_spec_collects_env_and_git() {
        let spec = build_start_spec(
            "node server.js".to_string(),
            Some("api".to_string()),
            None,
            vec!["PORT=3000".to_string(), "NODE_ENV=production".to_string()],
            RestartConfig::default(),
            Some("https://example.com/api.git".to_string()),
            "release".to_string(),
            0,
            false,
        )
        .expect("spec should build");

        assert_eq!(spec.env.get("PORT").map(String::as_str), Some("3000"));
        assert_eq!(spec.env.len(), 2);
        let git = spec.git.expect("git binding should be set");
        assert_eq!(git.branch, "release");
        assert_eq!(git.poll_interval_secs, 1, "interval is clamped to >= 1s");
    }

    #[test]
    fn env_pairs_require_a_key() {
        assert!(parse_env_var("PORT=3000").is_ok());
        assert_eq!(
            parse_env_var("FLAG=").expect("empty value is fine"),
            ("FLAG".to_string(), String::new())
        );
        assert!(parse_env_var("=oops").is_err());
        assert!(parse_env_var("novalue").is_err());
    }
}
