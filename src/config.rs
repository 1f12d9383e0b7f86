use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub base_dir: PathBuf,
    pub daemon_addr: String,
    pub addr_file: PathBuf,
    pub state_path: PathBuf,
    pub snapshot_path: PathBuf,
    pub log_dir: PathBuf,
    pub monitor_interval_secs: u64,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let base_dir = env::var("REMUS_HOME")
            .map(PathBuf::from)
            .ok()
            .unwrap_or_else(|| {
                dirs::data_local_dir()
                    .unwrap_or_else(env::temp_dir)
                    .join("remus")
            });
        let daemon_addr = env::var("REMUS_DAEMON_ADDR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| format!("127.0.0.1:{}", daemon_port()));
        let monitor_interval_secs = env_u64("REMUS_MONITOR_INTERVAL", 3).max(1);

        let config = Self {
            addr_file: base_dir.join("daemon.addr"),
            state_path: base_dir.join("state.json"),
            snapshot_path: base_dir.join("snapshot.json"),
            log_dir: base_dir.join("logs"),
            base_dir,
            daemon_addr,
            monitor_interval_secs,
        };
        config.ensure_layout()?;
        Ok(config)
    }

    pub fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("failed to create {}", self.base_dir.display()))?;
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("failed to create {}", self.log_dir.display()))?;
        Ok(())
    }

    /// Address clients should talk to: the one the running daemon advertised
    /// in the addr file, or the configured default when no daemon wrote one.
    pub fn discovered_daemon_addr(&self) -> String {
        fs::read_to_string(&self.addr_file)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.daemon_addr.clone())
    }

    /// Written by the daemon after a successful bind so later clients can
    /// discover the listening port.
    pub fn write_addr_file(&self, bound_addr: &str) -> Result<()> {
        fs::write(&self.addr_file, format!("{bound_addr}\n"))
            .with_context(|| format!("failed to write {}", self.addr_file.display()))
    }

    pub fn remove_addr_file(&self) {
        let _ = fs::remove_file(&self.addr_file);
    }
}

/// Stable per-user port in the non-privileged range, so daemons of different
/// users on one machine do not collide.
fn daemon_port() -> u16 {
    let identity = current_identity();
    let mut hash = 2166136261_u32;
    for byte in identity.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16777619);
    }

    let range = 20000_u16;
    40000 + (hash % range as u32) as u16
}

fn current_identity() -> String {
    #[cfg(unix)]
    {
        format!("uid-{}", nix::unistd::Uid::effective().as_raw())
    }

    #[cfg(windows)]
    {
        let username = env::var("USERNAME").unwrap_or_else(|_| "unknown".to_string());
        format!("win-{username}")
    }

    #[cfg(not(any(unix, windows)))]
    {
        "remus-generic".to_string()
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::{Mutex, OnceLock};
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::{daemon_port, env_u64, AppConfig};

    #[test]
    fn daemon_port_is_stable_and_in_expected_range() {
        let first = daemon_port();
        let second = daemon_port();
        assert_eq!(first, second, "daemon port should be deterministic");
        assert!(
            (40000..60000).contains(&first),
            "daemon port should stay in non-privileged range, got {first}"
        );
    }

    #[test]
    fn env_u64_uses_default_for_invalid_values() {
        let _guard = env_lock().lock().expect("failed to acquire env lock");
        let old = std::env::var("REMUS_TEST_ENV_U64").ok();
        std::env::set_var("REMUS_TEST_ENV_U64", "not-a-number");

        assert_eq!(env_u64("REMUS_TEST_ENV_U64", 42), 42);

        restore_env("REMUS_TEST_ENV_U64", old);
    }

    #[test]
    fn load_uses_env_overrides_and_creates_layout() {
        let _guard = env_lock().lock().expect("failed to acquire env lock");
        let base = temp_dir("config-load");

        let old_home = std::env::var("REMUS_HOME").ok();
        let old_addr = std::env::var("REMUS_DAEMON_ADDR").ok();
        let old_interval = std::env::var("REMUS_MONITOR_INTERVAL").ok();

        std::env::set_var("REMUS_HOME", &base);
        std::env::set_var("REMUS_DAEMON_ADDR", "127.0.0.1:45999");
        std::env::set_var("REMUS_MONITOR_INTERVAL", "0");

        let config = AppConfig::load().expect("config load should succeed");
        assert_eq!(config.base_dir, base);
        assert_eq!(config.daemon_addr, "127.0.0.1:45999");
        assert_eq!(config.state_path, base.join("state.json"));
        assert_eq!(config.snapshot_path, base.join("snapshot.json"));
        assert_eq!(
            config.monitor_interval_secs, 1,
            "monitor interval is clamped to at least one second"
        );
        assert!(config.base_dir.exists());
        assert!(config.log_dir.exists());

        let _ = fs::remove_dir_all(&base);
        restore_env("REMUS_HOME", old_home);
        restore_env("REMUS_DAEMON_ADDR", old_addr);
        restore_env("REMUS_MONITOR_INTERVAL", old_interval);
    }

    #[test]
    fn addr_file_roundtrip_and_fallback() {
        let base = temp_dir("config-addr");
        fs::create_dir_all(&base).expect("failed to create temp base");
        let config = AppConfig {
            base_dir: base.clone(),
            daemon_addr: "127.0.0.1:45000".to_string(),
            addr_file: base.join("daemon.addr"),
            state_path: base.join("state.json"),
            snapshot_path: base.join("snapshot.json"),
            log_dir: base.join("logs"),
            monitor_interval_secs: 3,
        };

        assert_eq!(config.discovered_daemon_addr(), "127.0.0.1:45000");

        config
            .write_addr_file("127.0.0.1:41234")
            .expect("failed to write addr file");
        assert_eq!(config.discovered_daemon_addr(), "127.0.0.1:41234");

        config.remove_addr_file();
        assert_eq!(config.discovered_daemon_addr(), "127.0.0.1:45000");

        let _ = fs::remove_dir_all(base);
    }

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    fn restore_env(key: &str, previous: Option<String>) {
        if let Some(value) = previous {
            std::env::set_var(key, value);
        } else {
            std::env::remove_var(key);
        }
    }

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock failure")
            .as_nanos();
        std::env::temp_dir().join(format!("remus-{prefix}-{nonce}"))
    }
}
