//! Per-process log files. The daemon owns writing (child stdout/stderr are
//! wired straight into these files at spawn time); clients only read tails.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessLogs {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

pub fn process_logs(log_dir: &Path, name: &str) -> ProcessLogs {
    ProcessLogs {
        stdout: log_dir.join(format!("{name}.out.log")),
        stderr: log_dir.join(format!("{name}.err.log")),
    }
}

pub fn open_log_writers(logs: &ProcessLogs) -> Result<(File, File)> {
    if let Some(parent) = logs.stdout.parent() {
        ensure_private_dir(parent)?;
    }
    let stdout = open_append(&logs.stdout)?;
    let stderr = open_append(&logs.stderr)?;
    Ok((stdout, stderr))
}

/// Truncate both streams in place; missing files are fine.
pub fn flush_logs(logs: &ProcessLogs) -> Result<()> {
    for path in [&logs.stdout, &logs.stderr] {
        if path.exists() {
            fs::write(path, b"").with_context(|| format!("failed to truncate {}", path.display()))?;
        }
    }
    Ok(())
}

fn open_append(path: &Path) -> Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).append(true).read(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
        .open(path)
        .with_context(|| format!("failed opening {}", path.display()))
}

fn ensure_private_dir(path: &Path) -> Result<()> {
    let existed = path.exists();
    fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if !existed {
            fs::set_permissions(path, fs::Permissions::from_mode(0o700))
                .with_context(|| format!("failed to set permissions on {}", path.display()))?;
        }
    }
    Ok(())
}

/// Tail a log without reading the whole file: walk backwards in fixed chunks
/// until enough newlines were seen, then keep the last `max_lines`.
pub fn read_last_lines(path: &Path, max_lines: usize) -> Result<Vec<String>> {
    if max_lines == 0 || !path.exists() {
        return Ok(Vec::new());
    }

    let mut file = File::open(path).with_context(|| format!("failed opening {}", path.display()))?;
    let total = file
        .metadata()
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    if total == 0 {
        return Ok(Vec::new());
    }

    const CHUNK: u64 = 8 * 1024;
    let mut offset = total;
    let mut newlines = 0_usize;
    let mut bytes: Vec<u8> = Vec::new();

    while offset > 0 && newlines <= max_lines {
        let len = CHUNK.min(offset) as usize;
        offset -= len as u64;

        file.seek(SeekFrom::Start(offset))
            .with_context(|| format!("failed seeking {}", path.display()))?;
        let mut chunk = vec![0_u8; len];
        file.read_exact(&mut chunk)
            .with_context(|| format!("failed reading {}", path.display()))?;

        newlines += chunk.iter().filter(|&&byte| byte == b'\n').count();
        chunk.extend_from_slice(&bytes);
        bytes = chunk;
    }

    let text = String::from_utf8_lossy(&bytes);
    let mut tail = VecDeque::with_capacity(max_lines.saturating_add(1));
    for line in text.lines() {
        tail.push_back(line.to_string());
        if tail.len() > max_lines {
            tail.pop_front();
        }
    }

    Ok(tail.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::{flush_logs, open_log_writers, process_logs, read_last_lines};

    #[test]
    fn process_logs_build_deterministic_paths() {
        let logs = process_logs(std::path::Path::new("/var/lib/remus/logs"), "api");
        assert_eq!(logs.stdout, PathBuf::from("/var/lib/remus/logs/api.out.log"));
        assert_eq!(logs.stderr, PathBuf::from("/var/lib/remus/logs/api.err.log"));
    }

    #[test]
    fn writers_append_instead_of_truncating() {
        let dir = temp_dir("append");
        let logs = process_logs(&dir, "api");

        {
            let (mut out, _err) = open_log_writers(&logs).expect("first open failed");
            writeln!(out, "one").expect("first write failed");
        }
        {
            let (mut out, _err) = open_log_writers(&logs).expect("second open failed");
            writeln!(out, "two").expect("second write failed");
        }

        let lines = read_last_lines(&logs.stdout, 10).expect("tail failed");
        assert_eq!(lines, vec!["one", "two"]);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn flush_truncates_existing_logs() {
        let dir = temp_dir("flush");
        let logs = process_logs(&dir, "api");
        fs::create_dir_all(&dir).expect("failed to create log dir");
        fs::write(&logs.stdout, "lots of output\n").expect("seed stdout failed");

        flush_logs(&logs).expect("flush failed");
        assert_eq!(
            fs::metadata(&logs.stdout).expect("stat failed").len(),
            0,
            "stdout should be empty after flush"
        );
        // stderr never existed; flush must not create it
        assert!(!logs.stderr.exists());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn read_last_lines_returns_only_tail() {
        let dir = temp_dir("tail");
        fs::create_dir_all(&dir).expect("failed to create dir");
        let path = dir.join("api.out.log");
        fs::write(&path, "a\nb\nc\nd\n").expect("seed failed");

        assert_eq!(read_last_lines(&path, 2).expect("tail failed"), vec!["c", "d"]);
        assert_eq!(
            read_last_lines(&path, 10).expect("tail failed"),
            vec!["a", "b", "c", "d"]
        );

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn read_last_lines_handles_missing_empty_and_zero() {
        let dir = temp_dir("tail-edge");
        fs::create_dir_all(&dir).expect("failed to create dir");
        let missing = dir.join("missing.log");
        let empty = dir.join("empty.log");
        fs::write(&empty, "").expect("seed failed");

        assert!(read_last_lines(&missing, 5).expect("missing").is_empty());
        assert!(read_last_lines(&empty, 5).expect("empty").is_empty());
        assert!(read_last_lines(&empty, 0).expect("zero").is_empty());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn read_last_lines_spans_chunk_boundaries() {
        let dir = temp_dir("tail-chunks");
        fs::create_dir_all(&dir).expect("failed to create dir");
        let path = dir.join("big.log");

        let mut content = String::new();
        for idx in 0..2000 {
            content.push_str(&format!("line-{idx} padding padding padding padding\n"));
        }
        fs::write(&path, &content).expect("seed failed");

        let lines = read_last_lines(&path, 3).expect("tail failed");
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("line-1999"));

        let _ = fs::remove_dir_all(dir);
    }

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock failure")
            .as_nanos();
        std::env::temp_dir().join(format!("remus-logging-{prefix}-{nonce}"))
    }
}
