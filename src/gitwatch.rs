//! Git update polling helpers. All repository access shells out to the `git`
//! binary through tokio so a slow or unreachable remote never blocks the
//! daemon loop; the daemon runs these in detached tasks and feeds the results
//! back as `GitEvent`s.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::process::Command;

/// Outcomes reported back into the daemon loop.
#[derive(Debug)]
pub enum GitEvent {
    /// Local HEAD of a freshly started process with no stored commit.
    Baseline { name: String, commit: String },
    /// Result of a non-destructive remote head query.
    RemoteHead {
        name: String,
        result: Result<String>,
    },
    /// Result of pulling a detected update into the working copy.
    PullFinished {
        name: String,
        commit: String,
        result: Result<()>,
    },
}

/// Work unit produced by the due-poll scan; executed off the registry path.
#[derive(Debug, Clone)]
pub struct GitPollJob {
    pub name: String,
    pub repo_url: String,
    pub branch: String,
    pub workdir: PathBuf,
    /// No stored commit yet: read the local baseline instead of the remote.
    pub baseline: bool,
}

/// Head commit of `branch` on the remote, via `git ls-remote` (never touches
/// the working copy).
pub async fn remote_head(repo_url: &str, branch: &str) -> Result<String> {
    let output = Command::new("git")
        .args(["ls-remote", repo_url, branch])
        .output()
        .await
        .context("failed to run git ls-remote")?;

    if !output.status.success() {
        anyhow::bail!(
            "git ls-remote {repo_url} {branch} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    parse_ls_remote(&String::from_utf8_lossy(&output.stdout), branch)
        .with_context(|| format!("no head found for branch {branch} at {repo_url}"))
}

pub async fn local_head(workdir: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(workdir)
        .output()
        .await
        .context("failed to run git rev-parse")?;

    if !output.status.success() {
        anyhow::bail!(
            "git rev-parse HEAD failed in {}: {}",
            workdir.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let head = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if head.is_empty() {
        anyhow::bail!("git rev-parse HEAD returned nothing in {}", workdir.display());
    }
    Ok(head)
}

/// Fast-forward the working copy to the tracked branch.
pub async fn pull(workdir: &Path, branch: &str) -> Result<()> {
    let output = Command::new("git")
        .args(["pull", "--ff-only", "origin", branch])
        .current_dir(workdir)
        .output()
        .await
        .context("failed to run git pull")?;

    if !output.status.success() {
        anyhow::bail!(
            "git pull --ff-only origin {branch} failed in {}: {}",
            workdir.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Pick the head hash out of `ls-remote` output. Lines look like
/// `<hash>\trefs/heads/<branch>`; a bare ref name or a single-line answer is
/// accepted as well.
pub fn parse_ls_remote(output: &str, branch: &str) -> Option<String> {
    let wanted = format!("refs/heads/{branch}");
    for line in output.lines() {
        let mut parts = line.split_whitespace();
        let (Some(hash), Some(reference)) = (parts.next(), parts.next()) else {
            continue;
        };
        if reference == wanted || reference == branch {
            return Some(hash.to_string());
        }
    }

    output
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::process::Command as StdCommand;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::{local_head, parse_ls_remote, pull, remote_head};

    #[test]
    fn parse_ls_remote_matches_branch_ref() {
        let output = "\
0123456789abcdef0123456789abcdef01234567\tHEAD
fedcba9876543210fedcba9876543210fedcba98\trefs/heads/main
1111111111111111111111111111111111111111\trefs/heads/dev
";
        assert_eq!(
            parse_ls_remote(output, "main").as_deref(),
            Some("fedcba9876543210fedcba9876543210fedcba98")
        );
        assert_eq!(
            parse_ls_remote(output, "dev").as_deref(),
            Some("1111111111111111111111111111111111111111")
        );
    }

    #[test]
    fn parse_ls_remote_falls_back_to_first_line() {
        let output = "abc123\tHEAD\n";
        assert_eq!(parse_ls_remote(output, "main").as_deref(), Some("abc123"));
        assert!(parse_ls_remote("", "main").is_none());
    }

    #[tokio::test]
    async fn local_and_remote_heads_agree_on_fresh_clone() {
        let fixture = GitFixture::new("heads");

        let local = local_head(&fixture.clone_dir).await.expect("local head");
        let remote = remote_head(fixture.remote_dir.to_str().expect("utf8 path"), "main")
            .await
            .expect("remote head");
        assert_eq!(local, remote);

        fixture.cleanup();
    }

    #[tokio::test]
    async fn pull_fast_forwards_clone_to_new_remote_commit() {
        let fixture = GitFixture::new("pull");
        let before = local_head(&fixture.clone_dir).await.expect("head before");

        fixture.push_new_commit("v2");
        let remote = remote_head(fixture.remote_dir.to_str().expect("utf8 path"), "main")
            .await
            .expect("remote head");
        assert_ne!(before, remote, "remote should have advanced");

        pull(&fixture.clone_dir, "main").await.expect("pull failed");
        let after = local_head(&fixture.clone_dir).await.expect("head after");
        assert_eq!(after, remote);

        fixture.cleanup();
    }

    #[tokio::test]
    async fn remote_head_fails_for_unreachable_remote() {
        let missing = std::env::temp_dir().join("remus-gitwatch-no-such-remote");
        let err = remote_head(missing.to_str().expect("utf8 path"), "main")
            .await
            .expect_err("missing remote should fail");
        assert!(
            err.to_string().contains("ls-remote"),
            "unexpected error: {err}"
        );
    }

    struct GitFixture {
        root: PathBuf,
        remote_dir: PathBuf,
        source_dir: PathBuf,
        clone_dir: PathBuf,
    }

    impl GitFixture {
        fn new(prefix: &str) -> Self {
            let nonce = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock failure")
                .as_nanos();
            let root = std::env::temp_dir().join(format!("remus-gitwatch-{prefix}-{nonce}"));
            let remote_dir = root.join("remote.git");
            let source_dir = root.join("source");
            let clone_dir = root.join("clone");

            fs::create_dir_all(&source_dir).expect("failed to create fixture dirs");
            run_git(&root, &["init", "--bare", remote_dir.to_str().expect("utf8")]);
            // Stock git may default the bare repo's HEAD to master; point it
            // at main so a fresh clone checks out the pushed branch.
            run_git(&remote_dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
            run_git(&source_dir, &["init"]);
            run_git(&source_dir, &["config", "user.email", "tests@remus.local"]);
            run_git(&source_dir, &["config", "user.name", "Remus Tests"]);
            fs::write(source_dir.join("app.js"), "console.log('v1');\n")
                .expect("failed writing fixture file");
            run_git(&source_dir, &["add", "."]);
            run_git(&source_dir, &["commit", "-m", "initial"]);
            run_git(&source_dir, &["branch", "-M", "main"]);
            run_git(
                &source_dir,
                &["remote", "add", "origin", remote_dir.to_str().expect("utf8")],
            );
            run_git(&source_dir, &["push", "-u", "origin", "main"]);
            run_git(
                &root,
                &[
                    "clone",
                    remote_dir.to_str().expect("utf8"),
                    clone_dir.to_str().expect("utf8"),
                ],
            );

            Self {
                root,
                remote_dir,
                source_dir,
                clone_dir,
            }
        }

        fn push_new_commit(&self, marker: &str) {
            fs::write(
                self.source_dir.join("app.js"),
                format!("console.log('{marker}');\n"),
            )
            .expect("failed rewriting fixture file");
            run_git(&self.source_dir, &["add", "."]);
            run_git(&self.source_dir, &["commit", "-m", marker]);
            run_git(&self.source_dir, &["push", "origin", "main"]);
        }

        fn cleanup(self) {
            let _ = fs::remove_dir_all(self.root);
        }
    }

    fn run_git(cwd: &Path, args: &[&str]) {
        fs::create_dir_all(cwd).expect("failed to create git cwd");
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .expect("failed to run git in test");
        assert!(
            output.status.success(),
            "git {:?} failed in {}: {}",
            args,
            cwd.display(),
            String::from_utf8_lossy(&output.stderr)
        );
    }
}
