//! Repository status snapshots taken around a submitted command.
//!
//! Everything here is best-effort: a missing `git` binary, a directory that
//! is not a work tree, or a slow repository all surface as `None` and the
//! caller carries on without a delta.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;
use webterm_core::{GitDelta, GitStatusEntry};

/// Source of `git status --short` style snapshots.
#[async_trait]
pub trait RepoInspector: Send + Sync {
    /// Cheap check whether `cwd` looks like a repository root.
    fn is_repository(&self, cwd: &Path) -> bool {
        cwd.join(".git").exists()
    }

    /// Status rows, or `None` when git failed or `cwd` is not a work tree.
    async fn status_short(&self, cwd: &Path) -> Option<Vec<GitStatusEntry>>;

    /// `git diff --stat` output, or `None` on failure.
    async fn diff_stat(&self, cwd: &Path) -> Option<String>;
}

/// Runs the `git` executable with a per-command timeout.
#[derive(Debug, Clone)]
pub struct GitCli {
    binary: String,
    timeout: Duration,
}

impl GitCli {
    pub fn new(timeout: Duration) -> Self {
        Self {
            binary: "git".into(),
            timeout,
        }
    }

    async fn run(&self, cwd: &Path, args: &[&str]) -> Option<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(out)) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
            Ok(Ok(out)) => {
                debug!(?args, code = out.status.code(), "git exited unsuccessfully");
                None
            }
            Ok(Err(e)) => {
                debug!(?args, error = %e, "failed to run git");
                None
            }
            Err(_) => {
                debug!(?args, timeout_ms = self.timeout.as_millis() as u64, "git timed out");
                None
            }
        }
    }
}

#[async_trait]
impl RepoInspector for GitCli {
    async fn status_short(&self, cwd: &Path) -> Option<Vec<GitStatusEntry>> {
        let text = self.run(cwd, &["status", "--short"]).await?;
        Some(parse_status_short(&text))
    }

    async fn diff_stat(&self, cwd: &Path) -> Option<String> {
        self.run(cwd, &["diff", "--stat"]).await
    }
}

/// Parse `git status --short` output: two status columns, a space, the path.
pub fn parse_status_short(text: &str) -> Vec<GitStatusEntry> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| GitStatusEntry {
            status: line.get(..2).unwrap_or(line).trim().to_string(),
            path: line.get(3..).unwrap_or_default().trim().to_string(),
        })
        .collect()
}

/// Compare two snapshots. Paths are reported with their status codes.
pub fn diff(before: &[GitStatusEntry], after: &[GitStatusEntry], command: Option<String>) -> GitDelta {
    let before: BTreeMap<&str, &str> = before.iter().map(|e| (e.path.as_str(), e.status.as_str())).collect();
    let after: BTreeMap<&str, &str> = after.iter().map(|e| (e.path.as_str(), e.status.as_str())).collect();

    let mut delta = GitDelta {
        command: command.filter(|c| !c.is_empty()),
        ..GitDelta::default()
    };
    for (path, status) in &after {
        match before.get(path) {
            None => delta.added.push(format!("{path} ({status})")),
            Some(prev) if prev != status => delta.modified.push(format!("{path} ({prev} -> {status})")),
            Some(_) => {}
        }
    }
    for (path, status) in &before {
        if !after.contains_key(path) {
            delta.deleted.push(format!("{path} ({status})"));
        }
    }
    delta
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    fn entry(status: &str, path: &str) -> GitStatusEntry {
        GitStatusEntry {
            status: status.into(),
            path: path.into(),
        }
    }

    /// Scripted inspector: returns the queued snapshots in order.
    pub(crate) struct FakeRepo {
        pub snapshots: Mutex<Vec<Vec<GitStatusEntry>>>,
    }

    impl FakeRepo {
        pub(crate) fn new(snapshots: Vec<Vec<GitStatusEntry>>) -> Self {
            Self {
                snapshots: Mutex::new(snapshots),
            }
        }
    }

    #[async_trait]
    impl RepoInspector for FakeRepo {
        fn is_repository(&self, _cwd: &Path) -> bool {
            true
        }

        async fn status_short(&self, _cwd: &Path) -> Option<Vec<GitStatusEntry>> {
            let mut queue = self.snapshots.lock().unwrap();
            if queue.is_empty() {
                None
            } else {
                Some(queue.remove(0))
            }
        }

        async fn diff_stat(&self, _cwd: &Path) -> Option<String> {
            Some(" a | 1 +\n".into())
        }
    }

    #[test]
    fn parses_short_status_columns() {
        let rows = parse_status_short(" M src/lib.rs\n?? notes.txt\nA  new.rs\n\n");
        assert_eq!(
            rows,
            vec![entry("M", "src/lib.rs"), entry("??", "notes.txt"), entry("A", "new.rs")]
        );
    }

    #[test]
    fn diff_reports_added_modified_deleted() {
        let before = vec![entry("M", "a.rs"), entry("??", "gone.txt"), entry("M", "same.rs")];
        let after = vec![entry("MM", "a.rs"), entry("??", "new.txt"), entry("M", "same.rs")];
        let delta = diff(&before, &after, Some("touch new.txt".into()));
        assert_eq!(delta.added, vec!["new.txt (??)"]);
        assert_eq!(delta.modified, vec!["a.rs (M -> MM)"]);
        assert_eq!(delta.deleted, vec!["gone.txt (??)"]);
        assert_eq!(delta.command.as_deref(), Some("touch new.txt"));
    }

    #[test]
    fn identical_snapshots_give_empty_delta() {
        let snap = vec![entry("M", "a.rs")];
        let delta = diff(&snap, &snap, Some(String::new()));
        assert!(delta.is_empty());
        assert!(delta.command.is_none());
    }

    #[tokio::test]
    async fn non_repository_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitCli::new(Duration::from_secs(5));
        assert!(!git.is_repository(dir.path()));
        assert!(git.status_short(dir.path()).await.is_none());
    }

    #[tokio::test]
    async fn missing_git_binary_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitCli {
            binary: "__webterm_no_git__".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(git.status_short(dir.path()).await.is_none());
        assert!(git.diff_stat(dir.path()).await.is_none());
    }
}
