//! Persisted and listed data: profiles, session records, git deltas.

use crate::error::{WebtermError, WebtermResult};
use crate::status::SessionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A named launch template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory override; the server default is used when absent.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Environment overlay applied on top of the server's environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Input is forwarded keystroke by keystroke with no command-boundary
    /// tracking (full-screen programs, REPLs with their own line editing).
    #[serde(default)]
    pub passthrough: bool,
}

impl Profile {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            passthrough: false,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Command line for display and logging.
    pub fn display_command(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// The persisted state of one session.
///
/// Invariants: `exit_code` is set iff `status` is completed or error;
/// `finished_at` is set iff `status` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    /// Profile snapshot taken when the session was created.
    pub profile: Profile,
    /// Resolved working directory of the process.
    pub cwd: PathBuf,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub log_path: PathBuf,
    /// Spawn or reader failure description, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionRecord {
    pub fn new(id: String, profile: Profile, cwd: PathBuf, log_path: PathBuf) -> Self {
        Self {
            id,
            profile,
            cwd,
            status: SessionStatus::Created,
            exit_code: None,
            created_at: Utc::now(),
            finished_at: None,
            log_path,
            error: None,
        }
    }

    /// Move to `next`, keeping the exit-code and timestamp invariants.
    ///
    /// `exit_code` is only recorded for completed/error; it is required for
    /// those states except when a spawn failure never produced a process, in
    /// which case 127 is recorded.
    pub fn transition(&mut self, next: SessionStatus, exit_code: Option<i32>) -> WebtermResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(WebtermError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.exit_code = if next.has_exit_code() {
            Some(exit_code.unwrap_or(127))
        } else {
            None
        };
        self.finished_at = if next.is_terminal() {
            Some(Utc::now())
        } else {
            None
        };
        Ok(())
    }
}

/// A connection attached to a session's output stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
    /// Connection handle, e.g. the remote address.
    pub connection: String,
    pub attached_at: DateTime<Utc>,
}

/// A session as shown by the registry listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    #[serde(flatten)]
    pub record: SessionRecord,
    /// Currently attached viewers, oldest first.
    #[serde(default)]
    pub viewers: Vec<Viewer>,
    /// Whether a process is attached to this session right now.
    pub live: bool,
}

/// One row of `git status --short`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitStatusEntry {
    pub status: String,
    pub path: String,
}

/// Repository status change observed around one submitted command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl GitDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Human-readable block, used for raw-text viewers.
    pub fn render(&self) -> String {
        let mut lines = vec!["=== Git Diff Before/After ===".to_string()];
        if let Some(command) = &self.command {
            lines.push(format!("Command: {command}"));
        }
        if self.is_empty() {
            lines.push("No file changes".to_string());
        }
        for (label, items) in [
            ("Added:", &self.added),
            ("Modified:", &self.modified),
            ("Deleted:", &self.deleted),
        ] {
            if !items.is_empty() {
                lines.push(label.to_string());
                lines.extend(items.iter().map(|item| format!("  {item}")));
            }
        }
        lines.push("==============================".to_string());
        lines.join("\r\n")
    }
}
