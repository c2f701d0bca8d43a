//! Messages spoken over the session stream and the control channel.
//!
//! Every message is a JSON object with a `type` tag.

use crate::record::{GitDelta, GitStatusEntry, Profile, SessionSummary};
use crate::status::SessionStatus;
use serde::{Deserialize, Serialize};

/// Client → session stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keystrokes or pasted text, forwarded verbatim to the process.
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Ping,
}

/// Session stream → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A chunk of process output (replayed or live).
    Output { data: String },
    /// Lifecycle change, out-of-band from process output.
    Status {
        status: SessionStatus,
        exit_code: Option<i32>,
    },
    /// This viewer fell behind and `missed` output events were dropped.
    Gap { missed: u64 },
    /// Repository changes observed around a submitted command.
    GitDelta(GitDelta),
    Pong,
    Error { message: String },
}

fn default_quantity() -> u8 {
    1
}

/// Control channel requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    ListProfiles,
    Create {
        profile_id: String,
        #[serde(default = "default_quantity")]
        quantity: u8,
    },
    List,
    Get { session_id: String },
    Delete { session_id: String },
    Stop { session_id: String },
    Log { session_id: String },
    ClearLog { session_id: String },
    GitChanges { session_id: String },
    Ping,
}

/// Control channel responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Profiles { profiles: Vec<Profile> },
    Sessions { sessions: Vec<SessionSummary> },
    Session { session: SessionSummary },
    Deleted { session_id: String },
    Stopped { session_id: String, stopped: bool },
    Log {
        session_id: String,
        content: String,
        historical: bool,
    },
    LogCleared { session_id: String },
    GitChanges {
        git: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<Vec<GitStatusEntry>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diff_stat: Option<String>,
    },
    Pong,
    Error { message: String },
}
