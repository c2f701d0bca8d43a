//! Session lifecycle states and the transitions allowed between them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a session.
///
/// `Created` is transient; every other non-terminal session is `Running`.
/// Terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Running,
    Completed,
    Error,
    Stopped,
    Interrupted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopped => "stopped",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Created | Self::Running)
    }

    /// Whether a record in this status carries an exit code.
    pub fn has_exit_code(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Whether `self -> next` is a legal lifecycle step.
    ///
    /// A failed spawn goes straight from `Created` to `Error`, and startup
    /// reconciliation may find a record that never left `Created`.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Error)
                | (Created, Interrupted)
                | (Running, Completed)
                | (Running, Error)
                | (Running, Stopped)
                | (Running, Interrupted)
        )
    }

    /// Terminal status for a process that exited on its own.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            Self::Completed
        } else {
            Self::Error
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "stopped" => Ok(Self::Stopped),
            "interrupted" => Ok(Self::Interrupted),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SessionStatus; 6] = [
        SessionStatus::Created,
        SessionStatus::Running,
        SessionStatus::Completed,
        SessionStatus::Error,
        SessionStatus::Stopped,
        SessionStatus::Interrupted,
    ];

    #[test]
    fn terminal_states_are_final() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn running_reaches_every_terminal_state() {
        for to in ALL.iter().filter(|s| s.is_terminal()) {
            assert!(SessionStatus::Running.can_transition_to(*to));
        }
        assert!(!SessionStatus::Running.can_transition_to(SessionStatus::Created));
    }

    #[test]
    fn spawn_failure_skips_running() {
        assert!(SessionStatus::Created.can_transition_to(SessionStatus::Error));
        assert!(!SessionStatus::Created.can_transition_to(SessionStatus::Completed));
        assert!(!SessionStatus::Created.can_transition_to(SessionStatus::Stopped));
    }

    #[test]
    fn exit_code_maps_to_status() {
        assert_eq!(SessionStatus::from_exit_code(0), SessionStatus::Completed);
        assert_eq!(SessionStatus::from_exit_code(1), SessionStatus::Error);
        assert_eq!(SessionStatus::from_exit_code(-1), SessionStatus::Error);
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&SessionStatus::Interrupted).unwrap();
        assert_eq!(json, "\"interrupted\"");
        assert_eq!("stopped".parse::<SessionStatus>().unwrap(), SessionStatus::Stopped);
        assert!("zombie".parse::<SessionStatus>().is_err());
    }
}
