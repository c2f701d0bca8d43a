//! webterm-core: shared protocol library for webterm.
//!
//! Provides the JSON message types spoken over the session and control
//! WebSockets, the session status state machine, persisted session records,
//! and the common error type.

pub mod codec;
pub mod error;
pub mod messages;
pub mod record;
pub mod status;

// Re-export commonly used items at crate root.
pub use codec::{decode_message, encode_message};
pub use error::{WebtermError, WebtermResult};
pub use messages::{ClientMessage, ControlRequest, ControlResponse, ServerMessage};
pub use record::{GitDelta, GitStatusEntry, Profile, SessionRecord, SessionSummary, Viewer};
pub use status::SessionStatus;
