//! Sessions: pty processes, output fan-out, lifecycle, persistence.

pub mod broadcaster;
pub mod pty;
pub mod registry;
pub mod ring_buffer;
pub mod runtime;
pub mod store;

pub use broadcaster::Received;
pub use registry::SessionRegistry;
pub use ring_buffer::EventPayload;
pub use runtime::{RuntimeDeps, SessionRuntime};
pub use store::{FileLogStore, JsonSessionStore};
