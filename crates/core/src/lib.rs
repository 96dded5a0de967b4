//! Provider-neutral building blocks of a live voice session: wire events,
//! transcript assembly, reconnection policy, playback timing, reminder
//! confirmation and remote tool dispatch.

pub mod confirmation;
pub mod context;
pub mod error;
pub mod generic_types;
pub mod playback;
pub mod realtime_api;
pub mod retry;
pub mod store;
pub mod tools;
pub mod transcript;

pub use error::{SessionError, ToolError};
