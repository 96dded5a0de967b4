//! Lumen Service Library Crate
//!
//! Runtime pieces of the voice assistant: configuration, the cpal audio
//! backend and DSP helpers, the Postgres conversation store, and the session
//! controller. The `lumen` binary is a thin wrapper around this library.

pub mod audio;
pub mod audio_utils;
pub mod config;
pub mod db;
pub mod session;
