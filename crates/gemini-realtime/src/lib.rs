//! Gemini Live provider for the lumen session controller.

mod client;
pub mod types;

pub use client::{DEFAULT_OUTPUT_SAMPLE_RATE, GEMINI_LIVE_ENDPOINT, GeminiLiveClient};
