//! Audio device seam.
//!
//! The controller only sees these traits; `cpal_backend` implements them on
//! real hardware and the tests implement them with fakes.

pub mod cpal_backend;
mod scheduler;

pub use crate::audio_utils::AudioFrame;
pub use scheduler::AudioPlaybackScheduler;

use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// No audio host or no device of the required kind exists at all.
    #[error("No audio device available: {0}")]
    NoDevice(String),

    #[error("Audio device unavailable: {0}")]
    Unavailable(String),

    #[error("Audio stream error: {0}")]
    Stream(String),
}

impl DeviceError {
    /// Whether reconnecting could never succeed on this machine.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeviceError::NoDevice(_))
    }
}

impl From<cpal::DefaultStreamConfigError> for DeviceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        DeviceError::Unavailable(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for DeviceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        DeviceError::Stream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for DeviceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        DeviceError::Stream(err.to_string())
    }
}

/// A running microphone stream.
pub trait CaptureHandle: Send {
    /// Stops emission and releases the device before returning.
    fn stop(&mut self);
}

/// A running output stream with its own clock.
pub trait PlaybackSink: Send {
    /// Time elapsed on the output clock since the sink started.
    fn now(&self) -> Duration;
    /// Queues mono PCM to start at `start` on the output clock.
    fn submit(&mut self, start: Duration, samples: &[i16], sample_rate: u32);
    /// Silences everything queued or playing.
    fn stop_all(&mut self);
    /// Releases the device before returning.
    fn close(&mut self);
}

pub trait AudioBackend: Send + Sync {
    fn start_capture(
        &self,
        frames: mpsc::Sender<AudioFrame>,
    ) -> Result<Box<dyn CaptureHandle>, DeviceError>;

    fn start_playback(&self) -> Result<Box<dyn PlaybackSink>, DeviceError>;
}
