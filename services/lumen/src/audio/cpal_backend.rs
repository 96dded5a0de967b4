//! Real devices through cpal.
//!
//! A cpal `Stream` is not `Send`, so each stream is built, played and dropped
//! on its own thread. The handles returned to the controller only hold the
//! means to stop that thread.

use super::{AudioBackend, AudioFrame, CaptureHandle, DeviceError, PlaybackSink};
use crate::audio_utils::{CapturePipeline, convert_i16_to_f32, resample_all};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Producer, Split};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const CAPTURE_POLL: Duration = Duration::from_millis(10);
/// Seconds of device audio the capture ring can hold.
const CAPTURE_RING_SECONDS: usize = 2;

#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for CpalBackend {
    fn start_capture(
        &self,
        frames: mpsc::Sender<AudioFrame>,
    ) -> Result<Box<dyn CaptureHandle>, DeviceError> {
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let thread_stop = stop.clone();
        let thread = std::thread::Builder::new()
            .name("lumen-capture".into())
            .spawn(move || capture_thread(frames, thread_stop, ready_tx))
            .map_err(|e| DeviceError::Stream(e.to_string()))?;

        match blocking(|| ready_rx.recv()) {
            Ok(Ok(())) => Ok(Box::new(CpalCapture {
                stop,
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(DeviceError::Stream("capture thread exited during startup".into()))
            }
        }
    }

    fn start_playback(&self) -> Result<Box<dyn PlaybackSink>, DeviceError> {
        let timeline = Arc::new(Mutex::new(OutputTimeline::default()));
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let thread_timeline = timeline.clone();
        let thread = std::thread::Builder::new()
            .name("lumen-playback".into())
            .spawn(move || playback_thread(thread_timeline, ready_tx, stop_rx))
            .map_err(|e| DeviceError::Stream(e.to_string()))?;

        match blocking(|| ready_rx.recv()) {
            Ok(Ok(device_rate)) => Ok(Box::new(CpalPlayback {
                timeline,
                device_rate,
                stop: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(DeviceError::Stream("playback thread exited during startup".into()))
            }
        }
    }
}

/// Runs a device-thread handshake or join without stalling other tasks on a
/// multi-threaded runtime. Elsewhere (plain threads, current-thread runtimes)
/// it simply runs `f`.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

fn input_device() -> Result<(cpal::Device, cpal::SupportedStreamConfig), DeviceError> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| DeviceError::NoDevice("no input device".into()))?;
    let config = device.default_input_config()?;
    Ok((device, config))
}

fn output_device() -> Result<(cpal::Device, cpal::SupportedStreamConfig), DeviceError> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| DeviceError::NoDevice("no output device".into()))?;
    let config = device.default_output_config()?;
    Ok((device, config))
}

fn capture_thread(
    frames: mpsc::Sender<AudioFrame>,
    stop: Arc<AtomicBool>,
    ready: std_mpsc::SyncSender<Result<(), DeviceError>>,
) {
    let (device, supported) = match input_device() {
        Ok(found) => found,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let device_rate = config.sample_rate.0;
    let channels = config.channels;

    let mut pipeline = match CapturePipeline::new(device_rate, channels) {
        Ok(p) => p,
        Err(e) => {
            let _ = ready.send(Err(DeviceError::Unavailable(e.to_string())));
            return;
        }
    };

    let capacity = device_rate as usize * channels as usize * CAPTURE_RING_SECONDS;
    let (mut producer, mut consumer) = HeapRb::<f32>::new(capacity).split();
    let err_fn = |err: cpal::StreamError| error!(error = %err, "Input stream error");

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                producer.push_slice(data);
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                producer.push_slice(&convert_i16_to_f32(data));
            },
            err_fn,
            None,
        ),
        other => {
            let _ = ready.send(Err(DeviceError::Unavailable(format!(
                "unsupported input sample format {other:?}"
            ))));
            return;
        }
    };
    let stream = match stream.map_err(DeviceError::from) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(e.into()));
        return;
    }
    info!(device_rate, channels, "Microphone capture started");
    let _ = ready.send(Ok(()));

    let mut scratch = vec![0f32; capacity.min(8192)];
    while !stop.load(Ordering::Acquire) {
        let n = consumer.pop_slice(&mut scratch);
        if n == 0 {
            std::thread::sleep(CAPTURE_POLL);
            continue;
        }
        for frame in pipeline.push(&scratch[..n]) {
            if frames.try_send(frame).is_err() {
                debug!("Frame channel full or closed, dropping frame");
            }
        }
    }
    drop(stream);
    info!("Microphone capture stopped");
}

struct CpalCapture {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle for CpalCapture {
    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if blocking(|| thread.join()).is_err() {
                warn!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One submitted buffer, already at the device rate.
struct Segment {
    start_frame: u64,
    samples: Vec<f32>,
}

#[derive(Default)]
struct OutputTimeline {
    position: u64,
    segments: VecDeque<Segment>,
}

impl OutputTimeline {
    fn render(&mut self, out: &mut [f32], channels: usize) {
        for frame in out.chunks_mut(channels.max(1)) {
            let pos = self.position;
            let mut value = 0.0;
            for seg in &self.segments {
                if pos >= seg.start_frame {
                    if let Some(s) = seg.samples.get((pos - seg.start_frame) as usize) {
                        value += s;
                    }
                }
            }
            frame.fill(value.clamp(-1.0, 1.0));
            self.position += 1;
        }
        let pos = self.position;
        self.segments
            .retain(|seg| seg.start_frame + seg.samples.len() as u64 > pos);
    }
}

fn playback_thread(
    timeline: Arc<Mutex<OutputTimeline>>,
    ready: std_mpsc::SyncSender<Result<u32, DeviceError>>,
    stop: std_mpsc::Receiver<()>,
) {
    let (device, supported) = match output_device() {
        Ok(found) => found,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let device_rate = config.sample_rate.0;
    let channels = config.channels as usize;
    let err_fn = |err: cpal::StreamError| error!(error = %err, "Output stream error");

    let stream = match sample_format {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| match timeline.lock() {
                Ok(mut t) => t.render(data, channels),
                Err(_) => data.fill(0.0),
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => {
            let mut mix = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    mix.resize(data.len(), 0.0);
                    match timeline.lock() {
                        Ok(mut t) => t.render(&mut mix, channels),
                        Err(_) => mix.fill(0.0),
                    }
                    for (o, s) in data.iter_mut().zip(&mix) {
                        *o = (s * i16::MAX as f32) as i16;
                    }
                },
                err_fn,
                None,
            )
        }
        other => {
            let _ = ready.send(Err(DeviceError::Unavailable(format!(
                "unsupported output sample format {other:?}"
            ))));
            return;
        }
    };
    let stream = match stream.map_err(DeviceError::from) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(e.into()));
        return;
    }
    info!(device_rate, channels, "Speaker output started");
    let _ = ready.send(Ok(device_rate));

    // Blocks until the handle sends or is dropped.
    let _ = stop.recv();
    drop(stream);
    info!("Speaker output stopped");
}

struct CpalPlayback {
    timeline: Arc<Mutex<OutputTimeline>>,
    device_rate: u32,
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PlaybackSink for CpalPlayback {
    fn now(&self) -> Duration {
        let position = self.timeline.lock().map(|t| t.position).unwrap_or(0);
        Duration::from_secs_f64(position as f64 / self.device_rate as f64)
    }

    fn submit(&mut self, start: Duration, samples: &[i16], sample_rate: u32) {
        let samples = match resample_all(&convert_i16_to_f32(samples), sample_rate, self.device_rate) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to resample assistant audio, dropping buffer");
                return;
            }
        };
        let start_frame = (start.as_secs_f64() * self.device_rate as f64).round() as u64;
        if let Ok(mut t) = self.timeline.lock() {
            t.segments.push_back(Segment {
                start_frame,
                samples,
            });
        }
    }

    fn stop_all(&mut self) {
        if let Ok(mut t) = self.timeline.lock() {
            t.segments.clear();
        }
    }

    fn close(&mut self) {
        self.stop_all();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if blocking(|| thread.join()).is_err() {
                warn!("Playback thread panicked");
            }
        }
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.close();
    }
}
