use super::PlaybackSink;
use crate::audio_utils::downmix;
use crate::audio_utils::{convert_f32_to_i16, convert_i16_to_f32};
use lumen_core::playback::{PlaybackScheduler, ScheduledBuffer, duration_of};
use tracing::debug;

/// Gapless playback of assistant audio on a `PlaybackSink`.
pub struct AudioPlaybackScheduler {
    timeline: PlaybackScheduler,
    sink: Box<dyn PlaybackSink>,
}

impl AudioPlaybackScheduler {
    pub fn new(sink: Box<dyn PlaybackSink>) -> Self {
        Self {
            timeline: PlaybackScheduler::new(),
            sink,
        }
    }

    /// Schedules one inbound buffer right after the previous one, or now if
    /// the output has already caught up.
    pub fn enqueue(&mut self, pcm: &[i16], sample_rate: u32, channels: u16) -> Option<ScheduledBuffer> {
        let mono;
        let pcm = if channels > 1 {
            mono = convert_f32_to_i16(&downmix(&convert_i16_to_f32(pcm), channels));
            &mono[..]
        } else {
            pcm
        };
        if pcm.is_empty() {
            return None;
        }
        let now = self.sink.now();
        self.timeline.reap(now);
        let buffer = self.timeline.schedule(now, duration_of(pcm.len(), sample_rate));
        self.sink.submit(buffer.start, pcm, sample_rate);
        Some(buffer)
    }

    /// Barge-in: drops everything in flight. Returns how many buffers were cut.
    pub fn interrupt(&mut self) -> usize {
        let flushed = self.timeline.interrupt(self.sink.now());
        self.sink.stop_all();
        debug!(flushed = flushed.len(), "Flushed assistant playback");
        flushed.len()
    }

    /// Forgets finished buffers; returns whether anything is still playing.
    pub fn tick(&mut self) -> bool {
        self.timeline.reap(self.sink.now());
        self.timeline.is_speaking()
    }

    pub fn is_speaking(&self) -> bool {
        self.timeline.is_speaking()
    }

    pub fn close(mut self) {
        self.timeline.interrupt(self.sink.now());
        self.sink.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorded {
        now: Duration,
        submits: Vec<(Duration, usize)>,
        stops: usize,
        closed: bool,
    }

    struct ManualSink(Arc<Mutex<Recorded>>);

    impl PlaybackSink for ManualSink {
        fn now(&self) -> Duration {
            self.0.lock().unwrap().now
        }
        fn submit(&mut self, start: Duration, samples: &[i16], _rate: u32) {
            self.0.lock().unwrap().submits.push((start, samples.len()));
        }
        fn stop_all(&mut self) {
            self.0.lock().unwrap().stops += 1;
        }
        fn close(&mut self) {
            self.0.lock().unwrap().closed = true;
        }
    }

    fn scheduler() -> (AudioPlaybackScheduler, Arc<Mutex<Recorded>>) {
        let rec = Arc::new(Mutex::new(Recorded::default()));
        (AudioPlaybackScheduler::new(Box::new(ManualSink(rec.clone()))), rec)
    }

    #[test]
    fn buffers_are_back_to_back() {
        let (mut s, rec) = scheduler();
        s.enqueue(&[0; 2400], 24000, 1);
        s.enqueue(&[0; 2400], 24000, 1);
        let submits = rec.lock().unwrap().submits.clone();
        assert_eq!(submits[0].0, Duration::ZERO);
        assert_eq!(submits[1].0, Duration::from_millis(100));
        assert!(s.is_speaking());
    }

    #[test]
    fn late_buffers_start_at_now() {
        let (mut s, rec) = scheduler();
        s.enqueue(&[0; 2400], 24000, 1);
        rec.lock().unwrap().now = Duration::from_millis(500);
        assert!(!s.tick());
        let b = s.enqueue(&[0; 2400], 24000, 1).unwrap();
        assert_eq!(b.start, Duration::from_millis(500));
    }

    #[test]
    fn interrupt_flushes_and_restarts_at_now() {
        let (mut s, rec) = scheduler();
        for _ in 0..3 {
            s.enqueue(&[0; 2400], 24000, 1);
        }
        rec.lock().unwrap().now = Duration::from_millis(50);
        assert_eq!(s.interrupt(), 3);
        assert!(!s.is_speaking());
        assert_eq!(rec.lock().unwrap().stops, 1);
        let b = s.enqueue(&[0; 240], 24000, 1).unwrap();
        assert_eq!(b.start, Duration::from_millis(50));
    }

    #[test]
    fn stereo_is_downmixed_before_timing() {
        let (mut s, rec) = scheduler();
        let b = s.enqueue(&[0; 4800], 24000, 2).unwrap();
        assert_eq!(b.duration, Duration::from_millis(100));
        assert_eq!(rec.lock().unwrap().submits[0].1, 2400);
        s.close();
        assert!(rec.lock().unwrap().closed);
    }
}
