//! Gapless playback scheduling.
//!
//! The scheduler does not touch audio hardware. It decides *when* each
//! decoded buffer starts on the output clock and remembers which buffers are
//! still in flight, so an interruption can flush them all at once.

use std::collections::VecDeque;
use std::time::Duration;

/// A buffer placed on the output timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledBuffer {
    pub id: u64,
    pub start: Duration,
    pub duration: Duration,
}

impl ScheduledBuffer {
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }
}

#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    cursor: Duration,
    in_flight: VecDeque<ScheduledBuffer>,
    next_id: u64,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places a buffer of `duration` at `max(now, cursor)` and advances the
    /// cursor past it.
    pub fn schedule(&mut self, now: Duration, duration: Duration) -> ScheduledBuffer {
        let start = self.cursor.max(now);
        let buffer = ScheduledBuffer {
            id: self.next_id,
            start,
            duration,
        };
        self.next_id += 1;
        self.cursor = buffer.end();
        self.in_flight.push_back(buffer);
        buffer
    }

    /// Stops everything in flight and pulls the cursor back to `now`.
    /// Returns the buffers that were flushed.
    pub fn interrupt(&mut self, now: Duration) -> Vec<ScheduledBuffer> {
        self.cursor = now;
        self.in_flight.drain(..).collect()
    }

    /// Forgets buffers whose playback has ended by `now`.
    pub fn reap(&mut self, now: Duration) -> usize {
        let before = self.in_flight.len();
        while self.in_flight.front().is_some_and(|b| b.end() <= now) {
            self.in_flight.pop_front();
        }
        before - self.in_flight.len()
    }

    pub fn is_speaking(&self) -> bool {
        !self.in_flight.is_empty()
    }

    pub fn cursor(&self) -> Duration {
        self.cursor
    }
}

/// Playback length of `samples` mono frames at `sample_rate`.
pub fn duration_of(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos((samples as u64).saturating_mul(1_000_000_000) / u64::from(sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn back_to_back_buffers_are_gapless() {
        let mut s = PlaybackScheduler::new();
        let durations = [ms(120), ms(80), ms(200), ms(40)];
        let scheduled: Vec<_> = durations.iter().map(|d| s.schedule(ms(10), *d)).collect();

        assert_eq!(scheduled[0].start, ms(10));
        for pair in scheduled.windows(2) {
            assert_eq!(pair[1].start, pair[0].start + pair[0].duration);
        }
        assert_eq!(s.cursor(), ms(450));
        assert!(s.is_speaking());
    }

    #[test]
    fn late_buffer_starts_now_not_in_the_past() {
        let mut s = PlaybackScheduler::new();
        s.schedule(ms(0), ms(100));
        let late = s.schedule(ms(500), ms(100));
        assert_eq!(late.start, ms(500));
        assert_eq!(s.cursor(), ms(600));
    }

    #[test]
    fn start_times_never_decrease() {
        let mut s = PlaybackScheduler::new();
        let nows = [0, 5, 3, 400, 401, 100, 900];
        let mut last = Duration::ZERO;
        for now in nows {
            let b = s.schedule(ms(now), ms(50));
            assert!(b.start >= last);
            assert!(b.start >= ms(now));
            last = b.start;
        }
    }

    #[test]
    fn interrupt_flushes_everything_and_resets_cursor() {
        let mut s = PlaybackScheduler::new();
        for _ in 0..4 {
            s.schedule(ms(0), ms(250));
        }
        let flushed = s.interrupt(ms(300));
        assert_eq!(flushed.len(), 4);
        assert!(!s.is_speaking());
        assert_eq!(s.cursor(), ms(300));

        let next = s.schedule(ms(300), ms(100));
        assert_eq!(next.start, ms(300));
    }

    #[test]
    fn reap_drops_finished_buffers() {
        let mut s = PlaybackScheduler::new();
        s.schedule(ms(0), ms(100));
        s.schedule(ms(0), ms(100));
        assert_eq!(s.reap(ms(150)), 1);
        assert!(s.is_speaking());
        assert_eq!(s.reap(ms(200)), 1);
        assert!(!s.is_speaking());
    }

    #[test]
    fn duration_of_pcm() {
        assert_eq!(duration_of(24_000, 24_000), Duration::from_secs(1));
        assert_eq!(duration_of(2_400, 24_000), ms(100));
        assert_eq!(duration_of(10, 0), Duration::ZERO);
    }
}
