//! # Playback Scheduler
//!
//! Schedules the agent's speech back-to-back on a single output timeline.
//!
//! ## Scheduling Algorithm:
//! One cursor, `next_start_time`, on the output graph's clock:
//! 1. If the cursor is behind the clock, snap it forward to "now"
//! 2. Start the new unit at the cursor
//! 3. Advance the cursor by the unit's duration
//!
//! Consecutive units of one turn therefore satisfy
//! `start[i + 1] >= start[i] + duration[i]`, with equality unless the clock
//! overtook the cursor. No per-chunk timers are involved; the graph plays each
//! unit at its scheduled time.
//!
//! ## Interruption:
//! `flush` stops every scheduled or playing unit, forgets them and resets the
//! cursor to "now". Nothing flushed is ever replayed.
//!
//! ## Amplitude:
//! `tick` runs at animation-frame cadence. While a unit is audible it returns the
//! RMS level around the playhead; when the queue drains it returns exactly one zero.

use crate::audio::backend::OutputGraph;
use crate::audio::pcm;
use crate::error::SessionResult;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// RMS of normal speech sits well below 0.5; scale it into a useful [0, 1] range.
const AMPLITUDE_GAIN: f32 = 2.5;

/// Decoded audio placed on the output timeline.
#[derive(Debug, Clone)]
pub struct PlaybackUnit {
    pub id: u64,
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
    /// seconds on the output clock
    pub start: f64,
}

impl PlaybackUnit {
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration()
    }
}

/// Where an enqueued payload landed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scheduled {
    pub id: u64,
    pub start: f64,
    pub duration: f64,
}

pub struct PlaybackScheduler {
    graph: Box<dyn OutputGraph>,
    sample_rate: u32,
    amplitude_window: usize,
    next_start_time: f64,
    queue: VecDeque<PlaybackUnit>,
    next_id: u64,
    audible: bool,
    units_played: u64,
    units_discarded: u64,
    closed: bool,
}

impl PlaybackScheduler {
    /// ## Parameters:
    /// - `graph`: output graph owned by this scheduler until `close`/drop
    /// - `sample_rate`: rate of incoming payloads (24 kHz for the relay)
    /// - `amplitude_interval`: tick cadence, also the RMS window length
    pub fn new(graph: Box<dyn OutputGraph>, sample_rate: u32, amplitude_interval: Duration) -> Self {
        let next_start_time = graph.current_time();
        let amplitude_window =
            ((sample_rate as f64 * amplitude_interval.as_secs_f64()).round() as usize).max(1);
        Self {
            graph,
            sample_rate,
            amplitude_window,
            next_start_time,
            queue: VecDeque::new(),
            next_id: 0,
            audible: false,
            units_played: 0,
            units_discarded: 0,
            closed: false,
        }
    }

    /// Decode a base64 PCM16 payload and schedule it after everything already queued.
    ///
    /// A corrupt payload returns a `Decode` error and leaves the timeline untouched.
    pub fn enqueue(&mut self, payload: &str) -> SessionResult<Scheduled> {
        let samples = pcm::decode_frame(payload)?;
        Ok(self.schedule(samples))
    }

    /// Schedule already decoded samples.
    pub fn schedule(&mut self, samples: Vec<f32>) -> Scheduled {
        let now = self.graph.current_time();
        if self.next_start_time < now {
            self.next_start_time = now;
        }

        self.next_id += 1;
        let unit = PlaybackUnit {
            id: self.next_id,
            samples: Arc::from(samples),
            sample_rate: self.sample_rate,
            start: self.next_start_time,
        };
        let scheduled = Scheduled {
            id: unit.id,
            start: unit.start,
            duration: unit.duration(),
        };

        self.graph
            .start(unit.id, Arc::clone(&unit.samples), unit.sample_rate, unit.start);
        self.next_start_time += scheduled.duration;
        self.queue.push_back(unit);

        trace!(
            id = scheduled.id,
            start = scheduled.start,
            duration = scheduled.duration,
            queued = self.queue.len(),
            "Scheduled playback unit"
        );
        scheduled
    }

    /// Stop and discard every queued or playing unit. Returns how many were discarded.
    pub fn flush(&mut self) -> usize {
        let discarded = self.queue.len();
        for unit in self.queue.drain(..) {
            self.graph.stop(unit.id);
        }
        self.next_start_time = self.graph.current_time();
        self.audible = false;
        self.units_discarded += discarded as u64;

        if discarded > 0 {
            debug!(discarded, "Playback flushed");
        }
        discarded
    }

    /// Animation-frame bookkeeping: retire finished units and report amplitude.
    ///
    /// ## Returns:
    /// - `Some(level)` while a unit is audible
    /// - `Some(0.0)` exactly once when the queue drains
    /// - `None` otherwise
    pub fn tick(&mut self) -> Option<f32> {
        let now = self.graph.current_time();
        while let Some(front) = self.queue.front() {
            if front.end() > now {
                break;
            }
            self.queue.pop_front();
            self.units_played += 1;
        }

        if let Some(level) = self.level_at(now) {
            self.audible = true;
            return Some(level);
        }

        if self.queue.is_empty() && self.audible {
            self.audible = false;
            return Some(0.0);
        }

        None
    }

    fn level_at(&self, now: f64) -> Option<f32> {
        let unit = self
            .queue
            .iter()
            .find(|unit| unit.start <= now && now < unit.end())?;
        let playhead = ((now - unit.start) * unit.sample_rate as f64) as usize;
        let from = playhead.min(unit.samples.len());
        let to = (from + self.amplitude_window).min(unit.samples.len());
        Some((pcm::rms(&unit.samples[from..to]) * AMPLITUDE_GAIN).min(1.0))
    }

    /// Whether `tick` still has work to do.
    pub fn needs_tick(&self) -> bool {
        !self.queue.is_empty() || self.audible
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn units_played(&self) -> u64 {
        self.units_played
    }

    pub fn units_discarded(&self) -> u64 {
        self.units_discarded
    }

    /// Flush and release the output graph. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.flush();
        self.graph.close();
        self.closed = true;
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::backend::AudioBackend;
    use crate::audio::virtual_device::{GraphEvent, VirtualBackend, VirtualClock};
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    const RATE: u32 = 24_000;

    /// `ms` of constant-level audio, as a relay payload.
    fn payload(ms: u32, level: f32) -> String {
        let samples = vec![level; (RATE * ms / 1000) as usize];
        pcm::encode_frame(&samples)
    }

    async fn scheduler() -> (PlaybackScheduler, VirtualBackend) {
        let backend = VirtualBackend::new(VirtualClock::manual());
        let graph = backend.open_output(RATE).await.unwrap();
        (
            PlaybackScheduler::new(graph, RATE, Duration::from_millis(16)),
            backend,
        )
    }

    #[tokio::test]
    async fn test_units_are_gapless_within_a_turn() {
        let (mut playback, backend) = scheduler().await;
        backend.clock().set(3.0);

        let a = playback.enqueue(&payload(500, 0.2)).unwrap();
        let b = playback.enqueue(&payload(250, 0.2)).unwrap();
        let c = playback.enqueue(&payload(100, 0.2)).unwrap();

        assert_eq!(a.start, 3.0);
        assert_eq!(b.start, a.start + a.duration);
        assert_eq!(c.start, b.start + b.duration);
        assert_eq!(playback.next_start_time(), c.start + c.duration);
    }

    #[tokio::test]
    async fn test_late_cursor_snaps_to_now() {
        let (mut playback, backend) = scheduler().await;
        let a = playback.enqueue(&payload(100, 0.2)).unwrap();
        assert_eq!(a.start, 0.0);

        backend.clock().set(5.0);
        let b = playback.enqueue(&payload(100, 0.2)).unwrap();
        assert_eq!(b.start, 5.0);
        assert!(b.start >= a.start + a.duration);
    }

    #[tokio::test]
    async fn test_flush_stops_everything_and_resets_cursor() {
        let (mut playback, backend) = scheduler().await;
        let clock = backend.clock();
        let a = playback.enqueue(&payload(500, 0.2)).unwrap();
        let b = playback.enqueue(&payload(500, 0.2)).unwrap();

        clock.set(0.7); // mid-B
        assert!(playback.tick().is_some());
        assert_eq!(playback.flush(), 1); // A already retired by tick

        let stopped: Vec<u64> = backend
            .graph_events()
            .into_iter()
            .filter_map(|e| match e {
                GraphEvent::Stopped { id, .. } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(stopped, vec![b.id]);
        assert_ne!(a.id, b.id);
        assert!(playback.is_idle());

        let next = playback.enqueue(&payload(100, 0.2)).unwrap();
        assert_eq!(next.start, 0.7);
    }

    #[tokio::test]
    async fn test_flush_discards_units_not_yet_started() {
        let (mut playback, _backend) = scheduler().await;
        for _ in 0..4 {
            playback.enqueue(&payload(200, 0.2)).unwrap();
        }
        assert_eq!(playback.flush(), 4);
        assert_eq!(playback.units_discarded(), 4);
        assert_eq!(playback.next_start_time(), 0.0);
    }

    #[tokio::test]
    async fn test_amplitude_while_playing_then_single_zero() {
        let (mut playback, backend) = scheduler().await;
        let clock = backend.clock();
        playback.enqueue(&payload(100, 0.2)).unwrap();

        clock.set(0.05);
        let level = playback.tick().unwrap();
        assert!((level - 0.5).abs() < 0.01);

        clock.set(0.2);
        assert_eq!(playback.tick(), Some(0.0));
        assert_eq!(playback.tick(), None);
        assert!(!playback.needs_tick());
        assert_eq!(playback.units_played(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_skipped() {
        let (mut playback, _backend) = scheduler().await;
        assert!(playback.enqueue(&STANDARD.encode([1u8, 2, 3])).is_err());
        assert!(playback.is_idle());
        assert_eq!(playback.next_start_time(), 0.0);

        let ok = playback.enqueue(&payload(100, 0.2)).unwrap();
        assert_eq!(ok.start, 0.0);
    }

    #[tokio::test]
    async fn test_drop_releases_graph() {
        let (mut playback, backend) = scheduler().await;
        playback.enqueue(&payload(100, 0.2)).unwrap();
        drop(playback);
        assert_eq!(backend.graphs_closed(), 1);
        assert!(backend.graph_events().contains(&GraphEvent::Closed));
    }
}
