//! # Virtual Audio Device
//!
//! An in-process [`AudioBackend`] with no sound hardware behind it. It backs
//! the headless runner binary and every session test.
//!
//! ## Key Components:
//! - **VirtualClock**: either wall-clock time or a manual clock that tests advance
//! - **Output graph**: logs every start/stop as a [`GraphEvent`] and mixes started
//!   units into a recording timeline (stopped units are cut at the stop time)
//! - **Microphone**: fed by the test (`feed_microphone`) or by a sample buffer
//!   (usually a WAV file) paced at the capture interval, followed by silence
//! - **Failure injection**: deny the microphone or fail the output graph

use crate::audio::backend::{
    AudioBackend, CaptureConstraints, MicrophoneStream, OutputGraph, TrackHandle,
};
use crate::audio::wav_io;
use crate::error::{SessionError, SessionResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

const MIC_CHANNEL_CAPACITY: usize = 32;

/// Output clock shared between the backend, its graphs and the test driving them.
#[derive(Debug, Clone)]
pub enum VirtualClock {
    Manual(Arc<Mutex<f64>>),
    Wall(Instant),
}

impl VirtualClock {
    /// Clock that only moves when `advance` or `set` is called.
    pub fn manual() -> Self {
        VirtualClock::Manual(Arc::new(Mutex::new(0.0)))
    }

    pub fn wall() -> Self {
        VirtualClock::Wall(Instant::now())
    }

    /// Seconds since the clock was created.
    pub fn now(&self) -> f64 {
        match self {
            VirtualClock::Manual(t) => *t.lock().unwrap_or_else(PoisonError::into_inner),
            VirtualClock::Wall(origin) => origin.elapsed().as_secs_f64(),
        }
    }

    /// Move a manual clock forward. No-op on a wall clock.
    pub fn advance(&self, secs: f64) {
        if let VirtualClock::Manual(t) = self {
            *t.lock().unwrap_or_else(PoisonError::into_inner) += secs;
        }
    }

    pub fn set(&self, secs: f64) {
        if let VirtualClock::Manual(t) = self {
            *t.lock().unwrap_or_else(PoisonError::into_inner) = secs;
        }
    }
}

/// Everything the virtual output graph was asked to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    Opened { sample_rate: u32 },
    Started { id: u64, at: f64, duration: f64 },
    Stopped { id: u64, at: f64 },
    Closed,
}

#[derive(Default)]
struct Shared {
    graph_log: Vec<GraphEvent>,
    recorded: Vec<f32>,
    output_rate: u32,
    mic_sender: Option<(u64, mpsc::Sender<Vec<f32>>)>,
    mic_generation: u64,
    mics_opened: usize,
    mics_released: usize,
    graphs_opened: usize,
    graphs_closed: usize,
    last_constraints: Option<CaptureConstraints>,
    deny_microphone: Option<String>,
    fail_output: Option<String>,
}

/// Headless audio backend.
///
/// Cloning yields another handle onto the same devices, so a test can keep
/// one handle for inspection while the controller owns another.
#[derive(Clone)]
pub struct VirtualBackend {
    clock: VirtualClock,
    shared: Arc<Mutex<Shared>>,
    input: Option<Arc<Vec<f32>>>,
}

impl VirtualBackend {
    /// Backend whose microphone is fed manually through `feed_microphone`.
    pub fn new(clock: VirtualClock) -> Self {
        Self {
            clock,
            shared: Arc::new(Mutex::new(Shared::default())),
            input: None,
        }
    }

    /// Microphone plays `samples` (already at the capture rate), then silence.
    pub fn with_input_samples(mut self, samples: Vec<f32>) -> Self {
        self.input = Some(Arc::new(samples));
        self
    }

    /// Microphone plays a WAV file, resampled to `capture_rate`, then silence.
    pub fn with_wav_input(self, path: &Path, capture_rate: u32) -> SessionResult<Self> {
        let (samples, rate) = wav_io::read_mono(path)?;
        info!(
            path = %path.display(),
            samples = samples.len(),
            sample_rate = rate,
            "Loaded microphone input file"
        );
        Ok(self.with_input_samples(wav_io::resample_linear(&samples, rate, capture_rate)))
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn clock(&self) -> VirtualClock {
        self.clock.clone()
    }

    /// Make the next `open_microphone` calls fail as a permission denial.
    pub fn deny_microphone(&self, reason: &str) {
        self.lock().deny_microphone = Some(reason.to_string());
    }

    /// Make the next `open_output` calls fail.
    pub fn fail_output(&self, reason: &str) {
        self.lock().fail_output = Some(reason.to_string());
    }

    /// Deliver one capture buffer to the open microphone. `false` if none is open.
    pub fn feed_microphone(&self, samples: Vec<f32>) -> bool {
        let sender = self.lock().mic_sender.as_ref().map(|(_, tx)| tx.clone());
        match sender {
            Some(tx) => tx.try_send(samples).is_ok(),
            None => false,
        }
    }

    /// Simulate the capture device disappearing.
    pub fn end_microphone(&self) {
        self.lock().mic_sender = None;
    }

    pub fn graph_events(&self) -> Vec<GraphEvent> {
        self.lock().graph_log.clone()
    }

    /// Mixed output timeline, at the output graph's sample rate.
    pub fn recorded_output(&self) -> (Vec<f32>, u32) {
        let shared = self.lock();
        (shared.recorded.clone(), shared.output_rate)
    }

    pub fn microphones_opened(&self) -> usize {
        self.lock().mics_opened
    }

    pub fn microphones_released(&self) -> usize {
        self.lock().mics_released
    }

    pub fn graphs_opened(&self) -> usize {
        self.lock().graphs_opened
    }

    pub fn graphs_closed(&self) -> usize {
        self.lock().graphs_closed
    }

    pub fn last_constraints(&self) -> Option<CaptureConstraints> {
        self.lock().last_constraints
    }
}

#[async_trait]
impl AudioBackend for VirtualBackend {
    async fn open_output(&self, sample_rate: u32) -> SessionResult<Box<dyn OutputGraph>> {
        {
            let mut shared = self.lock();
            if let Some(reason) = &shared.fail_output {
                return Err(SessionError::AudioDevice(reason.clone()));
            }
            shared.graphs_opened += 1;
            shared.output_rate = sample_rate;
            shared.graph_log.push(GraphEvent::Opened { sample_rate });
        }
        Ok(Box::new(VirtualGraph {
            clock: self.clock.clone(),
            shared: Arc::clone(&self.shared),
            sample_rate,
            placements: HashMap::new(),
            closed: false,
        }))
    }

    async fn open_microphone(
        &self,
        constraints: &CaptureConstraints,
    ) -> SessionResult<MicrophoneStream> {
        let (tx, rx) = mpsc::channel(MIC_CHANNEL_CAPACITY);
        let generation = {
            let mut shared = self.lock();
            if let Some(reason) = &shared.deny_microphone {
                return Err(SessionError::AudioDevice(format!(
                    "microphone permission denied: {}",
                    reason
                )));
            }
            shared.mic_generation += 1;
            shared.mics_opened += 1;
            shared.last_constraints = Some(*constraints);
            let generation = shared.mic_generation;
            shared.mic_sender = Some((generation, tx.clone()));
            generation
        };

        if let Some(input) = &self.input {
            tokio::spawn(pump_samples(Arc::clone(input), *constraints, tx));
        }

        debug!(generation, "Virtual microphone opened");
        Ok(MicrophoneStream::new(
            rx,
            Box::new(VirtualTrack {
                shared: Arc::clone(&self.shared),
                generation,
                stopped: false,
            }),
        ))
    }
}

/// Send `input` in capture-sized chunks at the capture cadence, then silence.
async fn pump_samples(
    input: Arc<Vec<f32>>,
    constraints: CaptureConstraints,
    tx: mpsc::Sender<Vec<f32>>,
) {
    let size = constraints.buffer_size.max(1);
    let period = Duration::from_secs_f64(size as f64 / constraints.sample_rate.max(1) as f64);
    let mut ticker = tokio::time::interval(period);
    let mut chunks = input.chunks(size);

    loop {
        ticker.tick().await;
        let mut frame = chunks.next().map(<[f32]>::to_vec).unwrap_or_default();
        frame.resize(size, 0.0);
        if tx.send(frame).await.is_err() {
            break; // track stopped
        }
    }
}

struct VirtualTrack {
    shared: Arc<Mutex<Shared>>,
    generation: u64,
    stopped: bool,
}

impl TrackHandle for VirtualTrack {
    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        shared.mics_released += 1;
        if matches!(shared.mic_sender, Some((g, _)) if g == self.generation) {
            shared.mic_sender = None;
        }
    }
}

struct VirtualGraph {
    clock: VirtualClock,
    shared: Arc<Mutex<Shared>>,
    sample_rate: u32,
    /// id → (first recorded sample index, length)
    placements: HashMap<u64, (usize, usize)>,
    closed: bool,
}

impl VirtualGraph {
    fn index_at(&self, secs: f64) -> usize {
        (secs.max(0.0) * self.sample_rate as f64).round() as usize
    }
}

impl OutputGraph for VirtualGraph {
    fn current_time(&self) -> f64 {
        self.clock.now()
    }

    fn start(&mut self, id: u64, samples: Arc<[f32]>, sample_rate: u32, at: f64) {
        let duration = samples.len() as f64 / sample_rate.max(1) as f64;
        let first = self.index_at(at);
        self.placements.insert(id, (first, samples.len()));

        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        shared.graph_log.push(GraphEvent::Started { id, at, duration });
        let end = first + samples.len();
        if shared.recorded.len() < end {
            shared.recorded.resize(end, 0.0);
        }
        for (slot, sample) in shared.recorded[first..end].iter_mut().zip(samples.iter()) {
            *slot += *sample;
        }
    }

    fn stop(&mut self, id: u64) {
        let now = self.clock.now();
        let cut = self.index_at(now);
        let placement = self.placements.remove(&id);

        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        shared.graph_log.push(GraphEvent::Stopped { id, at: now });
        if let Some((first, len)) = placement {
            let from = cut.max(first).min(shared.recorded.len());
            let to = (first + len).min(shared.recorded.len());
            for slot in shared.recorded[from.min(to)..to].iter_mut() {
                *slot = 0.0;
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        shared.graphs_closed += 1;
        shared.graph_log.push(GraphEvent::Closed);
    }
}

impl Drop for VirtualGraph {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constraints() -> CaptureConstraints {
        CaptureConstraints {
            sample_rate: 16_000,
            buffer_size: 160,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }

    #[test]
    fn test_manual_clock() {
        let clock = VirtualClock::manual();
        assert_eq!(clock.now(), 0.0);
        clock.advance(0.25);
        clock.advance(0.25);
        assert_eq!(clock.now(), 0.5);
        clock.set(2.0);
        assert_eq!(clock.now(), 2.0);
    }

    #[tokio::test]
    async fn test_graph_records_and_truncates_on_stop() {
        let backend = VirtualBackend::new(VirtualClock::manual());
        let clock = backend.clock();
        let mut graph = backend.open_output(10).await.unwrap();

        graph.start(1, Arc::from(vec![1.0f32; 10]), 10, 0.0);
        clock.advance(0.5);
        graph.stop(1);
        graph.close();

        let (recorded, rate) = backend.recorded_output();
        assert_eq!(rate, 10);
        assert_eq!(&recorded[..5], &[1.0; 5]);
        assert_eq!(&recorded[5..], &[0.0; 5]);
        assert_eq!(
            backend.graph_events(),
            vec![
                GraphEvent::Opened { sample_rate: 10 },
                GraphEvent::Started { id: 1, at: 0.0, duration: 1.0 },
                GraphEvent::Stopped { id: 1, at: 0.5 },
                GraphEvent::Closed,
            ]
        );
    }

    #[tokio::test]
    async fn test_dropping_graph_closes_it_once() {
        let backend = VirtualBackend::new(VirtualClock::manual());
        let mut graph = backend.open_output(24_000).await.unwrap();
        graph.close();
        drop(graph);
        assert_eq!(backend.graphs_closed(), 1);
    }

    #[tokio::test]
    async fn test_manual_microphone_feed_and_release() {
        let backend = VirtualBackend::new(VirtualClock::manual());
        let mut mic = backend.open_microphone(&constraints()).await.unwrap();

        assert!(backend.feed_microphone(vec![0.1; 160]));
        assert_eq!(mic.recv().await.unwrap().len(), 160);
        assert_eq!(backend.last_constraints(), Some(constraints()));

        drop(mic);
        assert_eq!(backend.microphones_released(), 1);
        assert!(!backend.feed_microphone(vec![0.1; 160]));
    }

    #[tokio::test]
    async fn test_denied_microphone() {
        let backend = VirtualBackend::new(VirtualClock::manual());
        backend.deny_microphone("user dismissed prompt");
        let err = backend.open_microphone(&constraints()).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(backend.microphones_opened(), 0);
    }

    #[tokio::test]
    async fn test_sample_input_is_chunked_then_silent() {
        let backend =
            VirtualBackend::new(VirtualClock::manual()).with_input_samples(vec![0.5; 200]);
        let mut mic = backend.open_microphone(&constraints()).await.unwrap();

        let first = mic.recv().await.unwrap();
        let second = mic.recv().await.unwrap();
        let third = mic.recv().await.unwrap();
        assert_eq!(first, vec![0.5; 160]);
        assert_eq!(&second[..40], &[0.5; 40]);
        assert_eq!(&second[40..], &[0.0; 120]);
        assert_eq!(third, vec![0.0; 160]);
    }
}
