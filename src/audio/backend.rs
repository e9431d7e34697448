//! # Audio Backend Seam
//!
//! The session engine never talks to a sound card directly. It asks an
//! [`AudioBackend`] for two resources per session:
//!
//! - an [`OutputGraph`]: a clock plus the ability to start and stop decoded
//!   buffers at exact times on that clock
//! - a [`MicrophoneStream`]: capture buffers delivered over a channel, plus a
//!   track handle that releases the device when dropped
//!
//! Both resources are owned by exactly one session and released when that
//! session's task ends, whichever way it ends.

use crate::config::AudioConfig;
use crate::error::SessionResult;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Processing requested from the capture device at acquisition time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub buffer_size: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl From<&AudioConfig> for CaptureConstraints {
    fn from(config: &AudioConfig) -> Self {
        Self {
            sample_rate: config.input_sample_rate,
            buffer_size: config.capture_buffer_size,
            echo_cancellation: config.echo_cancellation,
            noise_suppression: config.noise_suppression,
            auto_gain_control: config.auto_gain_control,
        }
    }
}

/// Source of audio devices for a session.
///
/// ## Thread Safety:
/// Shared between the controller and every session task it spawns, hence
/// `Send + Sync` and `Arc<dyn AudioBackend>` at the call sites.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Create and resume an output graph running at `sample_rate`.
    async fn open_output(&self, sample_rate: u32) -> SessionResult<Box<dyn OutputGraph>>;

    /// Acquire the microphone. Permission denial is an `AudioDevice` error.
    async fn open_microphone(
        &self,
        constraints: &CaptureConstraints,
    ) -> SessionResult<MicrophoneStream>;
}

/// Audio output with its own monotonically advancing clock (seconds).
pub trait OutputGraph: Send {
    fn current_time(&self) -> f64;

    /// Schedule `samples` to begin at `at` seconds on the output clock.
    fn start(&mut self, id: u64, samples: Arc<[f32]>, sample_rate: u32, at: f64);

    /// Stop a scheduled or playing source. Unknown ids are ignored.
    fn stop(&mut self, id: u64);

    /// Release the graph. Called once, after every source has been stopped.
    fn close(&mut self);
}

/// Releases the capture device.
pub trait TrackHandle: Send {
    fn stop(&mut self);
}

/// Live microphone capture.
///
/// `frames` yields one buffer of normalized samples per capture interval.
/// The channel closing means the device went away. Dropping the stream
/// stops the underlying track.
pub struct MicrophoneStream {
    frames: mpsc::Receiver<Vec<f32>>,
    track: Box<dyn TrackHandle>,
}

impl MicrophoneStream {
    pub fn new(frames: mpsc::Receiver<Vec<f32>>, track: Box<dyn TrackHandle>) -> Self {
        Self { frames, track }
    }

    /// Next capture buffer, `None` once the device stream has ended.
    ///
    /// Cancel-safe: usable as a `tokio::select!` branch.
    pub async fn recv(&mut self) -> Option<Vec<f32>> {
        self.frames.recv().await
    }

    /// Drop buffers captured before anyone was listening. Returns how many were dropped.
    pub fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        while self.frames.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

impl Drop for MicrophoneStream {
    fn drop(&mut self) {
        self.frames.close();
        self.track.stop();
    }
}

impl std::fmt::Debug for MicrophoneStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicrophoneStream").finish_non_exhaustive()
    }
}
