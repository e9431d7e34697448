//! # Audio Capture Encoder
//!
//! Turns microphone buffers into outbound transport frames.
//!
//! ## Capture Lifecycle:
//! 1. **Acquired**: the controller holds the microphone, nothing is emitted
//! 2. **Started**: `start(stream)` once the transport is open; buffers captured
//!    before that moment are discarded
//! 3. **Muted**: buffers keep arriving and are dropped, the track stays open
//! 4. **Stopped**: `stop()` or drop releases the track
//!
//! ## Frame Format:
//! 16-bit little-endian PCM at the capture rate, base64 encoded. Frames carry no
//! sequence number; the single ordered connection preserves their order.

use crate::audio::backend::MicrophoneStream;
use crate::audio::pcm;
use crate::error::{SessionError, SessionResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// One encoded capture interval, ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// base64 PCM16LE
    pub payload: String,
    /// number of samples encoded in `payload`
    pub samples: usize,
}

/// Mute flag shared between the controller and the capture encoder.
///
/// ## Thread Safety:
/// A single `AtomicBool`; `set_mute` on the controller takes effect on the very
/// next capture buffer without any lock or message round-trip.
#[derive(Debug, Clone, Default)]
pub struct MuteSwitch(Arc<AtomicBool>);

impl MuteSwitch {
    pub fn set(&self, muted: bool) {
        self.0.store(muted, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct AudioCaptureEncoder {
    mute: MuteSwitch,
    stream: Option<MicrophoneStream>,
    frames_emitted: u64,
    frames_muted: u64,
}

impl AudioCaptureEncoder {
    pub fn new(mute: MuteSwitch) -> Self {
        Self {
            mute,
            stream: None,
            frames_emitted: 0,
            frames_muted: 0,
        }
    }

    /// Begin emitting frames from `stream`.
    pub fn start(&mut self, mut stream: MicrophoneStream) {
        let stale = stream.discard_pending();
        debug!(stale, "Capture started");
        self.stream = Some(stream);
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_some()
    }

    /// Release the microphone track.
    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            debug!(
                frames_emitted = self.frames_emitted,
                frames_muted = self.frames_muted,
                "Capture stopped"
            );
        }
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    /// Wait for the next frame to send.
    ///
    /// Never resolves before `start`. Muted buffers are consumed and dropped.
    /// A microphone stream that ends is a fatal `AudioDevice` error.
    ///
    /// Cancel-safe: no buffer is held across an await point.
    pub async fn next_frame(&mut self) -> SessionResult<AudioFrame> {
        let Some(stream) = self.stream.as_mut() else {
            return std::future::pending().await;
        };

        loop {
            let Some(samples) = stream.recv().await else {
                return Err(SessionError::AudioDevice(
                    "microphone stream ended".to_string(),
                ));
            };

            if self.mute.is_muted() {
                self.frames_muted += 1;
                continue;
            }

            self.frames_emitted += 1;
            trace!(samples = samples.len(), "Encoded capture frame");
            return Ok(AudioFrame {
                payload: pcm::encode_frame(&samples),
                samples: samples.len(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::backend::{AudioBackend, CaptureConstraints};
    use crate::audio::virtual_device::{VirtualBackend, VirtualClock};
    use std::time::Duration;

    fn constraints() -> CaptureConstraints {
        CaptureConstraints {
            sample_rate: 16_000,
            buffer_size: 4,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }

    #[tokio::test]
    async fn test_nothing_emitted_before_start() {
        let mut encoder = AudioCaptureEncoder::new(MuteSwitch::default());
        let res = tokio::time::timeout(Duration::from_millis(20), encoder.next_frame()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_buffers_before_start_are_discarded() {
        let backend = VirtualBackend::new(VirtualClock::manual());
        let mic = backend.open_microphone(&constraints()).await.unwrap();
        assert!(backend.feed_microphone(vec![0.9; 4]));

        let mut encoder = AudioCaptureEncoder::new(MuteSwitch::default());
        encoder.start(mic);
        assert!(backend.feed_microphone(vec![0.5; 4]));

        let frame = encoder.next_frame().await.unwrap();
        assert_eq!(frame.payload, pcm::encode_frame(&[0.5; 4]));
        assert_eq!(frame.samples, 4);
    }

    #[tokio::test]
    async fn test_mute_gates_emission_not_acquisition() {
        let backend = VirtualBackend::new(VirtualClock::manual());
        let mic = backend.open_microphone(&constraints()).await.unwrap();
        let mute = MuteSwitch::default();
        let mut encoder = AudioCaptureEncoder::new(mute.clone());
        encoder.start(mic);

        mute.set(true);
        assert!(backend.feed_microphone(vec![0.1; 4]));
        let res = tokio::time::timeout(Duration::from_millis(20), encoder.next_frame()).await;
        assert!(res.is_err());
        assert_eq!(backend.microphones_released(), 0);

        mute.set(false);
        assert!(backend.feed_microphone(vec![0.2; 4]));
        let frame = encoder.next_frame().await.unwrap();
        assert_eq!(frame.payload, pcm::encode_frame(&[0.2; 4]));
        assert_eq!(encoder.frames_emitted(), 1);
    }

    #[tokio::test]
    async fn test_device_loss_is_fatal() {
        let backend = VirtualBackend::new(VirtualClock::manual());
        let mic = backend.open_microphone(&constraints()).await.unwrap();
        let mut encoder = AudioCaptureEncoder::new(MuteSwitch::default());
        encoder.start(mic);

        backend.end_microphone();
        let err = encoder.next_frame().await.unwrap_err();
        assert!(matches!(err, SessionError::AudioDevice(_)));
    }

    #[tokio::test]
    async fn test_stop_releases_track() {
        let backend = VirtualBackend::new(VirtualClock::manual());
        let mic = backend.open_microphone(&constraints()).await.unwrap();
        let mut encoder = AudioCaptureEncoder::new(MuteSwitch::default());
        encoder.start(mic);
        encoder.stop();
        encoder.stop();
        assert_eq!(backend.microphones_released(), 1);
        assert!(!encoder.is_started());
    }
}
