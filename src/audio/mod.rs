//! # Audio Module
//!
//! Everything between the microphone and the speaker.
//!
//! ## Key Components:
//! - **backend**: traits for the output graph and microphone a session acquires
//! - **capture**: microphone buffers → base64 PCM16 frames, gated by mute
//! - **playback**: gapless scheduling of the agent's speech, flush on barge-in
//! - **pcm**: the PCM16 little-endian codec shared by both directions
//! - **virtual_device**: headless backend for the runner binary and tests
//! - **wav_io**: WAV input/output for the headless backend
//!
//! ## Audio Format Requirements:
//! - **Capture**: 16 kHz mono, 16-bit signed little-endian PCM
//! - **Playback**: 24 kHz mono, 16-bit signed little-endian PCM
//! - **Transport encoding**: base64

pub mod backend;
pub mod capture;
pub mod pcm;
pub mod playback;
pub mod virtual_device;
pub mod wav_io;

pub use backend::{AudioBackend, CaptureConstraints, MicrophoneStream, OutputGraph, TrackHandle};
pub use capture::{AudioCaptureEncoder, AudioFrame, MuteSwitch};
pub use playback::{PlaybackScheduler, PlaybackUnit, Scheduled};
pub use virtual_device::{GraphEvent, VirtualBackend, VirtualClock};
