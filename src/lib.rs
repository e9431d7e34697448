//! # Onboard Voice - Real-Time Voice Session Engine
//!
//! Client-side engine for a spoken onboarding conversation with an AI agent
//! reached through a WebSocket relay.
//!
//! ## Module Architecture:
//! - **audio**: microphone capture, PCM16 codec, gapless playback scheduling
//! - **transport**: relay connection, wire framing, reconnect policy
//! - **tools**: the agent's tool calls and the onboarding stage machine
//! - **controller**: public API that wires one session together
//! - **state**: the shared live-session record behind `connect`/`disconnect`
//! - **events**: what a caller observes
//! - **transcript**: ordering and merging of transcription fragments
//! - **config**: layered configuration (defaults, TOML file, environment)
//! - **error**: one error type for the whole engine

pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod state;
pub mod tools;
pub mod transcript;
pub mod transport;

pub use audio::{AudioBackend, VirtualBackend, VirtualClock};
pub use config::EngineConfig;
pub use controller::SessionController;
pub use error::{SessionError, SessionResult};
pub use events::{EndReason, LifecycleEvent, SessionEvent, SessionSummary, Speaker, TranscriptEvent};
pub use state::{ConnectionState, SessionSnapshot};
pub use tools::{Completion, PaymentMethod, Stage, StageState};
pub use transcript::TranscriptLog;
