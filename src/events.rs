//! # Session Events
//!
//! A caller observes a [`SessionController`](crate::SessionController) through one ordered
//! stream of [`SessionEvent`]s instead of a set of callbacks.
//!
//! ## Ordering:
//! Events are emitted in the order the session task produced them. For one
//! inbound message that means interruption first, then audio amplitude,
//! transcripts and finally tool-call effects (each after its ack was sent).

use crate::error::SessionError;
use crate::tools::{Completion, Stage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Lifecycle(LifecycleEvent),
    StageChanged { stage: Stage },
    Transcript(TranscriptEvent),
    /// Agent speech level in [0, 1]; exactly 0.0 when playback stops.
    Amplitude(f32),
    Completed(Completion),
    /// Fatal error. Followed by `Lifecycle(Disconnected)`.
    Error(SessionError),
    Ended(SessionSummary),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Connecting { session_id: Uuid },
    Connected { session_id: Uuid },
    Reconnecting { attempt: u32, delay: Duration },
    /// The relay reports its upstream model connection open.
    UpstreamOpened,
    /// The upstream model acknowledged its setup and is ready for audio.
    UpstreamReady,
    /// The relay reports its upstream model connection closed.
    UpstreamClosed { reason: Option<String> },
    Disconnected { session_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Agent,
}

/// One transcription fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEvent {
    pub sender: Speaker,
    pub text: String,
    /// Arrival order within the session, starting at 0.
    pub order: u64,
    /// Same speaker as the previous fragment: append rather than start a new entry.
    pub continues: bool,
}

/// Why a session task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Completed,
    UserDisconnect,
    RemoteClosed,
    ConnectionLost,
    DeviceLost,
    Replaced,
}

/// End-of-session report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub end_reason: EndReason,
    /// Last onboarding stage entered, also for completed sessions.
    pub final_stage: Stage,
    pub completion: Option<Completion>,
    pub frames_captured: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub units_played: u64,
    pub units_discarded: u64,
    pub tool_calls: u64,
    pub reconnects: u32,
}
