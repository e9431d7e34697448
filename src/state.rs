//! # Session State Management
//!
//! The one live [`Session`] of a controller, shared between the controller's
//! public methods and the session task it spawned.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: the controller and its session task both hold the slot
//! - **RwLock**: snapshots read concurrently, transitions write exclusively
//!
//! ## Guarded Transitions:
//! Every write names the session id it applies to. A task that outlives its
//! session (because `connect` replaced it) can therefore never overwrite the
//! state of its successor.
//!
//! ## Behavior per state:
//! | state                      | `connect`                 | `disconnect` |
//! |----------------------------|---------------------------|--------------|
//! | Disconnected               | starts a session          | no-op        |
//! | Connecting (first attempt) | no-op (already in flight) | tears down   |
//! | Connecting (reconnecting)  | replaces the session      | tears down   |
//! | Connected                  | replaces the session      | tears down   |
//! | Disconnecting              | replaces after teardown   | no-op        |

use crate::tools::StageState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and state of one conversation attempt.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub muted: bool,
    pub stage: StageState,
    pub started_at: DateTime<Utc>,
    /// Cancels the session task.
    pub cancel: CancellationToken,
}

/// Read-only copy of the live session for callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Option<Uuid>,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub muted: bool,
    pub stage: Option<StageState>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Handle onto a newly started session.
#[derive(Debug, Clone)]
pub struct SessionTicket {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default)]
pub struct SharedSession {
    slot: Arc<RwLock<Option<Session>>>,
}

impl SharedSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<Session>> {
        self.slot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Session>> {
        self.slot.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self, muted: bool) -> SessionSnapshot {
        match self.read().as_ref() {
            Some(session) => SessionSnapshot {
                session_id: Some(session.id),
                state: session.state,
                reconnect_attempts: session.reconnect_attempts,
                muted: session.muted,
                stage: Some(session.stage),
                started_at: Some(session.started_at),
            },
            None => SessionSnapshot {
                session_id: None,
                state: ConnectionState::Disconnected,
                reconnect_attempts: 0,
                muted,
                stage: None,
                started_at: None,
            },
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.read()
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_current(&self, id: Uuid) -> bool {
        self.read().as_ref().is_some_and(|s| s.id == id)
    }

    /// Replace the live session with a fresh `Connecting` one.
    ///
    /// Returns `None` when a connect is already in flight. A session that is
    /// `Connecting` only because it is recovering from a dropped connection
    /// (`reconnect_attempts > 0`) is replaced like any other. The previous
    /// session, if any, is cancelled.
    pub fn begin(&self, muted: bool) -> Option<SessionTicket> {
        let mut slot = self.write();
        if let Some(current) = slot.as_ref() {
            if current.state == ConnectionState::Connecting && current.reconnect_attempts == 0 {
                return None;
            }
            current.cancel.cancel();
        }

        let ticket = SessionTicket {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
        };
        *slot = Some(Session {
            id: ticket.id,
            state: ConnectionState::Connecting,
            reconnect_attempts: 0,
            muted,
            stage: StageState::default(),
            started_at: ticket.started_at,
            cancel: ticket.cancel.clone(),
        });
        Some(ticket)
    }

    /// Move a live session to `Disconnecting` and hand back what is needed to stop it.
    ///
    /// `None` when there is nothing to disconnect (already disconnecting or disconnected).
    pub fn begin_disconnect(&self) -> Option<(Uuid, CancellationToken)> {
        let mut slot = self.write();
        let session = slot.as_mut()?;
        match session.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                session.state = ConnectionState::Disconnecting;
                Some((session.id, session.cancel.clone()))
            }
            ConnectionState::Disconnecting | ConnectionState::Disconnected => None,
        }
    }

    /// Compare-and-set keyed on the session id. Returns whether the transition applied.
    pub fn transition(&self, id: Uuid, from: &[ConnectionState], to: ConnectionState) -> bool {
        let mut slot = self.write();
        match slot.as_mut() {
            Some(session) if session.id == id && from.contains(&session.state) => {
                session.state = to;
                true
            }
            _ => false,
        }
    }

    /// Apply `f` to the session if it is still `id`.
    pub fn update(&self, id: Uuid, f: impl FnOnce(&mut Session)) {
        if let Some(session) = self.write().as_mut().filter(|s| s.id == id) {
            f(session);
        }
    }

    pub fn set_muted(&self, muted: bool) {
        if let Some(session) = self.write().as_mut() {
            session.muted = muted;
        }
    }

    /// Cancel whatever session is live, without waiting for it.
    pub fn cancel_current(&self) {
        if let Some(session) = self.read().as_ref() {
            session.cancel.cancel();
        }
    }
}
