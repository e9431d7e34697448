//! # Transport Session
//!
//! Owns the single WebSocket connection to the relay for one voice session.
//!
//! ## State Machine:
//! `Disconnected → Connecting → Connected → Disconnecting → Disconnected`
//!
//! While waiting out a reconnect delay the state is `Connecting` again.
//!
//! ## Key Components:
//! - **Reader**: the stream half stays inside the session and is polled by
//!   `next_event`, which also drives connect attempts, reconnect delays and
//!   keep-alive pings. `next_event` is cancel-safe, so it can sit in a
//!   `tokio::select!` next to capture and playback.
//! - **Writer**: a small task per connection owns the sink half. `send` only
//!   pushes onto its channel and never awaits.
//!
//! ## Reconnection:
//! Any drop other than a close frame with code 1000 (read error, missing close
//! frame, failed connect, keep-alive timeout) schedules reconnect attempt `n`
//! after `ReconnectPolicy::delay_for(n)`. When the policy has no attempt left the
//! session reports a fatal `ConnectionLost`. Every successful open resets the
//! counter and re-sends the initialization message.

use crate::config::TransportConfig;
use crate::error::SessionError;
use crate::state::ConnectionState;
use crate::transport::messages::{parse_inbound, Inbound, Outbound, WireDialect};
use crate::transport::reconnect::ReconnectPolicy;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture = Pin<Box<dyn Future<Output = Result<WsStream, SessionError>> + Send>>;

/// How long `close` waits for the close frame to be flushed.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Silence longer than this many keep-alive intervals counts as a dropped connection.
const KEEPALIVE_MISSES: u32 = 3;

/// What the session loop needs to react to.
#[derive(Debug)]
pub enum TransportEvent {
    /// Connection (re)established and initialization sent.
    Opened { reconnected: bool },
    /// A decoded inbound frame.
    Message(Inbound),
    /// The connection dropped; attempt `attempt` starts after `delay`.
    Reconnecting {
        attempt: u32,
        delay: Duration,
        cause: SessionError,
    },
    /// Reconnect budget exhausted. Terminal.
    Lost(SessionError),
    /// The relay closed normally (code 1000). Terminal, no retry.
    Closed { reason: String },
}

/// Counters reported in the session summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub opens: u32,
    pub reconnects: u32,
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

enum Link {
    Idle,
    Connecting(ConnectFuture),
    Waiting(Pin<Box<Sleep>>),
    Open(Connection),
}

enum Step {
    Connected(Result<WsStream, SessionError>),
    Retry,
    Read(ReadStep),
}

enum ReadStep {
    Frame(String),
    NormalClose(String),
    Dropped(SessionError),
    Continue,
}

struct Connection {
    outbound: mpsc::UnboundedSender<WsMessage>,
    inbound: SplitStream<WsStream>,
    writer: JoinHandle<()>,
    keepalive: Option<(Interval, Duration)>,
    last_seen: Instant,
}

pub struct TransportSession {
    session_id: Uuid,
    url: String,
    dialect: WireDialect,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    keepalive: Option<Duration>,
    init: Option<Outbound>,
    state: ConnectionState,
    link: Link,
    attempts: u32,
    stats: TransportStats,
}

impl TransportSession {
    pub fn new(session_id: Uuid, config: &TransportConfig) -> Self {
        Self {
            session_id,
            url: config.url.clone(),
            dialect: config.dialect,
            policy: ReconnectPolicy::from_config(config),
            connect_timeout: config.connect_timeout(),
            keepalive: config.keepalive_interval(),
            init: None,
            state: ConnectionState::Disconnected,
            link: Link::Idle,
            attempts: 0,
            stats: TransportStats::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reconnect attempts made since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    /// Start connecting. The outcome arrives through `next_event`.
    ///
    /// ## State Transition:
    /// `Disconnected → Connecting`. Ignored in any other state.
    pub fn open(&mut self, system_instruction: &str) {
        if self.state != ConnectionState::Disconnected {
            debug!(session_id = %self.session_id, state = %self.state, "open ignored");
            return;
        }
        self.init = Some(Outbound::Initialize {
            system_instruction: system_instruction.to_string(),
        });
        self.attempts = 0;
        self.state = ConnectionState::Connecting;
        self.link = Link::Connecting(self.connect_future());
        info!(session_id = %self.session_id, url = %self.url, "Connecting to relay");
    }

    fn connect_future(&self) -> ConnectFuture {
        let url = self.url.clone();
        let timeout = self.connect_timeout;
        Box::pin(async move {
            match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await
            {
                Ok(Ok((ws, _response))) => Ok(ws),
                Ok(Err(e)) => Err(SessionError::from(e)),
                Err(_) => Err(SessionError::Transport(format!(
                    "connect timed out after {}ms",
                    timeout.as_millis()
                ))),
            }
        })
    }

    /// Queue a message for the relay.
    ///
    /// Returns `false` (and counts the frame as dropped) when not connected.
    pub fn send(&mut self, message: Outbound) -> bool {
        let Link::Open(conn) = &self.link else {
            self.stats.frames_dropped += 1;
            trace!(session_id = %self.session_id, kind = message.kind(), "Dropped outbound message while not connected");
            return false;
        };

        let text = match message.encode(self.dialect) {
            Ok(text) => text,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Failed to encode outbound message");
                self.stats.frames_dropped += 1;
                return false;
            }
        };

        if conn.outbound.send(WsMessage::Text(text)).is_ok() {
            self.stats.frames_sent += 1;
            true
        } else {
            self.stats.frames_dropped += 1;
            false
        }
    }

    /// Wait for the next thing the session loop must react to.
    ///
    /// Never resolves while idle or after a terminal event.
    pub async fn next_event(&mut self) -> TransportEvent {
        loop {
            let step = match &mut self.link {
                Link::Idle => std::future::pending().await,
                Link::Connecting(connecting) => Step::Connected(connecting.await),
                Link::Waiting(delay) => {
                    delay.as_mut().await;
                    Step::Retry
                }
                Link::Open(conn) => Step::Read(conn.read().await),
            };

            match step {
                Step::Connected(Ok(ws)) => return self.established(ws),
                Step::Connected(Err(cause)) => return self.dropped(cause),
                Step::Retry => {
                    info!(session_id = %self.session_id, attempt = self.attempts, "Reconnecting to relay");
                    self.link = Link::Connecting(self.connect_future());
                }
                Step::Read(ReadStep::Continue) => {}
                Step::Read(ReadStep::Frame(text)) => match parse_inbound(&text) {
                    Ok(inbound) => return TransportEvent::Message(inbound),
                    Err(e) => {
                        warn!(session_id = %self.session_id, error = %e, "Ignoring malformed relay frame");
                    }
                },
                Step::Read(ReadStep::NormalClose(reason)) => {
                    info!(session_id = %self.session_id, reason = %reason, "Relay closed the connection");
                    self.link = Link::Idle;
                    self.state = ConnectionState::Disconnected;
                    return TransportEvent::Closed { reason };
                }
                Step::Read(ReadStep::Dropped(cause)) => return self.dropped(cause),
            }
        }
    }

    fn established(&mut self, ws: WsStream) -> TransportEvent {
        let (sink, inbound) = ws.split();
        let (outbound, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(sink, rx, self.session_id));

        let keepalive = self.keepalive.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            (ticker, period)
        });

        self.link = Link::Open(Connection {
            outbound,
            inbound,
            writer,
            keepalive,
            last_seen: Instant::now(),
        });
        self.state = ConnectionState::Connected;

        let reconnected = self.stats.opens > 0;
        self.stats.opens += 1;
        if reconnected {
            self.stats.reconnects += 1;
        }
        info!(
            session_id = %self.session_id,
            attempts = self.attempts,
            reconnected,
            "Relay connection open"
        );
        self.attempts = 0;

        if let Some(init) = self.init.clone() {
            self.send(init);
        }
        TransportEvent::Opened { reconnected }
    }

    fn dropped(&mut self, cause: SessionError) -> TransportEvent {
        self.link = Link::Idle;

        let attempt = self.attempts + 1;
        match self.policy.delay_for(attempt) {
            Some(delay) => {
                self.attempts = attempt;
                self.state = ConnectionState::Connecting;
                self.link = Link::Waiting(Box::pin(tokio::time::sleep(delay)));
                warn!(
                    session_id = %self.session_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    cause = %cause,
                    "Relay connection dropped, scheduling reconnect"
                );
                TransportEvent::Reconnecting {
                    attempt,
                    delay,
                    cause,
                }
            }
            None => {
                self.state = ConnectionState::Disconnected;
                warn!(
                    session_id = %self.session_id,
                    attempts = self.attempts,
                    cause = %cause,
                    "Reconnect budget exhausted"
                );
                TransportEvent::Lost(SessionError::ConnectionLost {
                    attempts: self.attempts,
                })
            }
        }
    }

    /// Close with code 1000 and cancel any pending connect or reconnect delay.
    ///
    /// ## State Transition:
    /// `* → Disconnecting → Disconnected`. A no-op when already disconnecting or disconnected.
    pub async fn close(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Disconnecting
        ) {
            self.link = Link::Idle;
            return;
        }
        self.state = ConnectionState::Disconnecting;

        match std::mem::replace(&mut self.link, Link::Idle) {
            Link::Open(conn) => conn.close_normal(self.session_id).await,
            Link::Connecting(_) | Link::Waiting(_) => {
                debug!(session_id = %self.session_id, "Cancelled pending connect");
            }
            Link::Idle => {}
        }

        self.state = ConnectionState::Disconnected;
        info!(session_id = %self.session_id, "Relay connection closed");
    }
}

impl Connection {
    async fn read(&mut self) -> ReadStep {
        tokio::select! {
            frame = self.inbound.next() => {
                self.last_seen = Instant::now();
                match frame {
                    Some(Ok(WsMessage::Text(text))) => ReadStep::Frame(text),
                    Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) if text.starts_with('{') => ReadStep::Frame(text),
                        _ => {
                            warn!("Skipping non-JSON binary frame from relay");
                            ReadStep::Continue
                        }
                    },
                    Some(Ok(WsMessage::Close(Some(frame)))) if frame.code == CloseCode::Normal => {
                        ReadStep::NormalClose(frame.reason.into_owned())
                    }
                    Some(Ok(WsMessage::Close(frame))) => ReadStep::Dropped(SessionError::Transport(
                        match frame {
                            Some(f) => format!("closed with code {}: {}", u16::from(f.code), f.reason),
                            None => "closed without a status code".to_string(),
                        },
                    )),
                    Some(Ok(_)) => ReadStep::Continue,
                    Some(Err(e)) => ReadStep::Dropped(e.into()),
                    None => ReadStep::Dropped(SessionError::Transport(
                        "connection dropped without a close frame".into(),
                    )),
                }
            }
            _ = keepalive_tick(&mut self.keepalive) => {
                let period = self.keepalive.as_ref().map(|(_, p)| *p).unwrap_or_default();
                if self.last_seen.elapsed() >= period * KEEPALIVE_MISSES {
                    ReadStep::Dropped(SessionError::Transport(format!(
                        "no traffic for {}ms",
                        self.last_seen.elapsed().as_millis()
                    )))
                } else {
                    let _ = self.outbound.send(WsMessage::Ping(Vec::new()));
                    ReadStep::Continue
                }
            }
        }
    }

    async fn close_normal(mut self, session_id: Uuid) {
        let _ = self.outbound.send(WsMessage::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "session ended".into(),
        })));
        drop(self.outbound);

        if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut self.writer)
            .await
            .is_err()
        {
            warn!(session_id = %session_id, "Close frame not flushed in time, aborting writer");
            self.writer.abort();
        }
    }
}

async fn keepalive_tick(keepalive: &mut Option<(Interval, Duration)>) {
    match keepalive {
        Some((ticker, _)) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Owns the sink half. Ends after sending a close frame, on a write error,
/// or when the session drops its sender.
async fn write_loop(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut rx: mpsc::UnboundedReceiver<WsMessage>,
    session_id: Uuid,
) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, WsMessage::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!(session_id = %session_id, error = %e, "Relay write failed");
            return;
        }
        if closing {
            return;
        }
    }
    let _ = sink.close().await;
}
