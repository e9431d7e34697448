//! # Session Controller
//!
//! Public entry point of the engine: `connect`, `disconnect`, `set_mute` and a
//! single ordered event stream.
//!
//! ## Session Lifecycle:
//! 1. **connect**: the previous session is torn down completely, then the output
//!    graph and the microphone are acquired and the relay connection is opened
//! 2. **session task**: one tokio task per session multiplexes relay events,
//!    capture frames, the amplitude tick and cancellation with `tokio::select!`
//! 3. **capture starts** only once the relay connection is open
//! 4. **teardown**: whichever way the task ends (user disconnect, completion,
//!    remote close, lost connection, lost microphone, replacement) it closes the
//!    connection, flushes playback and releases both devices before reporting
//!    an [`EndReason`] in its summary
//!
//! ## Thread Safety:
//! `SessionController` is `Send + Sync`; its methods take `&self` and may be
//! called from any task. Session setup and teardown are serialized by an
//! async mutex, so two sessions never own devices at the same time.

use crate::audio::{
    AudioBackend, AudioCaptureEncoder, CaptureConstraints, MicrophoneStream, MuteSwitch,
    PlaybackScheduler,
};
use crate::config::EngineConfig;
use crate::error::{SessionError, SessionResult};
use crate::events::{EndReason, LifecycleEvent, SessionEvent, SessionSummary, Speaker};
use crate::state::{ConnectionState, SessionSnapshot, SessionTicket, SharedSession};
use crate::tools::{Completion, DispatchOutcome, ToolCallDispatcher};
use crate::transcript::TranscriptSequencer;
use crate::transport::{Inbound, Outbound, TransportEvent, TransportSession, UpstreamMessage};
use chrono::{DateTime, Utc};
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, Sleep};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Real-time voice session engine.
///
/// ## Usage Example:
/// ```rust,no_run
/// use std::sync::Arc;
/// use futures_util::StreamExt;
/// use onboard_voice::{EngineConfig, SessionController, SessionEvent, VirtualBackend, VirtualClock};
///
/// # async fn run() -> onboard_voice::SessionResult<()> {
/// let backend = Arc::new(VirtualBackend::new(VirtualClock::wall()));
/// let controller = SessionController::new(EngineConfig::default(), backend);
/// let mut events = controller.events().expect("first call");
///
/// controller.connect("You are a friendly onboarding agent.").await?;
/// while let Some(event) = events.next().await {
///     if let SessionEvent::Ended(summary) = event {
///         println!("finished at stage {}", summary.final_stage);
///         break;
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct SessionController {
    config: Arc<EngineConfig>,
    backend: Arc<dyn AudioBackend>,
    shared: SharedSession,
    mute: MuteSwitch,
    events: mpsc::UnboundedSender<SessionEvent>,
    receiver: StdMutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    lifecycle: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    pub fn new(config: EngineConfig, backend: Arc<dyn AudioBackend>) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        Self {
            config: Arc::new(config),
            backend,
            shared: SharedSession::new(),
            mute: MuteSwitch::default(),
            events,
            receiver: StdMutex::new(Some(receiver)),
            lifecycle: Mutex::new(None),
        }
    }

    /// The event stream. Available once; later calls return `None`.
    pub fn events(&self) -> Option<UnboundedReceiverStream<SessionEvent>> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(UnboundedReceiverStream::new)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot(self.mute.is_muted())
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Gate outbound audio. The microphone, connection and output graph stay
    /// untouched, and the setting carries over to later sessions.
    pub fn set_mute(&self, muted: bool) {
        self.mute.set(muted);
        self.shared.set_muted(muted);
        debug!(muted, "Mute toggled");
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Start a new session driven by `system_instruction`.
    ///
    /// A no-op while a setup or first handshake is already in flight. Otherwise
    /// any previous session, including one waiting out a reconnect delay, is
    /// torn down first. An invalid configuration and device failures are
    /// fatal: they are emitted as `SessionEvent::Error` and returned.
    ///
    /// ## State Transition:
    /// `Disconnected | Connecting (reconnecting) | Connected | Disconnecting → Connecting`
    pub async fn connect(&self, system_instruction: &str) -> SessionResult<()> {
        if let Err(e) = self.config.validate() {
            error!(error = %e, "Refusing to connect with an invalid configuration");
            self.emit(SessionEvent::Error(e.clone()));
            return Err(e);
        }

        let Some(ticket) = self.shared.begin(self.mute.is_muted()) else {
            debug!("connect ignored, a connect is already in flight");
            return Ok(());
        };

        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(previous) = lifecycle.take() {
            debug!(session_id = %ticket.id, "Waiting for previous session to release its resources");
            let _ = previous.await;
        }
        if ticket.cancel.is_cancelled() {
            return Ok(());
        }

        info!(session_id = %ticket.id, "Connecting voice session");
        self.emit(SessionEvent::Lifecycle(LifecycleEvent::Connecting {
            session_id: ticket.id,
        }));

        let playback = {
            let graph = tokio::select! {
                _ = ticket.cancel.cancelled() => return Ok(()),
                graph = self.backend.open_output(self.config.playback.output_sample_rate) => graph,
            };
            match graph {
                Ok(graph) => PlaybackScheduler::new(
                    graph,
                    self.config.playback.output_sample_rate,
                    self.config.playback.amplitude_interval(),
                ),
                Err(e) => return Err(self.fail_setup(ticket.id, e)),
            }
        };

        let constraints = CaptureConstraints::from(&self.config.audio);
        let microphone = tokio::select! {
            _ = ticket.cancel.cancelled() => return Ok(()),
            mic = self.backend.open_microphone(&constraints) => mic,
        };
        let microphone = match microphone {
            Ok(mic) => mic,
            Err(e) => return Err(self.fail_setup(ticket.id, e)),
        };

        let mut transport = TransportSession::new(ticket.id, &self.config.transport);
        transport.open(system_instruction);

        let task = SessionTask::new(
            &ticket,
            Arc::clone(&self.config),
            self.shared.clone(),
            self.events.clone(),
            transport,
            AudioCaptureEncoder::new(self.mute.clone()),
            microphone,
            playback,
        );
        let span = tracing::info_span!("session", session_id = %ticket.id);
        *lifecycle = Some(tokio::spawn(task.run().instrument(span)));
        Ok(())
    }

    fn fail_setup(&self, id: Uuid, err: SessionError) -> SessionError {
        error!(session_id = %id, error = %err, "Voice session setup failed");
        self.emit(SessionEvent::Error(err.clone()));
        if self.shared.transition(
            id,
            &[ConnectionState::Connecting],
            ConnectionState::Disconnected,
        ) {
            self.emit(SessionEvent::Lifecycle(LifecycleEvent::Disconnected {
                session_id: id,
            }));
        }
        err
    }

    /// End the live session and wait until its resources are released.
    ///
    /// Safe from any state: a no-op when already disconnecting or disconnected,
    /// and it cancels a pending handshake or reconnect delay.
    ///
    /// ## State Transition:
    /// `Connecting | Connected → Disconnecting → Disconnected`
    pub async fn disconnect(&self) {
        let Some((id, cancel)) = self.shared.begin_disconnect() else {
            debug!("disconnect ignored, nothing to disconnect");
            return;
        };
        info!(session_id = %id, "Disconnecting voice session");
        cancel.cancel();

        {
            let mut lifecycle = self.lifecycle.lock().await;
            if let Some(task) = lifecycle.take() {
                if let Err(e) = task.await {
                    warn!(session_id = %id, error = %e, "Session task did not finish cleanly");
                }
            }
        }

        if self.shared.transition(
            id,
            &[ConnectionState::Disconnecting],
            ConnectionState::Disconnected,
        ) {
            self.emit(SessionEvent::Lifecycle(LifecycleEvent::Disconnected {
                session_id: id,
            }));
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shared.cancel_current();
    }
}

/// Everything one live session owns.
struct SessionTask {
    id: Uuid,
    started_at: DateTime<Utc>,
    config: Arc<EngineConfig>,
    shared: SharedSession,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
    transport: TransportSession,
    capture: AudioCaptureEncoder,
    microphone: Option<MicrophoneStream>,
    playback: PlaybackScheduler,
    dispatcher: ToolCallDispatcher,
    transcripts: TranscriptSequencer,
    completion: Option<Completion>,
    grace: Option<Pin<Box<Sleep>>>,
}

impl SessionTask {
    #[allow(clippy::too_many_arguments)]
    fn new(
        ticket: &SessionTicket,
        config: Arc<EngineConfig>,
        shared: SharedSession,
        events: mpsc::UnboundedSender<SessionEvent>,
        transport: TransportSession,
        capture: AudioCaptureEncoder,
        microphone: MicrophoneStream,
        playback: PlaybackScheduler,
    ) -> Self {
        Self {
            id: ticket.id,
            started_at: ticket.started_at,
            config,
            shared,
            events,
            cancel: ticket.cancel.clone(),
            transport,
            capture,
            microphone: Some(microphone),
            playback,
            dispatcher: ToolCallDispatcher::new(),
            transcripts: TranscriptSequencer::default(),
            completion: None,
            grace: None,
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.playback.amplitude_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let reason = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    break if self.shared.is_current(self.id) {
                        EndReason::UserDisconnect
                    } else {
                        EndReason::Replaced
                    };
                }

                event = self.transport.next_event() => {
                    if let Some(reason) = self.on_transport(event) {
                        break reason;
                    }
                }

                frame = self.capture.next_frame() => match frame {
                    Ok(frame) => {
                        self.transport.send(Outbound::Audio { payload: frame.payload });
                    }
                    Err(e) => {
                        error!(error = %e, "Microphone lost");
                        self.emit(SessionEvent::Error(e));
                        break EndReason::DeviceLost;
                    }
                },

                _ = ticker.tick(), if self.playback.needs_tick() || self.completion.is_some() => {
                    if let Some(level) = self.playback.tick() {
                        self.emit(SessionEvent::Amplitude(level));
                    }
                    if self.completion.is_some() && self.playback.is_idle() {
                        debug!("Closing remarks finished");
                        break EndReason::Completed;
                    }
                }

                _ = grace_elapsed(&mut self.grace) => {
                    debug!("Completion grace period elapsed");
                    break EndReason::Completed;
                }
            }
        };

        self.teardown(reason).await;
    }

    fn on_transport(&mut self, event: TransportEvent) -> Option<EndReason> {
        match event {
            TransportEvent::Opened { reconnected } => {
                self.shared.transition(
                    self.id,
                    &[ConnectionState::Connecting],
                    ConnectionState::Connected,
                );
                self.shared.update(self.id, |s| s.reconnect_attempts = 0);
                if let Some(mic) = self.microphone.take() {
                    self.capture.start(mic);
                }
                self.emit(SessionEvent::Lifecycle(LifecycleEvent::Connected {
                    session_id: self.id,
                }));
                info!(reconnected, "Voice session live");
                None
            }
            TransportEvent::Message(inbound) => {
                self.on_inbound(inbound);
                None
            }
            TransportEvent::Reconnecting { attempt, delay, .. } => {
                if self.completion.is_some() {
                    return Some(EndReason::Completed);
                }
                // One write, so `connect` never sees `Connecting` without the attempt count.
                self.shared.update(self.id, |s| {
                    s.reconnect_attempts = attempt;
                    if s.state == ConnectionState::Connected {
                        s.state = ConnectionState::Connecting;
                    }
                });
                self.emit(SessionEvent::Lifecycle(LifecycleEvent::Reconnecting {
                    attempt,
                    delay,
                }));
                None
            }
            TransportEvent::Lost(err) => {
                error!(error = %err, "Relay connection lost");
                self.emit(SessionEvent::Error(err));
                Some(EndReason::ConnectionLost)
            }
            TransportEvent::Closed { .. } => Some(if self.completion.is_some() {
                EndReason::Completed
            } else {
                EndReason::RemoteClosed
            }),
        }
    }

    fn on_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::RelayOpen => {
                self.emit(SessionEvent::Lifecycle(LifecycleEvent::UpstreamOpened));
            }
            Inbound::RelayClosed { reason } => {
                info!(reason = ?reason, "Relay reports upstream closed");
                self.emit(SessionEvent::Lifecycle(LifecycleEvent::UpstreamClosed {
                    reason,
                }));
            }
            Inbound::RelayError { message } => {
                warn!(relay_error = %message, "Relay reported an error");
            }
            Inbound::Upstream(message) => self.on_upstream(message),
        }
    }

    /// Interruption first, then audio, transcripts, and tool calls in arrival order.
    fn on_upstream(&mut self, message: UpstreamMessage) {
        if message.interrupted {
            let discarded = self.playback.flush();
            info!(discarded, "Agent interrupted, playback flushed");
            self.emit(SessionEvent::Amplitude(0.0));
        } else {
            for payload in &message.audio {
                if let Err(e) = self.playback.enqueue(payload) {
                    warn!(error = %e, "Skipping undecodable audio payload");
                }
            }
        }

        if let Some(text) = message.input_transcript {
            let event = self.transcripts.next(Speaker::User, text);
            self.emit(SessionEvent::Transcript(event));
        }
        if let Some(text) = message.output_transcript {
            let event = self.transcripts.next(Speaker::Agent, text);
            self.emit(SessionEvent::Transcript(event));
        }
        if message.setup_complete {
            info!("Upstream model setup complete");
            self.emit(SessionEvent::Lifecycle(LifecycleEvent::UpstreamReady));
        }
        if message.turn_complete {
            debug!("Agent turn complete");
        }

        for call in &message.tool_calls {
            let dispatch = self.dispatcher.handle(call);
            if !self.transport.send(Outbound::ToolResponse(dispatch.ack)) {
                warn!(call_id = %call.id, "Tool acknowledgement dropped, relay not connected");
            }

            let stage = self.dispatcher.state();
            self.shared.update(self.id, |s| s.stage = stage);

            match dispatch.outcome {
                DispatchOutcome::StageChanged(stage) => {
                    self.emit(SessionEvent::StageChanged { stage });
                }
                DispatchOutcome::Completed(completion) => self.complete(completion),
                DispatchOutcome::Ignored(_) => {}
            }
        }
    }

    /// Stop listening right away but let the agent finish its closing sentence.
    fn complete(&mut self, completion: Completion) {
        self.emit(SessionEvent::Completed(completion.clone()));
        self.capture.stop();
        self.microphone = None;
        self.completion = Some(completion);
        self.grace = Some(Box::pin(tokio::time::sleep(
            self.config.session.completion_grace(),
        )));
    }

    async fn teardown(mut self, reason: EndReason) {
        self.capture.stop();
        self.microphone = None;
        if self.playback.needs_tick() {
            self.emit(SessionEvent::Amplitude(0.0));
        }
        self.playback.flush();
        self.transport.close().await;
        self.playback.close();

        let ended_at = Utc::now();
        let stats = self.transport.stats();
        let summary = SessionSummary {
            session_id: self.id,
            started_at: self.started_at,
            ended_at,
            duration_ms: (ended_at - self.started_at).num_milliseconds().max(0) as u64,
            end_reason: reason,
            final_stage: self.dispatcher.stage_reached(),
            completion: self.completion.clone(),
            frames_captured: self.capture.frames_emitted(),
            messages_sent: stats.frames_sent,
            messages_dropped: stats.frames_dropped,
            units_played: self.playback.units_played(),
            units_discarded: self.playback.units_discarded(),
            tool_calls: self.dispatcher.handled(),
            reconnects: stats.reconnects,
        };
        info!(
            end_reason = ?reason,
            duration_ms = summary.duration_ms,
            tool_calls = summary.tool_calls,
            reconnects = summary.reconnects,
            "Voice session ended"
        );
        self.emit(SessionEvent::Ended(summary));

        let finished = match reason {
            // disconnect() owns the final transition
            EndReason::UserDisconnect => false,
            EndReason::Replaced => true,
            _ => self.shared.transition(
                self.id,
                &[ConnectionState::Connecting, ConnectionState::Connected],
                ConnectionState::Disconnected,
            ),
        };
        if finished {
            self.emit(SessionEvent::Lifecycle(LifecycleEvent::Disconnected {
                session_id: self.id,
            }));
        }
    }
}

async fn grace_elapsed(grace: &mut Option<Pin<Box<Sleep>>>) {
    match grace {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
