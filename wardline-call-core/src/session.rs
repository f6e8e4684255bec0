//! Per-call session actor.
//!
//! One task owns everything a call needs: the lifecycle state, the relay
//! channel, the negotiation machine and the local tracks. Transport
//! events, peer events and UI commands funnel into that task over
//! channels and are handled one at a time, so every signaling message is
//! processed to completion in arrival order and cleanup cannot race
//! anything.

use crate::media::{MediaDevices, TrackController};
use crate::negotiation::Negotiator;
use crate::peer::{PeerEvent, PeerFactory, PeerLinkState};
use crate::signaling::{RelayConnector, SignalMessage, SignalingChannel, TransportEvent};
use crate::types::{CallId, MediaConstraints, Role, SessionEvent, SessionState};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};

const EVENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionCommand {
    SetAudioEnabled(bool),
    SetVideoEnabled(bool),
    Leave,
}

/// Everything needed to spawn a session.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Call being joined or created.
    pub call_id: CallId,
    /// Which side of the call this participant is on.
    pub role: Role,
    /// Devices to capture for the call.
    pub constraints: MediaConstraints,
}

/// Public face of a running session.
///
/// The handle outlives the session task safely: once the session reaches
/// a terminal state every method degrades to a no-op.
pub struct SessionHandle {
    call_id: CallId,
    role: Role,
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    first_events: Mutex<Option<broadcast::Receiver<SessionEvent>>>,
}

impl SessionHandle {
    /// The session's call code.
    #[must_use]
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Which side of the call this session is.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch channel following the lifecycle state.
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Subscribes to session notifications.
    ///
    /// The first subscriber receives every event from the moment the
    /// session was spawned; later subscribers see events from their
    /// subscription point onwards.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        if let Ok(mut slot) = self.first_events.lock() {
            if let Some(receiver) = slot.take() {
                return receiver;
            }
        }
        self.events.subscribe()
    }

    /// Mutes or unmutes the microphone. A no-op without media or after
    /// the call ended.
    pub fn set_audio_enabled(&self, enabled: bool) {
        let _ = self.commands.send(SessionCommand::SetAudioEnabled(enabled));
    }

    /// Mutes or unmutes the camera. A no-op without media or after the
    /// call ended.
    pub fn set_video_enabled(&self, enabled: bool) {
        let _ = self.commands.send(SessionCommand::SetVideoEnabled(enabled));
    }

    /// Leaves the call and waits for the session to finish cleanup.
    ///
    /// Idempotent: leaving an already terminal session returns at once.
    pub async fn leave(&self) {
        let _ = self.commands.send(SessionCommand::Leave);
        let _ = self.wait_until_terminal().await;
    }

    /// Waits for the session to reach `Ended` or `Failed` and returns
    /// that state.
    pub async fn wait_until_terminal(&self) -> SessionState {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow();
            if current.is_terminal() {
                return current;
            }
            if state.changed().await.is_err() {
                return *state.borrow();
            }
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("call_id", &self.call_id)
            .field("role", &self.role)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

/// The session actor. Constructed through [`CallSession::spawn`]; all
/// interaction goes through the returned [`SessionHandle`].
pub struct CallSession {
    call_id: CallId,
    role: Role,
    state: SessionState,
    channel: Option<Arc<dyn SignalingChannel>>,
    tracks: TrackController,
    negotiator: Negotiator,
    state_tx: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    cleaned: bool,
}

impl CallSession {
    /// Spawns the session task and returns its handle.
    ///
    /// The task walks establishment on its own: media acquisition (a
    /// denied device degrades to a no-media call), relay connection with
    /// readiness wait, then negotiation. The creator sends the single
    /// initial offer as soon as the relay is ready.
    pub fn spawn(
        context: SessionContext,
        connector: Arc<dyn RelayConnector>,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerFactory>,
    ) -> SessionHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (event_tx, first_events) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let handle = SessionHandle {
            call_id: context.call_id.clone(),
            role: context.role,
            commands: command_tx,
            state: state_rx,
            events: event_tx.clone(),
            first_events: Mutex::new(Some(first_events)),
        };
        tokio::spawn(run(context, connector, devices, peers, command_rx, state_tx, event_tx));
        handle
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                call_id = %self.call_id,
                old_state = ?self.state,
                new_state = ?next,
                "illegal state transition ignored"
            );
            return;
        }
        tracing::debug!(
            call_id = %self.call_id,
            old_state = ?self.state,
            new_state = ?next,
            "session state changed"
        );
        self.state = next;
        let _ = self.state_tx.send(next);
        let _ = self.events.send(SessionEvent::StateChanged { state: next });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn send_signal(&self, message: SignalMessage) {
        let Some(channel) = &self.channel else {
            return;
        };
        let message_type = message.message_type();
        if let Err(e) = channel.send(message).await {
            tracing::warn!(call_id = %self.call_id, message_type, error = %e, "relay send failed");
        }
    }

    /// Tears the session down, tolerating partially initialized state:
    /// release tracks, close the peer capability, best-effort leave
    /// notice, close the relay channel. Runs at most once.
    async fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        tracing::debug!(call_id = %self.call_id, "session cleanup");
        self.tracks.release();
        self.negotiator.close().await;
        if let Some(channel) = self.channel.take() {
            if channel.is_open() {
                let leave = SignalMessage::Leave {
                    call_id: self.call_id.clone(),
                };
                if let Err(e) = channel.send(leave).await {
                    tracing::debug!(call_id = %self.call_id, error = %e, "leave notice not delivered");
                }
            }
            channel.close().await;
        }
    }

    async fn finish(&mut self, terminal: SessionState) {
        self.cleanup().await;
        self.set_state(terminal);
    }

    async fn handle_signal(&mut self, message: SignalMessage) -> bool {
        if message.call_id() != &self.call_id {
            tracing::warn!(
                call_id = %self.call_id,
                frame_call_id = %message.call_id(),
                "frame for another call ignored"
            );
            return false;
        }
        tracing::debug!(
            call_id = %self.call_id,
            message_type = message.message_type(),
            "relay message"
        );
        match message {
            SignalMessage::Offer { offer, .. } => {
                match self.negotiator.handle_offer(offer, &mut self.tracks).await {
                    Ok(Some(reply)) => self.send_signal(reply).await,
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(call_id = %self.call_id, error = %e, "offer handling failed");
                    }
                }
                false
            }
            SignalMessage::Answer { answer, .. } => {
                if let Err(e) = self.negotiator.handle_answer(answer).await {
                    tracing::warn!(call_id = %self.call_id, error = %e, "answer handling failed");
                }
                false
            }
            SignalMessage::IceCandidate { candidate, .. } => {
                if let Err(e) = self.negotiator.handle_candidate(candidate).await {
                    tracing::warn!(call_id = %self.call_id, error = %e, "candidate rejected");
                }
                false
            }
            SignalMessage::CallEnded { .. } => {
                tracing::info!(call_id = %self.call_id, "call ended by the other side");
                self.emit(SessionEvent::CallEnded);
                self.finish(SessionState::Ended).await;
                true
            }
            SignalMessage::ParticipantLeft { .. } => {
                tracing::info!(call_id = %self.call_id, "participant left");
                self.emit(SessionEvent::ParticipantLeft);
                false
            }
            SignalMessage::Leave { .. } => {
                tracing::debug!(call_id = %self.call_id, "peer leave notice");
                false
            }
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.send_signal(SignalMessage::IceCandidate {
                    call_id: self.call_id.clone(),
                    candidate,
                })
                .await;
            }
            PeerEvent::ConnectionState(state) => match state {
                PeerLinkState::Connected => self.set_state(SessionState::Connected),
                PeerLinkState::Disconnected | PeerLinkState::Failed => {
                    tracing::warn!(
                        call_id = %self.call_id,
                        peer_state = ?state,
                        "peer connectivity degraded"
                    );
                }
                _ => {}
            },
            PeerEvent::RemoteTrack { id, kind } => {
                tracing::info!(call_id = %self.call_id, track_id = %id, kind = %kind, "remote track arrived");
                self.emit(SessionEvent::RemoteTrack { id, kind });
            }
            PeerEvent::NegotiationNeeded => {
                match self
                    .negotiator
                    .handle_negotiation_needed(&mut self.tracks)
                    .await
                {
                    Ok(Some(message)) => self.send_signal(message).await,
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(call_id = %self.call_id, error = %e, "renegotiation failed");
                    }
                }
            }
        }
    }
}

async fn run(
    context: SessionContext,
    connector: Arc<dyn RelayConnector>,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerFactory>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    state_tx: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
) {
    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
    let mut session = CallSession {
        call_id: context.call_id.clone(),
        role: context.role,
        state: SessionState::Idle,
        channel: None,
        tracks: TrackController::new(devices, context.constraints),
        negotiator: Negotiator::new(context.call_id, context.role, peers, peer_tx),
        state_tx,
        events,
        cleaned: false,
    };
    tracing::debug!(call_id = %session.call_id, role = %session.role, "session task started");

    session.set_state(SessionState::Establishing);

    match session.tracks.acquire().await {
        Ok(count) => {
            tracing::debug!(call_id = %session.call_id, tracks = count, "media ready");
        }
        Err(e) if e.is_recoverable() => {
            tracing::warn!(call_id = %session.call_id, error = %e, "continuing without local media");
            session.emit(SessionEvent::MediaUnavailable {
                reason: e.to_string(),
            });
        }
        Err(e) => {
            tracing::error!(call_id = %session.call_id, error = %e, "media capture failed, aborting call");
            session.finish(SessionState::Failed).await;
            return;
        }
    }

    session.set_state(SessionState::AwaitingTransport);
    let mut inbound = match connector.connect(&session.call_id).await {
        Ok(link) => {
            session.channel = Some(link.channel);
            link.inbound
        }
        Err(e) => {
            tracing::error!(call_id = %session.call_id, error = %e, "relay connection failed");
            session.finish(SessionState::Failed).await;
            return;
        }
    };

    session.set_state(SessionState::Negotiating);
    match session.negotiator.start_offer(&mut session.tracks).await {
        Ok(Some(message)) => session.send_signal(message).await,
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(call_id = %session.call_id, error = %e, "initial offer failed");
        }
    }

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SessionCommand::SetAudioEnabled(enabled)) => {
                    let changed = session.tracks.set_audio_enabled(enabled);
                    tracing::debug!(call_id = %session.call_id, enabled, changed, "audio toggled");
                }
                Some(SessionCommand::SetVideoEnabled(enabled)) => {
                    let changed = session.tracks.set_video_enabled(enabled);
                    tracing::debug!(call_id = %session.call_id, enabled, changed, "video toggled");
                }
                Some(SessionCommand::Leave) | None => {
                    tracing::info!(call_id = %session.call_id, "leaving call");
                    session.finish(SessionState::Ended).await;
                    return;
                }
            },
            event = inbound.recv() => match event {
                Some(TransportEvent::Message(message)) => {
                    if session.handle_signal(message).await {
                        return;
                    }
                }
                Some(TransportEvent::Closed) | None => {
                    tracing::info!(call_id = %session.call_id, "relay connection closed");
                    session.finish(SessionState::Ended).await;
                    return;
                }
                Some(TransportEvent::Failed(reason)) => {
                    tracing::error!(call_id = %session.call_id, reason, "relay connection failed");
                    session.finish(SessionState::Failed).await;
                    return;
                }
            },
            Some(event) = peer_rx.recv() => {
                session.handle_peer_event(event).await;
            }
        }
    }
}
