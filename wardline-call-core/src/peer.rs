//! Peer connection capability behind a seam.
//!
//! The negotiation machine talks to [`PeerLink`], never to the webrtc
//! crate directly, so the offer/answer and candidate rules can be tested
//! without a live ICE stack. [`RtcPeerLink`] is the production driver;
//! it forwards everything the connection reports (candidates, state
//! changes, remote tracks, renegotiation requests) into the session's
//! event queue as [`PeerEvent`]s.

use crate::media::LocalTrack;
use crate::signaling::{IceCandidatePayload, SdpKind, SdpPayload};
use crate::types::TrackKind;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// Errors reported by the peer connection driver.
#[derive(Debug, Error)]
pub enum PeerError {
    /// The connection object could not be built.
    #[error("peer connection could not be created: {0}")]
    Create(String),
    /// A session description was rejected.
    #[error("session description rejected: {0}")]
    Sdp(String),
    /// A transport candidate was rejected.
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    /// A local track could not be attached.
    #[error("track could not be attached: {0}")]
    Track(String),
}

/// Connection state as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLinkState {
    /// Freshly created.
    New,
    /// Transport checks in progress.
    Connecting,
    /// Media is flowing.
    Connected,
    /// Connectivity was lost, possibly temporarily.
    Disconnected,
    /// Connectivity was lost for good.
    Failed,
    /// The connection was closed locally.
    Closed,
}

impl From<RTCPeerConnectionState> for PeerLinkState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
            _ => Self::New,
        }
    }
}

/// Something the peer connection reported.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A locally gathered candidate to relay to the other side.
    LocalCandidate(IceCandidatePayload),
    /// The connection state changed.
    ConnectionState(PeerLinkState),
    /// The remote participant's track arrived.
    RemoteTrack {
        /// Driver-assigned id.
        id: String,
        /// Audio or video.
        kind: TrackKind,
    },
    /// The connection wants a fresh offer/answer round.
    NegotiationNeeded,
}

/// One peer connection owned by a session.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Attaches a local track for sending.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Track`] when the track cannot feed this
    /// connection.
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), PeerError>;

    /// Creates an offer and installs it as the local description.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Sdp`] when the driver rejects the operation.
    async fn create_offer(&self) -> Result<SdpPayload, PeerError>;

    /// Creates an answer and installs it as the local description.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Sdp`] when the driver rejects the operation.
    async fn create_answer(&self) -> Result<SdpPayload, PeerError>;

    /// Installs the remote description.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Sdp`] when the description does not parse or
    /// does not fit the current signaling state.
    async fn set_remote_description(&self, description: SdpPayload) -> Result<(), PeerError>;

    /// Applies a remote transport candidate.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Candidate`] when the candidate is rejected.
    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), PeerError>;

    /// Closes the connection. Safe to call more than once.
    async fn close(&self);
}

/// Creates peer connections on demand.
///
/// Sessions create the capability lazily: the creator when negotiation
/// starts, the joiner when the first offer arrives.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Builds a connection that reports through `events`.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Create`] when construction fails.
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerLink>, PeerError>;
}

/// Production driver over the webrtc crate.
pub struct RtcPeerLink {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeerLink {
    /// Builds a connection with default codecs and interceptors against
    /// the given STUN/TURN servers.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Create`] when the media engine or the
    /// connection cannot be constructed.
    pub async fn new(
        ice_servers: &[String],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::Create(e.to_string()))?;

        let registry = Registry::new();
        let registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PeerError::Create(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| PeerError::Create(e.to_string()))?,
        );
        install_handlers(&pc, events);
        Ok(Self { pc })
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<PeerEvent>) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(PeerEvent::LocalCandidate(IceCandidatePayload {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "could not serialize local candidate");
                }
            }
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        tracing::debug!(state = ?state, "peer connection state changed");
        let _ = tx.send(PeerEvent::ConnectionState(PeerLinkState::from(state)));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        };
        match kind {
            Some(kind) => {
                let _ = tx.send(PeerEvent::RemoteTrack {
                    id: track.id(),
                    kind,
                });
            }
            None => {
                tracing::warn!("remote track with unspecified codec type ignored");
            }
        }
        Box::pin(async {})
    }));

    let tx = events;
    pc.on_negotiation_needed(Box::new(move || {
        let _ = tx.send(PeerEvent::NegotiationNeeded);
        Box::pin(async {})
    }));
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), PeerError> {
        let Some(rtc) = track.rtc_track() else {
            return Err(PeerError::Track(format!(
                "track {} has no driver handle",
                track.id()
            )));
        };
        self.pc
            .add_track(rtc)
            .await
            .map_err(|e| PeerError::Track(e.to_string()))?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SdpPayload, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::Sdp(e.to_string()))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| PeerError::Sdp(e.to_string()))?;
        Ok(SdpPayload {
            kind: SdpKind::Offer,
            sdp: offer.sdp,
        })
    }

    async fn create_answer(&self) -> Result<SdpPayload, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::Sdp(e.to_string()))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| PeerError::Sdp(e.to_string()))?;
        Ok(SdpPayload {
            kind: SdpKind::Answer,
            sdp: answer.sdp,
        })
    }

    async fn set_remote_description(&self, description: SdpPayload) -> Result<(), PeerError> {
        let parsed = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| PeerError::Sdp(e.to_string()))?;
        self.pc
            .set_remote_description(parsed)
            .await
            .map_err(|e| PeerError::Sdp(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| PeerError::Candidate(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!(error = %e, "peer connection close failed");
        }
    }
}

/// Production [`PeerFactory`] building [`RtcPeerLink`]s.
#[derive(Debug, Clone)]
pub struct RtcPeerFactory {
    ice_servers: Vec<String>,
}

impl RtcPeerFactory {
    /// Creates a factory using the given ICE server URLs.
    #[must_use]
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerLink>, PeerError> {
        let link = RtcPeerLink::new(&self.ice_servers, events).await?;
        Ok(Box::new(link))
    }
}
