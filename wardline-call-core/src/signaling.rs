//! Wire protocol spoken over the signaling relay.
//!
//! The relay blindly forwards JSON text frames between the two call
//! participants, so the message shapes here must match what the portal's
//! web client produces, including its field casing. The channel and
//! connector traits at the bottom are the seams the session consumes the
//! relay through; production implementations live in [`crate::transport`].

use crate::transport::TransportError;
use crate::types::CallId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Whether a session description is an offer or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Descriptions created by the offering side.
    Offer,
    /// Descriptions created in response to an offer.
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer => write!(f, "offer"),
            Self::Answer => write!(f, "answer"),
        }
    }
}

/// A session description as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    /// Offer or answer.
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// Raw SDP text.
    pub sdp: String,
}

/// An ICE candidate in the browser's JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    /// The candidate line.
    pub candidate: String,
    /// Media description identifier the candidate belongs to.
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to.
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment, when the driver provides one.
    #[serde(rename = "usernameFragment", skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// One signaling frame, tagged by `type` exactly as the relay forwards it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    /// Session description offer from the initiating side.
    #[serde(rename = "offer")]
    Offer {
        /// Call the offer belongs to.
        call_id: CallId,
        /// The offer description.
        offer: SdpPayload,
    },
    /// Session description answer back to the offerer.
    #[serde(rename = "answer")]
    Answer {
        /// Call the answer belongs to.
        call_id: CallId,
        /// The answer description.
        answer: SdpPayload,
    },
    /// A transport candidate discovered by either side.
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        /// Call the candidate belongs to.
        call_id: CallId,
        /// The candidate payload.
        candidate: IceCandidatePayload,
    },
    /// Polite notice that the sender is leaving the call.
    #[serde(rename = "leave")]
    Leave {
        /// Call being left.
        call_id: CallId,
    },
    /// The call was terminated for all participants.
    #[serde(rename = "call_ended")]
    CallEnded {
        /// Call that ended.
        call_id: CallId,
    },
    /// The other participant disconnected from the relay.
    #[serde(rename = "participant_left")]
    ParticipantLeft {
        /// Call the participant left.
        call_id: CallId,
    },
}

impl SignalMessage {
    /// Returns the call id carried by any message variant.
    #[must_use]
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::Offer { call_id, .. }
            | Self::Answer { call_id, .. }
            | Self::IceCandidate { call_id, .. }
            | Self::Leave { call_id }
            | Self::CallEnded { call_id }
            | Self::ParticipantLeft { call_id } => call_id,
        }
    }

    /// Returns the wire tag of this message, for log fields.
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Leave { .. } => "leave",
            Self::CallEnded { .. } => "call_ended",
            Self::ParticipantLeft { .. } => "participant_left",
        }
    }
}

/// Something the relay connection produced for the session.
///
/// Events are delivered over a single queue in arrival order; the session
/// drains them one at a time, which is what keeps signaling handling
/// strictly ordered.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded signaling frame.
    Message(SignalMessage),
    /// The connection closed, locally or by the remote end.
    Closed,
    /// The connection failed with a read or protocol error.
    Failed(String),
}

/// Outbound half of an open relay connection.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Serializes `message` and sends it to the relay.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the connection is no longer writable.
    async fn send(&self, message: SignalMessage) -> Result<(), TransportError>;

    /// Returns `true` while the connection is open.
    fn is_open(&self) -> bool;

    /// Closes the connection. Calling this more than once is harmless.
    async fn close(&self);
}

/// An established relay connection, ready for a session to drive.
pub struct RelayLink {
    /// Outbound message half.
    pub channel: Arc<dyn SignalingChannel>,
    /// Ordered inbound event queue.
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens relay connections for call sessions.
///
/// The production implementation dials the portal relay endpoint and waits
/// for readiness; tests substitute in-memory links.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Connects to the relay for `call_id` and waits until it is ready.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] when the connection does not
    /// become ready within the configured window, or another
    /// [`TransportError`] when the dial itself fails.
    async fn connect(&self, call_id: &CallId) -> Result<RelayLink, TransportError>;
}
