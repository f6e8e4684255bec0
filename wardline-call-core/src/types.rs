//! Core vocabulary for the consultation call engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a call code fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("call code must not be empty")]
pub struct InvalidCallId;

/// Opaque short code identifying one consultation call.
///
/// Codes are minted by the call registry and typed in by the joining
/// participant. They are normalized to uppercase on construction so two
/// renditions of the same code always compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Validates and normalizes a call code.
    ///
    /// Surrounding whitespace is trimmed and the remainder uppercased.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidCallId`] if the trimmed input is empty.
    pub fn parse(input: &str) -> Result<Self, InvalidCallId> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(InvalidCallId);
        }
        Ok(Self(trimmed.to_uppercase()))
    }

    /// Returns the normalized code.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CallId {
    type Err = InvalidCallId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Which side of the call this participant is on.
///
/// The role is fixed for the lifetime of a session: the creator sends the
/// single initial offer, the joiner answers and owns any renegotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Created the call and shares its code.
    Creator,
    /// Joined an existing call by code.
    Joiner,
}

impl Role {
    /// Returns `true` for [`Role::Creator`].
    #[must_use]
    pub fn is_creator(self) -> bool {
        matches!(self, Self::Creator)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creator => write!(f, "creator"),
            Self::Joiner => write!(f, "joiner"),
        }
    }
}

/// Lifecycle state of a call session.
///
/// States move strictly forward; `Ended` and `Failed` are terminal and a
/// session never leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Session object exists but nothing has started.
    Idle,
    /// Registry interaction is in flight.
    Establishing,
    /// Waiting for the signaling relay connection to open.
    AwaitingTransport,
    /// Relay is open and the offer/answer exchange is in progress.
    Negotiating,
    /// Peer connection reported connected media flow.
    Connected,
    /// Call finished normally (local leave or remote end).
    Ended,
    /// Call aborted by a registry, transport or fatal media error.
    Failed,
}

impl SessionState {
    /// Returns `true` once the session can no longer change state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// Checks whether a transition to `next` is legal from this state.
    ///
    /// Any non-terminal state may end (leave, remote `call_ended`) or fail
    /// (transport loss, fatal setup error); forward progress otherwise
    /// follows the establishment order.
    #[must_use]
    pub fn can_transition_to(self, next: SessionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Self::Idle, Self::Establishing)
                | (Self::Establishing, Self::AwaitingTransport)
                | (Self::AwaitingTransport, Self::Negotiating)
                | (Self::Negotiating, Self::Connected)
                | (_, Self::Ended)
                | (_, Self::Failed)
        )
    }
}

/// Identity of the local participant as supplied by the portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerProfile {
    /// Stable portal user id.
    pub user_id: String,
    /// Display name shown to the other participant.
    pub user_name: String,
}

impl CallerProfile {
    /// Creates a profile from the portal's user record.
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }
}

/// Which local capture devices a call should open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture the microphone.
    pub audio: bool,
    /// Capture the camera.
    pub video: bool,
}

impl MediaConstraints {
    /// Camera and microphone, the normal consultation setup.
    #[must_use]
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Microphone only.
    #[must_use]
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Returns `true` if audio capture is requested.
    #[must_use]
    pub fn has_audio(&self) -> bool {
        self.audio
    }

    /// Returns `true` if video capture is requested.
    #[must_use]
    pub fn has_video(&self) -> bool {
        self.video
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::video_call()
    }
}

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    /// Microphone / speaker path.
    Audio,
    /// Camera path.
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Notifications a session broadcasts to the embedding application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// The session moved to a new lifecycle state.
    StateChanged {
        /// State after the transition.
        state: SessionState,
    },
    /// Local capture was unavailable; the call continues without media.
    MediaUnavailable {
        /// Human-readable cause, suitable for a notice to the user.
        reason: String,
    },
    /// The remote participant's media track arrived.
    RemoteTrack {
        /// Driver-assigned track id.
        id: String,
        /// Audio or video.
        kind: TrackKind,
    },
    /// The other participant left; the call itself is still alive.
    ParticipantLeft,
    /// The remote side terminated the call for everyone.
    CallEnded,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_normalizes_case_and_whitespace() {
        let id = CallId::parse("  ab12cd  ").unwrap();
        assert_eq!(id.as_str(), "AB12CD");
        assert_eq!(id, CallId::parse("Ab12Cd").unwrap());
    }

    #[test]
    fn test_call_id_rejects_empty_input() {
        assert_eq!(CallId::parse(""), Err(InvalidCallId));
        assert_eq!(CallId::parse("   "), Err(InvalidCallId));
    }

    #[test]
    fn test_call_id_parses_from_str() {
        let id: CallId = "xy99".parse().unwrap();
        assert_eq!(id.to_string(), "XY99");
    }

    #[test]
    fn test_call_id_serializes_transparently() {
        let id = CallId::parse("AB12CD").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"AB12CD\"");
        let back: CallId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_role_identifies_creator() {
        assert!(Role::Creator.is_creator());
        assert!(!Role::Joiner.is_creator());
        assert_eq!(Role::Joiner.to_string(), "joiner");
    }

    #[test]
    fn test_establishment_order_is_legal() {
        use SessionState::*;
        assert!(Idle.can_transition_to(Establishing));
        assert!(Establishing.can_transition_to(AwaitingTransport));
        assert!(AwaitingTransport.can_transition_to(Negotiating));
        assert!(Negotiating.can_transition_to(Connected));
    }

    #[test]
    fn test_any_live_state_can_end_or_fail() {
        use SessionState::*;
        for state in [Idle, Establishing, AwaitingTransport, Negotiating, Connected] {
            assert!(state.can_transition_to(Ended), "{state:?} should end");
            assert!(state.can_transition_to(Failed), "{state:?} should fail");
        }
    }

    #[test]
    fn test_skipping_establishment_steps_is_illegal() {
        use SessionState::*;
        assert!(!Idle.can_transition_to(Negotiating));
        assert!(!Establishing.can_transition_to(Connected));
        assert!(!AwaitingTransport.can_transition_to(Connected));
    }

    #[test]
    fn test_terminal_states_are_stable() {
        use SessionState::*;
        for terminal in [Ended, Failed] {
            assert!(terminal.is_terminal());
            for next in [Idle, Establishing, Negotiating, Connected, Ended, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_default_constraints_open_both_devices() {
        let constraints = MediaConstraints::default();
        assert!(constraints.has_audio());
        assert!(constraints.has_video());
        assert!(!MediaConstraints::audio_only().has_video());
    }
}
