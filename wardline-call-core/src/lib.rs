//! Wardline Call - video consultations for the patient portal
//!
//! This library implements the client side of the Wardline portal's video
//! consultation feature: it registers calls with the portal backend,
//! exchanges session descriptions and ICE candidates over the portal's
//! WebSocket relay, and drives the peer connection from first dial to
//! teardown. It features:
//!
//! - **Registry client**: create, join and end calls over the portal HTTP API
//! - **Relay signaling**: ordered offer/answer/candidate delivery per call
//! - **Call sessions**: one state machine per call, from `Idle` to `Ended`
//! - **Graceful degradation**: calls proceed without capture when devices are denied
//! - **Injectable backends**: transport, media and peer stacks swap out for tests
//!
//! # Examples
//!
//! ```rust,no_run
//! use wardline_call_core::{CallConfig, CallManager, CallerProfile, SessionEvent};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = CallManager::new(CallConfig::new("https://portal.example.org"))?;
//! let caller = CallerProfile::new("patient-7", "Alex Doe");
//!
//! // Create a call and share the code with the other party.
//! let session = manager.create_call(&caller).await?;
//! println!("call code: {}", session.call_id());
//!
//! // React to session events until the call reaches a terminal state.
//! let mut events = session.subscribe();
//! while let Ok(event) = events.recv().await {
//!     if let SessionEvent::StateChanged { state } = event {
//!         if state.is_terminal() {
//!             break;
//!         }
//!     }
//! }
//!
//! manager.leave_call().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and session events
pub mod types;

/// Client configuration and portal endpoints
pub mod config;

/// Portal registry HTTP client
pub mod registry;

/// Signaling wire protocol and transport seams
pub mod signaling;

/// WebSocket relay transport
pub mod transport;

/// Local capture tracks and mute control
pub mod media;

/// Peer connection driver
pub mod peer;

/// Offer/answer and candidate sequencing
pub mod negotiation;

/// Per-call session task
pub mod session;

/// Call lifecycle management
pub mod call;

// Re-export main types at crate root
pub use call::{CallError, CallManager};
pub use config::{CallConfig, ConfigError, TransportTuning};
pub use media::{LocalTrack, MediaDevices, MediaError, TrackController};
pub use negotiation::{NegotiationError, Negotiator};
pub use peer::{PeerError, PeerEvent, PeerFactory, PeerLink, PeerLinkState};
pub use registry::{RegistryClient, RegistryError};
pub use session::{CallSession, SessionContext, SessionHandle};
pub use signaling::{
    IceCandidatePayload, RelayConnector, RelayLink, SdpKind, SdpPayload, SignalMessage,
    SignalingChannel, TransportEvent,
};
pub use transport::{LinkStatus, RelayDialer, RelayTransport, TransportError};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallError, CallManager};
    pub use crate::config::CallConfig;
    pub use crate::session::SessionHandle;
    pub use crate::types::{
        CallId, CallerProfile, MediaConstraints, Role, SessionEvent, SessionState,
    };
}
