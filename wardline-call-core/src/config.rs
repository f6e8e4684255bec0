//! Configuration for the call engine.

use crate::types::{CallId, MediaConstraints};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Errors produced while deriving endpoints from the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The portal base URL does not parse.
    #[error("portal base url {url:?} is invalid: {source}")]
    InvalidPortalUrl {
        /// The offending configured value.
        url: String,
        /// Parser diagnostic.
        #[source]
        source: url::ParseError,
    },
    /// The portal base URL uses a scheme other than http(s) or ws(s).
    #[error("portal base url scheme {0:?} is not supported")]
    UnsupportedScheme(String),
}

/// STUN servers used when the configuration does not override them.
#[must_use]
pub fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

/// Readiness tuning for the relay connection.
///
/// The connection is polled until it reports open; sessions give up after
/// `ready_timeout` and fail the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportTuning {
    /// Longest time to wait for the relay socket to open.
    pub ready_timeout: Duration,
    /// Interval between readiness checks.
    pub ready_poll_interval: Duration,
}

impl Default for TransportTuning {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_millis(5000),
            ready_poll_interval: Duration::from_millis(50),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallConfig {
    /// Base URL of the portal backend, e.g. `https://portal.example.org`.
    pub portal_base_url: String,
    /// ICE server URLs handed to the peer connection driver.
    pub ice_servers: Vec<String>,
    /// Which local devices to capture.
    pub constraints: MediaConstraints,
    /// Relay readiness tuning.
    pub transport: TransportTuning,
}

impl CallConfig {
    /// Creates a configuration for the given portal, everything else default.
    pub fn new(portal_base_url: impl Into<String>) -> Self {
        Self {
            portal_base_url: portal_base_url.into(),
            ..Self::default()
        }
    }

    fn endpoint(&self, suffix: &str) -> String {
        format!(
            "{}/api/video-call/{suffix}",
            self.portal_base_url.trim_end_matches('/')
        )
    }

    /// Registry endpoint that mints a new call.
    #[must_use]
    pub fn create_call_url(&self) -> String {
        self.endpoint("create")
    }

    /// Registry endpoint that validates joining `call_id`.
    #[must_use]
    pub fn join_call_url(&self, call_id: &CallId) -> String {
        self.endpoint(&format!("join/{call_id}"))
    }

    /// Registry endpoint that terminates `call_id` for everyone.
    #[must_use]
    pub fn end_call_url(&self, call_id: &CallId) -> String {
        self.endpoint(&format!("end/{call_id}"))
    }

    /// Relay WebSocket endpoint for `call_id`.
    ///
    /// The scheme is derived from the portal base: `http` dials `ws`,
    /// `https` dials `wss`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the base URL does not parse or carries
    /// a scheme with no WebSocket counterpart.
    pub fn relay_url(&self, call_id: &CallId) -> Result<Url, ConfigError> {
        let raw = self.endpoint(&format!("ws/{call_id}"));
        let mut url = Url::parse(&raw).map_err(|source| ConfigError::InvalidPortalUrl {
            url: self.portal_base_url.clone(),
            source,
        })?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };
        if url.set_scheme(scheme).is_err() {
            return Err(ConfigError::UnsupportedScheme(scheme.to_string()));
        }
        Ok(url)
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            portal_base_url: "http://127.0.0.1:8080".to_string(),
            ice_servers: default_ice_servers(),
            constraints: MediaConstraints::video_call(),
            transport: TransportTuning::default(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn call_id() -> CallId {
        CallId::parse("AB12CD").unwrap()
    }

    #[test]
    fn test_registry_endpoints_follow_the_portal_paths() {
        let config = CallConfig::new("https://portal.example.org");
        assert_eq!(
            config.create_call_url(),
            "https://portal.example.org/api/video-call/create"
        );
        assert_eq!(
            config.join_call_url(&call_id()),
            "https://portal.example.org/api/video-call/join/AB12CD"
        );
        assert_eq!(
            config.end_call_url(&call_id()),
            "https://portal.example.org/api/video-call/end/AB12CD"
        );
    }

    #[test]
    fn test_trailing_slash_does_not_double_up() {
        let config = CallConfig::new("https://portal.example.org/");
        assert_eq!(
            config.create_call_url(),
            "https://portal.example.org/api/video-call/create"
        );
    }

    #[test]
    fn test_relay_url_swaps_scheme_for_websockets() {
        let config = CallConfig::new("http://portal.example.org:8080");
        let url = config.relay_url(&call_id()).unwrap();
        assert_eq!(
            url.as_str(),
            "ws://portal.example.org:8080/api/video-call/ws/AB12CD"
        );

        let config = CallConfig::new("https://portal.example.org");
        let url = config.relay_url(&call_id()).unwrap();
        assert_eq!(url.scheme(), "wss");
    }

    #[test]
    fn test_relay_url_rejects_unusable_bases() {
        let config = CallConfig::new("not a url");
        assert!(matches!(
            config.relay_url(&call_id()),
            Err(ConfigError::InvalidPortalUrl { .. })
        ));

        let config = CallConfig::new("ftp://portal.example.org");
        assert!(matches!(
            config.relay_url(&call_id()),
            Err(ConfigError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_defaults_match_the_portal_tuning() {
        let config = CallConfig::default();
        assert_eq!(config.transport.ready_timeout, Duration::from_millis(5000));
        assert_eq!(
            config.transport.ready_poll_interval,
            Duration::from_millis(50)
        );
        assert_eq!(config.ice_servers.len(), 2);
        assert!(config.ice_servers[0].starts_with("stun:"));
        assert!(config.constraints.has_audio());
    }
}
