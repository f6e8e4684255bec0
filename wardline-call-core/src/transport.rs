//! WebSocket transport to the signaling relay.
//!
//! [`RelayTransport::connect`] spawns the connection task and returns
//! immediately; callers poll [`RelayTransport::wait_until_ready`] before
//! signaling, mirroring how the portal's web client opens its socket and
//! then waits for the ready state. One task owns the socket: it drains an
//! outbound queue into the sink and forwards decoded inbound frames, in
//! arrival order, to the session's event queue.

use crate::config::{CallConfig, ConfigError, TransportTuning};
use crate::signaling::{
    RelayConnector, RelayLink, SignalMessage, SignalingChannel, TransportEvent,
};
use crate::types::CallId;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// Errors produced by the relay transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection did not open within the readiness window.
    #[error("relay connection timed out before opening")]
    Timeout,
    /// The dial or handshake failed outright.
    #[error("relay connection failed: {0}")]
    Connect(String),
    /// The connection is gone.
    #[error("relay connection is closed")]
    Closed,
    /// A frame could not be serialized for sending.
    #[error("relay send failed: {0}")]
    Send(String),
    /// The relay endpoint could not be derived from the configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Connection status reported by the transport task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    /// Dial and handshake still in flight.
    Connecting,
    /// Socket open and usable.
    Open,
    /// Socket closed cleanly.
    Closed,
    /// Socket failed with the given reason.
    Failed(String),
}

/// Handle to one relay connection.
///
/// Cheap to share behind an [`Arc`]; dropping every handle tears the
/// connection task down.
#[derive(Debug)]
pub struct RelayTransport {
    status: watch::Receiver<LinkStatus>,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: watch::Sender<bool>,
}

impl RelayTransport {
    /// Starts connecting to `url`.
    ///
    /// Returns the transport handle plus the inbound event queue. The dial
    /// runs in the background; use [`Self::wait_until_ready`] to find out
    /// whether it succeeded.
    #[must_use]
    pub fn connect(url: Url) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (status_tx, status_rx) = watch::channel(LinkStatus::Connecting);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_connection(
            url,
            status_tx,
            outbound_rx,
            inbound_tx,
            shutdown_rx,
        ));
        (
            Self {
                status: status_rx,
                outbound: outbound_tx,
                shutdown: shutdown_tx,
            },
            inbound_rx,
        )
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    /// Polls the connection until it is open.
    ///
    /// Checks every `ready_poll_interval` for up to `ready_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] when the window elapses,
    /// [`TransportError::Closed`] if the socket closed during the wait, or
    /// [`TransportError::Connect`] if the dial failed.
    pub async fn wait_until_ready(&self, tuning: &TransportTuning) -> Result<(), TransportError> {
        let deadline = Instant::now() + tuning.ready_timeout;
        loop {
            match self.status() {
                LinkStatus::Open => return Ok(()),
                LinkStatus::Closed => return Err(TransportError::Closed),
                LinkStatus::Failed(reason) => return Err(TransportError::Connect(reason)),
                LinkStatus::Connecting => {}
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout);
            }
            sleep(tuning.ready_poll_interval).await;
        }
    }
}

#[async_trait]
impl SignalingChannel for RelayTransport {
    async fn send(&self, message: SignalMessage) -> Result<(), TransportError> {
        if matches!(self.status(), LinkStatus::Closed | LinkStatus::Failed(_)) {
            return Err(TransportError::Closed);
        }
        let frame =
            serde_json::to_string(&message).map_err(|e| TransportError::Send(e.to_string()))?;
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    fn is_open(&self) -> bool {
        matches!(self.status(), LinkStatus::Open)
    }

    async fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn run_connection(
    url: Url,
    status: watch::Sender<LinkStatus>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (ws, _response) = tokio::select! {
        result = connect_async(url.as_str()) => match result {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "relay dial failed");
                let _ = status.send(LinkStatus::Failed(e.to_string()));
                let _ = inbound.send(TransportEvent::Failed(e.to_string()));
                return;
            }
        },
        _ = shutdown.changed() => return,
    };
    let _ = status.send(LinkStatus::Open);
    tracing::debug!(url = %url, "relay connection open");

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(Message::Text(frame)).await {
                        tracing::warn!(error = %e, "relay send failed");
                        let _ = status.send(LinkStatus::Failed(e.to_string()));
                        let _ = inbound.send(TransportEvent::Failed(e.to_string()));
                        return;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = status.send(LinkStatus::Closed);
                    return;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<SignalMessage>(&text) {
                    Ok(message) => {
                        if inbound.send(TransportEvent::Message(message)).is_err() {
                            let _ = sink.send(Message::Close(None)).await;
                            let _ = status.send(LinkStatus::Closed);
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping undecodable relay frame");
                    }
                },
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    let _ = status.send(LinkStatus::Closed);
                    let _ = inbound.send(TransportEvent::Closed);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "relay read failed");
                    let _ = status.send(LinkStatus::Failed(e.to_string()));
                    let _ = inbound.send(TransportEvent::Failed(e.to_string()));
                    return;
                }
            },
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = status.send(LinkStatus::Closed);
                let _ = inbound.send(TransportEvent::Closed);
                return;
            }
        }
    }
}

/// Production [`RelayConnector`]: dials the configured relay endpoint and
/// waits for readiness with the configured tuning.
#[derive(Debug, Clone)]
pub struct RelayDialer {
    config: Arc<CallConfig>,
}

impl RelayDialer {
    /// Creates a dialer for the configured portal.
    #[must_use]
    pub fn new(config: Arc<CallConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RelayConnector for RelayDialer {
    async fn connect(&self, call_id: &CallId) -> Result<RelayLink, TransportError> {
        let url = self.config.relay_url(call_id)?;
        tracing::debug!(call_id = %call_id, url = %url, "dialing relay");
        let (transport, inbound) = RelayTransport::connect(url);
        transport.wait_until_ready(&self.config.transport).await?;
        Ok(RelayLink {
            channel: Arc::new(transport),
            inbound,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quick_tuning() -> TransportTuning {
        TransportTuning {
            ready_timeout: Duration::from_millis(500),
            ready_poll_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_refused_dial_surfaces_a_connect_error() {
        let url = Url::parse("ws://127.0.0.1:1/api/video-call/ws/AB12CD").unwrap();
        let (transport, _inbound) = RelayTransport::connect(url);
        let result = transport.wait_until_ready(&quick_tuning()).await;
        assert!(matches!(
            result,
            Err(TransportError::Connect(_) | TransportError::Timeout)
        ));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let url = Url::parse("ws://127.0.0.1:1/api/video-call/ws/AB12CD").unwrap();
        let (transport, _inbound) = RelayTransport::connect(url);
        transport.close().await;
        transport.close().await;
    }
}
