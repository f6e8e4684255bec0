//! Call lifecycle management.
//!
//! [`CallManager`] is the entry point the embedding application talks to:
//! it runs the registry steps, spawns one session per call and enforces
//! that only one call is active at a time. Transport, media and peer
//! connection backends are injectable; [`CallManager::new`] wires the
//! production stack.

use crate::config::CallConfig;
use crate::media::{MediaDevices, RtcMediaDevices};
use crate::peer::{PeerFactory, RtcPeerFactory};
use crate::registry::{RegistryClient, RegistryError};
use crate::session::{CallSession, SessionContext, SessionHandle};
use crate::signaling::RelayConnector;
use crate::transport::RelayDialer;
use crate::types::{CallId, CallerProfile, InvalidCallId, Role};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors returned by call lifecycle operations.
#[derive(Debug, Error)]
pub enum CallError {
    /// The call registry refused or failed the operation.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The supplied call code failed validation; nothing was sent.
    #[error("invalid call code: {0}")]
    InvalidCallCode(#[from] InvalidCallId),
    /// A call is already active on this manager.
    #[error("another call is already active")]
    AlreadyInCall,
}

/// Creates, joins and leaves consultation calls.
pub struct CallManager {
    config: Arc<CallConfig>,
    registry: RegistryClient,
    connector: Arc<dyn RelayConnector>,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerFactory>,
    active: RwLock<Option<Arc<SessionHandle>>>,
}

impl CallManager {
    /// Creates a manager with the production transport, media and peer
    /// connection backends.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Registry`] when the HTTP client cannot be
    /// constructed.
    pub fn new(config: CallConfig) -> Result<Self, CallError> {
        let config = Arc::new(config);
        let connector = Arc::new(RelayDialer::new(Arc::clone(&config)));
        let devices = Arc::new(RtcMediaDevices::new());
        let peers = Arc::new(RtcPeerFactory::new(config.ice_servers.clone()));
        Self::with_backends(config, connector, devices, peers)
    }

    /// Creates a manager with injected backends, for embedding platforms
    /// and tests that bring their own capture or transport stack.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Registry`] when the HTTP client cannot be
    /// constructed.
    pub fn with_backends(
        config: Arc<CallConfig>,
        connector: Arc<dyn RelayConnector>,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerFactory>,
    ) -> Result<Self, CallError> {
        let registry = RegistryClient::new(Arc::clone(&config))?;
        Ok(Self {
            config,
            registry,
            connector,
            devices,
            peers,
            active: RwLock::new(None),
        })
    }

    /// Registers a new call and starts the creator session.
    ///
    /// On registry failure nothing else happens: no transport is dialed
    /// and no session exists afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::AlreadyInCall`] while another call is live,
    /// or [`CallError::Registry`] when registration fails.
    #[tracing::instrument(skip(self, caller), fields(user_id = %caller.user_id))]
    pub async fn create_call(&self, caller: &CallerProfile) -> Result<Arc<SessionHandle>, CallError> {
        let mut active = self.active.write().await;
        if let Some(existing) = active.as_ref() {
            if !existing.state().is_terminal() {
                return Err(CallError::AlreadyInCall);
            }
        }
        let call_id = self.registry.create_call(caller).await?;
        tracing::info!(call_id = %call_id, "call created");
        let handle = self.spawn_session(call_id, Role::Creator);
        *active = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Validates `code`, asks the registry to admit us and starts the
    /// joiner session.
    ///
    /// The code is normalized exactly like the portal does (trimmed,
    /// uppercased); an empty code fails locally without any request.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidCallCode`] for an empty code,
    /// [`CallError::AlreadyInCall`] while another call is live, or
    /// [`CallError::Registry`] when the registry refuses the join.
    #[tracing::instrument(skip(self, caller), fields(user_id = %caller.user_id))]
    pub async fn join_call(
        &self,
        code: &str,
        caller: &CallerProfile,
    ) -> Result<Arc<SessionHandle>, CallError> {
        let call_id = CallId::parse(code)?;
        let mut active = self.active.write().await;
        if let Some(existing) = active.as_ref() {
            if !existing.state().is_terminal() {
                return Err(CallError::AlreadyInCall);
            }
        }
        self.registry.join_call(&call_id, caller).await?;
        tracing::info!(call_id = %call_id, "call joined");
        let handle = self.spawn_session(call_id, Role::Joiner);
        *active = Some(Arc::clone(&handle));
        Ok(handle)
    }

    fn spawn_session(&self, call_id: CallId, role: Role) -> Arc<SessionHandle> {
        let context = SessionContext {
            call_id,
            role,
            constraints: self.config.constraints,
        };
        Arc::new(CallSession::spawn(
            context,
            Arc::clone(&self.connector),
            Arc::clone(&self.devices),
            Arc::clone(&self.peers),
        ))
    }

    /// Leaves the active call, if any. Idempotent.
    ///
    /// When the local side created the call, a detached request also
    /// asks the registry to end the call for everyone; its failure is
    /// logged and otherwise ignored.
    #[tracing::instrument(skip(self))]
    pub async fn leave_call(&self) {
        let handle = self.active.write().await.take();
        let Some(handle) = handle else {
            tracing::debug!("leave requested with no active call");
            return;
        };
        handle.leave().await;
        if handle.role().is_creator() {
            let registry = self.registry.clone();
            let call_id = handle.call_id().clone();
            tokio::spawn(async move {
                if let Err(e) = registry.end_call(&call_id).await {
                    tracing::warn!(call_id = %call_id, error = %e, "registry end-call failed");
                }
            });
        }
    }

    /// Handle of the active session, if one is running.
    pub async fn active_session(&self) -> Option<Arc<SessionHandle>> {
        self.active.read().await.clone()
    }
}
