//! HTTP client for the portal's call registry.
//!
//! The registry mints call codes, admits joiners and terminates calls. It
//! is deliberately small: three POST endpoints with JSON bodies, no
//! authentication handling beyond what the embedding application already
//! puts on the process-wide proxy or headers.

use crate::config::CallConfig;
use crate::types::{CallId, CallerProfile};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The request never completed.
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The registry answered with a non-success status.
    #[error("registry rejected the request with status {status}")]
    Rejected {
        /// Status the registry answered with.
        status: StatusCode,
    },
    /// The registry answered with a body this client cannot use.
    #[error("registry response was malformed: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Serialize)]
struct CallerBody<'a> {
    user_id: &'a str,
    user_name: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateCallResponse {
    call_id: String,
}

/// Client for the three registry endpoints.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    config: Arc<CallConfig>,
}

impl RegistryClient {
    /// Builds a client against the configured portal.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Http`] if the underlying HTTP client
    /// cannot be constructed.
    pub fn new(config: Arc<CallConfig>) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http, config })
    }

    /// Registers a new call and returns its code.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Rejected`] on a non-success status,
    /// [`RegistryError::InvalidResponse`] when the body lacks a usable
    /// `call_id`, or [`RegistryError::Http`] on transport failure.
    #[tracing::instrument(skip(self, caller), fields(user_id = %caller.user_id))]
    pub async fn create_call(&self, caller: &CallerProfile) -> Result<CallId, RegistryError> {
        let response = self
            .http
            .post(self.config.create_call_url())
            .json(&CallerBody {
                user_id: &caller.user_id,
                user_name: &caller.user_name,
            })
            .send()
            .await?;
        let response = check(response)?;
        let body: CreateCallResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::InvalidResponse(e.to_string()))?;
        let call_id =
            CallId::parse(&body.call_id).map_err(|e| RegistryError::InvalidResponse(e.to_string()))?;
        tracing::info!(call_id = %call_id, "call registered");
        Ok(call_id)
    }

    /// Asks the registry to admit `caller` into `call_id`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Rejected`] when the code is unknown or the
    /// call is full, or [`RegistryError::Http`] on transport failure.
    #[tracing::instrument(skip(self, caller), fields(call_id = %call_id, user_id = %caller.user_id))]
    pub async fn join_call(
        &self,
        call_id: &CallId,
        caller: &CallerProfile,
    ) -> Result<(), RegistryError> {
        let response = self
            .http
            .post(self.config.join_call_url(call_id))
            .json(&CallerBody {
                user_id: &caller.user_id,
                user_name: &caller.user_name,
            })
            .send()
            .await?;
        check(response)?;
        tracing::debug!(call_id = %call_id, "join accepted");
        Ok(())
    }

    /// Terminates `call_id` for every participant.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Rejected`] on a non-success status or
    /// [`RegistryError::Http`] on transport failure.
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn end_call(&self, call_id: &CallId) -> Result<(), RegistryError> {
        let response = self.http.post(self.config.end_call_url(call_id)).send().await?;
        check(response)?;
        tracing::debug!(call_id = %call_id, "call ended at registry");
        Ok(())
    }
}

fn check(response: reqwest::Response) -> Result<reqwest::Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(RegistryError::Rejected { status })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_body_matches_the_portal_contract() {
        let caller = CallerProfile::new("patient-7", "Alex Doe");
        let body = CallerBody {
            user_id: &caller.user_id,
            user_name: &caller.user_name,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(json, r#"{"user_id":"patient-7","user_name":"Alex Doe"}"#);
    }

    #[test]
    fn test_create_response_parses_and_normalizes() {
        let body: CreateCallResponse = serde_json::from_str(r#"{"call_id":"ab12cd"}"#).unwrap();
        let call_id = CallId::parse(&body.call_id).unwrap();
        assert_eq!(call_id.as_str(), "AB12CD");
    }

    #[test]
    fn test_blank_minted_code_is_rejected() {
        let body: CreateCallResponse = serde_json::from_str(r#"{"call_id":"  "}"#).unwrap();
        assert!(CallId::parse(&body.call_id).is_err());
    }
}
