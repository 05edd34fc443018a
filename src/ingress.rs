//! Client for the Sense ingress API.
//!
//! Two exchanges are supported, both single-attempt JSON POSTs:
//! - `POST {endpoint}/v1/registration` trades the API key for a bearer token.
//! - `POST {endpoint}/v1/iot/events` submits one event using that token.
//!
//! Neither call interprets the response status; callers decide what a
//! non-200 means.

use crate::credential::Credential;
use crate::event::Event;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const REGISTRATION_PATH: &str = "/v1/registration";
pub const EVENTS_PATH: &str = "/v1/iot/events";

/// Boxed future returned by [`IngressApi`] methods.
pub type IngressFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Transport-level failures. HTTP status codes are never mapped to errors here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("HTTP client error: {0}")]
    Client(String),
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Invalid response body: {0}")]
    Body(String),
}

/// Outcome of a registration exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationReply {
    pub status: u16,
    /// Only parsed from successful responses.
    pub token: Option<String>,
}

/// Ingress API abstraction so the credential manager and pipeline can be
/// tested without a server.
pub trait IngressApi: Send + Sync {
    fn register<'a>(
        &'a self,
        api_key: &'a str,
    ) -> IngressFuture<'a, Result<RegistrationReply, DeliveryError>>;

    fn post_event<'a>(
        &'a self,
        credential: &'a Credential,
        event: &'a Event,
    ) -> IngressFuture<'a, Result<u16, DeliveryError>>;
}

/// Software version reported at registration, independent of the crate version.
pub const SOFTWARE_VERSION: &str = "sense-ble-client-v0.1";

/// Fixed description of this gateway sent with every registration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceProperties {
    pub timestamp: i64,
    pub manufacturer: &'static str,
    pub model: &'static str,
    pub os: &'static str,
    pub os_version: &'static str,
    pub software_version: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub sensors: [&'static str; 2],
}

impl DeviceProperties {
    /// Gateway descriptor stamped with the current Unix time in seconds.
    pub fn current() -> Self {
        Self {
            timestamp: Utc::now().timestamp(),
            manufacturer: "Intel",
            model: "Advantech",
            os: "wrlinux",
            os_version: "7.0.0.13",
            software_version: SOFTWARE_VERSION,
            kind: "wrlinux",
            sensors: ["temperature", "humidity"],
        }
    }
}

#[derive(Debug, Serialize)]
struct RegistrationRequest<'a> {
    api_key: &'a str,
    properties: DeviceProperties,
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    #[serde(default)]
    token: Option<String>,
}

/// `reqwest` backed ingress client.
pub struct HttpIngress {
    http: reqwest::Client,
    registration_url: String,
    events_url: String,
}

impl HttpIngress {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, DeliveryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Client(e.to_string()))?;
        let base = endpoint.trim_end_matches('/');
        Ok(Self {
            http,
            registration_url: format!("{base}{REGISTRATION_PATH}"),
            events_url: format!("{base}{EVENTS_PATH}"),
        })
    }

    async fn do_register(&self, api_key: &str) -> Result<RegistrationReply, DeliveryError> {
        let request = RegistrationRequest {
            api_key,
            properties: DeviceProperties::current(),
        };

        debug!(url = %self.registration_url, "sending registration");
        let response = self
            .http
            .post(&self.registration_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| DeliveryError::Request(e.to_string()))?;

        let status = response.status();
        let token = if status.is_success() {
            let body: RegistrationResponse = response
                .json()
                .await
                .map_err(|e| DeliveryError::Body(e.to_string()))?;
            body.token
        } else {
            None
        };

        Ok(RegistrationReply {
            status: status.as_u16(),
            token,
        })
    }

    async fn do_post_event(
        &self,
        credential: &Credential,
        event: &Event,
    ) -> Result<u16, DeliveryError> {
        let response = self
            .http
            .post(&self.events_url)
            .bearer_auth(credential.as_str())
            .json(event)
            .send()
            .await
            .map_err(|e| DeliveryError::Request(e.to_string()))?;

        Ok(response.status().as_u16())
    }
}

impl IngressApi for HttpIngress {
    fn register<'a>(
        &'a self,
        api_key: &'a str,
    ) -> IngressFuture<'a, Result<RegistrationReply, DeliveryError>> {
        Box::pin(self.do_register(api_key))
    }

    fn post_event<'a>(
        &'a self,
        credential: &'a Credential,
        event: &'a Event,
    ) -> IngressFuture<'a, Result<u16, DeliveryError>> {
        Box::pin(self.do_post_event(credential, event))
    }
}

impl std::fmt::Debug for HttpIngress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpIngress")
            .field("events_url", &self.events_url)
            .finish()
    }
}
