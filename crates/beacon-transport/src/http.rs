//! Push delivery through a remote connection-management endpoint.
//!
//! Each push is `POST {endpoint}/@connections/{connection_id}` with the
//! payload as the request body. The endpoint answers `410 Gone` for
//! connections it no longer knows about.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::trace;

use crate::traits::{DeliveryError, PushSender};

/// Default timeout for a single push.
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Pushes over HTTP to a connection-management endpoint.
#[derive(Debug, Clone)]
pub struct HttpPushSender {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpPushSender {
    /// Create a sender for an endpoint with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, reqwest::Error> {
        Self::with_timeout(endpoint, DEFAULT_PUSH_TIMEOUT)
    }

    /// Create a sender with a per-push timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_timeout(
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    /// The endpoint pushes are sent to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn connection_url(&self, connection_id: &str) -> String {
        format!("{}/@connections/{}", self.endpoint, connection_id)
    }
}

#[async_trait]
impl PushSender for HttpPushSender {
    async fn push(&self, connection_id: &str, payload: Bytes) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(self.connection_url(connection_id))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Other("push timed out".to_string())
                } else {
                    DeliveryError::Other(e.to_string())
                }
            })?;

        match response.status() {
            status if status.is_success() => {
                trace!(connection = %connection_id, "Pushed");
                Ok(())
            }
            StatusCode::GONE => Err(DeliveryError::Gone),
            status => Err(DeliveryError::Other(format!("endpoint returned {}", status))),
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
