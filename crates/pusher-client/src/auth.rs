//! Channel authorization: exchanging a `(socket_id, channel)` pair for an auth token.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::Error;
use crate::types::BoxError;

const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Produces auth tokens for private and presence channels.
///
/// Called each time a restricted channel is (re-)subscribed. A failure
/// abandons that subscribe attempt; it is logged and not retried until the
/// next connection is established.
#[async_trait::async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, socket_id: &str, channel: &str) -> Result<String, BoxError>;
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    auth: String,
}

/// Authorizes against an HTTP endpoint.
///
/// POSTs `socket_id` and `channel_name` as a form and reads the token from the
/// `auth` field of the JSON response.
#[derive(Debug, Clone)]
pub struct HttpAuthorizer {
    client: reqwest::Client,
    endpoint: String,
    headers: HashMap<String, String>,
}

impl HttpAuthorizer {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_AUTH_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client, endpoint))
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            headers: HashMap::new(),
        }
    }

    /// Add a header sent with every auth request (e.g. a session cookie or bearer token).
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    async fn request_token(&self, socket_id: &str, channel: &str) -> Result<String, Error> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .form(&[("socket_id", socket_id), ("channel_name", channel)]);
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let resp = req
            .send()
            .await?
            .error_for_status()?
            .json::<AuthResponse>()
            .await?;
        Ok(resp.auth)
    }
}

#[async_trait::async_trait]
impl Authorizer for HttpAuthorizer {
    async fn authorize(&self, socket_id: &str, channel: &str) -> Result<String, BoxError> {
        if socket_id.is_empty() || channel.is_empty() {
            return Err("socket_id and channel must be non-empty".into());
        }
        Ok(self.request_token(socket_id, channel).await?)
    }
}
