//! Web push relay
//!
//! Browser and push notifications go through an HTTP relay service that
//! holds the per-device push subscriptions. The sender posts one JSON
//! payload per notification; the relay fans out to the user's registered
//! endpoints and reports a message id back.

use async_trait::async_trait;
use mnemo_core::channel::{ChannelSender, SendOutcome};
use mnemo_core::content::NotificationContent;
use mnemo_core::error::{Error, Result};
use mnemo_core::types::{Channel, Priority};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Web push relay configuration.
#[derive(Debug, Clone)]
pub struct WebPushConfig {
    /// Relay base URL, e.g. `http://localhost:8090`
    pub relay_url: String,
    /// Bearer token for the relay API
    pub api_token: String,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl WebPushConfig {
    /// Create a config for the given relay.
    #[must_use]
    pub fn new(relay_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            api_token: api_token.into(),
            timeout_secs: 10,
        }
    }

    /// Set the per-request timeout.
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    user_id: &'a str,
    title: &'a str,
    body: &'a str,
    url: &'a str,
    priority: Priority,
    data: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    success: bool,
    message_id: Option<String>,
    error: Option<String>,
}

/// HTTP relay sender for browser and mobile push.
pub struct WebPushSender {
    channel: Channel,
    config: WebPushConfig,
    client: reqwest::Client,
}

impl WebPushSender {
    /// Create a sender for `channel` (browser or push; both ride the same
    /// relay, keyed by subscription type).
    pub fn new(channel: Channel, config: WebPushConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Channel {
                channel: channel.as_str().to_string(),
                message: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self {
            channel,
            config,
            client,
        })
    }

    fn channel_error(&self, message: String) -> Error {
        Error::Channel {
            channel: self.channel.as_str().to_string(),
            message,
        }
    }
}

#[async_trait]
impl ChannelSender for WebPushSender {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, user_id: &str, content: &NotificationContent) -> Result<SendOutcome> {
        let url = format!("{}/v1/push/{}", self.config.relay_url, self.channel);
        let request = PushRequest {
            user_id,
            title: &content.title,
            body: &content.message,
            url: &content.action_url,
            priority: content.priority,
            data: &content.metadata,
        };

        let resp: PushResponse = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_token)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.channel_error(format!("relay request failed: {e}")))?
            .json()
            .await
            .map_err(|e| self.channel_error(format!("invalid relay response: {e}")))?;

        if resp.success {
            debug!(user_id, channel = %self.channel, "push accepted by relay");
            Ok(SendOutcome {
                provider_id: resp.message_id,
            })
        } else {
            Err(self.channel_error(
                resp.error.unwrap_or_else(|| "relay rejected push".to_string()),
            ))
        }
    }
}
