//! Email delivery via an HTTP mail-relay API
//!
//! The relay resolves a user id to a verified address and sends the actual
//! mail; this sender only hands over subject, body, and a link back into
//! the app.

use async_trait::async_trait;
use mnemo_core::channel::{ChannelSender, SendOutcome};
use mnemo_core::content::NotificationContent;
use mnemo_core::error::{Error, Result};
use mnemo_core::types::Channel;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Mail relay configuration.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Relay API base URL
    pub api_url: String,
    /// API key for the relay
    pub api_key: String,
    /// From header, e.g. `Mnemo <noreply@mnemo.app>`
    pub from: String,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl EmailConfig {
    /// Create a config for the given relay.
    #[must_use]
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            from: from.into(),
            timeout_secs: 15,
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
struct MailRequest<'a> {
    user_id: &'a str,
    from: &'a str,
    subject: &'a str,
    text: &'a str,
    action_url: &'a str,
}

#[derive(Debug, Deserialize)]
struct MailResponse {
    success: bool,
    message_id: Option<String>,
    error: Option<String>,
}

/// HTTP mail-relay sender.
pub struct EmailSender {
    config: EmailConfig,
    client: reqwest::Client,
}

impl EmailSender {
    /// Create an email sender.
    pub fn new(config: EmailConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Channel {
                channel: Channel::Email.as_str().to_string(),
                message: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self { config, client })
    }

    fn channel_error(message: String) -> Error {
        Error::Channel {
            channel: Channel::Email.as_str().to_string(),
            message,
        }
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, user_id: &str, content: &NotificationContent) -> Result<SendOutcome> {
        let url = format!("{}/v1/mail", self.config.api_url);
        let request = MailRequest {
            user_id,
            from: &self.config.from,
            subject: &content.title,
            text: &content.message,
            action_url: &content.action_url,
        };

        let resp: MailResponse = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::channel_error(format!("relay request failed: {e}")))?
            .json()
            .await
            .map_err(|e| Self::channel_error(format!("invalid relay response: {e}")))?;

        if resp.success {
            debug!(user_id, "mail accepted by relay");
            Ok(SendOutcome {
                provider_id: resp.message_id,
            })
        } else {
            Err(Self::channel_error(
                resp.error.unwrap_or_else(|| "relay rejected mail".to_string()),
            ))
        }
    }
}
