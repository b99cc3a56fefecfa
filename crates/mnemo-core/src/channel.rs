//! Channel sender seam
//!
//! The core decides *whether and when* to deliver; delivery mechanics live
//! behind [`ChannelSender`]. Adapters (in-app feed, webhook push, email
//! relay) are provided by the `mnemo-channels` crate; tests use recording
//! fakes.

use async_trait::async_trait;

use crate::content::NotificationContent;
use crate::error::Result;
use crate::types::Channel;

/// Outcome of a successful channel send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOutcome {
    /// Provider-side id of the delivered message, when the channel has one
    pub provider_id: Option<String>,
}

/// A single delivery channel.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Which channel this sender delivers to.
    fn channel(&self) -> Channel;

    /// Deliver `content` to `user_id`. Transient failures return an error;
    /// the orchestrator isolates them per channel.
    async fn send(&self, user_id: &str, content: &NotificationContent) -> Result<SendOutcome>;
}
