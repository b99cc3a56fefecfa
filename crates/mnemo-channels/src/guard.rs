//! Circuit-breaker wrapper for channel senders
//!
//! Wraps any [`ChannelSender`] so every send runs through a named
//! [`CircuitBreaker`]. Once the provider trips the breaker, sends fail fast
//! with [`Error::BreakerOpen`] without touching the provider at all; the
//! caller's deferral logic treats that like any other channel failure.

use std::sync::Arc;

use async_trait::async_trait;
use mnemo_core::breaker::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig};
use mnemo_core::channel::{ChannelSender, SendOutcome};
use mnemo_core::content::NotificationContent;
use mnemo_core::error::Result;
use mnemo_core::types::Channel;

/// A [`ChannelSender`] whose sends run through a circuit breaker.
pub struct GuardedSender {
    inner: Arc<dyn ChannelSender>,
    breaker: Arc<CircuitBreaker>,
}

impl GuardedSender {
    /// Wrap `inner` with its own breaker named `sender:{channel}`.
    #[must_use]
    pub fn new(inner: Arc<dyn ChannelSender>, config: CircuitBreakerConfig) -> Self {
        let name = format!("sender:{}", inner.channel());
        Self {
            breaker: Arc::new(CircuitBreaker::new(name, config)),
            inner,
        }
    }

    /// Wrap `inner` with a breaker from a shared registry, so other callers
    /// hitting the same provider share its state.
    #[must_use]
    pub fn from_registry(
        inner: Arc<dyn ChannelSender>,
        registry: &BreakerRegistry,
        config: CircuitBreakerConfig,
    ) -> Self {
        let name = format!("sender:{}", inner.channel());
        Self {
            breaker: registry.get_or_create(&name, || config),
            inner,
        }
    }

    /// The breaker guarding this sender.
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

#[async_trait]
impl ChannelSender for GuardedSender {
    fn channel(&self) -> Channel {
        self.inner.channel()
    }

    async fn send(&self, user_id: &str, content: &NotificationContent) -> Result<SendOutcome> {
        self.breaker
            .execute(|| self.inner.send(user_id, content))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_core::breaker::CircuitState;
    use mnemo_core::error::Error;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct FlakySender {
        fail: AtomicBool,
        calls: AtomicUsize,
    }

    impl FlakySender {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ChannelSender for FlakySender {
        fn channel(&self) -> Channel {
            Channel::Push
        }

        async fn send(&self, _user_id: &str, _content: &NotificationContent) -> Result<SendOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Channel {
                    channel: "push".to_string(),
                    message: "relay unreachable".to_string(),
                });
            }
            Ok(SendOutcome {
                provider_id: Some("push_1".to_string()),
            })
        }
    }

    fn content() -> NotificationContent {
        mnemo_core::content::render(
            mnemo_core::types::NotificationType::ReviewDue,
            &mnemo_core::content::ContentContext::reviews(1, vec!["item_1".to_string()]),
        )
    }

    fn tight_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_failure_threshold(2)
            .with_reset_timeout(Duration::from_secs(60))
            .with_request_timeout(None)
    }

    #[tokio::test]
    async fn test_passes_through_while_closed() {
        let inner = FlakySender::new();
        let guarded = GuardedSender::new(inner.clone(), tight_config());

        let outcome = guarded.send("u1", &content()).await.unwrap();
        assert_eq!(outcome.provider_id.as_deref(), Some("push_1"));
        assert_eq!(guarded.channel(), Channel::Push);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_breaker_stops_invoking_the_provider() {
        let inner = FlakySender::new();
        let guarded = GuardedSender::new(inner.clone(), tight_config());
        inner.fail.store(true, Ordering::SeqCst);

        for _ in 0..2 {
            guarded.send("u1", &content()).await.unwrap_err();
        }
        assert_eq!(guarded.breaker().state(), CircuitState::Open);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);

        // Rejected without a provider call.
        let err = guarded.send("u1", &content()).await.unwrap_err();
        assert!(matches!(err, Error::BreakerOpen { .. }));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_registry_shares_breaker_state_per_channel() {
        let registry = BreakerRegistry::new();
        let inner = FlakySender::new();
        let a = GuardedSender::from_registry(inner.clone(), &registry, tight_config());
        let b = GuardedSender::from_registry(inner, &registry, tight_config());

        assert!(Arc::ptr_eq(a.breaker(), b.breaker()));
        assert_eq!(registry.names(), vec!["sender:push".to_string()]);
    }
}
