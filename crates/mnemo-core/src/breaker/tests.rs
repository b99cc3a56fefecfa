use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

async fn ok_call(breaker: &CircuitBreaker) -> Result<u32> {
    breaker.execute(|| async { Ok(1) }).await
}

async fn failing_call(breaker: &CircuitBreaker, calls: &Arc<AtomicUsize>) -> Result<u32> {
    let calls = calls.clone();
    breaker
        .execute(|| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Storage("down".to_string()))
        })
        .await
}

fn config(threshold: u32) -> CircuitBreakerConfig {
    CircuitBreakerConfig::new()
        .with_failure_threshold(threshold)
        .with_reset_timeout(Duration::from_secs(30))
        .with_request_timeout(None)
}

#[tokio::test(start_paused = true)]
async fn test_opens_after_exactly_n_consecutive_failures() {
    let breaker = CircuitBreaker::new("svc", config(3));
    let calls = Arc::new(AtomicUsize::new(0));

    for i in 1..=3 {
        let result = failing_call(&breaker, &calls).await;
        assert!(result.is_err());
        if i < 3 {
            assert_eq!(breaker.state(), CircuitState::Closed, "after failure {i}");
        }
    }
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // The N+1th call rejects without invoking the operation.
    let result = failing_call(&breaker, &calls).await;
    assert!(matches!(result, Err(Error::BreakerOpen { ref name }) if name == "svc"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_only_after_reset_timeout() {
    let breaker = CircuitBreaker::new("svc", config(1));
    let calls = Arc::new(AtomicUsize::new(0));

    failing_call(&breaker, &calls).await.unwrap_err();
    assert_eq!(breaker.state(), CircuitState::Open);

    // Just before the timeout: still rejected.
    tokio::time::advance(Duration::from_secs(29)).await;
    assert!(!breaker.can_execute());
    let result = ok_call(&breaker).await;
    assert!(result.unwrap_err().is_breaker_open());
    assert_eq!(breaker.state(), CircuitState::Open);

    // At the timeout: admitted as a trial call.
    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(breaker.can_execute());
    ok_call(&breaker).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_failure_reopens_immediately() {
    let breaker = CircuitBreaker::new(
        "svc",
        config(1).with_test_requests(5),
    );
    let calls = Arc::new(AtomicUsize::new(0));

    failing_call(&breaker, &calls).await.unwrap_err();
    tokio::time::advance(Duration::from_secs(30)).await;

    // Two trial successes, then one failure: reopens regardless.
    ok_call(&breaker).await.unwrap();
    ok_call(&breaker).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    failing_call(&breaker, &calls).await.unwrap_err();
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_closes_after_enough_trial_successes() {
    let breaker = CircuitBreaker::new(
        "svc",
        config(1).with_test_requests(3).with_success_threshold(0.9),
    );
    let calls = Arc::new(AtomicUsize::new(0));

    failing_call(&breaker, &calls).await.unwrap_err();
    tokio::time::advance(Duration::from_secs(30)).await;

    ok_call(&breaker).await.unwrap();
    ok_call(&breaker).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    ok_call(&breaker).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);

    // Counters reset on close.
    let stats = breaker.stats();
    assert_eq!(stats.consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_windowed_failures_open_without_being_consecutive() {
    let breaker = CircuitBreaker::new(
        "svc",
        CircuitBreakerConfig::new()
            .with_failure_threshold(3)
            .with_failure_window(Some(Duration::from_secs(60)))
            .with_request_timeout(None),
    );
    let calls = Arc::new(AtomicUsize::new(0));

    // Successes between failures break the consecutive count, but the
    // window still accumulates three failures.
    failing_call(&breaker, &calls).await.unwrap_err();
    ok_call(&breaker).await.unwrap();
    failing_call(&breaker, &calls).await.unwrap_err();
    ok_call(&breaker).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
    failing_call(&breaker, &calls).await.unwrap_err();
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_old_failures_fall_out_of_window() {
    let breaker = CircuitBreaker::new(
        "svc",
        CircuitBreakerConfig::new()
            .with_failure_threshold(3)
            .with_failure_window(Some(Duration::from_secs(60)))
            .with_request_timeout(None),
    );
    let calls = Arc::new(AtomicUsize::new(0));

    failing_call(&breaker, &calls).await.unwrap_err();
    ok_call(&breaker).await.unwrap();
    failing_call(&breaker, &calls).await.unwrap_err();
    ok_call(&breaker).await.unwrap();

    // Both prior failures age out.
    tokio::time::advance(Duration::from_secs(61)).await;
    failing_call(&breaker, &calls).await.unwrap_err();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_counts_as_failure() {
    let breaker = CircuitBreaker::new(
        "slow",
        CircuitBreakerConfig::new()
            .with_failure_threshold(1)
            .with_request_timeout(Some(Duration::from_secs(2))),
    );

    let result: Result<u32> = breaker
        .execute(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(1)
        })
        .await;

    assert!(matches!(result, Err(Error::BreakerTimeout { ref name }) if name == "slow"));
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_is_failure_predicate_excludes_errors() {
    let breaker = CircuitBreaker::new(
        "svc",
        config(1).with_is_failure(Arc::new(|e| !matches!(e, Error::NotFound(_)))),
    );

    // NotFound is an expected outcome, not a dependency failure.
    let result: Result<u32> = breaker
        .execute(|| async { Err(Error::NotFound("item".to_string())) })
        .await;
    assert!(result.is_err());
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.stats().failures, 0);

    let result: Result<u32> = breaker
        .execute(|| async { Err(Error::Storage("down".to_string())) })
        .await;
    assert!(result.is_err());
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_masks_open_rejection_only() {
    let breaker = CircuitBreaker::new("svc", config(1));
    let calls = Arc::new(AtomicUsize::new(0));

    // Closed: operation error propagates, fallback is not consulted.
    let result = breaker
        .execute_or(
            || async { Err(Error::Storage("down".to_string())) },
            || async { Ok(99u32) },
        )
        .await;
    assert!(matches!(result, Err(Error::Storage(_))));
    assert_eq!(breaker.state(), CircuitState::Open);

    // Open: fallback result is returned without invoking the operation.
    let result = breaker
        .execute_or(
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1u32)
                }
            },
            || async { Ok(99u32) },
        )
        .await;
    assert_eq!(result.unwrap(), 99);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Fallback errors propagate unmodified.
    let result: Result<u32> = breaker
        .execute_or(
            || async { Ok(1) },
            || async { Err(Error::Channel { channel: "email".to_string(), message: "fallback".to_string() }) },
        )
        .await;
    assert!(matches!(result, Err(Error::Channel { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_configured_fallback_answers_open_rejections() {
    let breaker = CircuitBreaker::new(
        "svc",
        config(1).with_fallback(fallback_fn(|| async { Ok(42u32) })),
    );
    let calls = Arc::new(AtomicUsize::new(0));

    // Closed: operation errors propagate, the fallback stays out of it.
    let result = failing_call(&breaker, &calls).await;
    assert!(matches!(result, Err(Error::Storage(_))));
    assert_eq!(breaker.state(), CircuitState::Open);

    // Open: the configured fallback answers without invoking the operation.
    let result = failing_call(&breaker, &calls).await;
    assert_eq!(result.unwrap(), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(breaker.state(), CircuitState::Open);

    // A result type the fallback does not produce still rejects.
    let result: Result<String> = breaker.execute(|| async { Ok("hi".to_string()) }).await;
    assert!(result.unwrap_err().is_breaker_open());
}

#[tokio::test(start_paused = true)]
async fn test_monitor_and_events_observe_transitions() {
    let seen = Arc::new(AtomicUsize::new(0));
    let monitor_seen = seen.clone();
    let breaker = CircuitBreaker::new(
        "svc",
        config(1).with_monitor(Arc::new(move |_| {
            monitor_seen.fetch_add(1, Ordering::SeqCst);
        })),
    );
    let mut rx = breaker.subscribe();
    let calls = Arc::new(AtomicUsize::new(0));

    failing_call(&breaker, &calls).await.unwrap_err();

    // StateChanged then Failure (transition happens under the lock, before
    // the failure event is emitted).
    let first = rx.recv().await.unwrap();
    assert!(matches!(
        first,
        BreakerEvent::StateChanged {
            from: CircuitState::Closed,
            to: CircuitState::Open,
            ..
        }
    ));
    let second = rx.recv().await.unwrap();
    assert!(matches!(second, BreakerEvent::Failure { .. }));
    assert!(seen.load(Ordering::SeqCst) >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_stats_track_totals() {
    let breaker = CircuitBreaker::new("svc", config(10));
    let calls = Arc::new(AtomicUsize::new(0));

    ok_call(&breaker).await.unwrap();
    ok_call(&breaker).await.unwrap();
    failing_call(&breaker, &calls).await.unwrap_err();

    let stats = breaker.stats();
    assert_eq!(stats.successes, 2);
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.consecutive_failures, 1);
    assert_eq!(stats.consecutive_successes, 0);
}

#[tokio::test]
async fn test_registry_shares_instances_by_name() {
    let registry = BreakerRegistry::new();
    let a = registry.get_or_create("email", CircuitBreakerConfig::default);
    let b = registry.get_or_create("email", CircuitBreakerConfig::default);
    assert!(Arc::ptr_eq(&a, &b));

    let c = registry.get_or_create("push", CircuitBreakerConfig::default);
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(registry.names().len(), 2);

    assert!(registry.remove("email"));
    assert!(!registry.remove("email"));
    assert!(registry.get("email").is_none());

    // Next lookup creates a fresh instance.
    let d = registry.get_or_create("email", CircuitBreakerConfig::default);
    assert!(!Arc::ptr_eq(&a, &d));
}

#[test]
fn test_config_builder() {
    let config = CircuitBreakerConfig::new()
        .with_failure_threshold(10)
        .with_success_threshold(1.5)
        .with_reset_timeout(Duration::from_secs(60))
        .with_test_requests(0);

    assert_eq!(config.failure_threshold, 10);
    assert_eq!(config.success_threshold, 1.0); // clamped
    assert_eq!(config.test_requests, 1); // at least one trial
    assert_eq!(config.reset_timeout, Duration::from_secs(60));
}

#[test]
fn test_circuit_state_display() {
    assert_eq!(CircuitState::Closed.to_string(), "Closed");
    assert_eq!(CircuitState::Open.to_string(), "Open");
    assert_eq!(CircuitState::HalfOpen.to_string(), "HalfOpen");
}
