//! Circuit breaker integration tests - per-dependency configuration

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use callguard::config::{CircuitBreakerConfig, ReliabilityConfig};
use callguard::failsafe::{CircuitBreaker, CircuitState, FailsafeRegistry};
use callguard::{CallError, DependencyError};
use parking_lot::Mutex;

#[test]
fn test_circuit_breaker_with_custom_config() {
    // Stricter configuration
    let custom_config = CircuitBreakerConfig {
        enabled: true,
        failure_threshold: 3,  // Lower than default 5
        success_threshold: 4,  // Higher than default 2
        reset_timeout: Duration::from_secs(60),
        half_open_max_calls: 4,
    };

    let cb = CircuitBreaker::new("custom-dependency", &custom_config);

    for _ in 0..2 {
        cb.record_failure();
    }
    assert!(cb.can_proceed());

    cb.record_failure(); // Third failure
    assert!(!cb.can_proceed());
}

#[test]
fn test_circuit_breaker_with_lenient_config() {
    // More lenient configuration for flaky dependencies
    let lenient_config = CircuitBreakerConfig {
        failure_threshold: 10,
        reset_timeout: Duration::from_secs(30),
        ..CircuitBreakerConfig::external_api()
    };

    let cb = CircuitBreaker::new("flaky-dependency", &lenient_config);

    // Should still be closed after 5 failures (default would open)
    for _ in 0..5 {
        cb.record_failure();
    }
    assert!(cb.can_proceed());

    for _ in 0..5 {
        cb.record_failure();
    }
    assert!(!cb.can_proceed());
}

#[test]
fn test_disabled_breaker_never_opens() {
    let cb = CircuitBreaker::new(
        "unguarded",
        &CircuitBreakerConfig {
            enabled: false,
            ..CircuitBreakerConfig::database()
        },
    );
    for _ in 0..20 {
        cb.record_failure();
    }
    assert!(cb.can_proceed());
    assert_eq!(cb.state(), CircuitState::Closed);
    assert!(cb.status_message().ends_with("(disabled)"));
}

#[test]
fn test_status_message_format() {
    let config = CircuitBreakerConfig {
        failure_threshold: 3,
        reset_timeout: Duration::from_secs(30),
        ..CircuitBreakerConfig::default()
    };

    let cb = CircuitBreaker::new("youtube", &config);

    // Closed state
    let message = cb.status_message();
    assert!(message.contains("youtube"));
    assert!(message.contains("closed"));

    // Open state
    for _ in 0..3 {
        cb.record_failure();
    }
    let message = cb.status_message();
    assert!(message.contains("Dependency 'youtube'"));
    assert!(message.contains("circuit breaker is open"));
    assert!(message.contains("3 failures"));
    assert!(message.contains("retry in"));
    assert!(message.contains("seconds"));

    cb.force_open();
    assert!(cb.status_message().contains("forced by operator"));
}

#[tokio::test(start_paused = true)]
async fn test_rejection_carries_retry_after() {
    let cb = CircuitBreaker::new("openai", &CircuitBreakerConfig::external_api());
    for _ in 0..5 {
        cb.record_failure();
    }
    tokio::time::advance(Duration::from_secs(20)).await;

    let err = cb
        .execute(|| async { Ok::<_, CallError<DependencyError>>(()) })
        .await
        .unwrap_err();
    match err {
        CallError::CircuitOpen(open) => {
            assert_eq!(open.dependency, "openai");
            assert_eq!(open.retry_after, Duration::from_secs(40));
            assert_eq!(
                open.to_string(),
                "Circuit breaker for 'openai' is open, retry in 40 seconds"
            );
        }
        other => panic!("expected CircuitOpen, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_failures_open_exactly_once() {
    let cb = Arc::new(CircuitBreaker::new("database", &CircuitBreakerConfig::database()));
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&transitions);
    cb.on_state_change(move |t| seen.lock().push((t.from, t.to)));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let cb = Arc::clone(&cb);
        tasks.push(tokio::spawn(async move {
            let _ = cb
                .execute(|| async { Err::<(), _>(CallError::Operation(DependencyError::http(500, "boom"))) })
                .await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(cb.state(), CircuitState::Open);
    assert_eq!(
        *transitions.lock(),
        vec![(CircuitState::Closed, CircuitState::Open)]
    );
    let stats = cb.stats();
    assert_eq!(stats.total_requests, 16);
    assert_eq!(stats.total_failures + stats.total_rejections, 16);
}

#[tokio::test(start_paused = true)]
async fn test_registry_per_dependency_thresholds() {
    let registry = FailsafeRegistry::new(&ReliabilityConfig::default());
    let db = registry.get_or_create("database");
    let ai = registry.get_or_create("openai");
    let calls = AtomicU32::new(0);

    for _ in 0..3 {
        let _: Result<(), CallError<DependencyError>> = db
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DependencyError::new("QueryError", "permission denied for table"))
            })
            .await;
        ai.breaker().record_failure();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(db.breaker().state(), CircuitState::Open);
    assert_eq!(ai.breaker().state(), CircuitState::Closed);
}
