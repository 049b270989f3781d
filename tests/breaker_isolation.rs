//! Breaker isolation scenario: a failing node stops receiving calls after the configured
//! failure threshold, and other nodes are unaffected.

use std::time::Duration;

use fleet_dispatcher::{BreakerConfig, CircuitBreaker, CircuitState, NullSink};

#[tokio::test]
async fn failing_node_is_isolated_while_healthy_nodes_stay_open() {
    let breaker = CircuitBreaker::new(
        BreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
            success_threshold: 1,
        },
        NullSink,
    );

    const FAILING_NODE: i64 = 101;
    const HEALTHY_NODE: i64 = 202;

    for _ in 0..3 {
        assert!(breaker.is_allowed(FAILING_NODE).await);
        breaker.record_failure(FAILING_NODE).await;
    }
    assert_eq!(breaker.state_of(FAILING_NODE), CircuitState::Open);
    assert!(!breaker.is_allowed(FAILING_NODE).await);

    for _ in 0..10 {
        assert!(breaker.is_allowed(HEALTHY_NODE).await);
        breaker.record_success(HEALTHY_NODE).await;
    }
    assert_eq!(breaker.state_of(HEALTHY_NODE), CircuitState::Closed);

    assert_eq!(breaker.open_circuits(), vec![FAILING_NODE]);
}

#[tokio::test]
async fn breaker_reset_reopens_node_for_traffic() {
    let breaker = CircuitBreaker::new(
        BreakerConfig { failure_threshold: 1, ..BreakerConfig::default() },
        NullSink,
    );
    breaker.record_failure(5).await;
    assert_eq!(breaker.state_of(5), CircuitState::Open);
    assert!(!breaker.is_allowed(5).await);

    breaker.reset(5);
    assert_eq!(breaker.state_of(5), CircuitState::Closed);
    assert!(breaker.is_allowed(5).await);
}
