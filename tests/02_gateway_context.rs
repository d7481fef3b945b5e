mod support;

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use gatelink::classifier::{CodeRule, ErrorCategory};
use gatelink::gateway::{GatewayContext, SessionError};
use gatelink::pacing::CallClass;
use gatelink::{GatewayConfig, GatewayError};
use support::{FakeFactory, FakeSession};

fn config() -> GatewayConfig {
    GatewayConfig {
        pool: support::fast_pool_config(2),
        health_check_interval: Duration::from_millis(50),
        ..GatewayConfig::default()
    }
}

fn work(s: &mut FakeSession) -> Result<u32, SessionError> {
    s.work(Duration::ZERO)
}

fn stop(s: &mut FakeSession) -> Result<(), SessionError> {
    s.stop_subscription()
}

#[tokio::test]
async fn call_acquires_paces_and_executes() {
    let factory = FakeFactory::new();
    let ctx = GatewayContext::init(&config(), factory.clone());

    let first = ctx.call(&CallClass::light(), work).await.unwrap();
    let second = ctx.call(&CallClass::light(), work).await.unwrap();

    assert_eq!(first, 1);
    assert_eq!(second, 1);
    assert_eq!(ctx.pace().stats().recorded_calls, 2);
    assert_eq!(ctx.pool().stats().created, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_beyond_max_connections_share_the_pool() {
    let factory = FakeFactory::new();
    let mut config = config();
    config.pool.max_connections = 1;
    let ctx = std::sync::Arc::new(GatewayContext::init(&config, factory.clone()));

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.call(&CallClass::light(), work).await })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), 1);
    }

    assert_eq!(ctx.pool().stats().created, 1);
    assert_eq!(factory.script.max_active_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_wakes_operations_waiting_on_cancellation() {
    let factory = FakeFactory::new();
    let ctx = GatewayContext::init(&config(), factory.clone());
    let token = ctx.coordinator().create_token("stream");
    let blocking = token.clone();

    let waiter = tokio::spawn(async move { token.cancelled().await });
    let thread = std::thread::spawn(move || blocking.wait_blocking(None));
    tokio::task::yield_now().await;

    ctx.shutdown(Duration::from_secs(1)).await;

    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("async waiter should wake")
        .unwrap();
    assert!(thread.join().unwrap());
}

#[tokio::test]
async fn cancelling_during_the_pacing_wait_skips_the_call() {
    let factory = FakeFactory::new();
    let ctx = GatewayContext::init(&config(), factory.clone());
    let bars = CallClass::heavy("AAPL|1 D|1 min");

    ctx.call(&bars, work).await.unwrap();

    // Same resource again: held back by the duplicate cooldown.
    let started = Instant::now();
    let (result, found) = tokio::join!(
        ctx.call_cancellable("bars-2", &bars, work, stop),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ctx.cancel_operation("bars-2", "user closed the chart")
        }
    );

    assert!(found);
    match result {
        Err(GatewayError::Cancelled {
            operation_id,
            reason,
        }) => {
            assert_eq!(operation_id, "bars-2");
            assert_eq!(reason, "user closed the chart");
        }
        other => panic!("expected Cancelled, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!ctx.coordinator().is_registered("bars-2"));
    assert_eq!(factory.script.calls.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.pace().stats().recorded_calls, 1);
}

#[tokio::test]
async fn cancellable_call_completes_when_not_cancelled() {
    let factory = FakeFactory::new();
    let ctx = GatewayContext::init(&config(), factory.clone());

    let id = ctx
        .call_cancellable("quote-1", &CallClass::light(), work, stop)
        .await
        .unwrap();

    assert_eq!(id, 1);
    assert_eq!(ctx.coordinator().active_operations(), 0);
    assert_eq!(factory.script.compensations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn shutdown_cancels_operations_and_stops_connections() {
    let factory = FakeFactory::new();
    let ctx = GatewayContext::init(&config(), factory.clone());
    ctx.start_health_monitor();

    ctx.call(&CallClass::light(), work).await.unwrap();
    let lingering = ctx.shutdown(Duration::from_secs(1)).await;

    assert_eq!(lingering, 0);
    assert!(ctx.coordinator().is_globally_cancelled());
    assert!(ctx.pool().is_closed());
    assert_eq!(factory.script.disconnects(), 1);

    let err = ctx.call(&CallClass::light(), work).await.unwrap_err();
    assert!(matches!(err, GatewayError::ShuttingDown));

    let err = ctx
        .call_cancellable("late", &CallClass::light(), work, stop)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn configured_error_codes_reach_the_classifier() {
    let factory = FakeFactory::new();
    let config = GatewayConfig {
        error_codes: vec![(
            2105,
            CodeRule::new(ErrorCategory::ConnectionError, Duration::from_secs(10)),
        )],
        ..config()
    };
    let ctx = GatewayContext::init(&config, factory.clone());

    let err = ctx
        .call(&CallClass::light(), |_s: &mut FakeSession| {
            Err::<(), _>(SessionError::gateway(
                2105,
                "HMDS data farm connection is broken",
            ))
        })
        .await
        .unwrap_err();

    assert_eq!(err.category(), Some(ErrorCategory::ConnectionError));
    match err {
        GatewayError::Protocol { wait, .. } => assert_eq!(wait, Duration::from_secs(10)),
        other => panic!("expected Protocol, got {other:?}"),
    }
}
