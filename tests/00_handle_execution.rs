mod support;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use gatelink::cancellation::CancellationToken;
use gatelink::classifier::ErrorCategory;
use gatelink::gateway::{
    ConnectionHandle, ConnectionIdentity, Endpoint, HandleConfig, HandleState, SessionError,
    StopReason,
};
use gatelink::GatewayError;
use support::{FakeFactory, FakeSession};

async fn open(factory: &Arc<FakeFactory>, config: HandleConfig) -> Arc<ConnectionHandle<FakeFactory>> {
    let handle = ConnectionHandle::open(
        factory.clone(),
        ConnectionIdentity::new(7),
        Endpoint::default(),
        config,
        support::classifier(),
    )
    .await
    .expect("handle connects");
    Arc::new(handle)
}

#[tokio::test]
async fn concurrent_callers_are_serialized_on_the_worker() {
    let factory = FakeFactory::new();
    let handle = open(&factory, support::fast_handle_config()).await;

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            handle
                .execute(|s: &mut FakeSession| s.work(Duration::from_millis(5)))
                .await
        }));
    }

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), 7);
    }

    let script = &factory.script;
    assert_eq!(script.calls.load(Ordering::SeqCst), 12);
    assert_eq!(script.max_active_calls.load(Ordering::SeqCst), 1);
    assert_eq!(handle.stats().processed, 12);
    assert_eq!(handle.state(), HandleState::Connected);
}

#[tokio::test]
async fn timed_out_request_is_reported_and_skipped_if_not_started() {
    let factory = FakeFactory::new();
    let handle = open(&factory, support::fast_handle_config()).await;

    let slow = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .execute_with_timeout(
                    |s: &mut FakeSession| s.work(Duration::from_millis(400)),
                    Duration::from_millis(100),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Queued behind the slow call; its caller gives up before it starts.
    let queued = handle
        .execute_with_timeout(
            |s: &mut FakeSession| s.work(Duration::ZERO),
            Duration::from_millis(50),
        )
        .await;
    assert!(matches!(queued, Err(GatewayError::RequestTimeout { .. })));

    let err = slow.await.unwrap().unwrap_err();
    match err {
        GatewayError::RequestTimeout {
            identity, timeout, ..
        } => {
            assert_eq!(identity.value(), 7);
            assert_eq!(timeout, Duration::from_millis(100));
        }
        other => panic!("expected RequestTimeout, got {other:?}"),
    }

    // The connection is still usable afterwards.
    let id = handle
        .execute(|s: &mut FakeSession| s.work(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(id, 7);
    assert_eq!(factory.script.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn full_queue_rejects_immediately() {
    let factory = FakeFactory::new();
    let config = HandleConfig {
        queue_capacity: 1,
        ..support::fast_handle_config()
    };
    let handle = open(&factory, config).await;

    let running = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .execute(|s: &mut FakeSession| s.work(Duration::from_millis(300)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let waiting = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .execute(|s: &mut FakeSession| s.work(Duration::ZERO))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(handle.queued(), 1);

    let err = handle
        .execute(|s: &mut FakeSession| s.work(Duration::ZERO))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::QueueFull { capacity: 1, .. }));

    assert!(running.await.unwrap().is_ok());
    assert!(waiting.await.unwrap().is_ok());
}

#[tokio::test]
async fn gateway_errors_are_classified() {
    let factory = FakeFactory::new();
    let handle = open(&factory, support::fast_handle_config()).await;

    let err = handle
        .execute(|_s: &mut FakeSession| {
            Err::<(), _>(SessionError::gateway(420, "Pacing violation"))
        })
        .await
        .unwrap_err();

    match &err {
        GatewayError::Protocol {
            code,
            category,
            wait,
            ..
        } => {
            assert_eq!(*code, 420);
            assert_eq!(*category, ErrorCategory::PacingViolation);
            assert_eq!(*wait, Duration::from_secs(60));
        }
        other => panic!("expected Protocol, got {other:?}"),
    }
    assert!(err.is_protocol_error());
    assert!(!err.is_pool_error());
    assert_eq!(handle.stats().errored, 1);
}

#[tokio::test]
async fn panicking_call_does_not_kill_the_worker() {
    let factory = FakeFactory::new();
    let handle = open(&factory, support::fast_handle_config()).await;

    let err = handle
        .execute(|_s: &mut FakeSession| -> Result<(), SessionError> { panic!("boom") })
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::WorkerPanicked { .. }));

    let id = handle
        .execute(|s: &mut FakeSession| s.work(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(id, 7);
    assert!(handle.is_worker_alive());
}

#[tokio::test]
async fn health_probes_do_not_keep_an_idle_connection_alive() {
    let factory = FakeFactory::new();
    let config = HandleConfig {
        idle_timeout: Duration::from_millis(300),
        ..support::fast_handle_config()
    };
    let handle = open(&factory, config).await;

    for _ in 0..10 {
        let _ = handle.probe().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(handle.wait_stopped(Duration::from_secs(2)).await);
    assert_eq!(handle.state(), HandleState::IdleStopped);
    assert_eq!(factory.script.disconnects(), 1);
    assert!(!handle.is_healthy().await);
}

#[tokio::test]
async fn teardown_disconnects_even_when_session_claims_disconnected() {
    let factory = FakeFactory::new();
    let handle = open(&factory, support::fast_handle_config()).await;

    factory.script.lie_connected(Some(false));
    handle.shutdown(StopReason::Evicted);

    assert!(handle.wait_stopped(Duration::from_secs(2)).await);
    assert_eq!(handle.state(), HandleState::Evicted);
    assert_eq!(factory.script.disconnects(), 1);

    let err = handle
        .execute(|s: &mut FakeSession| s.work(Duration::ZERO))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::HandleStopped { .. }));
}

#[tokio::test]
async fn failed_connect_is_reported_and_torn_down() {
    let factory = FakeFactory::new();
    factory
        .script
        .fail_next_connect(SessionError::transport("connection refused"));

    let err = ConnectionHandle::open(
        factory.clone(),
        ConnectionIdentity::new(3),
        Endpoint::default(),
        support::fast_handle_config(),
        support::classifier(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.message, "connection refused");
    assert_eq!(factory.script.disconnects(), 1);
}

#[tokio::test]
async fn lying_connected_flag_is_caught_by_the_probe() {
    let factory = FakeFactory::new();
    let handle = open(&factory, support::fast_handle_config()).await;
    assert!(handle.is_healthy().await);

    // Host slept: the session still says connected, the transport is gone.
    factory.script.lie_connected(Some(true));
    factory.script.kill(handle.identity());

    assert!(!handle.is_healthy().await);
}

#[tokio::test]
async fn cancellation_during_a_call_runs_the_compensating_call() {
    let factory = FakeFactory::new();
    let handle = open(&factory, support::fast_handle_config()).await;
    let token = CancellationToken::new("stream-1");

    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel("user stopped the stream");
        })
    };

    let err = handle
        .execute_cancellable(
            &token,
            |s: &mut FakeSession| s.work(Duration::from_millis(200)),
            |s: &mut FakeSession| s.stop_subscription(),
        )
        .await
        .unwrap_err();
    canceller.await.unwrap();

    match err {
        GatewayError::Cancelled {
            operation_id,
            reason,
        } => {
            assert_eq!(operation_id, "stream-1");
            assert_eq!(reason, "user stopped the stream");
        }
        other => panic!("expected Cancelled, got {other:?}"),
    }

    let script = &factory.script;
    assert_eq!(script.calls.load(Ordering::SeqCst), 1);
    assert_eq!(script.compensations.load(Ordering::SeqCst), 1);

    // Already cancelled: nothing is submitted at all.
    let err = handle
        .execute_cancellable(
            &token,
            |s: &mut FakeSession| s.work(Duration::ZERO),
            |s: &mut FakeSession| s.stop_subscription(),
        )
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(script.calls.load(Ordering::SeqCst), 1);
    assert_eq!(script.compensations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn blocking_callers_share_the_same_worker() {
    let factory = FakeFactory::new();
    let handle = open(&factory, support::fast_handle_config()).await;

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let handle = handle.clone();
            std::thread::spawn(move || {
                handle.execute_blocking(|s: &mut FakeSession| s.work(Duration::from_millis(10)))
            })
        })
        .collect();

    for t in threads {
        assert_eq!(t.join().unwrap().unwrap(), 7);
    }
    assert_eq!(factory.script.max_active_calls.load(Ordering::SeqCst), 1);
}
