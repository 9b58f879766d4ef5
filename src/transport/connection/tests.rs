use super::*;
use crate::protocol::smb2_constants::Smb2Command;
use crate::test_support::{addr, eventually, MockServer};
use std::collections::HashSet;
use std::io;
use std::time::Duration;

fn transport(server: &Arc<MockServer>, config: ClientConfig) -> Arc<SmbTransport> {
    SmbTransport::new(
        Endpoint::new("fileserver", addr("10.0.0.1:445")),
        None,
        Arc::new(config),
        server.connector(),
    )
}

fn echo() -> Request {
    Request::new(Operation::Echo)
}

#[tokio::test]
async fn test_connect_negotiates() {
    let server = MockServer::new();
    let transport = transport(&server, ClientConfig::default());
    assert_eq!(transport.state(), TransportState::Disconnected);

    transport.connect().await.unwrap();
    assert!(transport.is_connected());
    assert_eq!(transport.dialect(), Some(Smb2Dialect::Smb302));
    assert!(transport.is_modern_dialect());
    assert!(transport.has_capability(Smb2Capabilities::MULTI_CHANNEL));

    // Already connected: no second negotiation
    transport.connect().await.unwrap();
    assert_eq!(server.count(Smb2Command::Negotiate), 1);
}

#[tokio::test]
async fn test_concurrent_connect_opens_once() {
    let server = MockServer::new();
    let transport = transport(&server, ClientConfig::default());

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let transport = Arc::clone(&transport);
        tasks.push(tokio::spawn(async move { transport.connect().await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(server.opens.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(server.count(Smb2Command::Negotiate), 1);
}

#[tokio::test]
async fn test_legacy_dialect() {
    let server = MockServer::new();
    *server.dialect.lock() = Smb2Dialect::Smb210;
    let transport = transport(&server, ClientConfig::default());
    transport.connect().await.unwrap();
    assert!(!transport.is_modern_dialect());
}

#[tokio::test]
async fn test_negotiation_rejected_fails_transport() {
    let server = MockServer::new();
    server.script(Smb2Command::Negotiate, status::STATUS_NOT_SUPPORTED);
    let transport = transport(&server, ClientConfig::default());

    let err = transport.connect().await.unwrap_err();
    assert!(matches!(err, Error::ConnectionError { .. }));
    assert!(transport.is_failed());

    // A failed transport is never reconnected
    assert!(transport.connect().await.is_err());
    assert_eq!(server.opens.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(transport.send(&echo(), RequestFlags::NONE).await.is_err());
}

#[tokio::test]
async fn test_unoffered_dialect_rejected() {
    let server = MockServer::new();
    *server.dialect.lock() = Smb2Dialect::Smb311;
    let transport = transport(&server, ClientConfig::default());
    match transport.connect().await {
        Err(Error::ConnectionError {
            source: Some(cause),
            ..
        }) => assert!(matches!(*cause, Error::UnsupportedDialect(_))),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_connect_refused_keeps_cause() {
    let server = MockServer::new();
    server.refused.lock().insert(addr("10.0.0.1:445"));
    let transport = transport(&server, ClientConfig::default());
    match transport.connect().await {
        Err(Error::ConnectionError {
            source: Some(cause),
            ..
        }) => assert!(matches!(*cause, Error::Io(_))),
        other => panic!("unexpected {:?}", other),
    }
    assert!(transport.is_failed());
}

#[tokio::test]
async fn test_send_before_connect() {
    let server = MockServer::new();
    let transport = transport(&server, ClientConfig::default());
    assert!(matches!(
        transport.send(&echo(), RequestFlags::NONE).await,
        Err(Error::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_out_of_order_responses_correlate() {
    let server = MockServer::new();
    let transport = transport(&server, ClientConfig::default());
    transport.connect().await.unwrap();
    server
        .hold_responses
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let first = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move { transport.send(&echo(), RequestFlags::NONE).await })
    };
    let second = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move { transport.send(&echo(), RequestFlags::NONE).await })
    };
    assert!(eventually(|| server.held_count() == 2).await);
    assert_eq!(transport.in_flight(), 2);
    server.release_held_reversed();

    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();
    let ids: HashSet<u64> = [a.message_id(), b.message_id()].into_iter().collect();
    assert_eq!(ids, HashSet::from([1, 2]));
    assert_eq!(transport.in_flight(), 0);
}

#[tokio::test]
async fn test_interim_response_is_skipped() {
    let server = MockServer::new();
    let transport = transport(&server, ClientConfig::default());
    transport.connect().await.unwrap();
    server.interim.lock().insert(Smb2Command::Echo);

    let reply = transport.send(&echo(), RequestFlags::NONE).await.unwrap();
    assert_eq!(reply.status(), status::STATUS_SUCCESS);
    assert!(!reply.header().is_async());
}

#[tokio::test]
async fn test_transient_write_failure_retried_once() {
    let server = MockServer::new();
    let transport = transport(&server, ClientConfig::default());
    transport.connect().await.unwrap();

    server
        .write_faults
        .lock()
        .push_back(io::ErrorKind::Interrupted);
    let err = transport
        .send(&echo(), RequestFlags::NO_RETRY)
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert!(transport.is_connected());
    assert_eq!(server.count(Smb2Command::Echo), 0);

    server
        .write_faults
        .lock()
        .push_back(io::ErrorKind::Interrupted);
    transport.send(&echo(), RequestFlags::NONE).await.unwrap();
    assert_eq!(server.count(Smb2Command::Echo), 1);

    // Only one retry is granted
    server.write_faults.lock().extend([
        io::ErrorKind::Interrupted,
        io::ErrorKind::Interrupted,
    ]);
    assert!(transport.send(&echo(), RequestFlags::NONE).await.is_err());
    assert!(transport.is_connected());
}

#[tokio::test]
async fn test_fatal_write_failure_fails_transport() {
    let server = MockServer::new();
    let transport = transport(&server, ClientConfig::default());
    transport.connect().await.unwrap();

    server
        .write_faults
        .lock()
        .push_back(io::ErrorKind::ConnectionReset);
    let err = transport
        .send(&echo(), RequestFlags::NONE)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConnectionError { .. }));
    assert!(transport.is_failed());
    // The read half goes down with the write half
    assert!(!transport.has_receive_task());
    assert!(transport.send(&echo(), RequestFlags::NONE).await.is_err());
}

#[tokio::test]
async fn test_timeout_releases_slot() {
    let server = MockServer::new();
    let config = ClientConfig {
        response_timeout: Duration::from_millis(50),
        ..ClientConfig::default()
    };
    let transport = transport(&server, config);
    transport.connect().await.unwrap();
    server.silent.lock().insert(Smb2Command::Echo);

    let err = transport
        .send(&echo(), RequestFlags::NONE)
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(transport.in_flight(), 0);
    assert!(transport.is_connected());
}

#[tokio::test]
async fn test_connection_loss_fails_waiters() {
    let server = MockServer::new();
    let transport = transport(&server, ClientConfig::default());
    transport.connect().await.unwrap();
    server.silent.lock().insert(Smb2Command::Echo);

    let waiter = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move { transport.send(&echo(), RequestFlags::NO_TIMEOUT).await })
    };
    assert!(eventually(|| server.count(Smb2Command::Echo) == 1).await);
    assert_eq!(transport.in_flight(), 1);
    server.kill_links();

    let err = waiter.await.unwrap().unwrap_err();
    assert!(err.is_connection_lost());
    assert!(transport.is_failed());
    assert!(transport.connect().await.is_err());
}

#[tokio::test]
async fn test_retain_payload_flag() {
    let server = MockServer::new();
    let transport = transport(&server, ClientConfig::default());
    transport.connect().await.unwrap();

    let kept = transport
        .send(&echo(), RequestFlags::RETAIN_PAYLOAD)
        .await
        .unwrap();
    let raw = kept.raw_payload().expect("payload retained");
    assert!(raw.len() >= Smb2Header::SIZE);

    let plain = transport.send(&echo(), RequestFlags::NONE).await.unwrap();
    assert!(plain.raw_payload().is_none());
}

#[tokio::test]
async fn test_release_below_zero_is_clamped() {
    let server = MockServer::new();
    let transport = transport(&server, ClientConfig::default());
    transport.connect().await.unwrap();

    let _a = transport.acquire();
    let _b = transport.acquire();
    assert_eq!(transport.usage_count(), 2);
    transport.release();
    transport.release();
    transport.release();
    assert_eq!(transport.usage_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_idle_transport_closes_after_grace() {
    let server = MockServer::new();
    let transport = transport(&server, ClientConfig::default());
    transport.connect().await.unwrap();

    transport.acquire();
    transport.release();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(transport.is_connected());

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(transport.state(), TransportState::Disconnected);
    assert_eq!(server.open_links(), 0);

    // A closed transport may connect again
    transport.connect().await.unwrap();
    assert!(transport.is_connected());
    assert_eq!(server.count(Smb2Command::Negotiate), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reacquire_cancels_idle_close() {
    let server = MockServer::new();
    let transport = transport(&server, ClientConfig::default());
    transport.connect().await.unwrap();

    transport.acquire();
    transport.release();
    tokio::time::sleep(Duration::from_secs(1)).await;
    transport.acquire();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(transport.is_connected());
    assert_eq!(transport.usage_count(), 1);
}

#[tokio::test]
async fn test_close_never_fails() {
    let server = MockServer::new();
    let transport = transport(&server, ClientConfig::default());
    transport.close().await;
    transport.connect().await.unwrap();
    transport.close().await;
    transport.close().await;
    assert_eq!(transport.state(), TransportState::Disconnected);
    assert_eq!(server.open_links(), 0);
}
