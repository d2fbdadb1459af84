mod common;

use common::{eventually, MockServer};
use muxis_client::{ClientError, Command, Dispatcher, Pool, ProtocolVersion, Value};
use muxis_protocol::ErrorCode;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn concurrent_commands_get_their_own_replies() {
    let server = MockServer::start().await;
    let dispatcher = Dispatcher::connect(server.config()).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..50 {
        let d = dispatcher.clone();
        tasks.push(tokio::spawn(async move {
            let reply = d
                .submit(Command::new("ECHO").arg(format!("msg-{}", i)))
                .await;
            (i, reply)
        }));
    }

    for task in tasks {
        let (i, reply) = task.await.unwrap();
        assert_eq!(reply.unwrap().as_str(), Some(format!("msg-{}", i).as_str()));
    }
    assert_eq!(dispatcher.pending_count(), 0);
}

#[tokio::test]
async fn batch_failures_are_isolated() {
    let server = MockServer::start().await;
    let dispatcher = Dispatcher::connect(server.config()).await.unwrap();

    let results = dispatcher
        .submit_batch(vec![
            Command::new("SET").arg("word").arg("hello"),
            Command::new("INCR").arg("word"),
            Command::new("GET").arg("word"),
        ])
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    assert!(results[0].as_ref().unwrap().is_ok());
    let err = results[1].as_ref().unwrap_err();
    assert_eq!(err.code, ErrorCode::Err);
    assert!(err.message.contains("not an integer"));
    assert_eq!(results[2].as_ref().unwrap().as_str(), Some("hello"));
}

#[tokio::test]
async fn empty_batch_resolves_immediately() {
    let server = MockServer::start().await;
    let dispatcher = Dispatcher::connect(server.config()).await.unwrap();

    let results = assert_ok!(dispatcher.submit_batch(Vec::new()).await);
    assert!(results.is_empty());
}

#[tokio::test]
async fn command_error_leaves_connection_usable() {
    let server = MockServer::start().await;
    let dispatcher = Dispatcher::connect(server.config()).await.unwrap();

    let err = assert_err!(dispatcher.submit(Command::new("NOSUCHCOMMAND")).await);
    assert!(err.is_command_error());
    assert!(!dispatcher.is_broken());

    let pong = assert_ok!(dispatcher.submit(Command::new("PING")).await);
    assert_eq!(pong, Value::Status("PONG".into()));
}

#[tokio::test]
async fn broken_connection_fails_every_pending_request() {
    let server = MockServer::start().await;
    let dispatcher = Dispatcher::connect(server.config()).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let d = dispatcher.clone();
        tasks.push(tokio::spawn(async move { d.submit(Command::new("HANG")).await }));
    }
    assert!(eventually(|| dispatcher.pending_count() == 3).await);

    server.drop_connections();

    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::ConnectionLost(_)), "{:?}", err);
    }
    assert!(dispatcher.is_broken());

    let err = dispatcher.submit(Command::new("PING")).await.unwrap_err();
    assert!(err.is_connection_error());
}

#[tokio::test]
async fn pool_replaces_broken_connection() {
    let server = MockServer::start().await;
    let pool = Pool::new(server.config().with_pool_size(1));

    let first = pool.get().await.unwrap();
    assert_ok!(first.submit(Command::new("PING")).await);

    server.drop_connections();
    assert!(eventually(|| first.is_broken()).await);

    let second = pool.get().await.unwrap();
    assert!(!second.is_broken());
    assert_ok!(second.submit(Command::new("PING")).await);
    assert_eq!(server.accepted(), 2);
    assert_eq!(pool.live_connections().await, 1);
}

#[tokio::test]
async fn pool_hands_out_slots_round_robin() {
    let server = MockServer::start().await;
    let pool = Pool::new(server.config().with_pool_size(3));

    for _ in 0..6 {
        assert_ok!(pool.get().await.unwrap().submit(Command::new("PING")).await);
    }
    assert_eq!(server.accepted(), 3);

    pool.close().await.unwrap();
    assert_eq!(pool.live_connections().await, 0);
}

#[tokio::test]
async fn timeout_leaves_request_queued() {
    let server = MockServer::start().await;
    let dispatcher = Dispatcher::connect(
        server
            .config()
            .with_request_timeout(Duration::from_millis(100)),
    )
    .await
    .unwrap();

    let err = dispatcher.submit(Command::new("HANG")).await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout));
    assert!(!dispatcher.is_broken());
    assert_eq!(dispatcher.pending_count(), 1);
}

#[tokio::test]
async fn abandoned_reply_is_discarded() {
    let server = MockServer::start().await;
    let dispatcher = Dispatcher::connect(server.config()).await.unwrap();

    let slow = dispatcher.send(&Command::new("SLEEP").arg(200)).await;
    assert!(tokio::time::timeout(Duration::from_millis(20), slow)
        .await
        .is_err());

    // the late OK for SLEEP must not be handed to this request
    let echo = dispatcher
        .submit(Command::new("ECHO").arg("after"))
        .await
        .unwrap();
    assert_eq!(echo.as_str(), Some("after"));
    assert_eq!(dispatcher.pending_count(), 0);
}

#[tokio::test]
async fn malformed_reply_breaks_connection() {
    let server = MockServer::start().await;
    let dispatcher = Dispatcher::connect(server.config()).await.unwrap();

    let err = dispatcher.submit(Command::new("GARBAGE")).await.unwrap_err();
    assert!(err.is_connection_error());
    assert!(err.to_string().contains("invalid frame type byte"), "{}", err);
    assert!(dispatcher.is_broken());
}

#[tokio::test]
async fn truncated_reply_breaks_connection_after_read_deadline() {
    let server = MockServer::start().await;
    let dispatcher = Dispatcher::connect(server.config()).await.unwrap();

    let err = dispatcher.submit(Command::new("PARTIAL")).await.unwrap_err();
    assert!(err.to_string().contains("truncated"), "{}", err);
    assert!(dispatcher.is_broken());
}

#[tokio::test]
async fn unexpected_reply_breaks_connection() {
    let server = MockServer::start().await;
    let dispatcher = Dispatcher::connect(server.config()).await.unwrap();

    assert_ok!(dispatcher.submit(Command::new("EXTRA")).await);
    assert!(eventually(|| dispatcher.is_broken()).await);
}

#[tokio::test]
async fn peer_close_breaks_connection() {
    let server = MockServer::start().await;
    let dispatcher = Dispatcher::connect(server.config()).await.unwrap();

    let err = dispatcher.submit(Command::new("KILL")).await.unwrap_err();
    assert!(matches!(err, ClientError::ConnectionLost(_)), "{:?}", err);
}

#[tokio::test]
async fn close_fails_pending_requests() {
    let server = MockServer::start().await;
    let dispatcher = Dispatcher::connect(server.config()).await.unwrap();

    let hanging = dispatcher.send(&Command::new("HANG")).await;
    dispatcher.close().await.unwrap();

    let err = hanging.await.unwrap_err();
    assert!(err.is_connection_error());
    assert!(dispatcher.is_broken());
}

#[tokio::test]
async fn handshake_authenticates_and_rejects() {
    let server = MockServer::start_with_password("s3cret").await;

    let anonymous = Dispatcher::connect(server.config()).await.unwrap();
    let err = anonymous.submit(Command::new("PING")).await.unwrap_err();
    assert_eq!(
        err.server_error().map(|e| e.code),
        Some(ErrorCode::NoAuth)
    );

    let wrong = Dispatcher::connect(server.config().with_password("nope")).await;
    assert!(matches!(wrong, Err(ClientError::Handshake(_))));

    let good = Dispatcher::connect(
        server
            .config()
            .with_password("s3cret")
            .with_client_name("tests")
            .with_database(1),
    )
    .await
    .unwrap();
    assert_ok!(good.submit(Command::new("PING")).await);
}

#[tokio::test]
async fn resp3_handshake() {
    let server = MockServer::start_with_password("s3cret").await;
    let dispatcher = Dispatcher::connect(
        server
            .config()
            .with_password("s3cret")
            .with_protocol(ProtocolVersion::Resp3),
    )
    .await
    .unwrap();

    let reply = dispatcher
        .submit(Command::new("SET").arg("k").arg(42))
        .await
        .unwrap();
    assert!(reply.is_ok());
    let value = dispatcher.submit(Command::new("GET").arg("k")).await.unwrap();
    assert_eq!(value.as_int(), Some(42));
}

#[tokio::test]
async fn dropping_last_handle_releases_connection() {
    let server = MockServer::start().await;
    let dispatcher = Dispatcher::connect(server.config()).await.unwrap();
    let reply = dispatcher.send(&Command::new("HANG")).await;

    drop(dispatcher);
    let err = reply.await.unwrap_err();
    assert!(err.is_connection_error());
}
