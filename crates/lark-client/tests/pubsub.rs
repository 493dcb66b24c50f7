// Publish/subscribe, request/reply, and flush behavior against the mock
// broker.
mod common;

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use lark_client::{Connection, ConnectionState, Error, Headers, Options};
use test_harness::MockBroker;

use common::{init_tracing, recording_options};

const SHORT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn publish_subscribe_roundtrip() -> Result<()> {
    init_tracing();
    let broker = MockBroker::start().await?;
    let (options, _events) = recording_options([broker.url()]);
    let connection = Connection::connect(options).await?;
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(connection.connected_url(), Some(broker.url()));

    let subscription = connection.subscribe("greet.joe").await?;
    connection.flush(SHORT).await?;
    connection.publish("greet.joe", "hello").await?;

    let message = subscription.next(SHORT).await?;
    assert_eq!(message.subject, "greet.joe");
    assert_eq!(message.payload, Bytes::from_static(b"hello"));
    assert!(message.headers.is_none());

    let stats = connection.statistics();
    assert!(stats.out_msgs >= 1);
    assert!(stats.in_msgs >= 1);
    assert!(stats.out_bytes > 0);

    connection.close().await;
    assert_eq!(connection.state(), ConnectionState::Closed);
    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn publishes_arrive_in_order() -> Result<()> {
    init_tracing();
    let broker = MockBroker::start().await?;
    let (options, _events) = recording_options([broker.url()]);
    let connection = Connection::connect(options).await?;

    let subscription = connection.subscribe("ordered").await?;
    connection.flush(SHORT).await?;
    for sequence in 0..50u32 {
        connection
            .publish("ordered", sequence.to_string())
            .await?;
    }
    for sequence in 0..50u32 {
        let message = subscription.next(SHORT).await?;
        assert_eq!(message.payload, Bytes::from(sequence.to_string()));
    }

    connection.close().await;
    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn headers_survive_the_wire() -> Result<()> {
    init_tracing();
    let broker = MockBroker::start().await?;
    let (options, _events) = recording_options([broker.url()]);
    let connection = Connection::connect(options).await?;

    let subscription = connection.subscribe("annotated").await?;
    connection.flush(SHORT).await?;

    let mut headers = Headers::new();
    headers.append("Trace-Id", "t-42");
    headers.append("Retries", "0");
    connection
        .publish_with_headers("annotated", &headers, "body")
        .await?;

    let message = subscription.next(SHORT).await?;
    let received = message.headers.expect("headers");
    assert_eq!(received.get("Trace-Id"), Some("t-42"));
    assert_eq!(received.get("Retries"), Some("0"));
    assert_eq!(message.payload, Bytes::from_static(b"body"));

    connection.close().await;
    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn request_reply_through_dispatcher() -> Result<()> {
    init_tracing();
    let broker = MockBroker::start().await?;
    let (options, _events) = recording_options([broker.url()]);
    let connection = Connection::connect(options).await?;

    let replier = connection.clone();
    let dispatcher = connection.create_dispatcher(move |message| {
        let replier = replier.clone();
        async move {
            if let Some(reply_to) = message.reply_to.clone() {
                let _ = replier.publish(&reply_to, message.payload).await;
            }
        }
    });
    dispatcher.subscribe("svc.echo").await?;
    connection.flush(SHORT).await?;

    let reply = connection.request("svc.echo", "ping", SHORT).await?;
    assert_eq!(reply.payload, Bytes::from_static(b"ping"));

    // The reply inbox is private: the sibling subscription saw nothing.
    let bystander = connection.subscribe("unrelated").await?;
    assert!(matches!(
        bystander.next(Duration::from_millis(100)).await,
        Err(Error::Timeout)
    ));

    dispatcher.close();
    connection.close().await;
    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn request_times_out_without_a_responder() -> Result<()> {
    init_tracing();
    let broker = MockBroker::start().await?;
    let (options, _events) = recording_options([broker.url()]);
    let connection = Connection::connect(options).await?;

    let err = connection
        .request("nobody.home", "hello", Duration::from_millis(150))
        .await;
    assert!(matches!(err, Err(Error::Timeout)));

    connection.close().await;
    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn queue_group_delivers_to_one_member() -> Result<()> {
    init_tracing();
    let broker = MockBroker::start().await?;
    let (options, _events) = recording_options([broker.url()]);
    let connection = Connection::connect(options).await?;

    let first = connection.subscribe_queue("jobs", "workers").await?;
    let second = connection.subscribe_queue("jobs", "workers").await?;
    connection.flush(SHORT).await?;

    for _ in 0..10 {
        connection.publish("jobs", "work").await?;
    }
    connection.flush(SHORT).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let total = first.pending() + second.pending();
    assert_eq!(total, 10, "each job goes to exactly one group member");

    connection.close().await;
    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn slow_consumer_drops_oldest() -> Result<()> {
    init_tracing();
    let broker = MockBroker::start().await?;
    let (mut options, _events) = recording_options([broker.url()]);
    options.subscription_capacity = 2;
    let connection = Connection::connect(options).await?;

    let subscription = connection.subscribe("firehose").await?;
    connection.flush(SHORT).await?;
    for sequence in 0..5u32 {
        connection.publish("firehose", sequence.to_string()).await?;
    }
    connection.flush(SHORT).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(subscription.pending(), 2);
    assert_eq!(subscription.dropped(), 3);
    // The survivors are the most recent messages.
    assert_eq!(subscription.next(SHORT).await?.payload, Bytes::from_static(b"3"));
    assert_eq!(subscription.next(SHORT).await?.payload, Bytes::from_static(b"4"));

    let stats = connection.statistics();
    assert_eq!(stats.dropped_messages, 3);

    connection.close().await;
    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn auto_unsubscribe_stops_after_limit() -> Result<()> {
    init_tracing();
    let broker = MockBroker::start().await?;
    let (options, _events) = recording_options([broker.url()]);
    let connection = Connection::connect(options).await?;

    let subscription = connection.subscribe("counted").await?;
    subscription.unsubscribe_after(2).await?;
    connection.flush(SHORT).await?;

    for _ in 0..4 {
        connection.publish("counted", "tick").await?;
    }
    connection.flush(SHORT).await?;

    assert!(subscription.next(SHORT).await.is_ok());
    assert!(subscription.next(SHORT).await.is_ok());
    assert!(matches!(subscription.next(SHORT).await, Err(Error::Closed)));

    connection.close().await;
    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn per_call_failures_are_synchronous() -> Result<()> {
    init_tracing();
    let broker = MockBroker::start().await?;
    let (options, _events) = recording_options([broker.url()]);
    let connection = Connection::connect(options).await?;

    assert!(matches!(
        connection.publish("bad subject", "x").await,
        Err(Error::BadSubject(_))
    ));
    assert!(matches!(
        connection.subscribe("").await,
        Err(Error::BadSubject(_))
    ));

    // The mock advertises max_payload = 1 MiB.
    let oversized = vec![0u8; 2 * 1024 * 1024];
    assert!(matches!(
        connection.publish("big", oversized).await,
        Err(Error::MaxPayloadExceeded { .. })
    ));

    connection.close().await;
    assert!(matches!(
        connection.publish("late", "x").await,
        Err(Error::Closed)
    ));
    assert!(matches!(connection.flush(SHORT).await, Err(Error::Closed)));

    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn flush_round_trips_and_drain_closes() -> Result<()> {
    init_tracing();
    let broker = MockBroker::start().await?;
    let (options, _events) = recording_options([broker.url()]);
    let connection = Connection::connect(options).await?;

    let _subscription = connection.subscribe("draining").await?;
    for _ in 0..10 {
        connection.publish("draining", "payload").await?;
    }
    connection.drain(SHORT).await?;
    assert_eq!(connection.state(), ConnectionState::Closed);

    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn server_errors_follow_the_fatality_rules() -> Result<()> {
    init_tracing();
    let broker = MockBroker::start().await?;
    let (errors_tx, mut errors_rx) = tokio::sync::mpsc::unbounded_channel();
    let (options, _events) = recording_options([broker.url()]);
    let options = options.error_callback(move |err| {
        let _ = errors_tx.send(err.to_string());
    });
    let connection = Connection::connect(options).await?;
    connection.flush(SHORT).await?;

    // Ordinary errors are reported and leave the connection up.
    broker.broadcast_raw(b"-ERR 'Slow Consumer Detected'\r\n");
    let reported = tokio::time::timeout(SHORT, errors_rx.recv())
        .await
        .expect("error report")
        .expect("listener alive");
    assert!(reported.contains("Slow Consumer"));
    assert_eq!(connection.state(), ConnectionState::Connected);
    connection.flush(SHORT).await?;

    // Authorization-class errors are fatal.
    broker.broadcast_raw(b"-ERR 'Authorization Violation'\r\n");
    let mut state = connection.state_watch();
    tokio::time::timeout(SHORT, state.wait_for(|s| *s == ConnectionState::Closed))
        .await
        .expect("closed in time")
        .expect("state channel");

    broker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn connect_fails_fast_with_no_servers() {
    init_tracing();
    // Nothing listens on this port.
    let options = Options::new(["plain://127.0.0.1:1"]).expect("options");
    let err = Connection::connect(options).await.expect_err("no server");
    assert!(matches!(err, Error::NoServers));
}

#[tokio::test]
async fn verbose_ok_lines_are_tolerated() -> Result<()> {
    init_tracing();
    let broker = MockBroker::builder().verbose_ok().start().await?;
    let (mut options, _events) = recording_options([broker.url()]);
    options.verbose = true;
    let connection = Connection::connect(options).await?;

    let subscription = connection.subscribe("chatty").await?;
    connection.flush(SHORT).await?;
    connection.publish("chatty", "still works").await?;
    let message = subscription.next(SHORT).await?;
    assert_eq!(message.payload, Bytes::from_static(b"still works"));

    connection.close().await;
    broker.shutdown().await;
    Ok(())
}
