//! Pub/sub demo binary for the lark client.
//!
//! # Purpose
//! Demonstrates the end-to-end flow: broker boot, subscribe, publish,
//! request/reply, and a kill/restart cycle that exercises reconnection.
//!
//! # Notes
//! This is a developer-facing demo; it favors clarity over performance.
use anyhow::Result;
use lark_client::{Connection, Options};
use std::time::Duration;
use test_harness::MockBroker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("== lark Pub/Sub Demo ==");
    println!("Spins up an in-process broker, then runs a client against it.");

    println!("Step 1/5: booting the in-process broker.");
    let broker = MockBroker::start().await?;
    let port = broker.port();
    println!("Broker listening on {}", broker.addr());

    println!("Step 2/5: connecting the client.");
    let mut options = Options::new([broker.url()])?;
    options.reconnect_wait = Duration::from_millis(250);
    let connection = Connection::connect(options).await?;

    println!("Step 3/5: subscribing and publishing.");
    let subscription = connection.subscribe("demo.topic").await?;
    connection.flush(Duration::from_secs(1)).await?;
    connection.publish("demo.topic", "hello").await?;
    connection.publish("demo.topic", "world").await?;
    for _ in 0..2 {
        let message = subscription.next(Duration::from_secs(1)).await?;
        println!(
            "Received on {}: {}",
            message.subject,
            String::from_utf8_lossy(&message.payload)
        );
    }

    println!("Step 4/5: request/reply through a dispatcher.");
    let replier = connection.clone();
    let dispatcher = connection.create_dispatcher(move |message| {
        let replier = replier.clone();
        async move {
            if let Some(reply_to) = message.reply_to.clone() {
                let _ = replier.publish(&reply_to, message.payload).await;
            }
        }
    });
    dispatcher.subscribe("demo.echo").await?;
    connection.flush(Duration::from_secs(1)).await?;
    let reply = connection
        .request("demo.echo", "ping", Duration::from_secs(1))
        .await?;
    println!("Reply: {}", String::from_utf8_lossy(&reply.payload));

    println!("Step 5/5: killing and restarting the broker to show reconnection.");
    broker.shutdown().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let broker = MockBroker::start_on(port).await?;
    // Publishes issued here ride the reconnect buffer.
    connection.publish("demo.topic", "buffered across the outage").await?;
    let message = subscription.next(Duration::from_secs(5)).await?;
    println!(
        "Received after reconnect: {}",
        String::from_utf8_lossy(&message.payload)
    );
    println!(
        "Statistics: {:?}",
        connection.statistics()
    );

    dispatcher.close();
    connection.close().await;
    broker.shutdown().await;
    println!("Demo complete.");
    Ok(())
}
