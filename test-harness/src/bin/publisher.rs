// Raw-protocol publisher for poking at a running broker.
use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "publisher")]
#[command(about = "Publish messages to a line-protocol broker")]
struct Args {
    /// Broker address (host:port)
    #[arg(long, default_value = "127.0.0.1:4222")]
    broker: String,

    /// Subject to publish on
    #[arg(long, default_value = "bench.out")]
    subject: String,

    /// Message payload
    #[arg(long, default_value = "hello")]
    payload: String,

    /// Number of messages to send
    #[arg(long, default_value = "1")]
    count: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut stream = TcpStream::connect(&args.broker)
        .await
        .with_context(|| format!("connect to {}", args.broker))?;

    // Swallow the INFO line, identify ourselves, and confirm the round trip.
    let mut scratch = [0u8; 4096];
    let _ = stream.read(&mut scratch).await.context("read INFO")?;
    stream
        .write_all(b"CONNECT {\"verbose\":false,\"lang\":\"rust\"}\r\nPING\r\n")
        .await
        .context("send CONNECT")?;
    let _ = stream.read(&mut scratch).await.context("read PONG")?;

    for sequence in 0..args.count {
        let line = format!(
            "PUB {} {}\r\n{}\r\n",
            args.subject,
            args.payload.len(),
            args.payload
        );
        stream.write_all(line.as_bytes()).await.context("publish")?;
        if sequence % 1000 == 999 {
            info!(sent = sequence + 1, "progress");
        }
    }
    stream.write_all(b"PING\r\n").await.context("flush ping")?;
    let _ = stream.read(&mut scratch).await.context("flush pong")?;
    info!(count = args.count, subject = %args.subject, "done");
    Ok(())
}
