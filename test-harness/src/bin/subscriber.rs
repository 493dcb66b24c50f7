// Raw-protocol subscriber that prints every delivered message.
use anyhow::{Context, Result};
use bytes::BytesMut;
use clap::Parser;
use lark_wire::{Protocol, ServerOp};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "subscriber")]
#[command(about = "Subscribe to a subject and print deliveries")]
struct Args {
    /// Broker address (host:port)
    #[arg(long, default_value = "127.0.0.1:4222")]
    broker: String,

    /// Subject filter, wildcards allowed
    #[arg(long, default_value = "bench.>")]
    subject: String,

    /// Stop after this many messages (0 = run forever)
    #[arg(long, default_value = "0")]
    limit: usize,
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

    let connect = format!(
        "CONNECT {{\"verbose\":false,\"lang\":\"rust\"}}\r\nSUB {} 1\r\n",
        args.subject
    );
    stream.write_all(connect.as_bytes()).await.context("subscribe")?;

    let mut protocol = Protocol::new();
    let mut buf = BytesMut::with_capacity(16 * 1024);
    let mut received = 0usize;
    loop {
        while let Some(op) = protocol.parse(&mut buf).context("parse")? {
            match op {
                ServerOp::Msg(message) => {
                    received += 1;
                    info!(
                        subject = %message.subject,
                        bytes = message.payload.len(),
                        received,
                        "message"
                    );
                    if args.limit > 0 && received >= args.limit {
                        return Ok(());
                    }
                }
                ServerOp::Ping => stream.write_all(b"PONG\r\n").await.context("pong")?,
                _ => {}
            }
        }
        if stream.read_buf(&mut buf).await.context("read")? == 0 {
            info!("broker closed the connection");
            return Ok(());
        }
    }
}
