//! Async client for line-oriented publish/subscribe brokers.
//!
//! The crate centers on [`Connection`]: it owns the TCP/TLS transport,
//! drives the text protocol, multiplexes subscriptions and request/reply
//! over one socket, and rides out transient network failures with automatic
//! reconnection and bounded in-memory buffering.
//!
//! ```no_run
//! use lark_client::{Connection, Options};
//! use std::time::Duration;
//!
//! # async fn example() -> lark_client::Result<()> {
//! let connection = Connection::connect(Options::new(["plain://127.0.0.1:4222"])?).await?;
//! let subscription = connection.subscribe("updates").await?;
//! connection.publish("updates", "hello").await?;
//! let message = subscription.next(Duration::from_secs(1)).await?;
//! assert_eq!(&message.payload[..], b"hello");
//! connection.close().await;
//! # Ok(())
//! # }
//! ```
mod client;
mod config;
mod errors;
mod events;
mod stats;

pub use client::connection::Connection;
pub use client::subscriptions::{Dispatcher, Subscription};
pub use config::{ErrorCallback, EventCallback, Options};
pub use errors::{Error, Result};
pub use events::{ConnectionState, Event};
pub use stats::Statistics;

// Wire-level types that appear in the public API.
pub use lark_transport::{Endpoint, Scheme};
pub use lark_wire::{Headers, Message, ServerInfo};
