// Text line protocol: inbound parsing, outbound serialization, INFO/CONNECT types.
use bytes::Bytes;

mod headers;
mod info;
mod op;
mod parser;

pub use headers::Headers;
pub use info::{ConnectInfo, ServerInfo};
pub use op::{
    connect_line, hpub_prefix, ping_line, pong_line, pub_prefix, sub_line, unsub_line,
};
pub use parser::{Protocol, ServerOp};

pub const CRLF: &[u8] = b"\r\n";
pub const HEADER_VERSION: &str = "NATS/1.0";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("malformed header block: {0}")]
    BadHeaders(String),
    #[error("invalid server info: {0}")]
    BadInfo(#[from] serde_json::Error),
}

/// An inbound message delivered to a subscription.
///
/// ```
/// use lark_wire::Message;
///
/// let msg = Message {
///     subject: "orders.created".into(),
///     reply_to: None,
///     headers: None,
///     payload: bytes::Bytes::from_static(b"{}"),
///     sid: 4,
/// };
/// assert!(msg.headers.is_none());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub subject: String,
    pub reply_to: Option<String>,
    pub headers: Option<Headers>,
    pub payload: Bytes,
    pub sid: u64,
}

impl Message {
    // Wire size of the message body as delivered (headers block plus payload).
    pub fn size(&self) -> usize {
        let header_len = self.headers.as_ref().map_or(0, |h| h.encoded_len());
        header_len + self.payload.len()
    }
}
