// Failure surface of the client. Per-call failures are returned to callers;
// transport-level failures travel the communication-issue path and reach the
// application through listener callbacks.
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("connection is closed")]
    Closed,
    #[error("connection is not available")]
    Disconnected,
    #[error("operation timed out")]
    Timeout,
    #[error("no servers available for connection")]
    NoServers,
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("authorization violation: {0}")]
    AuthViolation(String),
    #[error("slow consumer on subscription {sid}: {dropped} messages dropped")]
    SlowConsumer { sid: u64, dropped: u64 },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("payload of {size} bytes exceeds server maximum of {max}")]
    MaxPayloadExceeded { size: usize, max: i64 },
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("invalid subject: {0:?}")]
    BadSubject(String),
    #[error("tls failure: {0}")]
    Tls(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<lark_transport::TransportError> for Error {
    fn from(err: lark_transport::TransportError) -> Self {
        use lark_transport::TransportError;
        match err {
            TransportError::Timeout(_) => Error::Timeout,
            TransportError::Eof => Error::Disconnected,
            TransportError::Tls(reason) => Error::Tls(reason),
            TransportError::Io(err) => Error::Io(err),
            TransportError::BadAddress(addr) => Error::IllegalState(format!(
                "unresolvable endpoint {addr}"
            )),
        }
    }
}

impl From<lark_wire::Error> for Error {
    fn from(err: lark_wire::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}

/// Classify a server `-ERR` reason line.
///
/// Errors naming authorization, authentication, or accounts terminate the
/// connection; everything else is reported to the error listener and the
/// connection stays up.
pub(crate) fn classify_server_error(reason: &str) -> Option<Error> {
    let lowered = reason.to_ascii_lowercase();
    if lowered.contains("authorization") {
        return Some(Error::AuthViolation(reason.to_string()));
    }
    if lowered.contains("authentication") || lowered.contains("account") {
        return Some(Error::AuthFailed(reason.to_string()));
    }
    None
}

pub(crate) fn validate_subject(subject: &str) -> Result<()> {
    if subject.is_empty()
        || subject
            .bytes()
            .any(|b| b == b' ' || b == b'\t' || b == b'\r' || b == b'\n')
    {
        return Err(Error::BadSubject(subject.to_string()));
    }
    Ok(())
}
