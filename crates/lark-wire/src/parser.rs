//! Incremental parser for the server side of the line protocol.
//!
//! # Purpose
//! Frames a raw byte stream into protocol operations. Message bodies are
//! length-delimited by their header line, so the parser is a two-state
//! machine: awaiting a line, or awaiting a body of known size.
//!
//! # Design notes
//! The parser consumes directly from the caller's read buffer and never
//! copies on a short read: incomplete input yields `Ok(None)` and the caller
//! awaits more bytes. A malformed terminator (LF without CR, or CR followed
//! by anything but LF) is a hard protocol error rather than something to
//! resynchronize past; the caller is expected to drop the transport.
use bytes::BytesMut;

use crate::headers::Headers;
use crate::info::ServerInfo;
use crate::{CRLF, Error, Message, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum ServerOp {
    Info(ServerInfo),
    /// MSG or HMSG; `headers` is `Some` for the latter.
    Msg(Message),
    Ping,
    Pong,
    Ok,
    Err(String),
}

// A MSG/HMSG header line parsed while its body is still in flight.
#[derive(Debug)]
struct PendingMsg {
    subject: String,
    sid: u64,
    reply_to: Option<String>,
    header_len: usize,
    total_len: usize,
}

/// Protocol parser state. One instance lives for the lifetime of a transport.
#[derive(Debug, Default)]
pub struct Protocol {
    pending: Option<PendingMsg>,
}

impl Protocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the next complete operation from `buf`, or return `None` when
    /// more bytes are needed.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<ServerOp>> {
        loop {
            if self.pending.is_some() {
                return self.parse_body(buf);
            }

            let Some(idx) = buf.iter().position(|b| *b == b'\r' || *b == b'\n') else {
                return Ok(None);
            };
            if buf[idx] == b'\n' {
                return Err(Error::Protocol("line feed without carriage return".into()));
            }
            if idx + 1 >= buf.len() {
                // CR is the last byte received so far; the LF may still arrive.
                return Ok(None);
            }
            if buf[idx + 1] != b'\n' {
                return Err(Error::Protocol(
                    "carriage return not followed by line feed".into(),
                ));
            }

            let raw = buf.split_to(idx + 2);
            let line = std::str::from_utf8(&raw[..idx])
                .map_err(|_| Error::Protocol("operation line is not utf-8".into()))?;
            if let Some(op) = self.parse_line(line)? {
                return Ok(Some(op));
            }
            // A MSG/HMSG header was recorded; fall through for the body.
        }
    }

    fn parse_body(&mut self, buf: &mut BytesMut) -> Result<Option<ServerOp>> {
        let needed = {
            let pending = self.pending.as_ref().expect("pending message");
            pending.total_len + CRLF.len()
        };
        if buf.len() < needed {
            return Ok(None);
        }
        let pending = self.pending.take().expect("pending message");
        let mut body = buf.split_to(needed);
        if &body[pending.total_len..] != CRLF {
            return Err(Error::Protocol(
                "message body not terminated by CRLF".into(),
            ));
        }
        body.truncate(pending.total_len);
        let body = body.freeze();

        let headers = if pending.header_len > 0 {
            Some(Headers::parse(&body[..pending.header_len])?)
        } else {
            None
        };
        let payload = body.slice(pending.header_len..);
        Ok(Some(ServerOp::Msg(Message {
            subject: pending.subject,
            reply_to: pending.reply_to,
            headers,
            payload,
            sid: pending.sid,
        })))
    }

    // Returns Some(op) for complete operations; None after recording a
    // pending MSG/HMSG header.
    fn parse_line(&mut self, line: &str) -> Result<Option<ServerOp>> {
        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        if verb.eq_ignore_ascii_case("MSG") {
            self.pending = Some(parse_msg_args(rest, false)?);
            return Ok(None);
        }
        if verb.eq_ignore_ascii_case("HMSG") {
            self.pending = Some(parse_msg_args(rest, true)?);
            return Ok(None);
        }
        if verb.eq_ignore_ascii_case("INFO") {
            return Ok(Some(ServerOp::Info(ServerInfo::parse(rest)?)));
        }
        if verb.eq_ignore_ascii_case("PING") {
            return Ok(Some(ServerOp::Ping));
        }
        if verb.eq_ignore_ascii_case("PONG") {
            return Ok(Some(ServerOp::Pong));
        }
        if verb.eq_ignore_ascii_case("+OK") {
            return Ok(Some(ServerOp::Ok));
        }
        if verb.eq_ignore_ascii_case("-ERR") {
            // Reasons come single-quoted on the wire.
            let reason = rest.trim_matches('\'').to_string();
            return Ok(Some(ServerOp::Err(reason)));
        }
        Err(Error::Protocol(format!("unknown operation {verb:?}")))
    }
}

fn parse_msg_args(rest: &str, with_headers: bool) -> Result<PendingMsg> {
    let args: Vec<&str> = rest.split_ascii_whitespace().collect();
    // MSG: subject sid [reply] size. HMSG adds a header size before the total.
    let fixed = if with_headers { 4 } else { 3 };
    let (reply_to, tail) = match args.len() {
        n if n == fixed => (None, &args[2..]),
        n if n == fixed + 1 => (Some(args[2].to_string()), &args[3..]),
        _ => {
            return Err(Error::Protocol(format!(
                "message header line has {} arguments",
                args.len()
            )));
        }
    };
    let sid = parse_number(args[1])?;
    let (header_len, total_len) = if with_headers {
        (parse_number(tail[0])? as usize, parse_number(tail[1])? as usize)
    } else {
        (0, parse_number(tail[0])? as usize)
    };
    if header_len > total_len {
        return Err(Error::Protocol(format!(
            "header size {header_len} exceeds total size {total_len}"
        )));
    }
    Ok(PendingMsg {
        subject: args[0].to_string(),
        sid,
        reply_to,
        header_len,
        total_len,
    })
}

fn parse_number(token: &str) -> Result<u64> {
    token
        .parse()
        .map_err(|_| Error::Protocol(format!("expected a number, got {token:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, Bytes};

    fn parse_all(input: &[u8]) -> Vec<ServerOp> {
        let mut protocol = Protocol::new();
        let mut buf = BytesMut::from(input);
        let mut ops = Vec::new();
        while let Some(op) = protocol.parse(&mut buf).expect("parse") {
            ops.push(op);
        }
        ops
    }

    #[test]
    fn parses_control_ops() {
        let ops = parse_all(b"PING\r\nPONG\r\n+OK\r\n-ERR 'Stale Connection'\r\n");
        assert_eq!(
            ops,
            vec![
                ServerOp::Ping,
                ServerOp::Pong,
                ServerOp::Ok,
                ServerOp::Err("Stale Connection".into()),
            ]
        );
    }

    #[test]
    fn verbs_match_case_insensitively() {
        let ops = parse_all(b"ping\r\nPong\r\n");
        assert_eq!(ops, vec![ServerOp::Ping, ServerOp::Pong]);
    }

    #[test]
    fn parses_msg_with_and_without_reply() {
        let ops = parse_all(b"MSG a.b 9 5\r\nhello\r\nMSG a.b 9 _INBOX.r.1 0\r\n\r\n");
        match &ops[0] {
            ServerOp::Msg(msg) => {
                assert_eq!(msg.subject, "a.b");
                assert_eq!(msg.sid, 9);
                assert_eq!(msg.reply_to, None);
                assert_eq!(msg.payload, Bytes::from_static(b"hello"));
                assert!(msg.headers.is_none());
            }
            other => panic!("unexpected op: {other:?}"),
        }
        match &ops[1] {
            ServerOp::Msg(msg) => {
                assert_eq!(msg.reply_to.as_deref(), Some("_INBOX.r.1"));
                assert!(msg.payload.is_empty());
            }
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn parses_hmsg_headers_and_payload() {
        let block = b"NATS/1.0\r\nTrace: 1\r\n\r\n";
        let mut wire = BytesMut::new();
        wire.put_slice(
            format!("HMSG sub 2 {} {}\r\n", block.len(), block.len() + 4).as_bytes(),
        );
        wire.put_slice(block);
        wire.put_slice(b"body\r\n");
        let ops = parse_all(&wire);
        match &ops[0] {
            ServerOp::Msg(msg) => {
                let headers = msg.headers.as_ref().expect("headers");
                assert_eq!(headers.get("Trace"), Some("1"));
                assert_eq!(msg.payload, Bytes::from_static(b"body"));
            }
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn byte_by_byte_feeding_yields_same_ops() {
        let wire = b"INFO {\"server_id\":\"s\"}\r\nMSG x 1 3\r\nabc\r\nPING\r\n";
        let mut protocol = Protocol::new();
        let mut buf = BytesMut::new();
        let mut ops = Vec::new();
        for byte in wire {
            buf.put_u8(*byte);
            while let Some(op) = protocol.parse(&mut buf).expect("parse") {
                ops.push(op);
            }
        }
        assert_eq!(ops.len(), 3);
        assert!(matches!(&ops[0], ServerOp::Info(info) if info.server_id == "s"));
        assert!(matches!(&ops[2], ServerOp::Ping));
    }

    #[test]
    fn incomplete_input_returns_none_without_consuming() {
        let mut protocol = Protocol::new();
        let mut buf = BytesMut::from(&b"MSG a.b 9 5\r\nhel"[..]);
        assert!(protocol.parse(&mut buf).expect("parse").is_none());
        buf.put_slice(b"lo\r\n");
        assert!(protocol.parse(&mut buf).expect("parse").is_some());
    }

    #[test]
    fn lone_line_feed_is_a_protocol_error() {
        let mut protocol = Protocol::new();
        let mut buf = BytesMut::from(&b"PING\n"[..]);
        let err = protocol.parse(&mut buf).expect_err("lone LF");
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn carriage_return_without_line_feed_is_a_protocol_error() {
        // A stray CR mid-stream must fail fast instead of waiting for an LF
        // that will never come.
        let mut protocol = Protocol::new();
        let mut buf = BytesMut::from(&b"MSG\rPING\r\n"[..]);
        let err = protocol.parse(&mut buf).expect_err("stray CR");
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn trailing_carriage_return_awaits_the_line_feed() {
        let mut protocol = Protocol::new();
        let mut buf = BytesMut::from(&b"PING\r"[..]);
        assert!(protocol.parse(&mut buf).expect("parse").is_none());
        buf.put_u8(b'\n');
        assert_eq!(
            protocol.parse(&mut buf).expect("parse"),
            Some(ServerOp::Ping)
        );
    }

    #[test]
    fn unknown_verb_is_a_protocol_error() {
        let mut protocol = Protocol::new();
        let mut buf = BytesMut::from(&b"BOGUS x\r\n"[..]);
        assert!(matches!(
            protocol.parse(&mut buf),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn body_missing_terminator_is_a_protocol_error() {
        let mut protocol = Protocol::new();
        let mut buf = BytesMut::from(&b"MSG a 1 3\r\nabcXY"[..]);
        assert!(matches!(
            protocol.parse(&mut buf),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn header_size_larger_than_total_is_rejected() {
        let mut protocol = Protocol::new();
        let mut buf = BytesMut::from(&b"HMSG a 1 10 5\r\n"[..]);
        assert!(matches!(
            protocol.parse(&mut buf),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn bad_sid_is_rejected() {
        let mut protocol = Protocol::new();
        let mut buf = BytesMut::from(&b"MSG a notanumber 3\r\n"[..]);
        assert!(matches!(
            protocol.parse(&mut buf),
            Err(Error::Protocol(_))
        ));
    }
}
