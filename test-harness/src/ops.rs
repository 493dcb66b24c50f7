// Parser for the client side of the line protocol, as seen by the broker.
use anyhow::{Context, Result, bail};
use bytes::{Bytes, BytesMut};

#[derive(Debug, Clone, PartialEq)]
pub enum ClientOp {
    Connect(String),
    Pub {
        subject: String,
        reply_to: Option<String>,
        payload: Bytes,
    },
    HPub {
        subject: String,
        reply_to: Option<String>,
        headers: Bytes,
        payload: Bytes,
    },
    Sub {
        subject: String,
        queue_group: Option<String>,
        sid: u64,
    },
    Unsub {
        sid: u64,
        max_msgs: Option<u64>,
    },
    Ping,
    Pong,
}

#[derive(Debug)]
struct PendingBody {
    subject: String,
    reply_to: Option<String>,
    header_len: usize,
    total_len: usize,
}

/// Incremental parser over a client's inbound bytes.
#[derive(Debug, Default)]
pub struct ClientProtocol {
    pending: Option<PendingBody>,
}

impl ClientProtocol {
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<ClientOp>> {
        loop {
            if let Some(pending) = self.pending.take() {
                let needed = pending.total_len + 2;
                if buf.len() < needed {
                    self.pending = Some(pending);
                    return Ok(None);
                }
                let mut body = buf.split_to(needed);
                if &body[pending.total_len..] != b"\r\n" {
                    bail!("publish body not terminated by CRLF");
                }
                body.truncate(pending.total_len);
                let body = body.freeze();
                let op = if pending.header_len > 0 {
                    ClientOp::HPub {
                        subject: pending.subject,
                        reply_to: pending.reply_to,
                        headers: body.slice(..pending.header_len),
                        payload: body.slice(pending.header_len..),
                    }
                } else {
                    ClientOp::Pub {
                        subject: pending.subject,
                        reply_to: pending.reply_to,
                        payload: body,
                    }
                };
                return Ok(Some(op));
            }

            let Some(idx) = buf.iter().position(|b| *b == b'\n') else {
                return Ok(None);
            };
            if idx == 0 || buf[idx - 1] != b'\r' {
                bail!("client line not terminated by CRLF");
            }
            let raw = buf.split_to(idx + 1);
            let line = std::str::from_utf8(&raw[..idx - 1]).context("client line not utf-8")?;
            if let Some(op) = self.parse_line(line)? {
                return Ok(Some(op));
            }
        }
    }

    fn parse_line(&mut self, line: &str) -> Result<Option<ClientOp>> {
        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        if verb.eq_ignore_ascii_case("PING") {
            return Ok(Some(ClientOp::Ping));
        }
        if verb.eq_ignore_ascii_case("PONG") {
            return Ok(Some(ClientOp::Pong));
        }
        if verb.eq_ignore_ascii_case("CONNECT") {
            return Ok(Some(ClientOp::Connect(rest.to_string())));
        }
        if verb.eq_ignore_ascii_case("SUB") {
            let args: Vec<&str> = rest.split_ascii_whitespace().collect();
            let (queue_group, sid) = match args.len() {
                2 => (None, args[1]),
                3 => (Some(args[1].to_string()), args[2]),
                n => bail!("SUB with {n} arguments"),
            };
            return Ok(Some(ClientOp::Sub {
                subject: args[0].to_string(),
                queue_group,
                sid: sid.parse().context("SUB sid")?,
            }));
        }
        if verb.eq_ignore_ascii_case("UNSUB") {
            let args: Vec<&str> = rest.split_ascii_whitespace().collect();
            let max_msgs = match args.len() {
                1 => None,
                2 => Some(args[1].parse().context("UNSUB max")?),
                n => bail!("UNSUB with {n} arguments"),
            };
            return Ok(Some(ClientOp::Unsub {
                sid: args[0].parse().context("UNSUB sid")?,
                max_msgs,
            }));
        }
        if verb.eq_ignore_ascii_case("PUB") {
            let args: Vec<&str> = rest.split_ascii_whitespace().collect();
            let (reply_to, size) = match args.len() {
                2 => (None, args[1]),
                3 => (Some(args[1].to_string()), args[2]),
                n => bail!("PUB with {n} arguments"),
            };
            self.pending = Some(PendingBody {
                subject: args[0].to_string(),
                reply_to,
                header_len: 0,
                total_len: size.parse().context("PUB size")?,
            });
            return Ok(None);
        }
        if verb.eq_ignore_ascii_case("HPUB") {
            let args: Vec<&str> = rest.split_ascii_whitespace().collect();
            let (reply_to, header_len, total_len) = match args.len() {
                3 => (None, args[1], args[2]),
                4 => (Some(args[1].to_string()), args[2], args[3]),
                n => bail!("HPUB with {n} arguments"),
            };
            self.pending = Some(PendingBody {
                subject: args[0].to_string(),
                reply_to,
                header_len: header_len.parse().context("HPUB header size")?,
                total_len: total_len.parse().context("HPUB total size")?,
            });
            return Ok(None);
        }
        bail!("unknown client operation {verb:?}")
    }
}

/// Broker-side subject matching: `*` matches one token, `>` the remainder.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (None, None) => return true,
            (Some(">"), _) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            _ => return false,
        }
    }
}
