// Outbound operation lines. Prefixes exclude the CRLF terminator: the writer
// appends it when serializing a batch, matching the inbound framing rules.
use bytes::{BufMut, Bytes, BytesMut};

use crate::info::ConnectInfo;

fn line(capacity: usize, build: impl FnOnce(&mut BytesMut)) -> Bytes {
    let mut buf = BytesMut::with_capacity(capacity);
    build(&mut buf);
    buf.freeze()
}

/// `PUB <subject> [reply] <size>`
pub fn pub_prefix(subject: &str, reply_to: Option<&str>, payload_len: usize) -> Bytes {
    line(subject.len() + 32, |buf| {
        buf.put_slice(b"PUB ");
        buf.put_slice(subject.as_bytes());
        if let Some(reply) = reply_to {
            buf.put_u8(b' ');
            buf.put_slice(reply.as_bytes());
        }
        buf.put_u8(b' ');
        buf.put_slice(payload_len.to_string().as_bytes());
    })
}

/// `HPUB <subject> [reply] <hdr-size> <total-size>`
pub fn hpub_prefix(
    subject: &str,
    reply_to: Option<&str>,
    header_len: usize,
    total_len: usize,
) -> Bytes {
    line(subject.len() + 40, |buf| {
        buf.put_slice(b"HPUB ");
        buf.put_slice(subject.as_bytes());
        if let Some(reply) = reply_to {
            buf.put_u8(b' ');
            buf.put_slice(reply.as_bytes());
        }
        buf.put_u8(b' ');
        buf.put_slice(header_len.to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(total_len.to_string().as_bytes());
    })
}

/// `SUB <subject> [queue] <sid>`
pub fn sub_line(subject: &str, queue_group: Option<&str>, sid: u64) -> Bytes {
    line(subject.len() + 32, |buf| {
        buf.put_slice(b"SUB ");
        buf.put_slice(subject.as_bytes());
        if let Some(queue) = queue_group {
            buf.put_u8(b' ');
            buf.put_slice(queue.as_bytes());
        }
        buf.put_u8(b' ');
        buf.put_slice(sid.to_string().as_bytes());
    })
}

/// `UNSUB <sid> [max-msgs]`
pub fn unsub_line(sid: u64, max_msgs: Option<u64>) -> Bytes {
    line(32, |buf| {
        buf.put_slice(b"UNSUB ");
        buf.put_slice(sid.to_string().as_bytes());
        if let Some(max) = max_msgs {
            buf.put_u8(b' ');
            buf.put_slice(max.to_string().as_bytes());
        }
    })
}

/// `CONNECT {json}`
pub fn connect_line(connect: &ConnectInfo) -> Bytes {
    let json = connect.to_json();
    line(8 + json.len(), |buf| {
        buf.put_slice(b"CONNECT ");
        buf.put_slice(json.as_bytes());
    })
}

pub fn ping_line() -> Bytes {
    Bytes::from_static(b"PING")
}

pub fn pong_line() -> Bytes {
    Bytes::from_static(b"PONG")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pub_prefix_with_and_without_reply() {
        assert_eq!(&pub_prefix("a.b", None, 5)[..], b"PUB a.b 5");
        assert_eq!(
            &pub_prefix("a.b", Some("_INBOX.x.1"), 0)[..],
            b"PUB a.b _INBOX.x.1 0"
        );
    }

    #[test]
    fn hpub_prefix_carries_both_sizes() {
        assert_eq!(&hpub_prefix("s", None, 22, 27)[..], b"HPUB s 22 27");
        assert_eq!(
            &hpub_prefix("s", Some("r"), 22, 27)[..],
            b"HPUB s r 22 27"
        );
    }

    #[test]
    fn sub_and_unsub_lines() {
        assert_eq!(&sub_line("orders.*", None, 3)[..], b"SUB orders.* 3");
        assert_eq!(
            &sub_line("orders.*", Some("workers"), 3)[..],
            b"SUB orders.* workers 3"
        );
        assert_eq!(&unsub_line(3, None)[..], b"UNSUB 3");
        assert_eq!(&unsub_line(3, Some(10))[..], b"UNSUB 3 10");
    }

    #[test]
    fn connect_line_embeds_json() {
        let connect = ConnectInfo::default();
        let bytes = connect_line(&connect);
        let text = std::str::from_utf8(&bytes).expect("utf8");
        assert!(text.starts_with("CONNECT {"));
        assert!(text.ends_with('}'));
    }
}
