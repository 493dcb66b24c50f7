// Header block codec: a version line followed by K: V pairs, blank-line terminated.
use bytes::{BufMut, Bytes, BytesMut};

use crate::{CRLF, Error, HEADER_VERSION, Result};

/// Ordered multimap of message headers.
///
/// Insertion order is preserved on the wire; a key may repeat.
///
/// ```
/// use lark_wire::Headers;
///
/// let mut headers = Headers::new();
/// headers.append("Trace-Id", "abc123");
/// assert_eq!(headers.get("trace-id"), Some("abc123"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
    // Remainder of the version line, e.g. an inline status code.
    status: Option<String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    // First value for a name, matched case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // Status text the server attached to the version line, if any.
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    /// Serialized size including the version line and terminating blank line.
    pub fn encoded_len(&self) -> usize {
        let mut len = HEADER_VERSION.len() + CRLF.len();
        if let Some(status) = &self.status {
            len += 1 + status.len();
        }
        for (key, value) in &self.entries {
            len += key.len() + 2 + value.len() + CRLF.len();
        }
        len + CRLF.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(HEADER_VERSION.as_bytes());
        if let Some(status) = &self.status {
            buf.put_u8(b' ');
            buf.put_slice(status.as_bytes());
        }
        buf.put_slice(CRLF);
        for (key, value) in &self.entries {
            buf.put_slice(key.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(CRLF);
        }
        buf.put_slice(CRLF);
    }

    /// Parse the header region of an HMSG body.
    ///
    /// The input covers exactly the declared header length, including the
    /// trailing blank line.
    pub fn parse(input: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(input)
            .map_err(|_| Error::BadHeaders("not valid utf-8".into()))?;
        let mut lines = text.split("\r\n");
        let version = lines
            .next()
            .ok_or_else(|| Error::BadHeaders("empty block".into()))?;
        if !version.starts_with(HEADER_VERSION) {
            return Err(Error::BadHeaders(format!(
                "unexpected version line: {version:?}"
            )));
        }
        let status = version[HEADER_VERSION.len()..].trim();
        let mut headers = Headers {
            entries: Vec::new(),
            status: (!status.is_empty()).then(|| status.to_string()),
        };
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| Error::BadHeaders(format!("missing separator in {line:?}")))?;
            headers
                .entries
                .push((key.trim().to_string(), value.trim().to_string()));
        }
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_order_and_duplicates() {
        let mut headers = Headers::new();
        headers.append("A", "1");
        headers.append("B", "2");
        headers.append("A", "3");
        let encoded = headers.encode();
        assert_eq!(encoded.len(), headers.encoded_len());
        let parsed = Headers::parse(&encoded).expect("parse");
        let pairs: Vec<_> = parsed.iter().collect();
        assert_eq!(pairs, vec![("A", "1"), ("B", "2"), ("A", "3")]);
    }

    #[test]
    fn get_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.append("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("missing"), None);
    }

    #[test]
    fn parse_keeps_inline_status() {
        let parsed = Headers::parse(b"NATS/1.0 503\r\n\r\n").expect("parse");
        assert_eq!(parsed.status(), Some("503"));
        assert!(parsed.is_empty());
    }

    #[test]
    fn parse_rejects_wrong_version_line() {
        let err = Headers::parse(b"HTTP/1.1 200\r\n\r\n").expect_err("version");
        assert!(matches!(err, Error::BadHeaders(_)));
    }

    #[test]
    fn parse_rejects_missing_separator() {
        let err = Headers::parse(b"NATS/1.0\r\nbroken\r\n\r\n").expect_err("separator");
        assert!(matches!(err, Error::BadHeaders(_)));
    }

    #[test]
    fn values_are_trimmed() {
        let parsed = Headers::parse(b"NATS/1.0\r\nKey:  padded  \r\n\r\n").expect("parse");
        assert_eq!(parsed.get("Key"), Some("padded"));
    }
}
