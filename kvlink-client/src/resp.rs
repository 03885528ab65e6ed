//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands and decode server replies from an
//! accumulating receive buffer.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Every attempt re-parses from the buffer origin;
//!    nothing is remembered between attempts.
//! 2. **Three-Way Outcome**: Malformed input is an error, a short buffer is
//!    `Parsed::Incomplete`, and a null value is `RespValue::Null`. The round
//!    trip only retries on `Incomplete`.
//! 3. **Binary-Safe**: Bulk strings are length framed and treated as raw bytes.

use bytes::{BufMut, Bytes, BytesMut};
use kvlink_common::{KvError, KvResult};

/// Deepest array nesting accepted in a reply.
const MAX_DEPTH: usize = 32;

/// RESP reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(String),
    /// -ERR ... responses.
    Error(String),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings.
    Bulk(Bytes),
    /// $-1 or *-1: the value does not exist.
    Null,
    /// *... arrays, elements may be arrays themselves.
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Flattens the value into its ordered string sequence.
    ///
    /// Nested arrays are expanded in place and null elements are skipped.
    pub fn into_list(self) -> Vec<Bytes> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(self, out: &mut Vec<Bytes>) {
        match self {
            RespValue::Bulk(data) => out.push(data),
            RespValue::Simple(text) | RespValue::Error(text) => out.push(Bytes::from(text)),
            RespValue::Integer(value) => out.push(Bytes::from(value.to_string())),
            RespValue::Null => {}
            RespValue::Array(items) => {
                for item in items {
                    item.flatten_into(out);
                }
            }
        }
    }
}

/// Outcome of one decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// The buffer does not yet hold one complete reply.
    Incomplete,
    /// One reply was decoded from the first `consumed` bytes.
    Complete { value: RespValue, consumed: usize },
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A], out: &mut BytesMut) {
    out.put_u8(b'*');
    push_usize(out, args.len());
    out.put_slice(b"\r\n");
    for arg in args {
        let arg = arg.as_ref();
        out.put_u8(b'$');
        push_usize(out, arg.len());
        out.put_slice(b"\r\n");
        out.put_slice(arg);
        out.put_slice(b"\r\n");
    }
}

/// Attempts to decode exactly one reply starting at `buf[0]`.
pub fn parse_reply(buf: &[u8]) -> KvResult<Parsed> {
    Ok(match parse_at(buf, 0, 0)? {
        Some((value, consumed)) => Parsed::Complete { value, consumed },
        None => Parsed::Incomplete,
    })
}

// Returns the value and the offset just past it, or `None` when more bytes
// are needed.
fn parse_at(buf: &[u8], pos: usize, depth: usize) -> KvResult<Option<(RespValue, usize)>> {
    let Some(&tag) = buf.get(pos) else {
        return Ok(None);
    };
    let Some(line_end) = find_crlf(buf, pos + 1) else {
        return Ok(None);
    };
    let line = &buf[pos + 1..line_end];
    let next = line_end + 2;

    match tag {
        b'+' => Ok(Some((RespValue::Simple(lossy(line)), next))),
        b'-' => Ok(Some((RespValue::Error(lossy(line)), next))),
        b':' => Ok(Some((RespValue::Integer(parse_i64(line)?), next))),
        b'$' => parse_bulk(buf, parse_i64(line)?, next),
        b'*' => {
            if depth >= MAX_DEPTH {
                return Err(KvError::Protocol("array nesting too deep"));
            }
            parse_array(buf, parse_i64(line)?, next, depth)
        }
        _ => Err(KvError::Protocol("unknown reply type")),
    }
}

fn parse_bulk(buf: &[u8], len: i64, start: usize) -> KvResult<Option<(RespValue, usize)>> {
    if len < 0 {
        return Ok(Some((RespValue::Null, start)));
    }
    let len = usize::try_from(len).map_err(|_| KvError::Protocol("invalid bulk length"))?;
    let end = start
        .checked_add(len)
        .ok_or(KvError::Protocol("invalid bulk length"))?;
    if buf.len() < end + 2 {
        return Ok(None);
    }
    if &buf[end..end + 2] != b"\r\n" {
        return Err(KvError::Protocol("missing bulk terminator"));
    }
    let data = Bytes::copy_from_slice(&buf[start..end]);
    Ok(Some((RespValue::Bulk(data), end + 2)))
}

fn parse_array(
    buf: &[u8],
    count: i64,
    start: usize,
    depth: usize,
) -> KvResult<Option<(RespValue, usize)>> {
    if count < 0 {
        return Ok(Some((RespValue::Null, start)));
    }

    // Cap the preallocation; the count comes from the wire.
    let mut items = Vec::with_capacity((count as usize).min(1024));
    let mut pos = start;
    for _ in 0..count {
        match parse_at(buf, pos, depth + 1)? {
            Some((item, next)) => {
                items.push(item);
                pos = next;
            }
            None => return Ok(None),
        }
    }
    Ok(Some((RespValue::Array(items), pos)))
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(2)
        .position(|pair| pair == b"\r\n")
        .map(|offset| from + offset)
}

fn lossy(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

fn parse_i64(data: &[u8]) -> KvResult<i64> {
    if data.is_empty() {
        return Err(KvError::Protocol("empty length field"));
    }
    let mut negative = false;
    let mut idx = 0;
    if data[0] == b'-' {
        negative = true;
        idx = 1;
    }
    if idx == data.len() {
        return Err(KvError::Protocol("invalid number"));
    }

    let mut value: i64 = 0;
    while idx < data.len() {
        let b = data[idx];
        if !b.is_ascii_digit() {
            return Err(KvError::Protocol("invalid number"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
        idx += 1;
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}

fn push_usize(out: &mut BytesMut, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.put_u8(buf[idx]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(buf: &[u8]) -> RespValue {
        match parse_reply(buf).unwrap() {
            Parsed::Complete { value, consumed } => {
                assert_eq!(consumed, buf.len());
                value
            }
            Parsed::Incomplete => panic!("expected complete reply"),
        }
    }

    #[test]
    fn encodes_command() {
        let mut buf = BytesMut::new();
        encode_command(&["GET", "key"], &mut buf);
        assert_eq!(&buf[..], b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
    }

    #[test]
    fn encodes_empty_argument() {
        let mut buf = BytesMut::new();
        encode_command(&["SET", "k", ""], &mut buf);
        assert_eq!(&buf[..], b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$0\r\n\r\n");
    }

    #[test]
    fn parses_simple_string() {
        assert_eq!(complete(b"+OK\r\n"), RespValue::Simple("OK".into()));
    }

    #[test]
    fn parses_error() {
        assert_eq!(complete(b"-ERR bad\r\n"), RespValue::Error("ERR bad".into()));
    }

    #[test]
    fn parses_integer() {
        assert_eq!(complete(b":42\r\n"), RespValue::Integer(42));
        assert_eq!(complete(b":-2\r\n"), RespValue::Integer(-2));
    }

    #[test]
    fn parses_bulk_string() {
        assert_eq!(complete(b"$5\r\nhello\r\n"), RespValue::Bulk(Bytes::from_static(b"hello")));
        assert_eq!(complete(b"$0\r\n\r\n"), RespValue::Bulk(Bytes::new()));
    }

    #[test]
    fn null_bulk_is_distinct_from_empty() {
        assert_eq!(complete(b"$-1\r\n"), RespValue::Null);
        assert_ne!(complete(b"$0\r\n\r\n"), RespValue::Null);
        assert_eq!(complete(b"*-1\r\n"), RespValue::Null);
    }

    #[test]
    fn parses_nested_arrays() {
        let value = complete(b"*3\r\n$1\r\na\r\n*2\r\n$1\r\nb\r\n:7\r\n$1\r\nc\r\n");
        assert_eq!(
            value,
            RespValue::Array(vec![
                RespValue::Bulk(Bytes::from_static(b"a")),
                RespValue::Array(vec![
                    RespValue::Bulk(Bytes::from_static(b"b")),
                    RespValue::Integer(7),
                ]),
                RespValue::Bulk(Bytes::from_static(b"c")),
            ])
        );
        let list = value.into_list();
        assert_eq!(list, vec!["a", "b", "7", "c"]);
    }

    #[test]
    fn flatten_skips_null_elements() {
        let value = complete(b"*3\r\n$1\r\na\r\n$-1\r\n$1\r\nb\r\n");
        assert_eq!(value.into_list(), vec!["a", "b"]);
    }

    #[test]
    fn every_prefix_is_incomplete() {
        let replies: [&[u8]; 6] = [
            b"+OK\r\n",
            b"-ERR x\r\n",
            b":100\r\n",
            b"$5\r\nhe\r\nl\r\n",
            b"$-1\r\n",
            b"*2\r\n$3\r\nfoo\r\n*1\r\n$3\r\nbar\r\n",
        ];
        for reply in replies {
            let whole = complete(reply);
            for split in 0..reply.len() {
                assert_eq!(
                    parse_reply(&reply[..split]).unwrap(),
                    Parsed::Incomplete,
                    "prefix {split} of {:?}",
                    String::from_utf8_lossy(reply)
                );
            }
            assert_eq!(complete(reply), whole);
        }
    }

    #[test]
    fn trailing_bytes_are_not_consumed() {
        match parse_reply(b"+OK\r\n+NEXT\r\n").unwrap() {
            Parsed::Complete { value, consumed } => {
                assert_eq!(value, RespValue::Simple("OK".into()));
                assert_eq!(consumed, 5);
            }
            Parsed::Incomplete => panic!("expected complete reply"),
        }
    }

    #[test]
    fn rejects_malformed_replies() {
        assert!(matches!(parse_reply(b"?what\r\n"), Err(KvError::Protocol(_))));
        assert!(matches!(parse_reply(b"$abc\r\n"), Err(KvError::Protocol(_))));
        assert!(matches!(parse_reply(b"$\r\n"), Err(KvError::Protocol(_))));
        assert!(matches!(parse_reply(b":-\r\n"), Err(KvError::Protocol(_))));
        assert!(matches!(parse_reply(b"$3\r\nabcde\r\n"), Err(KvError::Protocol(_))));
        assert!(matches!(parse_reply(b"*1\r\n!x\r\n"), Err(KvError::Protocol(_))));
    }

    #[test]
    fn binary_safe_roundtrip() {
        let payload: &[u8] = b"line1\r\nline2\r\n\0$*\xff";
        let mut request = BytesMut::new();
        encode_command(&[&b"SET"[..], &b"k"[..], payload], &mut request);
        assert!(request.ends_with(b"\0$*\xff\r\n"));

        let mut reply = BytesMut::new();
        reply.put_u8(b'$');
        push_usize(&mut reply, payload.len());
        reply.put_slice(b"\r\n");
        reply.put_slice(payload);
        reply.put_slice(b"\r\n");
        assert_eq!(complete(&reply), RespValue::Bulk(Bytes::copy_from_slice(payload)));
    }
}
