//! RESP2 values, command encoding, and incremental frame decoding.
//!
//! Decoding is buffer-oriented: [`decode`] inspects the bytes read so far and
//! returns `Ok(None)` until a complete frame is available, so the async reader
//! only has to append to its buffer and try again.

use thiserror::Error;

const CRLF: &[u8] = b"\r\n";
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// A single RESP2 reply value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// `+OK` style status reply.
    Simple(String),
    /// `-ERR ...` error reply.
    Error(String),
    /// `:42` integer reply.
    Integer(i64),
    /// `$n` bulk string.
    Bulk(Vec<u8>),
    /// `*n` array of nested values.
    Array(Vec<Value>),
    /// Null bulk string or null array.
    Nil,
}

impl Value {
    /// Builds a bulk string value.
    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        Self::Bulk(data.into())
    }

    /// Returns the raw bytes of a simple or bulk string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Simple(text) => Some(text.as_bytes()),
            Self::Bulk(data) => Some(data),
            _ => None,
        }
    }

    /// Returns a simple or bulk string as UTF-8 text.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes()
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    /// Serializes the value into its wire representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Self::Simple(text) => {
                out.push(b'+');
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(CRLF);
            }
            Self::Error(text) => {
                out.push(b'-');
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(CRLF);
            }
            Self::Integer(value) => {
                out.extend_from_slice(format!(":{value}\r\n").as_bytes());
            }
            Self::Bulk(data) => write_bulk(out, data),
            Self::Array(items) => {
                out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.write_to(out);
                }
            }
            Self::Nil => out.extend_from_slice(b"$-1\r\n"),
        }
    }
}

/// Errors raised while decoding malformed frames.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// First byte of a frame is not a RESP2 type marker.
    #[error("unknown frame type byte {0:#04x}")]
    UnknownType(u8),

    /// Length or integer field did not parse.
    #[error("invalid number in frame header: {0:?}")]
    InvalidNumber(String),

    /// Declared length exceeds the decoder's limits.
    #[error("frame length {0} exceeds limit")]
    TooLarge(i64),

    /// Bulk payload is not followed by CRLF.
    #[error("bulk string is missing its CRLF terminator")]
    MissingTerminator,
}

/// Encodes a command as an array of bulk strings.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        write_bulk(&mut out, arg.as_ref());
    }
    out
}

/// Attempts to decode one value from the front of `buf`.
///
/// Returns the value and the number of bytes it occupied, or `Ok(None)` when
/// `buf` does not yet hold a complete frame.
pub fn decode(buf: &[u8]) -> Result<Option<(Value, usize)>, FrameError> {
    decode_at(buf, 0)
}

fn decode_at(buf: &[u8], pos: usize) -> Result<Option<(Value, usize)>, FrameError> {
    let Some(&marker) = buf.get(pos) else {
        return Ok(None);
    };
    let Some((line, next)) = read_line(buf, pos + 1) else {
        return Ok(None);
    };

    match marker {
        b'+' => Ok(Some((
            Value::Simple(String::from_utf8_lossy(line).into_owned()),
            next,
        ))),
        b'-' => Ok(Some((
            Value::Error(String::from_utf8_lossy(line).into_owned()),
            next,
        ))),
        b':' => Ok(Some((Value::Integer(parse_number(line)?), next))),
        b'$' => {
            let len = parse_number(line)?;
            if len < 0 {
                return Ok(Some((Value::Nil, next)));
            }
            if len > MAX_BULK_LEN {
                return Err(FrameError::TooLarge(len));
            }
            let end = next + len as usize;
            if buf.len() < end + CRLF.len() {
                return Ok(None);
            }
            if &buf[end..end + CRLF.len()] != CRLF {
                return Err(FrameError::MissingTerminator);
            }
            Ok(Some((Value::Bulk(buf[next..end].to_vec()), end + CRLF.len())))
        }
        b'*' => {
            let len = parse_number(line)?;
            if len < 0 {
                return Ok(Some((Value::Nil, next)));
            }
            if len > MAX_ARRAY_LEN {
                return Err(FrameError::TooLarge(len));
            }
            let mut items = Vec::with_capacity(len as usize);
            let mut cursor = next;
            for _ in 0..len {
                match decode_at(buf, cursor)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Value::Array(items), cursor)))
        }
        other => Err(FrameError::UnknownType(other)),
    }
}

fn read_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(start..)?;
    let end = rest.windows(CRLF.len()).position(|window| window == CRLF)?;
    Some((&rest[..end], start + end + CRLF.len()))
}

fn parse_number(line: &[u8]) -> Result<i64, FrameError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| FrameError::InvalidNumber(String::from_utf8_lossy(line).into_owned()))
}

fn write_bulk(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(CRLF);
}

#[cfg(test)]
mod tests {
    use super::{decode, encode_command, FrameError, Value};

    #[test]
    fn encodes_commands_as_bulk_arrays() {
        let encoded = encode_command(&["SUBSCRIBE", "news"]);
        assert_eq!(encoded, b"*2\r\n$9\r\nSUBSCRIBE\r\n$4\r\nnews\r\n".to_vec());
    }

    #[test]
    fn decodes_subscription_ack() {
        let frame = b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n";
        let (value, used) = decode(frame).expect("valid frame").expect("complete");
        assert_eq!(used, frame.len());
        assert_eq!(
            value,
            Value::Array(vec![
                Value::bulk("subscribe"),
                Value::bulk("news"),
                Value::Integer(1),
            ])
        );
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let frame = b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$5\r\nhel";
        assert_eq!(decode(frame), Ok(None));
        assert_eq!(decode(b"$5\r\nhello"), Ok(None));
        assert_eq!(decode(b":12"), Ok(None));
        assert_eq!(decode(b""), Ok(None));
    }

    #[test]
    fn binary_payloads_survive_untouched() {
        let payload = vec![0u8, 13, 10, 255, 42];
        let encoded = Value::Bulk(payload.clone()).encode();
        let (value, _) = decode(&encoded).expect("valid").expect("complete");
        assert_eq!(value, Value::Bulk(payload));
    }

    #[test]
    fn decodes_nil_and_error_replies() {
        assert_eq!(decode(b"$-1\r\n"), Ok(Some((Value::Nil, 5))));
        assert_eq!(decode(b"*-1\r\n"), Ok(Some((Value::Nil, 5))));
        let (value, _) = decode(b"-NOAUTH Authentication required.\r\n")
            .expect("valid")
            .expect("complete");
        assert_eq!(
            value,
            Value::Error("NOAUTH Authentication required.".to_string())
        );
    }

    #[test]
    fn leaves_trailing_bytes_for_the_next_frame() {
        let buf = b"+OK\r\n:3\r\n";
        let (first, used) = decode(buf).expect("valid").expect("complete");
        assert_eq!(first, Value::Simple("OK".to_string()));
        let (second, _) = decode(&buf[used..]).expect("valid").expect("complete");
        assert_eq!(second, Value::Integer(3));
    }

    #[test]
    fn rejects_malformed_frames() {
        assert_eq!(decode(b"?what\r\n"), Err(FrameError::UnknownType(b'?')));
        assert!(matches!(
            decode(b"$abc\r\n"),
            Err(FrameError::InvalidNumber(_))
        ));
        assert_eq!(
            decode(b"$3\r\nabcXY"),
            Err(FrameError::MissingTerminator)
        );
    }
}
