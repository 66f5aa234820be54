/// RESP (REdis Serialization Protocol) parsing and encoding
///
/// [`RespParser::parse`] works on a borrowed slice and reports how many
/// bytes the value used, so nothing is consumed until a value is complete.
/// Partial arrays and bulk strings simply return `None`.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use std::str;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    SimpleString(String),
    Error(String),
    Integer(i64),
    /// `None` is the null bulk string
    BulkString(Option<Bytes>),
    /// `None` is the null array
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Text of a simple or bulk string reply
    pub fn as_text(&self) -> Option<String> {
        match self {
            RespValue::SimpleString(s) => Some(s.clone()),
            RespValue::BulkString(Some(data)) => Some(String::from_utf8_lossy(data).into_owned()),
            _ => None,
        }
    }
}

pub struct RespParser;

pub struct RespEncoder;

#[derive(Debug, thiserror::Error)]
pub enum RespParseError {
    #[error("Invalid RESP format: {0}")]
    InvalidFormat(String),
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] str::Utf8Error),
    #[error("Invalid integer: {0}")]
    InvalidInteger(#[from] std::num::ParseIntError),
}

/// Deepest array nesting accepted from a peer
const MAX_DEPTH: usize = 32;
/// Matches the server's default proto-max-bulk-len
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

impl RespParser {
    /// Parse one value from the front of `buf`. Returns the value and the
    /// number of bytes it occupied, or `None` if more input is needed.
    pub fn parse(buf: &[u8]) -> Result<Option<(RespValue, usize)>, RespParseError> {
        match FrameScanner::new().scan(buf)? {
            Some(len) => Self::parse_at(&buf[..len], 0, 0),
            None => Ok(None),
        }
    }

    /// Parse and consume one value from `buf`
    pub fn decode(buf: &mut BytesMut) -> Result<Option<RespValue>, RespParseError> {
        match Self::parse(buf)? {
            Some((value, used)) => {
                buf.advance(used);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Parse every complete value in `buf`, leaving any partial tail
    pub fn decode_all(buf: &mut BytesMut) -> Result<Vec<RespValue>, RespParseError> {
        let mut values = Vec::new();
        while let Some(value) = Self::decode(buf)? {
            values.push(value);
        }
        Ok(values)
    }

    fn parse_at(
        buf: &[u8],
        pos: usize,
        depth: usize,
    ) -> Result<Option<(RespValue, usize)>, RespParseError> {
        if depth > MAX_DEPTH {
            return Err(RespParseError::InvalidFormat("nesting too deep".to_string()));
        }
        let Some(&marker) = buf.get(pos) else {
            return Ok(None);
        };
        let Some((line, after_line)) = Self::line(buf, pos + 1) else {
            return Ok(None);
        };

        match marker {
            b'+' => Ok(Some((
                RespValue::SimpleString(str::from_utf8(line)?.to_string()),
                after_line,
            ))),
            b'-' => Ok(Some((
                RespValue::Error(str::from_utf8(line)?.to_string()),
                after_line,
            ))),
            b':' => Ok(Some((
                RespValue::Integer(str::from_utf8(line)?.parse()?),
                after_line,
            ))),
            b'$' => {
                let size: i64 = str::from_utf8(line)?.parse()?;
                if size == -1 {
                    return Ok(Some((RespValue::BulkString(None), after_line)));
                }
                if !(0..=MAX_BULK_LEN).contains(&size) {
                    return Err(RespParseError::InvalidFormat(format!(
                        "invalid bulk string size {}",
                        size
                    )));
                }

                let end = after_line + size as usize;
                if buf.len() < end + 2 {
                    return Ok(None);
                }
                if &buf[end..end + 2] != b"\r\n" {
                    return Err(RespParseError::InvalidFormat(
                        "missing \\r\\n after bulk string".to_string(),
                    ));
                }
                let data = Bytes::copy_from_slice(&buf[after_line..end]);
                Ok(Some((RespValue::BulkString(Some(data)), end + 2)))
            }
            b'*' => {
                let size: i64 = str::from_utf8(line)?.parse()?;
                if size == -1 {
                    return Ok(Some((RespValue::Array(None), after_line)));
                }
                if !(0..=MAX_BULK_LEN).contains(&size) {
                    return Err(RespParseError::InvalidFormat(format!(
                        "invalid array size {}",
                        size
                    )));
                }

                let mut elements = Vec::with_capacity((size as usize).min(1024));
                let mut cursor = after_line;
                for _ in 0..size {
                    match Self::parse_at(buf, cursor, depth + 1)? {
                        Some((element, next)) => {
                            elements.push(element);
                            cursor = next;
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some((RespValue::Array(Some(elements)), cursor)))
            }
            other => Err(RespParseError::InvalidFormat(format!(
                "unknown RESP type byte {:?}",
                other as char
            ))),
        }
    }

    /// Line content starting at `start` and the offset just past its CRLF
    fn line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
        let rest = buf.get(start..)?;
        let end = rest.windows(2).position(|pair| pair == b"\r\n")?;
        Some((&rest[..end], start + end + 2))
    }
}

/// Walks one RESP frame without building values. The scanner remembers
/// where it stopped, so feeding it a growing buffer only examines the
/// bytes that arrived since the last call.
#[derive(Debug, Default)]
pub struct FrameScanner {
    pos: usize,
    /// Elements still owed by each open array, innermost last
    pending: Vec<usize>,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Length of the first complete value in `buf`, or `None` if more input
    /// is needed. `buf` must keep its earlier contents between calls.
    pub fn scan(&mut self, buf: &[u8]) -> Result<Option<usize>, RespParseError> {
        loop {
            if self.pending.len() > MAX_DEPTH {
                return Err(RespParseError::InvalidFormat("nesting too deep".to_string()));
            }
            let Some(&marker) = buf.get(self.pos) else {
                return Ok(None);
            };
            let Some((line, after_line)) = RespParser::line(buf, self.pos + 1) else {
                return Ok(None);
            };

            let next = match marker {
                b'+' | b'-' => {
                    str::from_utf8(line)?;
                    after_line
                }
                b':' => {
                    str::from_utf8(line)?.parse::<i64>()?;
                    after_line
                }
                b'$' => match declared_len(line, "bulk string")? {
                    None => after_line,
                    Some(size) => {
                        let end = after_line + size;
                        if buf.len() < end + 2 {
                            return Ok(None);
                        }
                        if &buf[end..end + 2] != b"\r\n" {
                            return Err(RespParseError::InvalidFormat(
                                "missing \\r\\n after bulk string".to_string(),
                            ));
                        }
                        end + 2
                    }
                },
                b'*' => match declared_len(line, "array")? {
                    Some(count) if count > 0 => {
                        self.pending.push(count);
                        self.pos = after_line;
                        continue;
                    }
                    _ => after_line,
                },
                other => {
                    return Err(RespParseError::InvalidFormat(format!(
                        "unknown RESP type byte {:?}",
                        other as char
                    )))
                }
            };
            self.pos = next;

            // A finished value may also finish every array it closes
            loop {
                match self.pending.last_mut() {
                    None => return Ok(Some(self.pos)),
                    Some(remaining) => {
                        *remaining -= 1;
                        if *remaining > 0 {
                            break;
                        }
                        self.pending.pop();
                    }
                }
            }
        }
    }
}

/// Length from a `$` or `*` header; `None` for the null form
fn declared_len(line: &[u8], kind: &str) -> Result<Option<usize>, RespParseError> {
    let size: i64 = str::from_utf8(line)?.parse()?;
    if size == -1 {
        return Ok(None);
    }
    if !(0..=MAX_BULK_LEN).contains(&size) {
        return Err(RespParseError::InvalidFormat(format!(
            "invalid {} size {}",
            kind, size
        )));
    }
    Ok(Some(size as usize))
}

/// Read one complete value from `reader`, buffering partial input in `buf`.
/// Returns the value with its raw bytes, or `None` on a clean EOF.
pub async fn read_value<R>(reader: &mut R, buf: &mut BytesMut) -> io::Result<Option<(RespValue, Bytes)>>
where
    R: AsyncRead + Unpin,
{
    let mut scanner = FrameScanner::new();
    loop {
        match scanner.scan(buf) {
            Ok(Some(used)) => {
                let raw = buf.split_to(used).freeze();
                return match RespParser::parse_at(&raw, 0, 0) {
                    Ok(Some((value, _))) => Ok(Some((value, raw))),
                    Ok(None) => Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "incomplete RESP frame",
                    )),
                    Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
                };
            }
            Ok(None) => {}
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }

        if reader.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-reply",
            ));
        }
    }
}

impl RespEncoder {
    pub fn encode(value: &RespValue) -> Bytes {
        let mut buf = BytesMut::new();
        Self::encode_into(&mut buf, value);
        buf.freeze()
    }

    pub fn encode_into(buf: &mut BytesMut, value: &RespValue) {
        match value {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::Error(s) => {
                buf.put_u8(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::Integer(n) => {
                buf.put_u8(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::BulkString(Some(data)) => {
                buf.put_u8(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                buf.extend_from_slice(data);
                buf.put_slice(b"\r\n");
            }
            RespValue::BulkString(None) => buf.extend_from_slice(b"$-1\r\n"),
            RespValue::Array(Some(elements)) => {
                buf.put_u8(b'*');
                buf.extend_from_slice(elements.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                for element in elements {
                    Self::encode_into(buf, element);
                }
            }
            RespValue::Array(None) => buf.extend_from_slice(b"*-1\r\n"),
        }
    }

    /// Command as an array of bulk strings
    pub fn command<I, A>(parts: I) -> Bytes
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        let elements = parts
            .into_iter()
            .map(|part| RespValue::BulkString(Some(Bytes::copy_from_slice(part.as_ref()))))
            .collect();
        Self::encode(&RespValue::Array(Some(elements)))
    }

    /// `-ERR message\r\n`
    pub fn error(message: &str) -> Bytes {
        Self::encode(&RespValue::Error(format!("ERR {}", message)))
    }
}
