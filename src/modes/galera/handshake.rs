/// Minimal MySQL wire codec for the Galera listener
///
/// Covers what the proxy itself speaks: the v10 server greeting, the
/// client handshake response (user and schema only), the OK and ERR
/// packets, and COM_QUERY inspection for the proxy loop.
use crate::core::proxy::MessageInspector;
use crate::error::{UmbralError, UmbralResult};
use rand::Rng;
use std::borrow::Cow;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: u8 = 10;
pub const SERVER_VERSION: &str = "5.7.33-umbral";
pub(crate) const AUTH_PLUGIN: &str = "mysql_native_password";

/// Largest payload accepted from a peer
pub const MAX_PACKET: usize = 16 * 1024 * 1024 - 1;

const HEADER_LEN: usize = 4;
/// capability flags + max packet size + charset + filler
const RESPONSE_FIXED_LEN: usize = 4 + 4 + 1 + 23;

pub(crate) const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
pub(crate) const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;

pub(crate) const COM_QUERY: u8 = 0x03;
pub(crate) const ERR_HEADER: u8 = 0xff;
/// ER_HANDSHAKE_ERROR
const ERR_CODE: u16 = 1128;
const SQL_STATE: &[u8] = b"HY000";

/// Prefixes that classify a statement as a write
const WRITE_PREFIXES: &[&str] = &[
    "insert", "update", "delete", "replace", "create", "alter", "drop", "truncate",
];

/// Read one packet, returning its sequence id and payload
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    if len > MAX_PACKET {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("packet of {} bytes exceeds limit", len),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok((header[3], payload))
}

/// Frame `payload` with a length/sequence header
pub fn encode_packet(seq: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
    packet.extend_from_slice(&len.to_le_bytes()[..3]);
    packet.push(seq);
    packet.extend_from_slice(payload);
    packet
}

/// ERR packet with sequence id 1
pub fn error_packet(message: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(9 + message.len());
    payload.push(ERR_HEADER);
    payload.extend_from_slice(&ERR_CODE.to_le_bytes());
    payload.push(b'#');
    payload.extend_from_slice(SQL_STATE);
    payload.extend_from_slice(message.as_bytes());
    encode_packet(1, &payload)
}

/// OK packet acknowledging the handshake
pub fn ok_packet() -> Vec<u8> {
    // header, affected rows, last insert id, status flags, warnings
    encode_packet(2, &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00])
}

/// Server greeting (Protocol::HandshakeV10)
#[derive(Debug, Clone)]
pub struct Greeting {
    pub connection_id: u32,
    pub scramble: [u8; 20],
}

impl Greeting {
    pub fn new(connection_id: u32) -> Self {
        let mut rng = rand::thread_rng();
        let mut scramble = [0u8; 20];
        for byte in scramble.iter_mut() {
            // printable, never NUL
            *byte = rng.gen_range(0x21..0x7f);
        }
        Self {
            connection_id,
            scramble,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(96);
        payload.push(PROTOCOL_VERSION);
        payload.extend_from_slice(SERVER_VERSION.as_bytes());
        payload.push(0);
        payload.extend_from_slice(&self.connection_id.to_le_bytes());
        payload.extend_from_slice(&self.scramble[..8]);
        payload.push(0);
        payload.extend_from_slice(&[0xff, 0xf7]); // capabilities, low
        payload.push(0x21); // utf8_general_ci
        payload.extend_from_slice(&[0x02, 0x00]); // SERVER_STATUS_AUTOCOMMIT
        payload.extend_from_slice(&[0xff, 0x81]); // capabilities, high
        payload.push(21);
        payload.extend_from_slice(&[0u8; 10]);
        payload.extend_from_slice(&self.scramble[8..]);
        payload.push(0);
        payload.extend_from_slice(AUTH_PLUGIN.as_bytes());
        payload.push(0);
        encode_packet(0, &payload)
    }
}

/// Identity carried by the client's handshake response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub user: String,
    pub database: String,
}

pub(crate) fn take_cstr(payload: &[u8], pos: &mut usize) -> String {
    let rest = &payload[(*pos).min(payload.len())..];
    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    *pos += end + 1;
    String::from_utf8_lossy(&rest[..end]).into_owned()
}

pub fn parse_handshake_response(payload: &[u8]) -> UmbralResult<HandshakeResponse> {
    if payload.len() < RESPONSE_FIXED_LEN {
        return Err(UmbralError::protocol("invalid handshake packet: too short"));
    }

    let capabilities = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let mut pos = RESPONSE_FIXED_LEN;
    let user = take_cstr(payload, &mut pos);

    if pos < payload.len() {
        if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let auth_len = payload[pos] as usize;
            pos += 1 + auth_len;
        } else {
            take_cstr(payload, &mut pos);
        }
    }

    let database = if capabilities & CLIENT_CONNECT_WITH_DB != 0 && pos < payload.len() {
        take_cstr(payload, &mut pos)
    } else {
        String::new()
    };

    Ok(HandshakeResponse { user, database })
}

/// Greet the client, read its response and acknowledge it
pub async fn perform_handshake<S>(stream: &mut S, greeting: &Greeting) -> UmbralResult<HandshakeResponse>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&greeting.encode()).await?;

    let (_, payload) = read_packet(stream).await?;
    let response = parse_handshake_response(&payload)?;

    stream.write_all(&ok_packet()).await?;
    Ok(response)
}

pub fn is_write_query(query: &str) -> bool {
    let normalized = query.trim_start();
    WRITE_PREFIXES.iter().any(|prefix| {
        normalized
            .get(..prefix.len())
            .map(|head| head.eq_ignore_ascii_case(prefix))
            .unwrap_or(false)
    })
}

/// Extracts COM_QUERY text from client packets
#[derive(Debug, Default)]
pub struct MysqlInspector;

impl MessageInspector for MysqlInspector {
    fn query_text<'a>(&self, message: &'a [u8]) -> Option<Cow<'a, str>> {
        if message.len() <= HEADER_LEN || message[HEADER_LEN] != COM_QUERY {
            return None;
        }
        let len = u32::from_le_bytes([message[0], message[1], message[2], 0]) as usize;
        let end = (HEADER_LEN + len).min(message.len());
        Some(String::from_utf8_lossy(&message[HEADER_LEN + 1..end]))
    }

    fn is_write(&self, query: &str) -> bool {
        is_write_query(query)
    }

    fn error_reply(&self, message: &str) -> Option<Vec<u8>> {
        Some(error_packet(message))
    }
}
