/// Proxy-side login to Galera nodes
///
/// Backend connections authenticate with the node's configured credentials
/// before a session sees them, so clients only ever receive the proxy's own
/// greeting. The health monitor reuses the same login to run
/// `SHOW STATUS LIKE 'wsrep_%'`.
use super::handshake::{
    encode_packet, read_packet, take_cstr, AUTH_PLUGIN, CLIENT_CONNECT_WITH_DB,
    CLIENT_SECURE_CONNECTION, COM_QUERY, ERR_HEADER, MAX_PACKET, PROTOCOL_VERSION,
};
use crate::core::pool::{Connector, PoolError, TcpConnector};
use crate::core::Backend;
use crate::error::{UmbralError, UmbralResult};
use async_trait::async_trait;
use fnv::FnvHashMap;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
const UTF8_GENERAL_CI: u8 = 0x21;
const SCRAMBLE_LEN: usize = 20;

const OK_HEADER: u8 = 0x00;
const EOF_HEADER: u8 = 0xfe;
const AUTH_SWITCH: u8 = 0xfe;
const COM_QUIT: u8 = 0x01;
const COM_INIT_DB: u8 = 0x02;

pub const WSREP_STATUS_QUERY: &str = "SHOW STATUS LIKE 'wsrep_%'";

/// The parts of a node's v10 greeting the login needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerGreeting {
    pub server_version: String,
    pub connection_id: u32,
    pub capabilities: u32,
    pub scramble: Vec<u8>,
    pub auth_plugin: String,
}

pub fn parse_server_greeting(payload: &[u8]) -> UmbralResult<ServerGreeting> {
    match payload.first() {
        Some(&PROTOCOL_VERSION) => {}
        Some(&ERR_HEADER) => return Err(UmbralError::backend(server_error(payload))),
        _ => return Err(UmbralError::protocol("unexpected server greeting")),
    }
    let truncated = || UmbralError::protocol("truncated server greeting");

    let mut pos = 1;
    let server_version = take_cstr(payload, &mut pos);
    // connection id, scramble part 1, filler, capabilities (low)
    let fixed = payload.get(pos..pos + 15).ok_or_else(truncated)?;
    let connection_id = u32::from_le_bytes([fixed[0], fixed[1], fixed[2], fixed[3]]);
    let mut scramble = fixed[4..12].to_vec();
    let mut capabilities = u16::from_le_bytes([fixed[13], fixed[14]]) as u32;
    pos += fixed.len();

    let mut auth_plugin = String::new();
    // charset, status, capabilities (high), auth data length, reserved
    if let Some(extended) = payload.get(pos..pos + 16) {
        capabilities |= (u16::from_le_bytes([extended[3], extended[4]]) as u32) << 16;
        let auth_len = extended[5] as usize;
        pos += extended.len();

        if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let len = auth_len.saturating_sub(8).max(13);
            let part = payload.get(pos..pos + len).ok_or_else(truncated)?;
            scramble.extend_from_slice(part.strip_suffix(&[0]).unwrap_or(part));
            pos += len;
        }
        if capabilities & CLIENT_PLUGIN_AUTH != 0 {
            auth_plugin = take_cstr(payload, &mut pos);
        }
    }

    Ok(ServerGreeting {
        server_version,
        connection_id,
        capabilities,
        scramble,
        auth_plugin,
    })
}

/// `mysql_native_password` response:
/// SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))
pub fn native_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let scramble = &scramble[..scramble.len().min(SCRAMBLE_LEN)];

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(&stage1);
    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(&stage2);
    let mask = hasher.finalize();

    stage1.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect()
}

fn login_payload(backend: &Backend, greeting: &ServerGreeting) -> Vec<u8> {
    let mut capabilities = CLIENT_LONG_PASSWORD
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_PLUGIN_AUTH;
    if !backend.database.is_empty() {
        capabilities |= CLIENT_CONNECT_WITH_DB;
    }
    capabilities &= greeting.capabilities;

    let token = native_password(&backend.password, &greeting.scramble);
    let mut payload = Vec::with_capacity(64 + backend.user.len() + backend.database.len());
    payload.extend_from_slice(&capabilities.to_le_bytes());
    payload.extend_from_slice(&(MAX_PACKET as u32).to_le_bytes());
    payload.push(UTF8_GENERAL_CI);
    payload.extend_from_slice(&[0u8; 23]);
    payload.extend_from_slice(backend.user.as_bytes());
    payload.push(0);
    payload.push(token.len() as u8);
    payload.extend_from_slice(&token);
    if capabilities & CLIENT_CONNECT_WITH_DB != 0 {
        payload.extend_from_slice(backend.database.as_bytes());
        payload.push(0);
    }
    if capabilities & CLIENT_PLUGIN_AUTH != 0 {
        payload.extend_from_slice(AUTH_PLUGIN.as_bytes());
        payload.push(0);
    }
    payload
}

/// `code: message` from an ERR packet payload
fn server_error(payload: &[u8]) -> String {
    let code = match payload.get(1..3) {
        Some(code) => u16::from_le_bytes([code[0], code[1]]),
        None => return "malformed error packet".to_string(),
    };
    let message = match payload.get(3) {
        Some(&b'#') => payload.get(9..).unwrap_or_default(),
        _ => payload.get(3..).unwrap_or_default(),
    };
    format!("{}: {}", code, String::from_utf8_lossy(message))
}

/// Read the node's greeting and log in as `backend.user`. One switch to
/// `mysql_native_password` with a fresh scramble is followed; any other
/// authentication method is refused.
pub async fn login<S>(stream: &mut S, backend: &Backend) -> UmbralResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (seq, payload) = read_packet(stream).await?;
    let greeting = parse_server_greeting(&payload)?;
    let required = CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION;
    if greeting.capabilities & required != required {
        return Err(UmbralError::protocol(format!(
            "server {} does not support 4.1 authentication",
            greeting.server_version
        )));
    }

    let response = login_payload(backend, &greeting);
    stream
        .write_all(&encode_packet(seq.wrapping_add(1), &response))
        .await?;

    let mut switched = false;
    loop {
        let (seq, reply) = read_packet(stream).await?;
        match reply.first() {
            Some(&OK_HEADER) => return Ok(()),
            Some(&ERR_HEADER) => {
                return Err(UmbralError::backend(format!(
                    "login as '{}' rejected: {}",
                    backend.user,
                    server_error(&reply)
                )))
            }
            Some(&AUTH_SWITCH) if !switched => {
                let mut pos = 1;
                let plugin = take_cstr(&reply, &mut pos);
                if plugin != AUTH_PLUGIN {
                    return Err(UmbralError::protocol(format!(
                        "unsupported authentication plugin {}",
                        plugin
                    )));
                }
                let data = reply.get(pos..).unwrap_or_default();
                let scramble = data.strip_suffix(&[0]).unwrap_or(data);
                let token = native_password(&backend.password, scramble);
                stream
                    .write_all(&encode_packet(seq.wrapping_add(1), &token))
                    .await?;
                switched = true;
            }
            _ => {
                return Err(UmbralError::protocol(format!(
                    "unexpected authentication reply from {}",
                    backend.key()
                )))
            }
        }
    }
}

/// Switch the session's default schema
pub async fn select_database<S>(stream: &mut S, database: &str) -> UmbralResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut command = Vec::with_capacity(1 + database.len());
    command.push(COM_INIT_DB);
    command.extend_from_slice(database.as_bytes());
    stream.write_all(&encode_packet(0, &command)).await?;

    let (_, reply) = read_packet(stream).await?;
    match reply.first() {
        Some(&OK_HEADER) => Ok(()),
        Some(&ERR_HEADER) => Err(UmbralError::backend(server_error(&reply))),
        _ => Err(UmbralError::protocol("unexpected reply to COM_INIT_DB")),
    }
}

/// Tell the node the session is over. Failures are ignored.
pub async fn quit<S>(stream: &mut S)
where
    S: AsyncWrite + Unpin,
{
    let _ = stream.write_all(&encode_packet(0, &[COM_QUIT])).await;
}

fn lenenc_int(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let first = *buf.get(*pos)?;
    *pos += 1;
    let width = match first {
        0..=0xfa => return Some(first as u64),
        0xfc => 2,
        0xfd => 3,
        0xfe => 8,
        _ => return None,
    };
    let bytes = buf.get(*pos..*pos + width)?;
    *pos += width;
    Some(bytes.iter().rev().fold(0u64, |acc, &b| (acc << 8) | b as u64))
}

/// Length-encoded string; SQL NULL reads as empty
fn lenenc_str(buf: &[u8], pos: &mut usize) -> Option<String> {
    if buf.get(*pos) == Some(&0xfb) {
        *pos += 1;
        return Some(String::new());
    }
    let len = lenenc_int(buf, pos)? as usize;
    let bytes = buf.get(*pos..*pos + len)?;
    *pos += len;
    Some(String::from_utf8_lossy(bytes).into_owned())
}

fn is_eof(payload: &[u8]) -> bool {
    payload.first() == Some(&EOF_HEADER) && payload.len() < 9
}

/// Run a two-column query such as `SHOW STATUS` and collect its rows as a
/// name/value map
pub async fn query_status<S>(stream: &mut S, sql: &str) -> UmbralResult<HashMap<String, String>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut command = Vec::with_capacity(1 + sql.len());
    command.push(COM_QUERY);
    command.extend_from_slice(sql.as_bytes());
    stream.write_all(&encode_packet(0, &command)).await?;

    let (_, header) = read_packet(stream).await?;
    match header.first() {
        Some(&ERR_HEADER) => return Err(UmbralError::backend(server_error(&header))),
        Some(&OK_HEADER) => return Ok(HashMap::new()),
        _ => {}
    }
    let columns = lenenc_int(&header, &mut 0)
        .ok_or_else(|| UmbralError::protocol("malformed result set header"))?;
    if columns < 2 {
        return Err(UmbralError::protocol(format!(
            "expected two columns from {:?}, got {}",
            sql, columns
        )));
    }

    for _ in 0..columns {
        read_packet(stream).await?;
    }
    let (_, marker) = read_packet(stream).await?;
    if !is_eof(&marker) {
        return Err(UmbralError::protocol("missing end of column definitions"));
    }

    let mut status = HashMap::new();
    loop {
        let (_, row) = read_packet(stream).await?;
        if is_eof(&row) {
            return Ok(status);
        }
        if row.first() == Some(&ERR_HEADER) {
            return Err(UmbralError::backend(server_error(&row)));
        }

        let mut pos = 0;
        match (lenenc_str(&row, &mut pos), lenenc_str(&row, &mut pos)) {
            (Some(name), Some(value)) => {
                status.insert(name, value);
            }
            _ => return Err(UmbralError::protocol("malformed status row")),
        }
    }
}

/// Dials a node and logs in with that node's credentials. Keys without a
/// configured backend are refused.
pub struct MysqlConnector {
    tcp: TcpConnector,
    login_timeout: Duration,
    backends: FnvHashMap<String, Backend>,
}

impl MysqlConnector {
    pub fn new(backends: &[Backend], login_timeout: Duration) -> Self {
        Self {
            tcp: TcpConnector::new(login_timeout),
            login_timeout,
            backends: backends
                .iter()
                .map(|backend| (backend.key(), backend.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl Connector for MysqlConnector {
    type Conn = TcpStream;

    async fn connect(&self, key: &str) -> Result<TcpStream, PoolError> {
        let backend = self.backends.get(key).ok_or_else(|| PoolError::Unavailable {
            key: key.to_string(),
        })?;
        let mut stream = self.tcp.connect(key).await?;

        match timeout(self.login_timeout, login(&mut stream, backend)).await {
            Ok(Ok(())) => {
                debug!("Logged in to Galera node {} as '{}'", key, backend.user);
                Ok(stream)
            }
            Ok(Err(e)) => Err(PoolError::Login {
                key: key.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(PoolError::Timeout {
                key: key.to_string(),
            }),
        }
    }
}
