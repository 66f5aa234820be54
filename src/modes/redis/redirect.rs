/// Cluster redirections (MOVED and ASK)
///
/// Replies are scanned with Aho-Corasick on the raw bytes, so a redirect is
/// recognised without decoding the reply first.
use crate::error::RedisError;
use crate::utils::split_host_port;
use aho_corasick::AhoCorasick;
use bytes::Bytes;
use lazy_static::lazy_static;

/// Redirections followed per command before giving up
pub const MAX_REDIRECTIONS: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectType {
    /// Slot has a new owner
    Moved { slot: u16, address: String },
    /// Slot is migrating; retry once on the target after ASKING
    Ask { slot: u16, address: String },
}

impl RedirectType {
    pub fn address(&self) -> &str {
        match self {
            RedirectType::Moved { address, .. } | RedirectType::Ask { address, .. } => address,
        }
    }

    pub fn slot(&self) -> u16 {
        match self {
            RedirectType::Moved { slot, .. } | RedirectType::Ask { slot, .. } => *slot,
        }
    }
}

const BYTE_SPACE: u8 = b' ';
const PATTERNS: &[&str] = &["ASK", "MOVED"];
const ASK_PATTERN: u32 = 0;

lazy_static! {
    static ref FINDER: AhoCorasick =
        AhoCorasick::new(PATTERNS).expect("redirect patterns are valid");
}

pub struct RedirectParser;

impl RedirectParser {
    /// Parse a full reply such as `-MOVED 3999 127.0.0.1:6381\r\n`
    pub fn parse_redirect_raw(response: &[u8]) -> Option<RedirectType> {
        match response.split_first() {
            Some((b'-', body)) => Self::parse_body(body),
            _ => None,
        }
    }

    /// Error message body such as `MOVED 3999 127.0.0.1:6381`
    fn parse_body(data: &[u8]) -> Option<RedirectType> {
        let mat = FINDER.find(data)?;
        if mat.start() != 0 {
            return None;
        }

        let end = mat.end();
        if data.get(end) != Some(&BYTE_SPACE) {
            return None;
        }

        let rdata = &data[end + 1..];
        let pos = rdata.iter().position(|&x| x == BYTE_SPACE)?;
        let slot = btoi::btoi::<u16>(&rdata[..pos]).ok()?;

        let to = String::from_utf8_lossy(&rdata[pos + 1..]);
        let address = to.trim_end_matches(['\r', '\n']).to_string();
        if address.is_empty() {
            return None;
        }

        if mat.pattern().as_u32() == ASK_PATTERN {
            Some(RedirectType::Ask { slot, address })
        } else {
            Some(RedirectType::Moved { slot, address })
        }
    }
}

/// Redirect budget and trail for one command
#[derive(Debug, Clone)]
pub struct RedirectionContext {
    pub redirect_count: u8,
    pub max_redirects: u8,
    pub redirect_chain: Vec<String>,
}

impl RedirectionContext {
    pub fn new(max_redirects: u8) -> Self {
        Self {
            redirect_count: 0,
            max_redirects,
            redirect_chain: Vec::new(),
        }
    }

    /// Record a hop to `target`; fails once the budget is spent
    pub fn add_redirect(&mut self, target: &str) -> Result<(), RedisError> {
        if self.redirect_count >= self.max_redirects {
            return Err(RedisError::TooManyRedirections {
                count: self.redirect_count + 1,
            });
        }

        self.redirect_count += 1;
        self.redirect_chain.push(target.to_string());
        Ok(())
    }
}

/// `ASKING` as a RESP command
pub fn asking_command() -> Bytes {
    Bytes::from_static(b"*1\r\n$6\r\nASKING\r\n")
}

/// `READONLY` as a RESP command, enabling reads on a replica connection
pub fn readonly_command() -> Bytes {
    Bytes::from_static(b"*1\r\n$8\r\nREADONLY\r\n")
}

/// Redirect target with an empty host (`:6380`) means the host of the node
/// that sent the redirect
pub fn resolve_redirect_target(target: &str, current: &str) -> String {
    match (target.strip_prefix(':'), split_host_port(current)) {
        (Some(port), Some((host, _))) => format!("{}:{}", host, port),
        _ => target.to_string(),
    }
}

pub fn validate_node_address(address: &str) -> Result<(), RedisError> {
    match split_host_port(address) {
        Some((host, _)) if !host.is_empty() => Ok(()),
        _ => Err(RedisError::cluster(format!(
            "invalid node address '{}'",
            address
        ))),
    }
}
