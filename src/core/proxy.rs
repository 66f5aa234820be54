/// Bidirectional client/backend forwarding with a per-message inspection hook
///
/// Client messages pass the query-rate limiter, then the security checker
/// (when one is configured and the inspector can extract query text), and
/// are then forwarded unchanged. Backend bytes are passed straight through.
/// Any read or write error tears down both sides.
use crate::core::metrics::{HandlerStats, MetricsSink};
use crate::core::ratelimit::RateLimiter;
use crate::core::security::SecurityChecker;
use crate::error::{UmbralError, UmbralResult};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const BUFFER_SIZE: usize = 16 * 1024;

/// Protocol hooks used by [`proxy_session`]
pub trait MessageInspector: Send + Sync {
    /// Query text carried by a client message, if it carries one
    fn query_text<'a>(&self, message: &'a [u8]) -> Option<Cow<'a, str>>;

    /// Whether the query mutates data
    fn is_write(&self, query: &str) -> bool;

    /// Protocol-native error reply; `None` closes without replying
    fn error_reply(&self, message: &str) -> Option<Vec<u8>>;
}

/// Opaque byte stream with no query semantics
#[derive(Debug, Default)]
pub struct Passthrough;

impl MessageInspector for Passthrough {
    fn query_text<'a>(&self, _message: &'a [u8]) -> Option<Cow<'a, str>> {
        None
    }

    fn is_write(&self, _query: &str) -> bool {
        false
    }

    fn error_reply(&self, _message: &str) -> Option<Vec<u8>> {
        None
    }
}

/// Everything a connection needs from its handler
#[derive(Clone)]
pub struct SessionContext {
    pub route: String,
    pub cancel: CancellationToken,
    pub query_limiter: Arc<RateLimiter>,
    pub security: Option<Arc<dyn SecurityChecker>>,
    pub stats: Arc<HandlerStats>,
    pub metrics: Arc<dyn MetricsSink>,
}

/// Totals for one proxied session
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub bytes_client_to_backend: u64,
    pub bytes_backend_to_client: u64,
    pub packets_client_to_backend: u64,
    pub packets_backend_to_client: u64,
    pub connection_duration_ms: u64,
}

/// Write a protocol error to the client, ignoring write failures
pub async fn send_error<C, I>(client: &mut C, inspector: &I, message: &str)
where
    C: AsyncWrite + Unpin,
    I: MessageInspector + ?Sized,
{
    if let Some(reply) = inspector.error_reply(message) {
        if let Err(e) = client.write_all(&reply).await {
            debug!("Failed to send error reply to client: {}", e);
        }
    }
}

/// Run the proxy loop until either side closes, an error occurs, a message
/// is rejected, or the session is cancelled
pub async fn proxy_session<C, B, I>(
    client: &mut C,
    backend: &mut B,
    inspector: &I,
    ctx: &SessionContext,
) -> UmbralResult<ConnectionStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
    I: MessageInspector + ?Sized,
{
    let start = Instant::now();
    let mut stats = ConnectionStats::default();
    let mut client_buf = vec![0u8; BUFFER_SIZE];
    let mut backend_buf = vec![0u8; BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                debug!("Session on route {} cancelled", ctx.route);
                break;
            }
            read = client.read(&mut client_buf) => {
                let n = read?;
                if n == 0 {
                    debug!("Client closed connection on route {}", ctx.route);
                    break;
                }
                let message = &client_buf[..n];

                if !ctx.query_limiter.allow() {
                    warn!("Query rate limit exceeded on route {}", ctx.route);
                    send_error(client, inspector, "Query rate limit exceeded").await;
                    return Err(UmbralError::rate_limited("Query"));
                }

                if let Some(query) = inspector.query_text(message) {
                    if let Some(checker) = &ctx.security {
                        if let Some(reason) = checker.check_query(&query) {
                            warn!("Blocked query on route {}: {}", ctx.route, reason);
                            ctx.stats.query_blocked();
                            ctx.metrics.query_blocked(&ctx.route);
                            send_error(client, inspector, "Query blocked by security policy").await;
                            return Err(UmbralError::blocked(reason));
                        }
                    }

                    let is_write = inspector.is_write(&query);
                    ctx.stats.query(is_write);
                    ctx.metrics.query(&ctx.route, is_write);
                }

                backend.write_all(message).await?;
                stats.bytes_client_to_backend += n as u64;
                stats.packets_client_to_backend += 1;
                ctx.stats.bytes_to_backend(n);
            }
            read = backend.read(&mut backend_buf) => {
                let n = read?;
                if n == 0 {
                    debug!("Backend closed connection on route {}", ctx.route);
                    break;
                }

                client.write_all(&backend_buf[..n]).await?;
                stats.bytes_backend_to_client += n as u64;
                stats.packets_backend_to_client += 1;
                ctx.stats.bytes_to_client(n);
            }
        }
    }

    stats.connection_duration_ms = start.elapsed().as_millis() as u64;
    Ok(stats)
}
