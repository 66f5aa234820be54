/// Redis Cluster mode
///
/// Clients talk to the proxy as if it were a single Redis server. Each
/// command is routed by hash slot through the tracker's current topology,
/// executed on a pooled node connection, and its reply relayed unchanged.
/// MOVED and ASK replies are followed inline, up to
/// [`redirect::MAX_REDIRECTIONS`] hops per command.
pub mod executor;
pub mod redirect;
pub mod resp;
pub mod slots;
pub mod topology;

use crate::config::{RedisClusterRouteConfig, ServerConfig};
use crate::core::handler::ProxyStrategy;
use crate::core::pool::{ConnectionPool, TcpConnector};
use crate::core::proxy::SessionContext;
use crate::core::security::is_blocked_redis_command;
use crate::core::Backend;
use crate::error::{UmbralError, UmbralResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use executor::{CommandExecutor, Prelude, Reply};
use log::{debug, warn};
use parking_lot::Mutex;
use redirect::{
    resolve_redirect_target, validate_node_address, RedirectParser, RedirectType,
    RedirectionContext, MAX_REDIRECTIONS,
};
use resp::{RespEncoder, RespParseError, RespParser, RespValue};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use topology::{ClusterStats, ClusterTopologyTracker, TrackerSettings};

const RATE_LIMITED: &str = "Query rate limit exceeded";
const BLOCKED: &str = "Command blocked by security policy";
/// Longest inline command accepted without a newline
const MAX_INLINE_LEN: usize = 64 * 1024;

/// Commands whose first argument is not a key
const KEYLESS_COMMANDS: &[&str] = &[
    "PING", "ECHO", "INFO", "TIME", "DBSIZE", "COMMAND", "RANDOMKEY", "LASTSAVE", "ROLE",
    "SELECT", "AUTH", "HELLO", "MULTI", "EXEC", "DISCARD", "WAIT", "SCAN", "KEYS",
];

/// One client command
#[derive(Debug, Clone, PartialEq)]
pub struct RedisCommand {
    /// Upper-cased command name
    pub name: String,
    pub args: Vec<Bytes>,
    pub is_read: bool,
}

impl RedisCommand {
    pub fn new(name: &str, args: Vec<Bytes>) -> Self {
        let name = name.to_ascii_uppercase();
        let is_read = is_readonly_command(&name);
        Self {
            name,
            args,
            is_read,
        }
    }

    /// Parse an inline command such as `GET user:1`
    pub fn parse_inline(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let name = parts.next()?;
        let args = parts
            .map(|part| Bytes::copy_from_slice(part.as_bytes()))
            .collect();
        Some(Self::new(name, args))
    }

    /// Build from a RESP array of bulk strings
    pub fn from_resp(value: &RespValue) -> Option<Self> {
        let RespValue::Array(Some(elements)) = value else {
            return None;
        };
        let mut parts = elements.iter().map(|element| match element {
            RespValue::BulkString(Some(data)) => Some(data.clone()),
            RespValue::SimpleString(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
            _ => None,
        });
        let name = parts.next()??;
        let args = parts.collect::<Option<Vec<Bytes>>>()?;
        Some(Self::new(&String::from_utf8_lossy(&name), args))
    }

    /// Routing key: the first argument unless the command takes none
    pub fn key(&self) -> Option<&[u8]> {
        if KEYLESS_COMMANDS.contains(&self.name.as_str()) {
            return None;
        }
        self.args.first().map(|arg| arg.as_ref())
    }

    pub fn encode(&self) -> Bytes {
        RespEncoder::command(
            std::iter::once(self.name.as_bytes()).chain(self.args.iter().map(|arg| arg.as_ref())),
        )
    }
}

/// Commands that may be served by a replica
fn is_readonly_command(command: &str) -> bool {
    matches!(
        command,
        "GET"
            | "MGET"
            | "EXISTS"
            | "TTL"
            | "PTTL"
            | "TYPE"
            | "STRLEN"
            | "LLEN"
            | "LRANGE"
            | "LINDEX"
            | "SCARD"
            | "SMEMBERS"
            | "SISMEMBER"
            | "HGET"
            | "HMGET"
            | "HGETALL"
            | "HLEN"
            | "HEXISTS"
            | "HKEYS"
            | "HVALS"
            | "ZCARD"
            | "ZCOUNT"
            | "ZRANGE"
            | "ZRANGEBYSCORE"
            | "ZRANK"
            | "ZSCORE"
    )
}

/// Take one command off the front of `buf`. RESP arrays and inline lines are
/// both accepted; blank lines are skipped. An array that is not a list of
/// strings is a protocol error.
pub fn take_command(buf: &mut BytesMut) -> Result<Option<RedisCommand>, RespParseError> {
    loop {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };

        if first == b'*' {
            let Some(value) = RespParser::decode(buf)? else {
                return Ok(None);
            };
            return match RedisCommand::from_resp(&value) {
                Some(command) => Ok(Some(command)),
                None => Err(RespParseError::InvalidFormat("invalid command".to_string())),
            };
        }

        let Some(end) = buf.iter().position(|&b| b == b'\n') else {
            if buf.len() > MAX_INLINE_LEN {
                return Err(RespParseError::InvalidFormat(
                    "inline command too long".to_string(),
                ));
            }
            return Ok(None);
        };
        let line = buf.split_to(end + 1);
        if let Some(command) = RedisCommand::parse_inline(&String::from_utf8_lossy(&line)) {
            return Ok(Some(command));
        }
    }
}

struct RedisRuntime {
    tracker: Arc<ClusterTopologyTracker>,
    executor: Arc<CommandExecutor>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct RedisClusterStrategy {
    config: RedisClusterRouteConfig,
    max_connections: usize,
    request_timeout: Duration,
    block_dangerous: bool,
    runtime: Mutex<Option<RedisRuntime>>,
}

impl RedisClusterStrategy {
    pub fn new(config: RedisClusterRouteConfig, server: &ServerConfig, block_dangerous: bool) -> Self {
        Self {
            config,
            max_connections: server.max_connections_per_route,
            request_timeout: server.connection_timeout(),
            block_dangerous,
            runtime: Mutex::new(None),
        }
    }

    fn settings(&self) -> TrackerSettings {
        TrackerSettings {
            refresh_interval: Duration::from_secs(self.config.refresh_interval_sec),
            health_interval: Duration::from_secs(self.config.health_check_interval_sec),
            ping_timeout: Duration::from_millis(self.config.ping_timeout_ms),
        }
    }

    fn running(&self) -> Option<(Arc<ClusterTopologyTracker>, Arc<CommandExecutor>)> {
        self.runtime
            .lock()
            .as_ref()
            .map(|runtime| (runtime.tracker.clone(), runtime.executor.clone()))
    }

    /// Tracker counters; `None` while stopped
    pub fn cluster_stats(&self) -> Option<ClusterStats> {
        self.running().map(|(tracker, _)| tracker.stats())
    }

    async fn serve_stream<C>(&self, client: &mut C, ctx: &SessionContext) -> UmbralResult<()>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (tracker, executor) = self
            .running()
            .ok_or_else(|| UmbralError::internal("Redis cluster strategy is not started"))?;
        let mut buf = BytesMut::with_capacity(4096);

        loop {
            let command = match take_command(&mut buf) {
                Ok(Some(command)) => command,
                Ok(None) => {
                    let read = tokio::select! {
                        _ = ctx.cancel.cancelled() => return Ok(()),
                        read = client.read_buf(&mut buf) => read?,
                    };
                    if read == 0 {
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => {
                    let reply = RespEncoder::error(&format!("Protocol error: {}", e));
                    let _ = client.write_all(&reply).await;
                    return Err(UmbralError::protocol(e.to_string()));
                }
            };

            if command.name == "QUIT" {
                client.write_all(b"+OK\r\n").await?;
                return Ok(());
            }

            let reply = self.handle(&command, &tracker, &executor, ctx).await;
            client.write_all(&reply).await?;
            ctx.stats.bytes_to_client(reply.len());
        }
    }

    async fn handle(
        &self,
        command: &RedisCommand,
        tracker: &ClusterTopologyTracker,
        executor: &CommandExecutor,
        ctx: &SessionContext,
    ) -> Bytes {
        if !ctx.query_limiter.allow() {
            return RespEncoder::error(RATE_LIMITED);
        }

        if self.block_dangerous && is_blocked_redis_command(&command.name) {
            warn!("Blocked Redis command {} on {}", command.name, ctx.route);
            ctx.stats.query_blocked();
            ctx.metrics.query_blocked(&ctx.route);
            return RespEncoder::error(BLOCKED);
        }

        ctx.stats.query(!command.is_read);
        ctx.metrics.query(&ctx.route, !command.is_read);
        tracker.record_request();

        match self.execute(command, tracker, executor, ctx).await {
            Ok(reply) => reply.raw,
            Err(UmbralError::Redis(e)) => RespEncoder::error(&e.to_string()),
            Err(e) => RespEncoder::error(&e.to_string()),
        }
    }

    /// Run `command` on its node, following redirections
    async fn execute(
        &self,
        command: &RedisCommand,
        tracker: &ClusterTopologyTracker,
        executor: &CommandExecutor,
        ctx: &SessionContext,
    ) -> UmbralResult<Reply> {
        let key = command.key();
        let (mut address, mut prelude) = {
            let topology = tracker.topology();
            let node = topology.select_for_command(key, command.is_read)?;
            node.record_request();
            let prelude = (command.is_read && !node.master).then_some(Prelude::ReadOnly);
            (node.address.clone(), prelude)
        };

        let encoded = command.encode();
        let mut redirects = RedirectionContext::new(MAX_REDIRECTIONS);

        loop {
            ctx.stats.bytes_to_backend(encoded.len());
            let reply = match executor.execute(&address, &encoded, prelude.take()).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("Redis command {} failed on {}: {}", command.name, address, e);
                    tracker.record_cluster_error();
                    if let Some(node) = tracker.topology().find_by_address(&address) {
                        node.record_error();
                    }
                    ctx.stats.backend_error();
                    ctx.metrics.backend_error(&ctx.route, &address);
                    return Err(e);
                }
            };

            let Some(redirect) = RedirectParser::parse_redirect_raw(&reply.raw) else {
                return Ok(reply);
            };
            let target = resolve_redirect_target(redirect.address(), &address);

            if let Err(e) = redirects.add_redirect(&target) {
                warn!(
                    "Giving up on {} after {} redirections: {:?}",
                    command.name, redirects.redirect_count, redirects.redirect_chain
                );
                return Err(e.into());
            }
            validate_node_address(&target)?;

            match redirect {
                RedirectType::Moved { slot, .. } => {
                    debug!("Slot {} moved to {}", slot, target);
                    tracker.record_moved();
                    if self.config.refresh_on_moved {
                        tracker.request_refresh();
                    }
                }
                RedirectType::Ask { slot, .. } => {
                    debug!("Slot {} asked to {}", slot, target);
                    tracker.record_ask();
                    prelude = Some(Prelude::Asking);
                }
            }
            address = target;
        }
    }
}

#[async_trait]
impl ProxyStrategy for RedisClusterStrategy {
    fn protocol(&self) -> &'static str {
        "redis_cluster"
    }

    async fn start(&self, cancel: CancellationToken) -> UmbralResult<()> {
        let seeds: Vec<String> = self.config.common.backends.iter().map(Backend::key).collect();
        if seeds.is_empty() {
            return Err(UmbralError::backend("no backends configured for Redis cluster"));
        }
        for seed in &seeds {
            validate_node_address(seed)?;
        }

        let tracker = Arc::new(ClusterTopologyTracker::new(seeds, self.settings()));
        tracker.discover().await;

        let keys: Vec<String> = tracker
            .topology()
            .nodes()
            .iter()
            .map(|node| node.address.clone())
            .collect();
        let pool = Arc::new(ConnectionPool::new(
            TcpConnector::new(self.request_timeout),
            &keys,
            self.max_connections,
        ));
        tracker.attach_pool(pool.clone());
        let executor = Arc::new(CommandExecutor::new(pool, self.request_timeout));

        let tracker_cancel = cancel.child_token();
        let task = tracker.spawn(tracker_cancel.clone());

        let previous = self.runtime.lock().replace(RedisRuntime {
            tracker,
            executor,
            cancel: tracker_cancel,
            task,
        });
        if let Some(previous) = previous {
            warn!("Redis cluster route {} restarted without stop", self.config.common.name);
            previous.cancel.cancel();
            previous.executor.pool().close();
        }
        Ok(())
    }

    async fn stop(&self) {
        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            runtime.cancel.cancel();
            runtime.executor.pool().close();
            if tokio::time::timeout(Duration::from_secs(5), runtime.task)
                .await
                .is_err()
            {
                warn!("Redis cluster tracker for {} did not stop in time", self.config.common.name);
            }
        }
    }

    async fn serve(
        &self,
        mut client: TcpStream,
        peer: SocketAddr,
        ctx: &SessionContext,
    ) -> UmbralResult<()> {
        debug!("Redis client {} connected to {}", peer, ctx.route);
        if let Err(e) = client.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        self.serve_stream(&mut client, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::handler::{Handler, HandlerOptions};
    use crate::core::proxy::tests::test_context;
    use crate::health::redis::tests::fake_node;
    use resp::read_value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{duplex, DuplexStream};

    fn server_config() -> ServerConfig {
        ServerConfig {
            bind_host: "127.0.0.1".to_string(),
            max_connections_per_route: 100,
            connection_timeout_sec: 1,
        }
    }

    fn strategy(seed: SocketAddr, block_dangerous: bool) -> RedisClusterStrategy {
        let backends = vec![Backend::new("127.0.0.1", seed.port())];
        RedisClusterStrategy::new(
            RedisClusterRouteConfig::new("redis-test", 0, backends),
            &server_config(),
            block_dangerous,
        )
    }

    /// Node without cluster support; `reply` answers everything but
    /// `CLUSTER NODES`
    async fn standalone<F>(reply: F) -> SocketAddr
    where
        F: Fn(&[String]) -> Vec<u8> + Send + Sync + 'static,
    {
        fake_node(move |parts| match parts.first().map(String::as_str) {
            Some("CLUSTER") => b"-ERR This instance has cluster support disabled\r\n".to_vec(),
            _ => reply(parts),
        })
        .await
    }

    async fn session(
        strategy: Arc<RedisClusterStrategy>,
        ctx: SessionContext,
    ) -> (DuplexStream, JoinHandle<UmbralResult<()>>) {
        let (client, mut peer) = duplex(64 * 1024);
        let task = tokio::spawn(async move { strategy.serve_stream(&mut peer, &ctx).await });
        (client, task)
    }

    async fn roundtrip(client: &mut DuplexStream, buf: &mut BytesMut, command: &[u8]) -> Bytes {
        client.write_all(command).await.unwrap();
        let (_, raw) = read_value(client, buf).await.unwrap().unwrap();
        raw
    }

    #[test]
    fn test_parse_inline_command() {
        let command = RedisCommand::parse_inline("get user:{42}:name\r\n").unwrap();
        assert_eq!(command.name, "GET");
        assert!(command.is_read);
        assert_eq!(command.key(), Some(&b"user:{42}:name"[..]));
        assert!(RedisCommand::parse_inline("   \r\n").is_none());

        let command = RedisCommand::parse_inline("SET k v").unwrap();
        assert!(!command.is_read);
        assert_eq!(command.encode(), RespEncoder::command(["SET", "k", "v"]));

        let command = RedisCommand::parse_inline("PING hello").unwrap();
        assert_eq!(command.key(), None);
    }

    #[test]
    fn test_take_command_mixed_framing() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\r\nGET a\r\n");
        buf.extend_from_slice(&RespEncoder::command(["hget", "h", "f"]));
        buf.extend_from_slice(b"SET b");

        assert_eq!(take_command(&mut buf).unwrap().unwrap().name, "GET");
        let command = take_command(&mut buf).unwrap().unwrap();
        assert_eq!(command.name, "HGET");
        assert_eq!(command.args.len(), 2);
        assert!(take_command(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"SET b");
    }

    #[test]
    fn test_take_command_rejects_endless_line() {
        let mut buf = BytesMut::from(&vec![b'a'; MAX_INLINE_LEN + 1][..]);
        assert!(take_command(&mut buf).is_err());
    }

    #[test]
    fn test_take_command_rejects_non_command_arrays() {
        let mut buf = BytesMut::from(&b"*0\r\n"[..]);
        assert!(take_command(&mut buf).is_err());

        let mut buf = BytesMut::from(&b"*2\r\n:1\r\n:2\r\n"[..]);
        assert!(take_command(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_empty_array_gets_protocol_error() {
        let node = standalone(|_| b"+OK\r\n".to_vec()).await;
        let strategy = Arc::new(strategy(node, false));
        strategy.start(CancellationToken::new()).await.unwrap();

        let (mut client, task) = session(strategy.clone(), test_context(None, false)).await;
        let mut buf = BytesMut::new();
        let reply = roundtrip(&mut client, &mut buf, b"*0\r\n").await;
        assert!(reply.starts_with(b"-ERR Protocol error"), "{:?}", reply);
        assert!(task.await.unwrap().is_err());
        strategy.stop().await;
    }

    #[tokio::test]
    async fn test_command_relayed_to_owner() {
        let node = standalone(|parts| match parts.first().map(String::as_str) {
            Some("GET") => b"$3\r\nbar\r\n".to_vec(),
            _ => b"+PONG\r\n".to_vec(),
        })
        .await;
        let strategy = Arc::new(strategy(node, false));
        strategy.start(CancellationToken::new()).await.unwrap();
        let ctx = test_context(None, false);
        let stats = ctx.stats.clone();

        let (mut client, _task) = session(strategy.clone(), ctx).await;
        let mut buf = BytesMut::new();
        assert_eq!(&roundtrip(&mut client, &mut buf, b"GET foo\r\n").await[..], b"$3\r\nbar\r\n");

        let cluster = strategy.cluster_stats().unwrap();
        assert!(cluster.single_node_mode);
        assert_eq!(cluster.total_requests, 1);
        assert_eq!(stats.snapshot().queries, 1);
        strategy.stop().await;
    }

    #[tokio::test]
    async fn test_moved_is_followed() {
        let target = standalone(|_| b"$3\r\nbar\r\n".to_vec()).await;
        let moved = format!("-MOVED 12182 {}\r\n", target);
        let origin = standalone(move |_| moved.clone().into_bytes()).await;

        let strategy = Arc::new(strategy(origin, false));
        strategy.start(CancellationToken::new()).await.unwrap();

        let (mut client, _task) = session(strategy.clone(), test_context(None, false)).await;
        let mut buf = BytesMut::new();
        assert_eq!(&roundtrip(&mut client, &mut buf, b"GET foo\r\n").await[..], b"$3\r\nbar\r\n");
        assert_eq!(strategy.cluster_stats().unwrap().moved_redirects, 1);
        strategy.stop().await;
    }

    #[tokio::test]
    async fn test_moved_without_host_stays_on_sender_host() {
        let target = standalone(|_| b"$3\r\nbar\r\n".to_vec()).await;
        let moved = format!("-MOVED 12182 :{}\r\n", target.port());
        let origin = standalone(move |_| moved.clone().into_bytes()).await;

        let strategy = Arc::new(strategy(origin, false));
        strategy.start(CancellationToken::new()).await.unwrap();

        let (mut client, _task) = session(strategy.clone(), test_context(None, false)).await;
        let mut buf = BytesMut::new();
        assert_eq!(&roundtrip(&mut client, &mut buf, b"GET foo\r\n").await[..], b"$3\r\nbar\r\n");
        assert_eq!(strategy.cluster_stats().unwrap().moved_redirects, 1);
        strategy.stop().await;
    }

    #[tokio::test]
    async fn test_ask_sends_asking_on_target() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let target = standalone(move |parts| {
            record.lock().push(parts.join(" "));
            match parts.first().map(String::as_str) {
                Some("ASKING") => b"+OK\r\n".to_vec(),
                _ => b"$3\r\nbaz\r\n".to_vec(),
            }
        })
        .await;
        let ask = format!("-ASK 12182 {}\r\n", target);
        let origin = standalone(move |_| ask.clone().into_bytes()).await;

        let strategy = Arc::new(strategy(origin, false));
        strategy.start(CancellationToken::new()).await.unwrap();

        let (mut client, _task) = session(strategy.clone(), test_context(None, false)).await;
        let mut buf = BytesMut::new();
        assert_eq!(&roundtrip(&mut client, &mut buf, b"GET foo\r\n").await[..], b"$3\r\nbaz\r\n");
        assert_eq!(*seen.lock(), vec!["ASKING", "GET foo"]);

        let cluster = strategy.cluster_stats().unwrap();
        assert_eq!(cluster.ask_redirects, 1);
        assert_eq!(cluster.moved_redirects, 0);
        assert!(cluster.single_node_mode);
        strategy.stop().await;
    }

    #[tokio::test]
    async fn test_redirect_loop_is_bounded() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let self_address = Arc::new(Mutex::new(String::new()));

        let counter = attempts.clone();
        let address = self_address.clone();
        let node = standalone(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            format!("-MOVED 12182 {}\r\n", address.lock()).into_bytes()
        })
        .await;
        *self_address.lock() = node.to_string();

        let strategy = Arc::new(strategy(node, false));
        strategy.start(CancellationToken::new()).await.unwrap();

        let (mut client, _task) = session(strategy.clone(), test_context(None, false)).await;
        let mut buf = BytesMut::new();
        assert_eq!(
            &roundtrip(&mut client, &mut buf, b"GET foo\r\n").await[..],
            b"-ERR too many redirections\r\n"
        );
        assert_eq!(
            attempts.load(Ordering::SeqCst),
            MAX_REDIRECTIONS as usize + 1
        );
        assert_eq!(
            strategy.cluster_stats().unwrap().moved_redirects,
            MAX_REDIRECTIONS as u64
        );

        // The session survives a failed command
        assert_eq!(
            &roundtrip(&mut client, &mut buf, b"GET foo\r\n").await[..],
            b"-ERR too many redirections\r\n"
        );
        strategy.stop().await;
    }

    #[tokio::test]
    async fn test_dangerous_command_blocked() {
        let node = standalone(|_| b"+OK\r\n".to_vec()).await;
        let strategy = Arc::new(strategy(node, true));
        strategy.start(CancellationToken::new()).await.unwrap();
        let ctx = test_context(None, false);
        let stats = ctx.stats.clone();

        let (mut client, _task) = session(strategy.clone(), ctx).await;
        let mut buf = BytesMut::new();
        assert_eq!(
            &roundtrip(&mut client, &mut buf, b"FLUSHALL\r\n").await[..],
            b"-ERR Command blocked by security policy\r\n"
        );
        assert_eq!(&roundtrip(&mut client, &mut buf, b"SET k v\r\n").await[..], b"+OK\r\n");
        assert_eq!(stats.snapshot().blocked_queries, 1);
        assert_eq!(stats.snapshot().write_queries, 1);
        strategy.stop().await;
    }

    #[tokio::test]
    async fn test_query_rate_limit_replies_and_continues() {
        let node = standalone(|_| b"+OK\r\n".to_vec()).await;
        let strategy = Arc::new(strategy(node, false));
        strategy.start(CancellationToken::new()).await.unwrap();

        let (mut client, _task) = session(strategy.clone(), test_context(Some(1.0), false)).await;
        let mut buf = BytesMut::new();
        assert_eq!(&roundtrip(&mut client, &mut buf, b"SET a 1\r\n").await[..], b"+OK\r\n");
        assert_eq!(
            &roundtrip(&mut client, &mut buf, b"SET b 2\r\n").await[..],
            b"-ERR Query rate limit exceeded\r\n"
        );
        strategy.stop().await;
    }

    #[tokio::test]
    async fn test_quit_ends_session() {
        let node = standalone(|_| b"+OK\r\n".to_vec()).await;
        let strategy = Arc::new(strategy(node, false));
        strategy.start(CancellationToken::new()).await.unwrap();

        let (mut client, task) = session(strategy.clone(), test_context(None, false)).await;
        let mut buf = BytesMut::new();
        assert_eq!(&roundtrip(&mut client, &mut buf, b"QUIT\r\n").await[..], b"+OK\r\n");
        assert!(task.await.unwrap().is_ok());
        strategy.stop().await;
    }

    #[tokio::test]
    async fn test_start_requires_backends() {
        let strategy = RedisClusterStrategy::new(
            RedisClusterRouteConfig::new("redis-test", 0, Vec::new()),
            &server_config(),
            false,
        );
        let err = strategy.start(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("no backends configured"));
        assert!(strategy.cluster_stats().is_none());
    }

    #[tokio::test]
    async fn test_handler_serves_redis_clients() {
        let node = standalone(|parts| match parts.first().map(String::as_str) {
            Some("GET") => b"$2\r\nv1\r\n".to_vec(),
            _ => b"+PONG\r\n".to_vec(),
        })
        .await;
        let handler = Handler::new(
            strategy(node, false),
            HandlerOptions::new("redis-test", "127.0.0.1:0"),
        );
        let cancel = CancellationToken::new();
        let addr = handler.start(&cancel).await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = BytesMut::new();
        client
            .write_all(&RespEncoder::command(["GET", "k"]))
            .await
            .unwrap();
        let (value, _) = read_value(&mut client, &mut buf).await.unwrap().unwrap();
        assert_eq!(value.as_text().as_deref(), Some("v1"));

        handler.stop().await.unwrap();
        assert!(handler.strategy().cluster_stats().is_none());
    }
}
