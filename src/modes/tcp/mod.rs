/// Raw TCP mode
///
/// Byte-level passthrough to a rotating set of peers. New connections pick a
/// backend through the configured rotation and fail over to the next peer in
/// order when the pick cannot be dialed.
pub mod balancer;

use crate::config::{ServerConfig, TcpRouteConfig};
use crate::core::handler::ProxyStrategy;
use crate::core::pool::{ConnectionPool, TcpConnector};
use crate::core::proxy::{proxy_session, Passthrough, SessionContext};
use crate::core::Backend;
use crate::error::{UmbralError, UmbralResult};
use async_trait::async_trait;
use balancer::{algorithm, LoadBalancingAlgorithm};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct TcpStrategy {
    config: TcpRouteConfig,
    max_connections: usize,
    connect_timeout: Duration,
    balancer: Box<dyn LoadBalancingAlgorithm>,
    pool: Mutex<Option<Arc<ConnectionPool<TcpConnector>>>>,
}

impl TcpStrategy {
    pub fn new(config: TcpRouteConfig, server: &ServerConfig) -> Self {
        let balancer = algorithm(config.algorithm);
        Self {
            config,
            max_connections: server.max_connections_per_route,
            connect_timeout: server.connection_timeout(),
            balancer,
            pool: Mutex::new(None),
        }
    }

    fn backends(&self) -> &[Backend] {
        &self.config.common.backends
    }
}

#[async_trait]
impl ProxyStrategy for TcpStrategy {
    fn protocol(&self) -> &'static str {
        "tcp"
    }

    async fn start(&self, _cancel: CancellationToken) -> UmbralResult<()> {
        if self.backends().is_empty() {
            return Err(UmbralError::backend("no backends configured for TCP route"));
        }

        let keys: Vec<String> = self.backends().iter().map(Backend::key).collect();
        let pool = Arc::new(ConnectionPool::new(
            TcpConnector::new(self.connect_timeout),
            &keys,
            self.max_connections,
        ));
        info!(
            "TCP route {} ready with {} backends ({:?})",
            self.config.common.name,
            keys.len(),
            self.config.algorithm
        );
        *self.pool.lock() = Some(pool);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(pool) = self.pool.lock().take() {
            pool.close();
        }
    }

    async fn serve(
        &self,
        mut client: TcpStream,
        peer: SocketAddr,
        ctx: &SessionContext,
    ) -> UmbralResult<()> {
        let pool = self
            .pool
            .lock()
            .clone()
            .ok_or_else(|| UmbralError::internal("TCP strategy is not started"))?;

        let backends = self.backends();
        let first = self
            .balancer
            .select_backend(backends)
            .ok_or_else(|| UmbralError::no_healthy_backend("TCP"))?;

        for offset in 0..backends.len() {
            let key = backends[(first + offset) % backends.len()].key();
            let mut conn = match pool.get(&key).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("TCP backend {} unavailable for {}: {}", key, peer, e);
                    ctx.stats.backend_error();
                    ctx.metrics.backend_error(&ctx.route, &key);
                    continue;
                }
            };

            debug!("TCP client {} routed to {} on {}", peer, key, ctx.route);
            let stats = proxy_session(&mut client, &mut *conn, &Passthrough, ctx).await?;
            debug!(
                "TCP session {} via {} ended after {} ms",
                peer, key, stats.connection_duration_ms
            );
            return Ok(());
        }

        Err(UmbralError::no_healthy_backend("TCP"))
    }
}
