/// Galera cluster mode
///
/// Clients complete a MySQL handshake with the proxy, then each connection
/// is pinned to one node picked from the health monitor's current view. The
/// backend connection comes from a per-node pool, already logged in with the
/// node's credentials, and the session runs through the shared proxy loop
/// with COM_QUERY inspection.
pub mod backend;
pub mod handshake;
pub mod selector;

use crate::config::{GaleraRouteConfig, ServerConfig};
use crate::core::handler::ProxyStrategy;
use crate::core::pool::{ConnectionPool, Connector};
use crate::core::proxy::{proxy_session, send_error, SessionContext};
use crate::core::Backend;
use crate::error::{UmbralError, UmbralResult};
use crate::health::galera::{
    HealthMonitor, MonitorConfig, NodeInfo, StatusProbe, WsrepStatusQuery,
};
use async_trait::async_trait;
use backend::{select_database, MysqlConnector};
use handshake::{perform_handshake, Greeting, MysqlInspector};
use parking_lot::Mutex;
use selector::{BackendSelector, SelectionPolicy};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const NO_HEALTHY_NODE: &str = "No healthy Galera node available";
const BACKEND_FAILED: &str = "Backend connection failed";

struct GaleraRuntime<K: Connector> {
    pool: Arc<ConnectionPool<K>>,
    monitor: Arc<HealthMonitor>,
    monitor_cancel: CancellationToken,
    monitor_task: JoinHandle<()>,
}

pub struct GaleraStrategy<K: Connector = MysqlConnector> {
    config: GaleraRouteConfig,
    max_connections: usize,
    connector: Arc<K>,
    probe: Arc<dyn StatusProbe>,
    selector: BackendSelector,
    connection_ids: AtomicU32,
    runtime: Mutex<Option<GaleraRuntime<SharedConnector<K>>>>,
}

/// Lets one connector outlive a stop/start cycle
pub struct SharedConnector<K>(Arc<K>);

#[async_trait]
impl<K: Connector> Connector for SharedConnector<K> {
    type Conn = K::Conn;

    async fn connect(&self, key: &str) -> Result<Self::Conn, crate::core::pool::PoolError> {
        self.0.connect(key).await
    }
}

impl GaleraStrategy<MysqlConnector> {
    pub fn new(config: GaleraRouteConfig, server: &ServerConfig) -> Self {
        let timeout = server.connection_timeout();
        let connector = MysqlConnector::new(&config.common.backends, timeout);
        Self::with_connector(
            config,
            server.max_connections_per_route,
            connector,
            Arc::new(WsrepStatusQuery::new(timeout)),
        )
    }
}

impl<K> GaleraStrategy<K>
where
    K: Connector,
    K::Conn: AsyncRead + AsyncWrite + Unpin,
{
    pub fn with_connector(
        config: GaleraRouteConfig,
        max_connections: usize,
        connector: K,
        probe: Arc<dyn StatusProbe>,
    ) -> Self {
        let policy = SelectionPolicy {
            read_only_nodes: config.read_only_nodes,
            weighted: config.node_weight_enabled,
        };
        Self {
            config,
            max_connections,
            connector: Arc::new(connector),
            probe,
            selector: BackendSelector::new(policy),
            connection_ids: AtomicU32::new(1),
            runtime: Mutex::new(None),
        }
    }

    /// Replace the selector, e.g. with a seeded one
    pub fn with_selector(mut self, selector: BackendSelector) -> Self {
        self.selector = selector;
        self
    }

    fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: self.config.health_check_interval(),
            error_threshold: self.config.max_consecutive_errors,
            probe_timeout: self.config.health_check_interval(),
            flow_control_threshold: self.config.flow_control_threshold,
        }
    }

    fn running(&self) -> Option<(Arc<ConnectionPool<SharedConnector<K>>>, Arc<HealthMonitor>)> {
        self.runtime
            .lock()
            .as_ref()
            .map(|runtime| (runtime.pool.clone(), runtime.monitor.clone()))
    }

    /// Node for a new session. With write balancing off every session goes
    /// to the first writable node so the cluster sees a single writer.
    fn pick_backend(&self, monitor: &HealthMonitor) -> Option<Backend> {
        let nodes = monitor.nodes().read();
        if !self.config.write_balancing {
            let now = Instant::now();
            if let Some(node) = nodes.values().find(|node| node.can_serve_writes_at(now)) {
                return Some(node.backend.clone());
            }
        }
        self.selector.select(&nodes, false)
    }

    /// Every node as last seen by the monitor; empty while stopped
    pub fn cluster_status(&self) -> Vec<NodeInfo> {
        self.running()
            .map(|(_, monitor)| monitor.cluster_status())
            .unwrap_or_default()
    }

    pub fn healthy_nodes(&self, for_writes: bool) -> Vec<NodeInfo> {
        self.running()
            .map(|(_, monitor)| monitor.healthy_nodes(for_writes))
            .unwrap_or_default()
    }

    async fn serve_stream<C>(&self, client: &mut C, ctx: &SessionContext) -> UmbralResult<()>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (pool, monitor) = self
            .running()
            .ok_or_else(|| UmbralError::internal("Galera strategy is not started"))?;

        let greeting = Greeting::new(self.connection_ids.fetch_add(1, Ordering::Relaxed));
        let identity = perform_handshake(client, &greeting).await?;
        debug!(
            "Galera client authenticated as {:?} (database {:?}) on {}",
            identity.user, identity.database, ctx.route
        );

        let Some(backend) = self.pick_backend(&monitor) else {
            error!("{} for route {}", NO_HEALTHY_NODE, ctx.route);
            send_error(client, &MysqlInspector, NO_HEALTHY_NODE).await;
            return Err(UmbralError::no_healthy_backend("Galera"));
        };

        let key = backend.key();
        let mut conn = match pool.get(&key).await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Failed to connect to Galera node {}: {}", key, e);
                ctx.stats.backend_error();
                ctx.metrics.backend_error(&ctx.route, &key);
                send_error(client, &MysqlInspector, BACKEND_FAILED).await;
                return Err(e.into());
            }
        };

        if !identity.database.is_empty() && identity.database != backend.database {
            if let Err(e) = select_database(&mut *conn, &identity.database).await {
                warn!(
                    "Galera node {} refused database {:?}: {}",
                    key, identity.database, e
                );
                send_error(client, &MysqlInspector, &e.to_string()).await;
                return Err(e);
            }
        }

        // The backend session carries client state, so it is closed rather
        // than returned to the idle list
        let stats = proxy_session(client, &mut *conn, &MysqlInspector, ctx).await?;
        debug!(
            "Galera session on {} via {} ended: {} bytes up, {} bytes down",
            ctx.route, key, stats.bytes_client_to_backend, stats.bytes_backend_to_client
        );
        Ok(())
    }
}

#[async_trait]
impl<K> ProxyStrategy for GaleraStrategy<K>
where
    K: Connector,
    K::Conn: AsyncRead + AsyncWrite + Unpin,
{
    fn protocol(&self) -> &'static str {
        "galera"
    }

    async fn start(&self, cancel: CancellationToken) -> UmbralResult<()> {
        let backends = &self.config.common.backends;
        if backends.is_empty() {
            return Err(UmbralError::backend("no backends configured for Galera cluster"));
        }

        let keys: Vec<String> = backends.iter().map(Backend::key).collect();
        let pool = Arc::new(ConnectionPool::new(
            SharedConnector(self.connector.clone()),
            &keys,
            self.max_connections,
        ));
        for key in &keys {
            info!(
                "Galera backend pool initialized for {} (max {} connections)",
                key,
                pool.per_backend()
            );
        }

        let monitor = Arc::new(HealthMonitor::new(
            backends,
            self.probe.clone(),
            self.monitor_config(),
        ));
        let monitor_cancel = cancel.child_token();
        let monitor_task = monitor.spawn(monitor_cancel.clone());

        let previous = self.runtime.lock().replace(GaleraRuntime {
            pool,
            monitor,
            monitor_cancel,
            monitor_task,
        });
        if let Some(previous) = previous {
            warn!("Galera route {} restarted without stop", self.config.common.name);
            previous.monitor_cancel.cancel();
            previous.pool.close();
        }
        Ok(())
    }

    async fn stop(&self) {
        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            runtime.monitor_cancel.cancel();
            runtime.pool.close();
            if tokio::time::timeout(Duration::from_secs(5), runtime.monitor_task)
                .await
                .is_err()
            {
                warn!("Galera health monitor for {} did not stop in time", self.config.common.name);
            }
        }
    }

    async fn serve(
        &self,
        mut client: TcpStream,
        peer: SocketAddr,
        ctx: &SessionContext,
    ) -> UmbralResult<()> {
        debug!("Galera client {} connected to {}", peer, ctx.route);
        self.serve_stream(&mut client, ctx).await
    }
}
