/// Per-backend connection pooling
///
/// Each backend key (`host:port`) gets a bounded pool. A connection checked
/// out with [`ConnectionPool::get`] belongs to exactly one task until it is
/// either released back with [`PooledConnection::release`] or dropped, which
/// closes it and frees its slot.
use async_trait::async_trait;
use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};
use socket2::SockRef;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Lower bound on per-backend capacity
pub const MIN_CONNECTIONS_PER_BACKEND: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("connection pool exhausted for {key} (max {max})")]
    Exhausted { key: String, max: usize },

    #[error("connection pool unavailable for {key}")]
    Unavailable { key: String },

    #[error("failed to connect to {key}: {source}")]
    Connect {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to {key}")]
    Timeout { key: String },

    #[error("login to {key} failed: {message}")]
    Login { key: String, message: String },
}

/// Backend connection primitive
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Send + 'static;

    async fn connect(&self, key: &str) -> Result<Self::Conn, PoolError>;
}

/// Plain TCP dialer with a connect timeout
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn configure(stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;
        SockRef::from(stream).set_keepalive(true)?;
        Ok(())
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Conn = TcpStream;

    async fn connect(&self, key: &str) -> Result<TcpStream, PoolError> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(key)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(PoolError::Connect {
                    key: key.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(PoolError::Timeout {
                    key: key.to_string(),
                })
            }
        };

        if let Err(e) = Self::configure(&stream) {
            warn!("Failed to configure backend stream {}: {}", key, e);
        }
        Ok(stream)
    }
}

struct BackendPool<C> {
    idle: Mutex<Vec<C>>,
    /// Idle plus checked-out connections
    open: Mutex<usize>,
    created: AtomicU64,
}

impl<C> BackendPool<C> {
    fn new() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            open: Mutex::new(0),
            created: AtomicU64::new(0),
        }
    }

    fn free_slot(&self) {
        let mut open = self.open.lock();
        *open = open.saturating_sub(1);
    }
}

/// Counters for one backend pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub key: String,
    pub open: usize,
    pub idle: usize,
    pub created: u64,
    pub max: usize,
}

pub struct ConnectionPool<K: Connector> {
    connector: K,
    per_backend: usize,
    pools: RwLock<FnvHashMap<String, Arc<BackendPool<K::Conn>>>>,
    closed: AtomicBool,
}

impl<K: Connector> ConnectionPool<K> {
    /// Split `total_max` evenly across `backend_count`, never below the floor
    pub fn capacity_per_backend(total_max: usize, backend_count: usize) -> usize {
        (total_max / backend_count.max(1)).max(MIN_CONNECTIONS_PER_BACKEND)
    }

    pub fn new(connector: K, keys: &[String], total_max: usize) -> Self {
        let per_backend = Self::capacity_per_backend(total_max, keys.len());
        let pools = keys
            .iter()
            .map(|key| (key.clone(), Arc::new(BackendPool::new())))
            .collect();

        Self {
            connector,
            per_backend,
            pools: RwLock::new(pools),
            closed: AtomicBool::new(false),
        }
    }

    pub fn per_backend(&self) -> usize {
        self.per_backend
    }

    fn backend(&self, key: &str) -> Arc<BackendPool<K::Conn>> {
        if let Some(pool) = self.pools.read().get(key) {
            return pool.clone();
        }
        self.pools
            .write()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(BackendPool::new()))
            .clone()
    }

    /// Check out a connection to `key`, dialing a new one when under capacity
    pub async fn get(self: &Arc<Self>, key: &str) -> Result<PooledConnection<K>, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Unavailable {
                key: key.to_string(),
            });
        }

        let backend = self.backend(key);
        let idle = backend.idle.lock().pop();
        if let Some(conn) = idle {
            return Ok(PooledConnection::new(self.clone(), key, backend, conn));
        }

        {
            let mut open = backend.open.lock();
            if *open >= self.per_backend {
                return Err(PoolError::Exhausted {
                    key: key.to_string(),
                    max: self.per_backend,
                });
            }
            *open += 1;
        }

        match self.connector.connect(key).await {
            Ok(conn) => {
                backend.created.fetch_add(1, Ordering::Relaxed);
                debug!("Opened backend connection to {}", key);
                Ok(PooledConnection::new(self.clone(), key, backend, conn))
            }
            Err(e) => {
                backend.free_slot();
                Err(e)
            }
        }
    }

    fn put(&self, backend: &BackendPool<K::Conn>, conn: K::Conn) {
        if self.closed.load(Ordering::Acquire) {
            backend.free_slot();
            return;
        }

        let mut idle = backend.idle.lock();
        if idle.len() >= self.per_backend {
            drop(idle);
            backend.free_slot();
            return;
        }
        idle.push(conn);
    }

    /// Drain every idle connection and refuse further checkouts
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for backend in self.pools.read().values() {
            let drained = std::mem::take(&mut *backend.idle.lock());
            let mut open = backend.open.lock();
            *open = open.saturating_sub(drained.len());
        }
    }

    /// Forget every backend not listed in `keep`, closing its idle
    /// connections. Checked-out connections to a dropped backend close when
    /// they are released. Returns how many backends were dropped.
    pub fn retain(&self, keep: &[String]) -> usize {
        let mut pools = self.pools.write();
        let before = pools.len();
        pools.retain(|key, _| keep.contains(key));
        let dropped = before - pools.len();
        if dropped > 0 {
            debug!("Dropped {} backend pools", dropped);
        }
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self
            .pools
            .read()
            .iter()
            .map(|(key, backend)| PoolStats {
                key: key.clone(),
                open: *backend.open.lock(),
                idle: backend.idle.lock().len(),
                created: backend.created.load(Ordering::Relaxed),
                max: self.per_backend,
            })
            .collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }
}

/// A checked-out backend connection
pub struct PooledConnection<K: Connector> {
    pool: Arc<ConnectionPool<K>>,
    backend: Arc<BackendPool<K::Conn>>,
    key: String,
    conn: Option<K::Conn>,
}

impl<K: Connector> PooledConnection<K> {
    fn new(
        pool: Arc<ConnectionPool<K>>,
        key: &str,
        backend: Arc<BackendPool<K::Conn>>,
        conn: K::Conn,
    ) -> Self {
        Self {
            pool,
            backend,
            key: key.to_string(),
            conn: Some(conn),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Return the connection to the idle list
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(&self.backend, conn);
        }
    }
}

impl<K: Connector> Deref for PooledConnection<K> {
    type Target = K::Conn;

    fn deref(&self) -> &K::Conn {
        // Only `release` and `drop` take the connection, both consume self
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<K: Connector> DerefMut for PooledConnection<K> {
    fn deref_mut(&mut self) -> &mut K::Conn {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<K: Connector> Drop for PooledConnection<K> {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            self.backend.free_slot();
        }
    }
}
