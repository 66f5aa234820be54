/// Listener lifecycle shared by every protocol
///
/// A [`Handler`] owns one listening socket and moves through
/// `Stopped -> Starting -> Running -> Stopping -> Stopped`. Protocol specifics
/// live in a [`ProxyStrategy`]: the strategy acquires backend resources before
/// the listener opens, serves each accepted connection, and releases its
/// resources on stop.
use crate::core::metrics::{HandlerStats, MetricsSink, NoopMetrics, StatsSnapshot};
use crate::core::proxy::SessionContext;
use crate::core::ratelimit::RateLimiter;
use crate::core::security::SecurityChecker;
use crate::error::{ErrorSeverity, UmbralError, UmbralResult};
use crate::utils::generate_id;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Protocol-specific half of a handler
#[async_trait]
pub trait ProxyStrategy: Send + Sync + 'static {
    fn protocol(&self) -> &'static str;

    /// Acquire pools, monitors and trackers. Background tasks must stop when
    /// `cancel` fires.
    async fn start(&self, cancel: CancellationToken) -> UmbralResult<()>;

    /// Release everything `start` acquired
    async fn stop(&self);

    /// Serve one accepted client until it disconnects or the session ends
    async fn serve(
        &self,
        client: TcpStream,
        peer: SocketAddr,
        ctx: &SessionContext,
    ) -> UmbralResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HandlerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerState::Stopped => write!(f, "stopped"),
            HandlerState::Starting => write!(f, "starting"),
            HandlerState::Running => write!(f, "running"),
            HandlerState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Construction parameters for a [`Handler`]
pub struct HandlerOptions {
    pub name: String,
    pub listen_addr: String,
    /// Accepted connections per second; `None` disables the gate
    pub connection_rate: Option<f64>,
    /// Client messages per second across the handler; `None` disables it
    pub query_rate: Option<f64>,
    pub security: Option<Arc<dyn SecurityChecker>>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl HandlerOptions {
    pub fn new(name: &str, listen_addr: &str) -> Self {
        Self {
            name: name.to_string(),
            listen_addr: listen_addr.to_string(),
            connection_rate: None,
            query_rate: None,
            security: None,
            metrics: Arc::new(NoopMetrics),
        }
    }
}

/// Stats reported by a handler
#[derive(Debug, Clone, Serialize)]
pub struct HandlerSnapshot {
    pub name: String,
    pub protocol: String,
    pub listen_addr: String,
    pub state: HandlerState,
    pub uptime_secs: u64,
    pub stats: StatsSnapshot,
}

struct RunningListener {
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
    started_at: Instant,
}

pub struct Handler<S: ProxyStrategy> {
    name: String,
    listen_addr: String,
    strategy: Arc<S>,
    conn_limiter: Arc<RateLimiter>,
    query_limiter: Arc<RateLimiter>,
    security: Option<Arc<dyn SecurityChecker>>,
    metrics: Arc<dyn MetricsSink>,
    stats: Arc<HandlerStats>,
    state: Mutex<HandlerState>,
    accepting: Arc<AtomicBool>,
    listener: tokio::sync::Mutex<Option<RunningListener>>,
    bound: Mutex<Option<(SocketAddr, Instant)>>,
}

fn limiter(rate: Option<f64>) -> RateLimiter {
    match rate {
        Some(rate) => RateLimiter::per_second(rate),
        None => RateLimiter::unlimited(),
    }
}

impl<S: ProxyStrategy> Handler<S> {
    pub fn new(strategy: S, options: HandlerOptions) -> Self {
        Self {
            name: options.name,
            listen_addr: options.listen_addr,
            strategy: Arc::new(strategy),
            conn_limiter: Arc::new(limiter(options.connection_rate)),
            query_limiter: Arc::new(limiter(options.query_rate)),
            security: options.security,
            metrics: options.metrics,
            stats: Arc::new(HandlerStats::default()),
            state: Mutex::new(HandlerState::Stopped),
            accepting: Arc::new(AtomicBool::new(false)),
            listener: tokio::sync::Mutex::new(None),
            bound: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> &Arc<S> {
        &self.strategy
    }

    pub fn state(&self) -> HandlerState {
        *self.state.lock()
    }

    /// Address the listener is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.lock().map(|(addr, _)| addr)
    }

    fn set_state(&self, state: HandlerState) {
        *self.state.lock() = state;
    }

    /// Start the strategy, bind the listener and spawn the accept loop
    pub async fn start(&self, parent: &CancellationToken) -> UmbralResult<SocketAddr> {
        {
            let mut state = self.state.lock();
            if *state != HandlerState::Stopped {
                return Err(UmbralError::AlreadyRunning {
                    name: self.name.clone(),
                });
            }
            *state = HandlerState::Starting;
        }

        let cancel = parent.child_token();
        if let Err(e) = self.strategy.start(cancel.clone()).await {
            cancel.cancel();
            self.set_state(HandlerState::Stopped);
            return Err(e);
        }

        let (listener, local_addr) = match Self::bind(&self.listen_addr).await {
            Ok(bound) => bound,
            Err(e) => {
                error!("Failed to listen on {} for {}: {}", self.listen_addr, self.name, e);
                cancel.cancel();
                self.strategy.stop().await;
                self.set_state(HandlerState::Stopped);
                return Err(e);
            }
        };

        let ctx = SessionContext {
            route: self.name.clone(),
            cancel: cancel.clone(),
            query_limiter: self.query_limiter.clone(),
            security: self.security.clone(),
            stats: self.stats.clone(),
            metrics: self.metrics.clone(),
        };

        self.accepting.store(true, Ordering::Release);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.strategy.clone(),
            self.conn_limiter.clone(),
            ctx,
            self.accepting.clone(),
        ));

        let started_at = Instant::now();
        *self.listener.lock().await = Some(RunningListener {
            cancel,
            accept_task,
            local_addr,
            started_at,
        });
        *self.bound.lock() = Some((local_addr, started_at));
        self.set_state(HandlerState::Running);

        info!(
            "{} handler {} listening on {}",
            self.strategy.protocol(),
            self.name,
            local_addr
        );
        Ok(local_addr)
    }

    async fn bind(addr: &str) -> UmbralResult<(TcpListener, SocketAddr)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok((listener, local_addr))
    }

    /// Cancel the accept loop and release strategy resources. A handler that
    /// is not running is left untouched.
    pub async fn stop(&self) -> UmbralResult<()> {
        {
            let mut state = self.state.lock();
            if *state != HandlerState::Running {
                return Ok(());
            }
            *state = HandlerState::Stopping;
        }

        self.accepting.store(false, Ordering::Release);
        if let Some(running) = self.listener.lock().await.take() {
            running.cancel.cancel();
            if let Err(e) = running.accept_task.await {
                warn!("Accept loop for {} ended abnormally: {}", self.name, e);
            }
            info!(
                "{} handler {} on {} stopped after {}",
                self.strategy.protocol(),
                self.name,
                running.local_addr,
                crate::utils::format_duration(running.started_at.elapsed())
            );
        }

        self.strategy.stop().await;
        *self.bound.lock() = None;
        self.set_state(HandlerState::Stopped);
        Ok(())
    }

    pub fn stats(&self) -> HandlerSnapshot {
        let bound = *self.bound.lock();
        HandlerSnapshot {
            name: self.name.clone(),
            protocol: self.strategy.protocol().to_string(),
            listen_addr: bound
                .map(|(addr, _)| addr.to_string())
                .unwrap_or_else(|| self.listen_addr.clone()),
            state: self.state(),
            uptime_secs: bound.map(|(_, at)| at.elapsed().as_secs()).unwrap_or(0),
            stats: self.stats.snapshot(),
        }
    }
}

async fn accept_loop<S: ProxyStrategy>(
    listener: TcpListener,
    strategy: Arc<S>,
    conn_limiter: Arc<RateLimiter>,
    ctx: SessionContext,
    accepting: Arc<AtomicBool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                if !accepting.load(Ordering::Acquire) {
                    break;
                }
                error!("Accept error on {}: {}", ctx.route, e);
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };

        if !conn_limiter.allow() {
            warn!("Connection rate limit exceeded on {}, rejecting {}", ctx.route, peer);
            ctx.stats.connection_rejected();
            ctx.metrics.connection_rejected(&ctx.route);
            drop(stream);
            continue;
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let strategy = strategy.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let conn_id = generate_id("conn");
            ctx.stats.connection_opened();
            ctx.metrics.connection_opened(&ctx.route);
            debug!("[{}] accepted {} on {}", conn_id, peer, ctx.route);

            match strategy.serve(stream, peer, &ctx).await {
                Ok(()) => debug!("[{}] connection from {} closed", conn_id, peer),
                Err(e) if e.severity() == ErrorSeverity::Info => {
                    debug!("[{}] connection from {} ended: {}", conn_id, peer, e)
                }
                Err(e) => warn!("[{}] connection from {} failed: {}", conn_id, peer, e),
            }

            ctx.stats.connection_closed();
            ctx.metrics.connection_closed(&ctx.route);
        });
    }

    debug!("Accept loop for {} exited", ctx.route);
}

/// Object-safe view of a handler, used by the manager
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self, parent: &CancellationToken) -> UmbralResult<SocketAddr>;

    async fn stop(&self) -> UmbralResult<()>;

    fn stats(&self) -> HandlerSnapshot;
}

#[async_trait]
impl<S: ProxyStrategy> ProtocolHandler for Handler<S> {
    fn name(&self) -> &str {
        Handler::name(self)
    }

    async fn start(&self, parent: &CancellationToken) -> UmbralResult<SocketAddr> {
        Handler::start(self, parent).await
    }

    async fn stop(&self) -> UmbralResult<()> {
        Handler::stop(self).await
    }

    fn stats(&self) -> HandlerSnapshot {
        Handler::stats(self)
    }
}
