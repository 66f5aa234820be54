pub mod config;
pub mod error;
/// Umbral - cluster-aware database proxy
///
/// Each configured route gets its own listener and protocol handler:
/// 1. Galera: MySQL-protocol proxy that steers clients to synced cluster nodes
/// 2. Redis Cluster: slot-aware command router with MOVED/ASK handling
/// 3. TCP: byte-level passthrough with round-robin rotation
pub mod core;
pub mod health;
pub mod modes;
pub mod utils;

use crate::config::{Config, RouteConfig};
use crate::core::handler::{Handler, HandlerOptions, HandlerSnapshot, ProtocolHandler};
use crate::core::security::{KeywordChecker, SecurityChecker};
use crate::error::{UmbralError, UmbralResult};
use crate::modes::galera::GaleraStrategy;
use crate::modes::redis::RedisClusterStrategy;
use crate::modes::tcp::TcpStrategy;
use futures::future::join_all;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Owns one handler per route and drives their lifecycle together
pub struct Umbral {
    config: Config,
    handlers: Vec<Box<dyn ProtocolHandler>>,
    cancel: CancellationToken,
}

impl Umbral {
    /// Build handlers for every route. The config is taken as given; callers
    /// loading from disk get validation from `Config::load_from_file`.
    pub fn from_config(config: Config) -> UmbralResult<Self> {
        let sql_checker: Option<Arc<dyn SecurityChecker>> =
            if config.security.sql_injection_detection {
                let checker = KeywordChecker::sql_injection()
                    .map_err(|e| UmbralError::internal(format!("security patterns: {}", e)))?;
                Some(Arc::new(checker))
            } else {
                None
            };

        let mut handlers: Vec<Box<dyn ProtocolHandler>> = Vec::with_capacity(config.routes.len());
        for route in &config.routes {
            let options = route_options(&config, route, sql_checker.clone());
            let handler: Box<dyn ProtocolHandler> = match route {
                RouteConfig::Galera(galera) => Box::new(Handler::new(
                    GaleraStrategy::new(galera.clone(), &config.server),
                    options,
                )),
                RouteConfig::RedisCluster(redis) => Box::new(Handler::new(
                    RedisClusterStrategy::new(
                        redis.clone(),
                        &config.server,
                        config.security.block_dangerous_commands,
                    ),
                    options,
                )),
                RouteConfig::Tcp(tcp) => Box::new(Handler::new(
                    TcpStrategy::new(tcp.clone(), &config.server),
                    options,
                )),
            };
            handlers.push(handler);
        }

        Ok(Self {
            config,
            handlers,
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn handlers(&self) -> &[Box<dyn ProtocolHandler>] {
        &self.handlers
    }

    /// Start every handler in route order. If one fails, the handlers already
    /// running are stopped again before the error is returned.
    pub async fn start_all(&self) -> UmbralResult<Vec<(String, SocketAddr)>> {
        let mut started = Vec::with_capacity(self.handlers.len());

        for handler in &self.handlers {
            match handler.start(&self.cancel).await {
                Ok(addr) => {
                    info!("Route {} listening on {}", handler.name(), addr);
                    started.push((handler.name().to_string(), addr));
                }
                Err(e) => {
                    error!("Failed to start route {}: {}", handler.name(), e);
                    for running in self.handlers.iter().take(started.len()) {
                        if let Err(stop_err) = running.stop().await {
                            error!("Rollback of {} failed: {}", running.name(), stop_err);
                        }
                    }
                    return Err(e);
                }
            }
        }

        Ok(started)
    }

    /// Stop every handler concurrently, reporting the first failure after all
    /// have finished
    pub async fn stop_all(&self) -> UmbralResult<()> {
        let results = join_all(self.handlers.iter().map(|handler| handler.stop())).await;

        let mut first_error = None;
        for (handler, result) in self.handlers.iter().zip(results) {
            if let Err(e) = result {
                error!("Failed to stop route {}: {}", handler.name(), e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("All routes stopped");
                Ok(())
            }
        }
    }

    pub fn stats(&self) -> Vec<HandlerSnapshot> {
        self.handlers.iter().map(|h| h.stats()).collect()
    }
}

/// Listener address and limits for one route; per-route rates win over the
/// global limits, which only apply when enabled.
fn route_options(
    config: &Config,
    route: &RouteConfig,
    sql_checker: Option<Arc<dyn SecurityChecker>>,
) -> HandlerOptions {
    let common = route.common();
    let listen_addr = format!("{}:{}", config.server.bind_host, common.listen_port);
    let mut options = HandlerOptions::new(&common.name, &listen_addr);

    let limits = &config.limits;
    options.connection_rate = common
        .connection_rate
        .or_else(|| limits.enabled.then_some(limits.connection_rate));
    options.query_rate = common
        .query_rate
        .or_else(|| limits.enabled.then_some(limits.query_rate));

    if matches!(route, RouteConfig::Galera(_)) {
        options.security = sql_checker;
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GaleraRouteConfig, TcpRouteConfig};
    use crate::core::handler::HandlerState;
    use crate::core::Backend;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn echo_backend() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 256];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    fn local_config(routes: Vec<RouteConfig>) -> Config {
        let mut config = Config {
            routes,
            ..Default::default()
        };
        config.server.bind_host = "127.0.0.1".to_string();
        config
    }

    #[test]
    fn test_route_options_prefer_route_rates() {
        let mut tcp = TcpRouteConfig::new("tcp", 7000, vec![Backend::new("127.0.0.1", 1)]);
        tcp.common.query_rate = Some(5.0);
        let route = RouteConfig::Tcp(tcp);
        let config = local_config(vec![route.clone()]);

        let options = route_options(&config, &route, None);
        assert_eq!(options.listen_addr, "127.0.0.1:7000");
        assert_eq!(options.query_rate, Some(5.0));
        assert_eq!(options.connection_rate, Some(config.limits.connection_rate));
    }

    #[test]
    fn test_route_options_without_limits() {
        let route = RouteConfig::Tcp(TcpRouteConfig::new("tcp", 7000, vec![]));
        let mut config = local_config(vec![route.clone()]);
        config.limits.enabled = false;

        let options = route_options(&config, &route, None);
        assert_eq!(options.connection_rate, None);
        assert_eq!(options.query_rate, None);
    }

    #[test]
    fn test_sql_checker_only_on_galera() {
        let galera = RouteConfig::Galera(GaleraRouteConfig::new("db", 3306, vec![]));
        let tcp = RouteConfig::Tcp(TcpRouteConfig::new("tcp", 7000, vec![]));
        let config = local_config(vec![galera.clone(), tcp.clone()]);
        let checker: Arc<dyn SecurityChecker> = Arc::new(KeywordChecker::sql_injection().unwrap());

        assert!(route_options(&config, &galera, Some(checker.clone())).security.is_some());
        assert!(route_options(&config, &tcp, Some(checker)).security.is_none());
    }

    #[test]
    fn test_one_handler_per_route() {
        let config = local_config(vec![
            RouteConfig::Galera(GaleraRouteConfig::new("db", 3306, vec![])),
            RouteConfig::Tcp(TcpRouteConfig::new("tcp", 7000, vec![])),
        ]);
        let umbral = Umbral::from_config(config).unwrap();

        let names: Vec<&str> = umbral.handlers().iter().map(|h| h.name()).collect();
        assert_eq!(names, vec!["db", "tcp"]);
        assert!(umbral
            .stats()
            .iter()
            .all(|s| s.state == HandlerState::Stopped));
    }

    #[tokio::test]
    async fn test_start_and_stop_all() {
        let backend = echo_backend().await;
        let config = local_config(vec![RouteConfig::Tcp(TcpRouteConfig::new(
            "echo",
            0,
            vec![Backend::new("127.0.0.1", backend)],
        ))]);
        let umbral = Umbral::from_config(config).unwrap();

        let started = umbral.start_all().await.unwrap();
        assert_eq!(started.len(), 1);

        let mut client = TcpStream::connect(started[0].1).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert_eq!(umbral.stats()[0].state, HandlerState::Running);
        umbral.stop_all().await.unwrap();
        assert_eq!(umbral.stats()[0].state, HandlerState::Stopped);
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back() {
        let backend = echo_backend().await;
        let config = local_config(vec![
            RouteConfig::Tcp(TcpRouteConfig::new(
                "good",
                0,
                vec![Backend::new("127.0.0.1", backend)],
            )),
            RouteConfig::Tcp(TcpRouteConfig::new("empty", 0, vec![])),
        ]);
        let umbral = Umbral::from_config(config).unwrap();

        assert!(umbral.start_all().await.is_err());
        assert!(umbral
            .stats()
            .iter()
            .all(|s| s.state != HandlerState::Running));
    }
}
