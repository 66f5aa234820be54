/// Configuration management for umbral
use crate::core::Backend;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main umbral configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Connection and query rate limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Query inspection policy
    #[serde(default)]
    pub security: SecurityConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// One listener per route
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host every route listener binds to
    pub bind_host: String,
    /// Total backend connections per route, split across its backends
    pub max_connections_per_route: usize,
    /// Backend connect timeout in seconds
    pub connection_timeout_sec: u64,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub enabled: bool,
    /// Accepted connections per second, per route
    pub connection_rate: f64,
    /// Client messages per second, per route
    pub query_rate: f64,
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Run the keyword checker over SQL traffic
    pub sql_injection_detection: bool,
    /// Refuse administrative commands on Redis routes
    pub block_dangerous_commands: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

/// Per-route configuration, tagged by protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol")]
pub enum RouteConfig {
    #[serde(rename = "galera")]
    Galera(GaleraRouteConfig),
    #[serde(rename = "redis_cluster")]
    RedisCluster(RedisClusterRouteConfig),
    #[serde(rename = "tcp")]
    Tcp(TcpRouteConfig),
}

/// Settings every route carries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteCommon {
    pub name: String,
    pub listen_port: u16,
    /// Overrides `limits.connection_rate`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_rate: Option<f64>,
    /// Overrides `limits.query_rate`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_rate: Option<f64>,
    #[serde(default)]
    pub backends: Vec<Backend>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaleraRouteConfig {
    #[serde(flatten)]
    pub common: RouteCommon,
    #[serde(default = "default_galera_health_interval")]
    pub health_check_interval_sec: u64,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "default_flow_control_threshold")]
    pub flow_control_threshold: u32,
    /// Allow reads from Joined nodes that are not flow-controlled
    #[serde(default)]
    pub read_only_nodes: bool,
    #[serde(default = "default_true")]
    pub write_balancing: bool,
    /// Weighted random selection instead of uniform
    #[serde(default = "default_true")]
    pub node_weight_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisClusterRouteConfig {
    #[serde(flatten)]
    pub common: RouteCommon,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_sec: u64,
    #[serde(default = "default_redis_health_interval")]
    pub health_check_interval_sec: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,
    /// Signal a topology refresh as soon as a MOVED reply is seen
    #[serde(default = "default_true")]
    pub refresh_on_moved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpRouteConfig {
    #[serde(flatten)]
    pub common: RouteCommon,
    #[serde(default)]
    pub algorithm: BalancingAlgorithm,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancingAlgorithm {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
}

fn default_true() -> bool {
    true
}

fn default_galera_health_interval() -> u64 {
    10
}

fn default_max_consecutive_errors() -> u32 {
    3
}

fn default_flow_control_threshold() -> u32 {
    100
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_redis_health_interval() -> u64 {
    10
}

fn default_ping_timeout() -> u64 {
    2000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            connection_rate: 100.0,
            query_rate: 1000.0,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            sql_injection_detection: true,
            block_dangerous_commands: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_host: "0.0.0.0".to_string(),
                max_connections_per_route: 100,
                connection_timeout_sec: 5,
            },
            limits: LimitsConfig::default(),
            security: SecurityConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
            routes: vec![RouteConfig::Galera(GaleraRouteConfig::new(
                "galera",
                3306,
                vec![Backend::new("127.0.0.1", 3307)],
            ))],
        }
    }
}

impl GaleraRouteConfig {
    pub fn new(name: &str, listen_port: u16, backends: Vec<Backend>) -> Self {
        Self {
            common: RouteCommon::new(name, listen_port, backends),
            health_check_interval_sec: default_galera_health_interval(),
            max_consecutive_errors: default_max_consecutive_errors(),
            flow_control_threshold: default_flow_control_threshold(),
            read_only_nodes: false,
            write_balancing: true,
            node_weight_enabled: true,
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_sec)
    }
}

impl RedisClusterRouteConfig {
    pub fn new(name: &str, listen_port: u16, backends: Vec<Backend>) -> Self {
        Self {
            common: RouteCommon::new(name, listen_port, backends),
            refresh_interval_sec: default_refresh_interval(),
            health_check_interval_sec: default_redis_health_interval(),
            ping_timeout_ms: default_ping_timeout(),
            refresh_on_moved: true,
        }
    }
}

impl TcpRouteConfig {
    pub fn new(name: &str, listen_port: u16, backends: Vec<Backend>) -> Self {
        Self {
            common: RouteCommon::new(name, listen_port, backends),
            algorithm: BalancingAlgorithm::RoundRobin,
        }
    }
}

impl RouteCommon {
    pub fn new(name: &str, listen_port: u16, backends: Vec<Backend>) -> Self {
        Self {
            name: name.to_string(),
            listen_port,
            connection_rate: None,
            query_rate: None,
            backends,
        }
    }
}

impl RouteConfig {
    pub fn common(&self) -> &RouteCommon {
        match self {
            RouteConfig::Galera(route) => &route.common,
            RouteConfig::RedisCluster(route) => &route.common,
            RouteConfig::Tcp(route) => &route.common,
        }
    }

    pub fn protocol(&self) -> &'static str {
        match self {
            RouteConfig::Galera(_) => "galera",
            RouteConfig::RedisCluster(_) => "redis_cluster",
            RouteConfig::Tcp(_) => "tcp",
        }
    }
}

impl ServerConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_sec)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_connections_per_route == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections_per_route must be greater than 0".to_string(),
            ));
        }

        if self.server.connection_timeout_sec == 0 {
            return Err(ConfigError::ValidationError(
                "connection_timeout_sec must be greater than 0".to_string(),
            ));
        }

        if self.limits.enabled && (self.limits.connection_rate <= 0.0 || self.limits.query_rate <= 0.0)
        {
            return Err(ConfigError::ValidationError(
                "rate limits must be greater than 0".to_string(),
            ));
        }

        if self.routes.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one route must be configured".to_string(),
            ));
        }

        let mut ports = std::collections::HashSet::new();
        for route in &self.routes {
            self.validate_route(route)?;
            if !ports.insert(route.common().listen_port) {
                return Err(ConfigError::ValidationError(format!(
                    "listen_port {} is used by more than one route",
                    route.common().listen_port
                )));
            }
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    fn validate_route(&self, route: &RouteConfig) -> Result<(), ConfigError> {
        let common = route.common();
        if common.name.is_empty() {
            return Err(ConfigError::ValidationError(
                "route name cannot be empty".to_string(),
            ));
        }

        if common.listen_port == 0 {
            return Err(ConfigError::ValidationError(format!(
                "route {}: listen_port must be between 1 and 65535",
                common.name
            )));
        }

        if common.backends.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "route {}: no backends configured",
                common.name
            )));
        }

        for backend in &common.backends {
            if backend.host.is_empty() || backend.port == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "route {}: invalid backend {}",
                    common.name,
                    backend.key()
                )));
            }
            if backend.weight < 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "route {}: backend {} has a negative weight",
                    common.name,
                    backend.key()
                )));
            }
        }

        for rate in [common.connection_rate, common.query_rate].into_iter().flatten() {
            if rate <= 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "route {}: rate overrides must be greater than 0",
                    common.name
                )));
            }
        }

        match route {
            RouteConfig::Galera(galera) => {
                if galera.health_check_interval_sec == 0 {
                    return Err(ConfigError::ValidationError(format!(
                        "route {}: health_check_interval_sec must be greater than 0",
                        common.name
                    )));
                }
                if galera.max_consecutive_errors == 0 {
                    return Err(ConfigError::ValidationError(format!(
                        "route {}: max_consecutive_errors must be greater than 0",
                        common.name
                    )));
                }
            }
            RouteConfig::RedisCluster(redis) => {
                if redis.refresh_interval_sec == 0 || redis.health_check_interval_sec == 0 {
                    return Err(ConfigError::ValidationError(format!(
                        "route {}: refresh and health intervals must be greater than 0",
                        common.name
                    )));
                }
                if redis.ping_timeout_ms == 0
                    || redis.ping_timeout_ms >= redis.health_check_interval_sec * 1000
                {
                    return Err(ConfigError::ValidationError(format!(
                        "route {}: ping_timeout_ms must be less than the health check interval",
                        common.name
                    )));
                }
            }
            RouteConfig::Tcp(_) => {}
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, mode: &str) -> Result<(), ConfigError> {
        let route = match mode {
            "galera" => RouteConfig::Galera(GaleraRouteConfig::new(
                "galera-main",
                3306,
                vec![
                    Backend::new("10.0.1.10", 3306).with_credentials("umbral", "change-me"),
                    Backend::new("10.0.1.11", 3306).with_credentials("umbral", "change-me"),
                    Backend::new("10.0.1.12", 3306)
                        .with_credentials("umbral", "change-me")
                        .with_weight(2.0),
                ],
            )),
            "redis_cluster" => RouteConfig::RedisCluster(RedisClusterRouteConfig::new(
                "redis-cache",
                6379,
                vec![
                    Backend::new("10.0.1.20", 6379),
                    Backend::new("10.0.1.21", 6379),
                    Backend::new("10.0.1.22", 6379),
                ],
            )),
            "tcp" => RouteConfig::Tcp(TcpRouteConfig::new(
                "tcp-passthrough",
                5432,
                vec![Backend::new("10.0.1.30", 5432), Backend::new("10.0.1.31", 5432)],
            )),
            _ => {
                return Err(ConfigError::ValidationError(
                    "Mode must be 'galera', 'redis_cluster' or 'tcp'".to_string(),
                ))
            }
        };

        let config = Config {
            routes: vec![route],
            ..Default::default()
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
