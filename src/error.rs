/// Unified error handling for umbral
///
/// Every fallible operation in the proxy returns an `UmbralError`. Transient
/// backend failures are recoverable and end up as counters and node state;
/// configuration failures are fatal at start.
use crate::config::ConfigError;
use crate::core::pool::PoolError;
use std::fmt;
use std::io;
use std::net::AddrParseError;
use thiserror::Error;

/// Main error type for umbral operations
#[derive(Debug, Error)]
pub enum UmbralError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Client or backend protocol violations
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Backend connection errors
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// Health probe errors
    #[error("Health check failed: {message}")]
    HealthCheck { message: String },

    /// No backend passed the candidate filter
    #[error("No healthy {protocol} node available")]
    NoHealthyBackend { protocol: String },

    /// Connection pool errors
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Redis-specific errors
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    /// Query rejected by the security checker
    #[error("Query blocked by security policy: {reason}")]
    QueryBlocked { reason: String },

    /// Rate limiter budget exhausted
    #[error("{what} rate limit exceeded")]
    RateLimited { what: String },

    /// Start called on a handler that is not stopped
    #[error("Handler {name} is already running")]
    AlreadyRunning { name: String },

    /// Address parsing errors
    #[error("Address parsing error: {0}")]
    AddressParse(#[from] AddrParseError),

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Redis-specific errors
#[derive(Debug, Error)]
pub enum RedisError {
    #[error("RESP protocol error: {message}")]
    ProtocolError { message: String },

    #[error("Cluster topology error: {message}")]
    ClusterError { message: String },

    #[error("Redis command error: {command} - {message}")]
    CommandError { command: String, message: String },

    #[error("Slot mapping error: {message}")]
    SlotMappingError { message: String },

    #[error("too many redirections")]
    TooManyRedirections { count: u8 },

    #[error("no available node for command")]
    NoNodeAvailable,
}

/// Result type alias for umbral operations
pub type UmbralResult<T> = Result<T, UmbralError>;

impl UmbralError {
    pub fn backend<S: Into<String>>(message: S) -> Self {
        UmbralError::Backend {
            message: message.into(),
        }
    }

    pub fn health_check<S: Into<String>>(message: S) -> Self {
        UmbralError::HealthCheck {
            message: message.into(),
        }
    }

    pub fn no_healthy_backend<S: Into<String>>(protocol: S) -> Self {
        UmbralError::NoHealthyBackend {
            protocol: protocol.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        UmbralError::Protocol(message.into())
    }

    pub fn blocked<S: Into<String>>(reason: S) -> Self {
        UmbralError::QueryBlocked {
            reason: reason.into(),
        }
    }

    pub fn rate_limited<S: Into<String>>(what: S) -> Self {
        UmbralError::RateLimited { what: what.into() }
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        UmbralError::Timeout {
            operation: operation.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        UmbralError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        match self {
            UmbralError::Network(_) => true,
            UmbralError::Backend { .. } => true,
            UmbralError::HealthCheck { .. } => true,
            UmbralError::NoHealthyBackend { .. } => true,
            UmbralError::Timeout { .. } => true,
            UmbralError::RateLimited { .. } => true,
            UmbralError::Pool(PoolError::Exhausted { .. }) => true,
            UmbralError::Pool(PoolError::Connect { .. }) => true,
            UmbralError::Redis(RedisError::ClusterError { .. }) => true,
            UmbralError::Redis(RedisError::NoNodeAvailable) => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            UmbralError::Config(_) => ErrorSeverity::Critical,
            UmbralError::Internal { .. } => ErrorSeverity::Critical,
            UmbralError::Network(_) => ErrorSeverity::Warning,
            UmbralError::Backend { .. } => ErrorSeverity::Warning,
            UmbralError::Pool(_) => ErrorSeverity::Warning,
            UmbralError::Timeout { .. } => ErrorSeverity::Warning,
            UmbralError::HealthCheck { .. } => ErrorSeverity::Info,
            UmbralError::QueryBlocked { .. } => ErrorSeverity::Info,
            UmbralError::RateLimited { .. } => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

impl RedisError {
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        RedisError::ProtocolError {
            message: message.into(),
        }
    }

    pub fn cluster<S: Into<String>>(message: S) -> Self {
        RedisError::ClusterError {
            message: message.into(),
        }
    }

    pub fn command<S: Into<String>>(command: S, message: S) -> Self {
        RedisError::CommandError {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn slot_mapping<S: Into<String>>(message: S) -> Self {
        RedisError::SlotMappingError {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = UmbralError::backend("Backend unavailable");
        assert!(matches!(error, UmbralError::Backend { .. }));
        assert_eq!(error.to_string(), "Backend error: Backend unavailable");
    }

    #[test]
    fn test_error_severity() {
        let config_error =
            UmbralError::Config(ConfigError::ValidationError("test".to_string()));
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);

        let network_error =
            UmbralError::Network(io::Error::new(io::ErrorKind::ConnectionRefused, "test"));
        assert_eq!(network_error.severity(), ErrorSeverity::Warning);

        assert_eq!(
            UmbralError::blocked("union select").severity(),
            ErrorSeverity::Info
        );
    }

    #[test]
    fn test_error_recoverability() {
        let network_error =
            UmbralError::Network(io::Error::new(io::ErrorKind::ConnectionRefused, "test"));
        assert!(network_error.is_recoverable());

        let config_error =
            UmbralError::Config(ConfigError::ValidationError("test".to_string()));
        assert!(!config_error.is_recoverable());

        let redirects = UmbralError::Redis(RedisError::TooManyRedirections { count: 4 });
        assert!(!redirects.is_recoverable());
    }

    #[test]
    fn test_redirection_messages() {
        assert_eq!(
            RedisError::TooManyRedirections { count: 4 }.to_string(),
            "too many redirections"
        );
        assert_eq!(
            RedisError::NoNodeAvailable.to_string(),
            "no available node for command"
        );
    }

    #[test]
    fn test_no_healthy_backend_message() {
        let error = UmbralError::no_healthy_backend("Galera");
        assert_eq!(error.to_string(), "No healthy Galera node available");
    }

    #[test]
    fn test_rate_limited_message() {
        assert_eq!(
            UmbralError::rate_limited("Query").to_string(),
            "Query rate limit exceeded"
        );
    }
}
