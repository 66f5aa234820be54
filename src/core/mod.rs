/// Core abstractions shared by every protocol mode
pub mod handler;
pub mod metrics;
pub mod pool;
pub mod proxy;
pub mod ratelimit;
pub mod security;

use serde::{Deserialize, Serialize};

/// A configured backend endpoint (Galera node, Redis seed or TCP peer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl Backend {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            user: String::new(),
            password: String::new(),
            database: String::new(),
            tls: false,
            weight: default_weight(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Login used for backend connections and status queries
    pub fn with_credentials(mut self, user: &str, password: &str) -> Self {
        self.user = user.to_string();
        self.password = password.to_string();
        self
    }

    /// Pool and node-map key, `host:port`
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
