/// Health probing for Galera nodes and Redis cluster nodes
pub mod galera;
pub mod redis;

use crate::error::{UmbralError, UmbralResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

/// Bound a probe by `limit`; expiry becomes a timeout error
pub async fn probe_with_timeout<F, T>(limit: Duration, operation: &str, probe: F) -> UmbralResult<T>
where
    F: Future<Output = UmbralResult<T>>,
{
    match timeout(limit, probe).await {
        Ok(result) => result,
        Err(_) => Err(UmbralError::timeout(operation)),
    }
}
