/// Redis cluster node probing
///
/// Each probe opens a fresh connection so a wedged pooled connection never
/// masks a node that is actually reachable.
use super::probe_with_timeout;
use crate::error::{UmbralError, UmbralResult};
use crate::modes::redis::resp::{read_value, RespEncoder, RespValue};
use bytes::BytesMut;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

#[derive(Debug, Clone)]
pub struct RedisProbe {
    timeout: Duration,
}

impl RedisProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// PING `address`; returns the round-trip latency
    pub async fn ping(&self, address: &str) -> UmbralResult<Duration> {
        probe_with_timeout(self.timeout, "redis ping", async {
            let started = Instant::now();
            match request(address, ["PING"]).await? {
                RespValue::SimpleString(reply) if reply == "PONG" => Ok(started.elapsed()),
                RespValue::Error(message) => Err(UmbralError::health_check(format!(
                    "{} answered PING with {}",
                    address, message
                ))),
                other => Err(UmbralError::health_check(format!(
                    "unexpected PING reply from {}: {:?}",
                    address, other
                ))),
            }
        })
        .await
    }

    /// Raw `CLUSTER NODES` table from `address`
    pub async fn cluster_nodes(&self, address: &str) -> UmbralResult<String> {
        probe_with_timeout(self.timeout, "redis cluster nodes", async {
            let reply = request(address, ["CLUSTER", "NODES"]).await?;
            if let RespValue::Error(message) = &reply {
                return Err(UmbralError::health_check(format!(
                    "CLUSTER NODES failed on {}: {}",
                    address, message
                )));
            }
            reply.as_text().ok_or_else(|| {
                UmbralError::health_check(format!(
                    "unexpected CLUSTER NODES reply from {}",
                    address
                ))
            })
        })
        .await
    }
}

async fn request<const N: usize>(address: &str, parts: [&str; N]) -> UmbralResult<RespValue> {
    let mut stream = TcpStream::connect(address).await?;
    stream.write_all(&RespEncoder::command(parts)).await?;

    let mut buf = BytesMut::new();
    match read_value(&mut stream, &mut buf).await? {
        Some((value, _)) => Ok(value),
        None => Err(UmbralError::health_check(format!(
            "{} closed the connection without replying",
            address
        ))),
    }
}
