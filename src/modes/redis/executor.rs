/// One command, one node, one reply
///
/// Connections to cluster nodes come from the shared pool. A connection goes
/// back to the idle list only after a complete reply with nothing left over;
/// any error drops it so a half-read reply never leaks into the next command.
use super::redirect::{asking_command, readonly_command};
use super::resp::{read_value, RespValue};
use crate::core::pool::{ConnectionPool, TcpConnector};
use crate::error::{RedisError, UmbralError, UmbralResult};
use bytes::{Bytes, BytesMut};
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// A node reply, decoded and as received
#[derive(Debug, Clone)]
pub struct Reply {
    pub value: RespValue,
    pub raw: Bytes,
}

/// Command sent ahead of the real one on the same connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prelude {
    /// One-shot permission to touch an importing slot
    Asking,
    /// Allow reads on a replica
    ReadOnly,
}

impl Prelude {
    pub fn name(self) -> &'static str {
        match self {
            Prelude::Asking => "ASKING",
            Prelude::ReadOnly => "READONLY",
        }
    }

    fn command(self) -> Bytes {
        match self {
            Prelude::Asking => asking_command(),
            Prelude::ReadOnly => readonly_command(),
        }
    }
}

pub struct CommandExecutor {
    pool: Arc<ConnectionPool<TcpConnector>>,
    request_timeout: Duration,
}

impl CommandExecutor {
    pub fn new(pool: Arc<ConnectionPool<TcpConnector>>, request_timeout: Duration) -> Self {
        Self {
            pool,
            request_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<TcpConnector>> {
        &self.pool
    }

    /// Send `command` to `address`. A `prelude` goes first on the same
    /// connection and must be acknowledged.
    pub async fn execute(
        &self,
        address: &str,
        command: &[u8],
        prelude: Option<Prelude>,
    ) -> UmbralResult<Reply> {
        let mut conn = self.pool.get(address).await?;

        let result = timeout(
            self.request_timeout,
            round_trip(&mut *conn, command, prelude),
        )
        .await;

        match result {
            Ok(Ok((reply, clean))) => {
                if clean {
                    conn.release();
                } else {
                    debug!("Dropping connection to {} with unread reply bytes", address);
                }
                Ok(reply)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(UmbralError::timeout(format!("redis command on {}", address))),
        }
    }
}

/// Returns the reply and whether the connection is clean to reuse
async fn round_trip<S>(
    stream: &mut S,
    command: &[u8],
    prelude: Option<Prelude>,
) -> UmbralResult<(Reply, bool)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();

    if let Some(prelude) = prelude {
        stream.write_all(&prelude.command()).await?;
        let (ack, _) = read_reply(stream, &mut buf).await?;
        if let RespValue::Error(message) = ack {
            return Err(RedisError::command(prelude.name().to_string(), message).into());
        }
    }

    stream.write_all(command).await?;
    let (value, raw) = read_reply(stream, &mut buf).await?;
    Ok((Reply { value, raw }, buf.is_empty()))
}

async fn read_reply<S>(stream: &mut S, buf: &mut BytesMut) -> UmbralResult<(RespValue, Bytes)>
where
    S: AsyncRead + Unpin,
{
    read_value(stream, buf)
        .await?
        .ok_or_else(|| RedisError::protocol("node closed the connection").into())
}
