//! Newline-delimited JSON over TCP.
//!
//! Every outbound message opens its own connection, writes one JSON line and
//! closes. The stream is dropped on every exit path, so a failed write never
//! leaks a connection.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::core::pipeline::RemoteModel;
use crate::core::transport::{ModelCall, ModelTransport, ReceiverTransport};
use crate::core::BrokerError;
use crate::util::serde::Endpoint;

/// Connect to `endpoint`, write `message` as one JSON line and close.
///
/// # Errors
///
/// [`BrokerError::Transport`] on connect timeout, connect failure or write failure.
pub async fn write_json_line<T: Serialize + Sync>(
    endpoint: &Endpoint,
    message: &T,
    connect_timeout: Duration,
) -> Result<(), BrokerError> {
    let mut line = serde_json::to_vec(message)
        .map_err(|e| BrokerError::Transport(format!("encode for {endpoint}: {e}")))?;
    line.push(b'\n');

    let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(endpoint.as_str()))
        .await
        .map_err(|_| BrokerError::Transport(format!("connect to {endpoint} timed out")))?
        .map_err(|e| BrokerError::Transport(format!("connect to {endpoint}: {e}")))?;

    stream
        .write_all(&line)
        .await
        .map_err(|e| BrokerError::Transport(format!("write to {endpoint}: {e}")))?;
    stream
        .shutdown()
        .await
        .map_err(|e| BrokerError::Transport(format!("close {endpoint}: {e}")))?;
    debug!(%endpoint, bytes = line.len(), "json line sent");
    Ok(())
}

/// Default cap on one inbound line, newline excluded.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Read JSON lines from `reader` until EOF, calling `handle` for each and
/// returning how many were handled. Blank lines are skipped. No line may
/// exceed `max_line_bytes`, so a peer that never sends a newline cannot grow
/// the buffer without bound.
///
/// # Errors
///
/// [`BrokerError::Decode`] on a read failure, an over-long line or the first
/// line that is not valid `T`, otherwise the first error `handle` returns;
/// reading stops there.
pub async fn read_json_lines<R, T, F, Fut>(
    reader: R,
    max_line_bytes: usize,
    mut handle: F,
) -> Result<usize, BrokerError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
    F: FnMut(T) -> Fut,
    Fut: std::future::Future<Output = Result<(), BrokerError>>,
{
    let mut reader = BufReader::new(reader);
    // One byte over the cap leaves room for the newline.
    let window = u64::try_from(max_line_bytes)
        .unwrap_or(u64::MAX)
        .saturating_add(1);
    let mut line = Vec::new();
    let mut count = 0;
    loop {
        line.clear();
        let read = (&mut reader)
            .take(window)
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| BrokerError::Decode(format!("read: {e}")))?;
        if read == 0 {
            return Ok(count);
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        } else if line.len() > max_line_bytes {
            return Err(BrokerError::Decode(format!(
                "line exceeds {max_line_bytes} bytes"
            )));
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let message: T =
            serde_json::from_slice(&line).map_err(|e| BrokerError::Decode(e.to_string()))?;
        handle(message).await?;
        count += 1;
    }
}

/// Sends model calls over fresh TCP connections, with optional retries.
#[derive(Debug, Clone)]
pub struct TcpModelTransport {
    connect_timeout: Duration,
    retries: u32,
    backoff: Duration,
}

impl TcpModelTransport {
    /// Single attempt per call.
    pub const fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            retries: 0,
            backoff: Duration::ZERO,
        }
    }

    /// Retry a failed send `retries` more times, sleeping `backoff` between tries.
    #[must_use]
    pub const fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }
}

#[async_trait]
impl ModelTransport for TcpModelTransport {
    async fn send(&self, remote: &RemoteModel, call: &ModelCall) -> Result<(), BrokerError> {
        let mut attempt = 0;
        loop {
            match write_json_line(&remote.endpoint, call, self.connect_timeout).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    warn!(model = %remote.name, attempt, error = %e, "retrying model call");
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Forwards response values to receivers over fresh TCP connections.
#[derive(Debug, Clone)]
pub struct TcpReceiverTransport {
    connect_timeout: Duration,
}

impl TcpReceiverTransport {
    /// Create a forwarder with the given connect timeout.
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl ReceiverTransport for TcpReceiverTransport {
    async fn forward(
        &self,
        receiver: &Endpoint,
        value: &serde_json::Value,
    ) -> Result<(), BrokerError> {
        write_json_line(receiver, value, self.connect_timeout).await
    }
}
