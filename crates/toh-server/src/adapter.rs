//! Server-side end of one tunnel session
//!
//! An [`Adapter`] owns the outbound TCP connection to the real target.
//! Every frame first writes the request body to the target, then drains
//! whatever the target produced within a short, tiered deadline budget.
//!
//! The client never has two frames in flight for the same session, so the
//! socket is never contended in practice. A frame still has to take an
//! [`AdapterLease`] first; the lease is non-blocking and a second concurrent
//! frame is refused with [`AdapterError::Busy`] instead of being queued.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use toh_proto::{CHUNK_SIZE, DRAIN_ATTEMPTS, DRAIN_ATTEMPT_TIMEOUT};
use tracing::debug;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Session {0} already has a frame in flight")]
    Busy(String),

    #[error("Session {0} is closed")]
    Closed(String),

    #[error("Failed to write to target: {0}")]
    Write(#[source] std::io::Error),

    #[error("Failed to read from target: {0}")]
    Read(#[source] std::io::Error),
}

impl AdapterError {
    /// Whether the error leaves the target connection unusable
    pub fn is_fatal(&self) -> bool {
        matches!(self, AdapterError::Write(_) | AdapterError::Read(_))
    }
}

/// Bytes harvested by one drain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Drained {
    pub data: Bytes,
    /// Every attempt filled a whole chunk, so the socket likely holds more
    pub more_likely: bool,
}

/// Binds a session id to its live target connection
#[derive(Debug)]
pub struct Adapter {
    id: String,
    target: String,
    stream: Mutex<Option<TcpStream>>,
}

impl Adapter {
    pub fn new(id: impl Into<String>, target: impl Into<String>, stream: TcpStream) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            stream: Mutex::new(Some(stream)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Take exclusive use of the target socket for one frame
    pub fn lease(&self) -> Result<AdapterLease<'_>, AdapterError> {
        let guard = self
            .stream
            .try_lock()
            .map_err(|_| AdapterError::Busy(self.id.clone()))?;

        if guard.is_none() {
            return Err(AdapterError::Closed(self.id.clone()));
        }

        Ok(AdapterLease {
            id: &self.id,
            guard,
        })
    }

    /// Write `body` (if any) then drain the target, under a single lease
    pub async fn handle_frame(&self, body: &[u8]) -> Result<Drained, AdapterError> {
        self.lease()?.handle_frame(body).await
    }

    /// Close the target connection. Later calls are no-ops.
    pub async fn shutdown(&self) {
        let stream = self.stream.lock().await.take();
        if let Some(mut stream) = stream {
            let _ = stream.shutdown().await;
            debug!(session_id = %self.id, target = %self.target, "Target connection closed");
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.stream.lock().await.is_none()
    }
}

/// Exclusive access to an [`Adapter`]'s socket for the duration of one frame
pub struct AdapterLease<'a> {
    id: &'a str,
    guard: MutexGuard<'a, Option<TcpStream>>,
}

impl AdapterLease<'_> {
    fn stream(&mut self) -> Result<&mut TcpStream, AdapterError> {
        self.guard
            .as_mut()
            .ok_or_else(|| AdapterError::Closed(self.id.to_string()))
    }

    /// Write the whole body to the target. Empty bodies are not written.
    pub async fn write(&mut self, body: &[u8]) -> Result<(), AdapterError> {
        if body.is_empty() {
            return Ok(());
        }

        let stream = self.stream()?;
        stream.write_all(body).await.map_err(AdapterError::Write)?;

        debug!(session_id = %self.id, bytes = body.len(), "Wrote to target");
        Ok(())
    }

    pub async fn drain(&mut self) -> Result<Drained, AdapterError> {
        let id = self.id;
        let stream = self.stream()?;
        let drained = drain(stream).await.map_err(AdapterError::Read)?;

        debug!(
            session_id = %id,
            bytes = drained.data.len(),
            more_likely = drained.more_likely,
            "Drained target"
        );
        Ok(drained)
    }

    /// A failed write short-circuits; the drain is skipped
    pub async fn handle_frame(&mut self, body: &[u8]) -> Result<Drained, AdapterError> {
        self.write(body).await?;
        self.drain().await
    }
}

/// Read what is currently available from `reader`.
///
/// Performs up to [`DRAIN_ATTEMPTS`] reads of at most [`CHUNK_SIZE`] bytes,
/// each bounded by [`DRAIN_ATTEMPT_TIMEOUT`]. An attempt that times out or
/// hits end-of-stream ends the drain. `more_likely` is set only when every
/// attempt returned a full chunk.
pub async fn drain<R>(reader: &mut R) -> std::io::Result<Drained>
where
    R: AsyncRead + Unpin,
{
    let mut data = BytesMut::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut full_chunks = 0;

    for _ in 0..DRAIN_ATTEMPTS {
        let n = match tokio::time::timeout(DRAIN_ATTEMPT_TIMEOUT, reader.read(&mut chunk)).await {
            Err(_) | Ok(Ok(0)) => {
                return Ok(Drained {
                    data: data.freeze(),
                    more_likely: false,
                })
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
        };

        data.extend_from_slice(&chunk[..n]);
        if n == CHUNK_SIZE {
            full_chunks += 1;
        }
    }

    Ok(Drained {
        data: data.freeze(),
        more_likely: full_chunks == DRAIN_ATTEMPTS,
    })
}
