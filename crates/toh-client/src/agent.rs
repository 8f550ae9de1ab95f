//! Client-side end of one tunnel session
//!
//! An [`Agent`] owns one accepted inbound connection and runs the whole
//! session for it: establish, relay greeting bytes, then forward every
//! inbound read and relay the answer, until either side goes away.

use crate::driver::{DriverError, SessionState, TunnelDriver};
use crate::transport::FrameTransport;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use toh_proto::CHUNK_SIZE;
use tracing::{error, info};

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The inbound peer closed its side; `Goodbye` was sent
    InboundEof,
    /// `Establish` failed; nothing was forwarded
    EstablishFailed,
    /// A `Forward` or `Require` frame failed
    TransportFailed,
    /// Reading the inbound socket failed
    InboundReadFailed,
    /// Writing target bytes to the inbound socket failed; `Goodbye` was sent
    InboundWriteFailed,
    /// The client is shutting down and the session was idle; `Goodbye` was sent
    Shutdown,
}

impl CloseReason {
    /// Whether the server-side session is still alive and should be told
    fn sends_goodbye(&self) -> bool {
        matches!(
            self,
            CloseReason::InboundEof | CloseReason::InboundWriteFailed | CloseReason::Shutdown
        )
    }
}

/// Outcome of one session
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub bytes_to_target: u64,
    pub bytes_from_target: u64,
    pub reason: CloseReason,
    pub state: SessionState,
}

pub struct Agent<S, T> {
    stream: S,
    peer: String,
    driver: TunnelDriver<T>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<S, T> Agent<S, T>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    T: FrameTransport,
{
    pub fn new(stream: S, peer: impl Into<String>, driver: TunnelDriver<T>) -> Self {
        Self {
            stream,
            peer: peer.into(),
            driver,
            shutdown: None,
        }
    }

    /// Stop at the next inbound read once `shutdown` turns `true`.
    /// A frame chain already in progress is never interrupted.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn id(&self) -> &str {
        self.driver.id()
    }

    /// Run the session to completion. The inbound stream is closed on return.
    pub async fn run(self) -> SessionSummary {
        let Agent {
            mut stream,
            peer,
            mut driver,
            mut shutdown,
        } = self;
        let id = driver.id().to_string();

        info!(session_id = %id, remote = %peer, "New connection established");

        let mut bytes_to_target = 0u64;
        let mut bytes_from_target = 0u64;
        let reason = drive(
            &mut stream,
            &mut driver,
            &mut shutdown,
            &mut bytes_to_target,
            &mut bytes_from_target,
        )
        .await;

        let state = driver.finish(reason.sends_goodbye()).await;
        let _ = stream.shutdown().await;
        drop(stream);

        info!(
            session_id = %id,
            remote = %peer,
            bytes_to_target,
            bytes_from_target,
            reason = ?reason,
            "Connection closed"
        );

        SessionSummary {
            id,
            bytes_to_target,
            bytes_from_target,
            reason,
            state,
        }
    }
}

async fn drive<S, T>(
    stream: &mut S,
    driver: &mut TunnelDriver<T>,
    shutdown: &mut Option<watch::Receiver<bool>>,
    bytes_to_target: &mut u64,
    bytes_from_target: &mut u64,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    T: FrameTransport,
{
    let greeting = match driver.establish().await {
        Ok(response) => response,
        Err(e) => {
            error!(session_id = %driver.id(), "Proxy failed: {}", e);
            return CloseReason::EstablishFailed;
        }
    };

    match driver.relay(greeting, stream).await {
        Ok(n) => *bytes_from_target += n,
        Err(e) => return relay_failure(driver.id(), e),
    }

    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            read = stream.read(&mut buffer) => read,
            _ = stop_requested(shutdown) => return CloseReason::Shutdown,
        };
        let n = match read {
            Ok(0) => return CloseReason::InboundEof,
            Ok(n) => n,
            Err(e) => {
                error!(session_id = %driver.id(), "Inbound read failed: {}", e);
                return CloseReason::InboundReadFailed;
            }
        };
        *bytes_to_target += n as u64;

        let response = match driver.forward(Bytes::copy_from_slice(&buffer[..n])).await {
            Ok(response) => response,
            Err(e) => {
                error!(session_id = %driver.id(), "Proxy failed: {}", e);
                return CloseReason::TransportFailed;
            }
        };

        match driver.relay(response, stream).await {
            Ok(n) => *bytes_from_target += n,
            Err(e) => return relay_failure(driver.id(), e),
        }
    }
}

async fn stop_requested(shutdown: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = shutdown {
        let stopped = rx.wait_for(|stop| *stop).await.is_ok();
        if stopped {
            return;
        }
    }
    // No shutdown source, or its sender is gone
    std::future::pending::<()>().await
}

fn relay_failure(id: &str, e: DriverError) -> CloseReason {
    error!(session_id = %id, "Proxy failed: {}", e);
    match e {
        DriverError::Inbound(_) => CloseReason::InboundWriteFailed,
        DriverError::Frame { .. } | DriverError::InvalidState { .. } => CloseReason::TransportFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::tests::ScriptedTransport;
    use tokio::io::duplex;
    use toh_proto::Action;

    #[tokio::test]
    async fn test_greeting_then_eof_says_goodbye() {
        let transport = ScriptedTransport::default();
        transport.push(b"220 ready\r\n", false);
        let driver = TunnelDriver::new("abcd1234", "smtp:25", transport.clone());

        let (inbound, mut peer) = duplex(64 * 1024);
        let agent = Agent::new(inbound, "test", driver);
        let handle = tokio::spawn(agent.run());

        let mut greeting = vec![0u8; 11];
        peer.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, b"220 ready\r\n");

        peer.shutdown().await.unwrap();
        let summary = handle.await.unwrap();

        assert_eq!(summary.reason, CloseReason::InboundEof);
        assert_eq!(summary.state, SessionState::Closed);
        assert_eq!(summary.bytes_from_target, 11);
        assert_eq!(transport.actions(), vec![Action::Establish, Action::Goodbye]);
    }

    #[tokio::test]
    async fn test_forward_and_continuation() {
        let transport = ScriptedTransport::default();
        transport.push(b"", false);
        transport.push(b"PO", true);
        transport.push(b"NG", false);
        let driver = TunnelDriver::new("abcd1234", "echo:7", transport.clone());

        let (inbound, mut peer) = duplex(64 * 1024);
        let handle = tokio::spawn(Agent::new(inbound, "test", driver).run());

        peer.write_all(b"PING").await.unwrap();
        let mut reply = [0u8; 4];
        peer.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"PONG");

        peer.shutdown().await.unwrap();
        let summary = handle.await.unwrap();
        assert_eq!(summary.bytes_to_target, 4);
        assert_eq!(summary.bytes_from_target, 4);

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[1].action, Action::Forward);
        assert_eq!(&sent[1].body[..], b"PING");
        assert_eq!(sent[2].action, Action::Require);
        assert_eq!(sent[3].action, Action::Goodbye);
    }

    #[tokio::test]
    async fn test_establish_failure_closes_inbound() {
        let transport = ScriptedTransport::default();
        transport.push_err(500);
        let driver = TunnelDriver::new("abcd1234", "down:1", transport.clone());

        let (inbound, mut peer) = duplex(64 * 1024);
        let summary = Agent::new(inbound, "test", driver).run().await;

        assert_eq!(summary.reason, CloseReason::EstablishFailed);
        assert_eq!(transport.actions(), vec![Action::Establish]);

        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_session() {
        let transport = ScriptedTransport::default();
        let driver = TunnelDriver::new("abcd1234", "db:5432", transport.clone());
        let (stop_tx, stop_rx) = watch::channel(false);

        let (inbound, mut peer) = duplex(64 * 1024);
        let handle = tokio::spawn(Agent::new(inbound, "test", driver).with_shutdown(stop_rx).run());

        tokio::task::yield_now().await;
        stop_tx.send(true).unwrap();
        let summary = handle.await.unwrap();

        assert_eq!(summary.reason, CloseReason::Shutdown);
        assert_eq!(transport.actions(), vec![Action::Establish, Action::Goodbye]);

        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_forward_failure_skips_goodbye() {
        let transport = ScriptedTransport::default();
        transport.push(b"", false);
        transport.push_err(400);
        let driver = TunnelDriver::new("abcd1234", "db:5432", transport.clone());

        let (inbound, mut peer) = duplex(64 * 1024);
        let handle = tokio::spawn(Agent::new(inbound, "test", driver).run());

        peer.write_all(b"query").await.unwrap();
        let summary = handle.await.unwrap();

        assert_eq!(summary.reason, CloseReason::TransportFailed);
        assert_eq!(transport.actions(), vec![Action::Establish, Action::Forward]);
    }
}
