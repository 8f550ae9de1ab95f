//! Tunnel driver
//!
//! Sequential state machine for one session on the client side. It issues
//! the frames, and relays response bodies (following the continuation
//! chain) into the inbound socket.
//!
//! Every frame method takes `&mut self`, and closing consumes the driver, so
//! a session can neither have two frames in flight nor send after close.

use crate::transport::{FrameTransport, TransportError};
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use toh_proto::{Action, FrameRequest, FrameResponse, DEFAULT_MAX_CHAIN};
use tracing::{debug, warn};

/// Client-observed session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Establishing,
    Active,
    Closing,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Establishing => write!(f, "establishing"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Frame {action} failed: {source}")]
    Frame {
        action: Action,
        #[source]
        source: TransportError,
    },

    #[error("Failed to write to inbound connection: {0}")]
    Inbound(#[source] std::io::Error),

    #[error("Cannot send {action} while {state}")]
    InvalidState { action: Action, state: SessionState },
}

pub struct TunnelDriver<T> {
    id: String,
    target: String,
    transport: T,
    max_chain: usize,
    state: SessionState,
}

impl<T: FrameTransport> TunnelDriver<T> {
    pub fn new(id: impl Into<String>, target: impl Into<String>, transport: T) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            transport,
            max_chain: DEFAULT_MAX_CHAIN,
            state: SessionState::Idle,
        }
    }

    /// Bound the number of `Require` frames chained after one response
    pub fn with_max_chain(mut self, max_chain: usize) -> Self {
        self.max_chain = max_chain;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    async fn send(&mut self, action: Action, body: Bytes) -> Result<FrameResponse, DriverError> {
        let request = FrameRequest::new(self.id.clone(), action, self.target.clone()).with_body(body);
        self.transport
            .exchange(request)
            .await
            .map_err(|source| DriverError::Frame { action, source })
    }

    /// Open the session on the server
    pub async fn establish(&mut self) -> Result<FrameResponse, DriverError> {
        if self.state != SessionState::Idle {
            return Err(DriverError::InvalidState {
                action: Action::Establish,
                state: self.state,
            });
        }

        self.state = SessionState::Establishing;
        match self.send(Action::Establish, Bytes::new()).await {
            Ok(response) => {
                self.state = SessionState::Active;
                Ok(response)
            }
            Err(e) => {
                self.state = SessionState::Closing;
                Err(e)
            }
        }
    }

    pub async fn forward(&mut self, data: Bytes) -> Result<FrameResponse, DriverError> {
        self.active_send(Action::Forward, data).await
    }

    pub async fn require(&mut self) -> Result<FrameResponse, DriverError> {
        self.active_send(Action::Require, Bytes::new()).await
    }

    async fn active_send(&mut self, action: Action, body: Bytes) -> Result<FrameResponse, DriverError> {
        if self.state != SessionState::Active {
            return Err(DriverError::InvalidState {
                action,
                state: self.state,
            });
        }

        let result = self.send(action, body).await;
        if result.is_err() {
            self.state = SessionState::Closing;
        }
        result
    }

    /// Write `response` into `sink`, then keep polling with `Require` while
    /// the server signals more data, up to the chain bound.
    ///
    /// Returns the number of bytes written to `sink`.
    pub async fn relay<W>(&mut self, response: FrameResponse, sink: &mut W) -> Result<u64, DriverError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut response = response;
        let mut written = 0u64;
        let mut chained = 0usize;

        loop {
            if !response.body.is_empty() {
                sink.write_all(&response.body)
                    .await
                    .map_err(DriverError::Inbound)?;
                written += response.body.len() as u64;
                debug!(session_id = %self.id, bytes = response.body.len(), "Received from target");
            }

            if !response.has_next {
                break;
            }

            if chained >= self.max_chain {
                warn!(
                    session_id = %self.id,
                    max_chain = self.max_chain,
                    "Continuation chain bound reached, resuming inbound reads"
                );
                break;
            }

            chained += 1;
            response = self.require().await?;
        }

        sink.flush().await.map_err(DriverError::Inbound)?;
        Ok(written)
    }

    /// Close the session. Sends a best-effort `Goodbye` when asked to.
    pub async fn finish(mut self, goodbye: bool) -> SessionState {
        self.state = SessionState::Closing;
        if goodbye {
            if let Err(e) = self.send(Action::Goodbye, Bytes::new()).await {
                debug!(session_id = %self.id, "Goodbye failed: {}", e);
            }
        }
        SessionState::Closed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Transport replaying canned responses and recording requests
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedTransport {
        responses: Arc<Mutex<VecDeque<Result<FrameResponse, TransportError>>>>,
        pub(crate) sent: Arc<Mutex<Vec<FrameRequest>>>,
    }

    impl ScriptedTransport {
        pub(crate) fn push(&self, body: &[u8], has_next: bool) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Ok(FrameResponse::new(body.to_vec(), has_next)));
        }

        pub(crate) fn push_err(&self, status: u16) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Err(TransportError::Status(status)));
        }

        pub(crate) fn actions(&self) -> Vec<Action> {
            self.sent.lock().unwrap().iter().map(|r| r.action).collect()
        }
    }

    #[async_trait]
    impl FrameTransport for ScriptedTransport {
        async fn exchange(&mut self, request: FrameRequest) -> Result<FrameResponse, TransportError> {
            self.sent.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(FrameResponse::empty()))
        }
    }

    #[tokio::test]
    async fn test_establish_transitions() {
        let transport = ScriptedTransport::default();
        transport.push(b"hello", false);
        let mut driver = TunnelDriver::new("abcd1234", "db:5432", transport.clone());
        assert_eq!(driver.state(), SessionState::Idle);

        let response = driver.establish().await.unwrap();
        assert_eq!(&response.body[..], b"hello");
        assert_eq!(driver.state(), SessionState::Active);

        // Establish is only valid once
        assert!(matches!(
            driver.establish().await,
            Err(DriverError::InvalidState { .. })
        ));

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].id, "abcd1234");
        assert_eq!(sent[0].target.as_deref(), Some("db:5432"));
        assert!(sent[0].body.is_empty());
    }

    #[tokio::test]
    async fn test_failed_establish_blocks_forward() {
        let transport = ScriptedTransport::default();
        transport.push_err(500);
        let mut driver = TunnelDriver::new("abcd1234", "db:5432", transport.clone());

        assert!(driver.establish().await.is_err());
        assert_eq!(driver.state(), SessionState::Closing);
        assert!(matches!(
            driver.forward(Bytes::from_static(b"x")).await,
            Err(DriverError::InvalidState { .. })
        ));
        assert_eq!(transport.actions(), vec![Action::Establish]);
    }

    #[tokio::test]
    async fn test_relay_follows_continuation() {
        let transport = ScriptedTransport::default();
        transport.push(b"", false);
        transport.push(b"bbb", true);
        transport.push(b"ccc", false);
        let mut driver = TunnelDriver::new("abcd1234", "db:5432", transport.clone());
        driver.establish().await.unwrap();

        let mut sink = Vec::new();
        let first = FrameResponse::new(&b"aaa"[..], true);
        let written = driver.relay(first, &mut sink).await.unwrap();

        assert_eq!(written, 9);
        assert_eq!(sink, b"aaabbbccc");
        assert_eq!(
            transport.actions(),
            vec![Action::Establish, Action::Require, Action::Require]
        );
    }

    #[tokio::test]
    async fn test_relay_chain_is_bounded() {
        let transport = ScriptedTransport::default();
        transport.push(b"", false);
        for _ in 0..10 {
            transport.push(b"x", true);
        }
        let mut driver =
            TunnelDriver::new("abcd1234", "db:5432", transport.clone()).with_max_chain(3);
        driver.establish().await.unwrap();

        let mut sink = Vec::new();
        let written = driver
            .relay(FrameResponse::new(&b"x"[..], true), &mut sink)
            .await
            .unwrap();

        assert_eq!(written, 4);
        let requires = transport
            .actions()
            .into_iter()
            .filter(|a| *a == Action::Require)
            .count();
        assert_eq!(requires, 3);
        assert_eq!(driver.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_relay_stops_on_transport_failure() {
        let transport = ScriptedTransport::default();
        transport.push(b"", false);
        transport.push_err(400);
        let mut driver = TunnelDriver::new("abcd1234", "db:5432", transport.clone());
        driver.establish().await.unwrap();

        let mut sink = Vec::new();
        let result = driver
            .relay(FrameResponse::new(&b"part"[..], true), &mut sink)
            .await;

        assert!(matches!(
            result,
            Err(DriverError::Frame {
                action: Action::Require,
                ..
            })
        ));
        assert_eq!(sink, b"part");
        assert_eq!(driver.state(), SessionState::Closing);
    }

    #[tokio::test]
    async fn test_finish_sends_goodbye_only_when_asked() {
        let transport = ScriptedTransport::default();
        let mut driver = TunnelDriver::new("abcd1234", "db:5432", transport.clone());
        driver.establish().await.unwrap();
        assert_eq!(driver.finish(true).await, SessionState::Closed);
        assert_eq!(transport.actions(), vec![Action::Establish, Action::Goodbye]);

        let transport = ScriptedTransport::default();
        let mut driver = TunnelDriver::new("abcd1234", "db:5432", transport.clone());
        driver.establish().await.unwrap();
        assert_eq!(driver.finish(false).await, SessionState::Closed);
        assert_eq!(transport.actions(), vec![Action::Establish]);
    }

    #[tokio::test]
    async fn test_goodbye_failure_is_ignored() {
        let transport = ScriptedTransport::default();
        transport.push(b"", false);
        transport.push_err(502);
        let mut driver = TunnelDriver::new("abcd1234", "db:5432", transport.clone());
        driver.establish().await.unwrap();
        assert_eq!(driver.finish(true).await, SessionState::Closed);
    }
}
