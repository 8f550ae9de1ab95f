//! Local TCP listener feeding one agent per accepted connection

use crate::agent::{Agent, SessionSummary};
use crate::driver::TunnelDriver;
use crate::transport::{HttpTransport, TransportError};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use toh_proto::{new_session_id, DEFAULT_MAX_CHAIN, FRAME_TIMEOUT};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}")]
    Bind { address: SocketAddr, reason: String },

    #[error("Failed to build HTTP client: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Local address accepting connections to tunnel
    pub listen_addr: SocketAddr,
    /// Proxy endpoint of the tunnel server, e.g. `http://host:9000/proxy`
    pub url: String,
    /// Target `host:port` as seen from the server
    pub target: String,
    /// Maximum `Require` frames chained after one response
    pub max_chain: usize,
    /// Deadline of each frame exchange
    pub frame_timeout: Duration,
    /// How long running sessions get to wind down once shutdown starts
    pub shutdown_grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            url: String::new(),
            target: "mysql:3306".to_string(),
            max_chain: DEFAULT_MAX_CHAIN,
            frame_timeout: FRAME_TIMEOUT,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

pub struct TunnelClient {
    config: ClientConfig,
    http: reqwest::Client,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = HttpTransport::build_client(config.frame_timeout)?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Build the agent for one accepted connection with a fresh session id
    pub fn agent(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> Agent<TcpStream, HttpTransport> {
        let transport = HttpTransport::new(
            self.http.clone(),
            self.config.url.clone(),
            self.config.frame_timeout,
        );
        let driver = TunnelDriver::new(new_session_id(), self.config.target.clone(), transport)
            .with_max_chain(self.config.max_chain);
        Agent::new(stream, peer.to_string(), driver).with_shutdown(shutdown)
    }

    /// Bind the local listener, retrying while the port is still in use
    pub async fn bind(&self) -> Result<TcpListener, ClientError> {
        let address = self.config.listen_addr;
        for attempt in 1..=3 {
            match TcpListener::bind(address).await {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 3 => {
                    warn!(
                        "Port {} is in use (attempt {}/3), retrying in 1 second...",
                        address.port(),
                        attempt
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => {
                    return Err(ClientError::Bind {
                        address,
                        reason: e.to_string(),
                    })
                }
            }
        }

        Err(ClientError::Bind {
            address,
            reason: "Address in use after 3 retry attempts".to_string(),
        })
    }

    /// Bind and accept until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<(), ClientError>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    ///
    /// Idle sessions then close at their next inbound read; a frame chain in
    /// progress runs to completion. Sessions still running after
    /// `shutdown_grace` are aborted.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), ClientError>
    where
        F: Future<Output = ()> + Send,
    {
        info!(
            "Proxy client listening on {} -> {} via {}",
            listener.local_addr()?,
            self.config.target,
            self.config.url
        );

        let mut sessions: JoinSet<SessionSummary> = JoinSet::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let agent = self.agent(stream, peer, stop_rx.clone());
                        debug!(session_id = %agent.id(), remote = %peer, "Accepted connection");
                        sessions.spawn(agent.run());
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                    }
                },
            }
        }

        drop(listener);
        let _ = stop_tx.send(true);
        if !sessions.is_empty() {
            info!(
                active = sessions.len(),
                "Waiting up to {:?} for running sessions",
                self.config.shutdown_grace
            );
            let finished = tokio::time::timeout(self.config.shutdown_grace, async {
                while sessions.join_next().await.is_some() {}
            })
            .await;
            if finished.is_err() {
                warn!(aborted = sessions.len(), "Aborting sessions still running");
                sessions.abort_all();
            }
        }

        info!("Proxy client shutdown");
        Ok(())
    }
}
