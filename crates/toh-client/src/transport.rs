//! Frame transport abstraction
//!
//! The driver only needs "send one frame, get one response". The production
//! implementation posts the frame over HTTP with reqwest.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use toh_proto::{headers, FrameRequest, FrameResponse, ProtocolError};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Frame timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected status code {0}")]
    Status(u16),

    #[error("Invalid frame: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Exchanges one frame with the tunnel server.
///
/// Takes `&mut self`: whoever owns the transport can have at most one
/// frame in flight.
#[async_trait]
pub trait FrameTransport: Send {
    async fn exchange(&mut self, request: FrameRequest) -> Result<FrameResponse, TransportError>;
}

/// Frame transport posting to the server's proxy endpoint
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }

    /// Build a client suitable for frame exchanges
    pub fn build_client(timeout: Duration) -> Result<reqwest::Client, TransportError> {
        Ok(reqwest::Client::builder().timeout(timeout).build()?)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn map_error(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else {
            TransportError::Http(e)
        }
    }
}

#[async_trait]
impl FrameTransport for HttpTransport {
    async fn exchange(&mut self, request: FrameRequest) -> Result<FrameResponse, TransportError> {
        let response = self
            .client
            .post(&self.url)
            .headers(request.to_headers()?)
            .header(reqwest::header::CONTENT_TYPE, headers::OCTET_STREAM)
            .body(request.body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        let has_next = FrameResponse::has_next_in(response.headers());
        let body = response.bytes().await.map_err(|e| self.map_error(e))?;

        Ok(FrameResponse { body, has_next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Status(400);
        assert!(err.to_string().contains("400"));

        let err = TransportError::Timeout(Duration::from_secs(10));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpTransport::build_client(Duration::from_secs(2)).unwrap();
        let mut transport =
            HttpTransport::new(client, format!("http://{}/proxy", addr), Duration::from_secs(2));

        let request = FrameRequest::new("abcd1234", toh_proto::Action::Establish, "db:5432");
        assert!(transport.exchange(request).await.is_err());
    }
}
