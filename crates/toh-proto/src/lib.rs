//! Tunnel Frame Protocol
//!
//! One tunnel operation is carried by one HTTP request/response pair.
//! This crate defines the action vocabulary, the header names, the shared
//! timing/size constants and the plain value types both halves exchange.

pub mod action;
pub mod frame;

pub use action::{Action, ProtocolError};
pub use frame::{new_session_id, FrameRequest, FrameResponse};

use std::time::Duration;

/// Size of one read chunk, on both the inbound socket and the target socket
pub const CHUNK_SIZE: usize = 10_000;

/// Number of read attempts a single drain performs against the target
pub const DRAIN_ATTEMPTS: usize = 3;

/// Upper bound of bytes returned by one drain
pub const DRAIN_CAP: usize = CHUNK_SIZE * DRAIN_ATTEMPTS;

/// Deadline of each individual drain attempt
pub const DRAIN_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(100);

/// Connect timeout used by the server when dialing a target
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for one complete HTTP frame exchange (connect + send + receive)
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on consecutive `Require` frames after one response
pub const DEFAULT_MAX_CHAIN: usize = 64;

/// Header names used by the frame protocol
pub mod headers {
    use http::HeaderName;

    /// Session identifier
    pub const PROXY_ID: HeaderName = HeaderName::from_static("proxy-id");
    /// One of `establish|forward|require|goodbye`
    pub const PROXY_ACTION: HeaderName = HeaderName::from_static("proxy-action");
    /// Target `host:port`, only meaningful on `establish`
    pub const PROXY_TARGET: HeaderName = HeaderName::from_static("proxy-target");
    /// Present with value `true` when the drain filled its cap
    pub const PROXY_HAS_NEXT: HeaderName = HeaderName::from_static("proxy-has-next");

    /// Value of [`PROXY_HAS_NEXT`] when set
    pub const HAS_NEXT_TRUE: &str = "true";

    /// Content type of every frame body
    pub const OCTET_STREAM: &str = "application/octet-stream";
}
