//! toh client
//!
//! Accepts local TCP connections and carries each one to the tunnel server
//! as a sequence of HTTP frames.

pub mod agent;
pub mod client;
pub mod driver;
pub mod transport;

pub use agent::{Agent, CloseReason, SessionSummary};
pub use client::{ClientConfig, ClientError, TunnelClient};
pub use driver::{DriverError, SessionState, TunnelDriver};
pub use transport::{FrameTransport, HttpTransport, TransportError};
