//! toh server
//!
//! Terminates tunnel frames arriving over HTTP and turns them back into
//! byte-stream I/O against the real target, one TCP connection per session.

pub mod adapter;
pub mod handler;
pub mod registry;
pub mod server;

pub use adapter::{Adapter, AdapterError, AdapterLease, Drained};
pub use registry::{RegistryError, SessionRegistry};
pub use server::{build_router, normalize_path, ProxyServer, ServerConfig, ServerError};
