//! Frame actions and protocol-level errors

use thiserror::Error;

/// Errors raised while interpreting a frame at the protocol boundary
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Missing session id")]
    MissingId,

    #[error("Missing action")]
    MissingAction,

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Missing target address")]
    MissingTarget,

    #[error("Header {0} is not valid UTF-8")]
    InvalidHeader(&'static str),
}

/// Operation carried by a single frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Open the target connection and return any greeting bytes
    Establish,
    /// Deliver the body to the target and return whatever it answers
    Forward,
    /// Deliver nothing, only poll for more target bytes
    Require,
    /// Tear the session down
    Goodbye,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Establish => "establish",
            Action::Forward => "forward",
            Action::Require => "require",
            Action::Goodbye => "goodbye",
        }
    }

    /// Whether the server must see a `Proxy-Target` header for this action
    pub fn requires_target(&self) -> bool {
        matches!(self, Action::Establish)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "establish" => Ok(Action::Establish),
            "forward" => Ok(Action::Forward),
            "require" => Ok(Action::Require),
            "goodbye" => Ok(Action::Goodbye),
            other => Err(ProtocolError::UnknownAction(other.to_string())),
        }
    }
}
