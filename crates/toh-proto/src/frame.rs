//! Frame value types and their header mapping

use crate::action::{Action, ProtocolError};
use crate::headers;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue};

/// Generate a fresh session id (8 hex characters of a random v4 UUID)
pub fn new_session_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// One tunnel operation as sent by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRequest {
    pub id: String,
    pub action: Action,
    /// Target address; the server only reads it on `Establish`
    pub target: Option<String>,
    pub body: Bytes,
}

impl FrameRequest {
    pub fn new(id: impl Into<String>, action: Action, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action,
            target: Some(target.into()),
            body: Bytes::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Decode a frame from request headers and body.
    ///
    /// The id and action are always required. The target is required only
    /// when the action needs it and is dropped otherwise.
    pub fn from_headers(headers: &HeaderMap, body: Bytes) -> Result<Self, ProtocolError> {
        let id = header_str(headers, &headers::PROXY_ID, "Proxy-Id")?
            .filter(|id| !id.is_empty())
            .ok_or(ProtocolError::MissingId)?;

        let action = header_str(headers, &headers::PROXY_ACTION, "Proxy-Action")?
            .filter(|action| !action.is_empty())
            .ok_or(ProtocolError::MissingAction)?
            .parse::<Action>()?;

        let target = if action.requires_target() {
            let target = header_str(headers, &headers::PROXY_TARGET, "Proxy-Target")?
                .filter(|target| !target.is_empty())
                .ok_or(ProtocolError::MissingTarget)?;
            Some(target.to_string())
        } else {
            None
        };

        Ok(Self {
            id: id.to_string(),
            action,
            target,
            body,
        })
    }

    /// Encode the frame's metadata as request headers
    pub fn to_headers(&self) -> Result<HeaderMap, ProtocolError> {
        let mut map = HeaderMap::new();
        map.insert(
            headers::PROXY_ID,
            HeaderValue::from_str(&self.id).map_err(|_| ProtocolError::InvalidHeader("Proxy-Id"))?,
        );
        map.insert(
            headers::PROXY_ACTION,
            HeaderValue::from_static(self.action.as_str()),
        );
        if let Some(target) = &self.target {
            map.insert(
                headers::PROXY_TARGET,
                HeaderValue::from_str(target)
                    .map_err(|_| ProtocolError::InvalidHeader("Proxy-Target"))?,
            );
        }
        Ok(map)
    }
}

fn header_str<'a>(
    headers: &'a HeaderMap,
    name: &http::HeaderName,
    display: &'static str,
) -> Result<Option<&'a str>, ProtocolError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map(str::trim)
                .map_err(|_| ProtocolError::InvalidHeader(display))
        })
        .transpose()
}

/// Bytes read back from the target plus the continuation flag
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameResponse {
    pub body: Bytes,
    /// The drain filled its cap; more target data is likely already buffered
    pub has_next: bool,
}

impl FrameResponse {
    pub fn new(body: impl Into<Bytes>, has_next: bool) -> Self {
        Self {
            body: body.into(),
            has_next,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Read the continuation flag from response headers
    pub fn has_next_in(headers: &HeaderMap) -> bool {
        headers
            .get(&headers::PROXY_HAS_NEXT)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().eq_ignore_ascii_case(headers::HAS_NEXT_TRUE))
            .unwrap_or(false)
    }
}
