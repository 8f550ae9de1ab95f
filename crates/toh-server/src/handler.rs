//! HTTP handlers for the proxy endpoint and the health check

use crate::adapter::{Adapter, AdapterError, Drained};
use crate::registry::SessionRegistry;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::sync::Arc;
use toh_proto::{headers, Action, FrameRequest};
use tracing::{debug, error, info, warn};

/// Liveness check
pub async fn health() -> &'static str {
    "ok"
}

/// Decode one frame, apply it to the session registry, encode the result
pub async fn proxy(
    State(registry): State<Arc<SessionRegistry>>,
    request_headers: HeaderMap,
    body: Bytes,
) -> Response {
    let frame = match FrameRequest::from_headers(&request_headers, body) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Rejected frame: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match frame.action {
        Action::Establish => establish(&registry, frame).await,
        Action::Forward | Action::Require => exchange(&registry, frame).await,
        Action::Goodbye => {
            if registry.delete(&frame.id).await {
                info!(session_id = %frame.id, "Session finished");
            } else {
                debug!(session_id = %frame.id, "Goodbye for unknown session");
            }
            StatusCode::OK.into_response()
        }
    }
}

async fn establish(registry: &SessionRegistry, frame: FrameRequest) -> Response {
    let Some(target) = frame.target.as_deref() else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let adapter = match registry.create(&frame.id, target).await {
        Ok(adapter) => adapter,
        Err(e) => {
            error!(session_id = %frame.id, target = %target, "Establish failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    info!(session_id = %frame.id, target = %target, "New connection established");

    let result = adapter.handle_frame(&frame.body).await;
    respond(registry, &adapter, result).await
}

async fn exchange(registry: &SessionRegistry, frame: FrameRequest) -> Response {
    let Some(adapter) = registry.get(&frame.id).await else {
        warn!(session_id = %frame.id, action = %frame.action, "Frame for unknown session");
        return StatusCode::BAD_REQUEST.into_response();
    };

    // Require only polls
    let body: &[u8] = match frame.action {
        Action::Require => &[],
        _ => &frame.body,
    };

    let result = adapter.handle_frame(body).await;
    respond(registry, &adapter, result).await
}

async fn respond(
    registry: &SessionRegistry,
    adapter: &Arc<Adapter>,
    result: Result<Drained, AdapterError>,
) -> Response {
    match result {
        Ok(drained) => drained_response(drained),
        Err(e) if e.is_fatal() => {
            error!(session_id = %adapter.id(), "Target I/O failed, closing session: {}", e);
            registry.remove(adapter).await;
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(e) => {
            warn!(session_id = %adapter.id(), "Frame rejected: {}", e);
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}

fn drained_response(drained: Drained) -> Response {
    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(headers::OCTET_STREAM),
    );
    if drained.more_likely {
        response_headers.insert(
            headers::PROXY_HAS_NEXT,
            HeaderValue::from_static(headers::HAS_NEXT_TRUE),
        );
    }

    (StatusCode::OK, response_headers, drained.data).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drained_response_flag() {
        let response = drained_response(Drained {
            data: Bytes::from_static(b"abc"),
            more_likely: true,
        });
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("Proxy-Has-Next").unwrap(), "true");

        let response = drained_response(Drained::default());
        assert!(response.headers().get("Proxy-Has-Next").is_none());
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/octet-stream"
        );
    }

    #[tokio::test]
    async fn test_health() {
        assert_eq!(health().await, "ok");
    }
}
