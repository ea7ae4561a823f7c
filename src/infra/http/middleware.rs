use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::SNAPSHOT_HEADER;
use crate::application::error::ErrorReport;

const TARGET: &str = "crawlsnap::http::response";

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Correlation id for one request, taken from `x-request-id` when the
/// client sent a usable one.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl RequestId {
    fn from_request(request: &Request<Body>) -> Self {
        request
            .headers()
            .get(&REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty() && value.len() <= 128)
            .map(|value| Self(value.to_string()))
            .unwrap_or_else(|| Self(Uuid::new_v4().to_string()))
    }
}

/// Tag the request with a [`RequestId`], echo it back, and log the outcome:
/// served snapshots at debug, failures with their [`ErrorReport`] chain.
pub async fn trace_requests(mut request: Request<Body>, next: Next) -> Response {
    let request_id = RequestId::from_request(&request);
    request.extensions_mut().insert(request_id.clone());
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let mut response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis() as u64;

    if let Some(freshness) = response
        .headers()
        .get(&SNAPSHOT_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        debug!(
            target = TARGET,
            status = status.as_u16(),
            path = %uri.path(),
            freshness,
            elapsed_ms,
            request_id = %request_id.0,
            "snapshot served",
        );
    } else if status.is_client_error() || status.is_server_error() {
        let (source, messages) = match response.extensions_mut().remove::<ErrorReport>() {
            Some(report) => (report.source, report.messages),
            None => ("unknown", Vec::new()),
        };
        let detail = messages
            .first()
            .map(String::as_str)
            .unwrap_or("no diagnostic available");

        if status.is_server_error() {
            error!(
                target = TARGET,
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                query = uri.query().unwrap_or(""),
                elapsed_ms,
                source,
                detail,
                chain = ?messages,
                request_id = %request_id.0,
                "request failed",
            );
        } else {
            warn!(
                target = TARGET,
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                elapsed_ms,
                source,
                detail,
                request_id = %request_id.0,
                "client request error",
            );
        }
    }

    if let Ok(value) = HeaderValue::from_str(&request_id.0) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response.extensions_mut().insert(request_id);
    response
}
