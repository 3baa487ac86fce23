use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode, Uri, header},
    response::Response,
};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::state::AppState;

// Connection-scoped headers that must not cross the gateway, plus the ones
// the http clients recompute themselves
static SKIPPED_HEADERS: [header::HeaderName; 10] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
    header::CONTENT_LENGTH,
    header::HeaderName::from_static("keep-alive"),
];

// Copy every end-to-end header, keeping repeated values (e.g. Set-Cookie)
fn copy_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if !SKIPPED_HEADERS.contains(name) {
            to.append(name.clone(), value.clone());
        }
    }
}

// Forward an admitted request to the upstream app and relay its reply as is
pub async fn forward_handler(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let url = format!("{}{}", state.upstream, path);
    debug!("Forwarding to {}", url);

    let mut outbound = HeaderMap::new();
    copy_headers(&headers, &mut outbound);

    let res = state
        .client
        .post(&url)
        .headers(outbound)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            warn!(url = %url, error = %e, "Upstream request failed");
            GatewayError::Upstream(e.to_string())
        })?;

    let status = StatusCode::from_u16(res.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut relayed = HeaderMap::new();
    copy_headers(res.headers(), &mut relayed);

    let payload = res.bytes().await.map_err(|e| {
        warn!(url = %url, error = %e, "Failed to read upstream body");
        GatewayError::Upstream(e.to_string())
    })?;

    let mut response = Response::new(Body::from(payload));
    *response.status_mut() = status;
    *response.headers_mut() = relayed;
    Ok(response)
}
