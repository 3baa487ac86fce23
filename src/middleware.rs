use axum::{
    Json,
    body::{Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures_util::{StreamExt, stream};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::guard::{CheckOutcome, ClientRequest, ClientResponse, IpSource, RateLimitGuard};
use crate::rate_limit::RateLimiter;

// Largest body prefix buffered to look for an identifier
pub const MAX_SNIFF_BYTES: usize = 64 * 1024;

// Paths with their own profile; everything else uses "default"
pub const GUARDED_ROUTES: [(&str, &str); 3] = [
    ("/api/auth/login", "login"),
    ("/api/auth/signup", "signup"),
    ("/api/verify-turnstile", "verify-turnstile"),
];

/// One guard per profile, picked by the normalised request path.
pub struct RouteGuards {
    routes: Vec<(&'static str, RateLimitGuard)>,
    fallback: RateLimitGuard,
}

impl RouteGuards {
    pub fn new(
        limiter: Arc<RateLimiter>,
        ip_source: IpSource,
        routes: &[(&'static str, &'static str)],
    ) -> Self {
        let routes = routes
            .iter()
            .map(|(path, action)| {
                let guard = RateLimitGuard::new(limiter.clone(), *action).with_ip_source(ip_source);
                (*path, guard)
            })
            .collect();

        Self {
            routes,
            fallback: RateLimitGuard::new(limiter, "default").with_ip_source(ip_source),
        }
    }

    pub fn for_path(&self, path: &str) -> &RateLimitGuard {
        let path = normalize_path(path);
        self.routes
            .iter()
            .find(|(route, _)| *route == path)
            .map(|(_, guard)| guard)
            .unwrap_or(&self.fallback)
    }
}

/// Collapse repeated slashes and drop trailing ones, so `/api/auth//login/`
/// resolves to the same profile as `/api/auth/login`.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

// Read-only view of an axum request
struct AxumRequest<'a> {
    headers: &'a HeaderMap,
    remote: Option<SocketAddr>,
    body: Option<Value>,
}

impl ClientRequest for AxumRequest<'_> {
    fn header(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self
            .headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote.map(|addr| addr.ip().to_string())
    }

    fn json_body(&self) -> Option<&Value> {
        self.body.as_ref()
    }
}

// Headers and an optional terminal reply collected while the guard runs
#[derive(Default)]
struct PendingResponse {
    headers: Vec<(&'static str, String)>,
    reply: Option<(StatusCode, Value)>,
}

impl ClientResponse for PendingResponse {
    fn set_header(&mut self, name: &'static str, value: String) {
        self.headers.retain(|(existing, _)| *existing != name);
        self.headers.push((name, value));
    }

    fn send_json(&mut self, status: StatusCode, body: Value) {
        self.reply = Some((status, body));
    }
}

impl PendingResponse {
    fn apply_headers(self, mut response: Response) -> Response {
        for (name, value) in self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().insert(name, value);
                }
                _ => warn!(header = name, "Skipping invalid rate limit header"),
            }
        }
        response
    }
}

/// Buffer up to `limit` bytes to look for a JSON body.
///
/// Returns the parsed JSON (only when the whole body fit) and a body that
/// yields exactly what the client sent, including any read error.
async fn sniff_body(body: Body, limit: usize) -> (Option<Value>, Body) {
    let mut data = body.into_data_stream();
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut size = 0;

    while let Some(next) = data.next().await {
        match next {
            Ok(chunk) => {
                size += chunk.len();
                chunks.push(chunk);
                if size > limit {
                    debug!(limit, "Body too large to inspect, limiting by IP only");
                    let head = stream::iter(chunks.into_iter().map(Ok::<_, axum::Error>));
                    return (None, Body::from_stream(head.chain(data)));
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to read request body, limiting by IP only");
                let head = chunks.into_iter().map(Ok).chain(std::iter::once(Err(e)));
                return (None, Body::from_stream(stream::iter(head)));
            }
        }
    }

    let bytes = Bytes::from(chunks.concat());
    (serde_json::from_slice(&bytes).ok(), Body::from(bytes))
}

// Rate limit middleware, used with axum::middleware::from_fn_with_state
pub async fn rate_limit(
    State(guards): State<Arc<RouteGuards>>,
    req: Request,
    next: Next,
) -> Response {
    let (parts, body) = req.into_parts();
    let guard = guards.for_path(parts.uri.path());
    let (json, body) = sniff_body(body, MAX_SNIFF_BYTES).await;

    let remote = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);

    let view = AxumRequest {
        headers: &parts.headers,
        remote,
        body: json,
    };

    let mut pending = PendingResponse::default();
    let outcome = guard.apply(&view, &mut pending);
    drop(view);

    if let CheckOutcome::Limited(_) = outcome {
        if let Some((status, body)) = pending.reply.take() {
            let refused = (status, Json(body)).into_response();
            return pending.apply_headers(refused);
        }
    }

    let response = next.run(Request::from_parts(parts, body)).await;
    pending.apply_headers(response)
}
