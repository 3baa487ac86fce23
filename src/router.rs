use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use std::sync::Arc;

use crate::guard::IpSource;
use crate::handlers::{forward_handler, health_handler, metrics_handler};
use crate::middleware::{GUARDED_ROUTES, RouteGuards, rate_limit};
use crate::rate_limit::RateLimiter;
use crate::state::AppState;

/// Gateway routes. Every POST under /api is forwarded; the rate limit profile
/// is picked from the normalised path, so `/api/auth/login/` is still "login".
pub fn router(state: Arc<AppState>, limiter: Arc<RateLimiter>, ip_source: IpSource) -> Router {
    let guards = Arc::new(RouteGuards::new(limiter, ip_source, &GUARDED_ROUTES));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route(
            "/api/{*path}",
            post(forward_handler).layer(from_fn_with_state(guards, rate_limit)),
        )
        .with_state(state)
}
