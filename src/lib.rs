pub mod clock;
pub mod config;
pub mod error;
pub mod guard;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod rate_limit;
pub mod router;
pub mod state;
pub mod sweeper;

pub use guard::{CheckOutcome, Guarded, IpSource, LimitScope, RateLimitGuard, with_rate_limit};
pub use rate_limit::{RateLimiter, rate_limit_key};
