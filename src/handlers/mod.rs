mod forward;
mod health;
mod metrics;

pub use forward::forward_handler;
pub use health::health_handler;
pub use metrics::metrics_handler;
