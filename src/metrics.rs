use lazy_static::lazy_static;
use prometheus::{Counter, Gauge, register_counter, register_gauge};

lazy_static! {
    pub static ref RATE_LIMIT_CHECKS: Counter = register_counter!(
        "debt_flow_guard_rate_limit_checks_total",
        "Total rate limit checks"
    )
    .unwrap();
    pub static ref LIMITED_BY_IP: Counter = register_counter!(
        "debt_flow_guard_limited_ip_total",
        "Requests refused by the per-IP limit"
    )
    .unwrap();
    pub static ref LIMITED_BY_IDENTIFIER: Counter = register_counter!(
        "debt_flow_guard_limited_identifier_total",
        "Requests refused by the per-identifier limit"
    )
    .unwrap();
    pub static ref DEGRADED: Counter = register_counter!(
        "debt_flow_guard_degraded_total",
        "Requests let through because the limiter failed"
    )
    .unwrap();
    pub static ref SWEPT_ENTRIES: Counter = register_counter!(
        "debt_flow_guard_swept_entries_total",
        "Expired entries removed by the sweeper"
    )
    .unwrap();
    pub static ref STORE_SIZE: Gauge = register_gauge!(
        "debt_flow_guard_store_size",
        "Current number of rate limit entries"
    )
    .unwrap();
}
