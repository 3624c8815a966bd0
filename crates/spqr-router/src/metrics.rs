//! Prometheus metrics for the SPQR router

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_int_counter, register_int_gauge, register_int_gauge_vec,
    CounterVec, IntCounter, IntGauge, IntGaugeVec,
};

/// Total client sessions accepted
pub static SESSIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("spqr_sessions_total", "Client sessions accepted").unwrap()
});

/// Client sessions currently open
pub static ACTIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("spqr_active_sessions", "Client sessions currently open").unwrap()
});

/// Routing decisions by outcome (single, multi, reject)
pub static ROUTING_DECISIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "spqr_routing_decisions_total",
        "Routing decisions by outcome",
        &["outcome"]
    )
    .unwrap()
});

/// Statements forwarded to shards
pub static FORWARDED_QUERIES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("spqr_forwarded_queries_total", "Statements forwarded to shards")
        .unwrap()
});

/// Pooled backend connections by shard and state (idle, busy)
pub static BACKEND_POOL_SIZE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "spqr_backend_pool_size",
        "Pooled backend connections by shard and state",
        &["shard", "state"]
    )
    .unwrap()
});

pub fn record_session_start() {
    SESSIONS_TOTAL.inc();
    ACTIVE_SESSIONS.inc();
}

pub fn record_session_end() {
    ACTIVE_SESSIONS.dec();
}

pub fn record_routing_decision(outcome: &str) {
    ROUTING_DECISIONS.with_label_values(&[outcome]).inc();
    if outcome == "single" {
        FORWARDED_QUERIES.inc();
    }
}

pub fn update_backend_pool_size(shard: &str, idle: usize, busy: usize) {
    BACKEND_POOL_SIZE
        .with_label_values(&[shard, "idle"])
        .set(idle as i64);
    BACKEND_POOL_SIZE
        .with_label_values(&[shard, "busy"])
        .set(busy as i64);
}
