//! Prometheus metrics for pgbridge
//!
//! Tracks:
//! - Client connections
//! - Executions submitted to the worker pool and how they ended
//! - Routing decisions of the execution dispatcher
//!
//! Metrics register in the default prometheus registry. Exposing them
//! (`prometheus::gather()`) is up to the embedding application.

use crate::pg_wire::handler::{ExecutionOutcome, Route};
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use std::time::Instant;

// ═══════════════════════════════════════════════════════════════════════════
// CONNECTION METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Connections accepted since start
pub static CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("pgbridge_connections_total", "Client connections accepted")
        .expect("connections_total definition")
});

/// Connections currently open
pub static CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("pgbridge_connections_active", "Client connections currently open")
        .expect("connections_active definition")
});

// ═══════════════════════════════════════════════════════════════════════════
// EXECUTION METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Executions handed to the worker pool, by kind (extended, simple)
pub static EXECUTIONS_STARTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pgbridge_executions_started_total",
        "Executions submitted to the worker pool",
        &["kind"]
    )
    .expect("executions_started_total definition")
});

/// Executions whose response was written, by kind and outcome
pub static EXECUTIONS_ENDED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pgbridge_executions_ended_total",
        "Executions that finished, by outcome",
        &["kind", "outcome"]
    )
    .expect("executions_ended_total definition")
});

/// Time from submission to the last frame handed to the writer
pub static EXECUTION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "pgbridge_execution_seconds",
        "Execution latency in seconds",
        &["kind", "outcome"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]
    )
    .expect("execution_seconds definition")
});

/// Worker threads currently running a backend call
pub static WORKERS_BUSY: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("pgbridge_workers_busy", "Worker threads running a backend call")
        .expect("workers_busy definition")
});

// ═══════════════════════════════════════════════════════════════════════════
// ROUTING METRICS
// ═══════════════════════════════════════════════════════════════════════════

/// Statements routed, by route (empty, canned, metadata, data)
pub static ROUTES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pgbridge_routes_total",
        "Statements routed by the execution dispatcher",
        &["route"]
    )
    .expect("routes_total definition")
});

// ═══════════════════════════════════════════════════════════════════════════
// HELPER FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Held for the lifetime of a connection
pub struct ConnectionGuard(());

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        CONNECTIONS_ACTIVE.dec();
    }
}

/// Record an accepted connection; the gauge drops with the guard
pub fn connection_opened() -> ConnectionGuard {
    CONNECTIONS_TOTAL.inc();
    CONNECTIONS_ACTIVE.inc();
    ConnectionGuard(())
}

/// Measures one execution from submission to its outcome
pub struct ExecutionTimer {
    kind: &'static str,
    started: Instant,
}

impl ExecutionTimer {
    pub fn finish(self, outcome: &ExecutionOutcome) {
        let labels = [self.kind, outcome.label()];
        EXECUTIONS_ENDED_TOTAL.with_label_values(&labels).inc();
        EXECUTION_SECONDS
            .with_label_values(&labels)
            .observe(self.started.elapsed().as_secs_f64());
    }
}

/// Record a submitted execution
pub fn execution_started(kind: &'static str) -> ExecutionTimer {
    EXECUTIONS_STARTED_TOTAL.with_label_values(&[kind]).inc();
    ExecutionTimer {
        kind,
        started: Instant::now(),
    }
}

/// Record a routing decision
pub fn record_route(route: &Route) {
    ROUTES_TOTAL.with_label_values(&[route.label()]).inc();
}

/// Update the busy worker gauge
pub fn update_workers_busy(busy: usize) {
    WORKERS_BUSY.set(busy as i64);
}
