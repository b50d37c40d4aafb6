//! The controller's internal HTTP endpoints: Prometheus metrics and health probes.
use actix_web::{get, http::header, web::Data, HttpResponse};
use opentelemetry::{global, metrics::MetricsError};
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::atomic::{AtomicBool, Ordering};

/// Process health as reported by the probe endpoints.
#[derive(Debug, Default)]
pub struct HealthState {
    leader: AtomicBool,
    synced: AtomicBool,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    /// Ready once this replica leads and its initial listing of the target DaemonSet has completed.
    pub fn is_ready(&self) -> bool {
        self.is_leader() && self.synced.load(Ordering::SeqCst)
    }
}

#[get("/metrics")]
pub async fn vending_metrics(registry: Data<Registry>) -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buf = Vec::new();
    if let Err(err) = encoder.encode(&metric_families[..], &mut buf) {
        global::handle_error(MetricsError::Other(err.to_string()));
    }

    let body = String::from_utf8(buf).unwrap_or_default();
    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, prometheus::TEXT_FORMAT))
        .body(body)
}

#[get("/healthz")]
pub async fn healthz() -> HttpResponse {
    HttpResponse::Ok().body("ok")
}

#[get("/readyz")]
pub async fn readyz(health: Data<HealthState>) -> HttpResponse {
    if health.is_ready() {
        HttpResponse::Ok().body("ok")
    } else {
        HttpResponse::ServiceUnavailable().body("not leading or not synced")
    }
}
