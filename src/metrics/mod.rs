//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Draining progress per stream
//! - Action dispatch
//! - Transaction building, signing and publishing
//! - Retries and health checks

use crate::error::GroupResult;
use crate::model::Stream;

use axum::{routing::get, Router};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Draining metrics
    pub static ref OUTPUTS_DRAINED: CounterVec = register_counter_vec!(
        "trusted_group_outputs_drained_total",
        "Total output updates persisted by draining",
        &["stream"]
    ).expect("metric registration");

    pub static ref DRAIN_CHECKPOINT: GaugeVec = register_gauge_vec!(
        "trusted_group_drain_checkpoint_seconds",
        "Persisted draining checkpoint as unix time",
        &["stream"]
    ).expect("metric registration");

    // Action metrics
    pub static ref ACTIONS_DISPATCHED: CounterVec = register_counter_vec!(
        "trusted_group_actions_dispatched_total",
        "Total actions offered to every worker",
        &["stream"]
    ).expect("metric registration");

    // Transaction metrics
    pub static ref TX_BUILT: CounterVec = register_counter_vec!(
        "trusted_group_transactions_built_total",
        "Total transaction requests accepted",
        &["stream"]
    ).expect("metric registration");

    pub static ref TX_SIGNED: CounterVec = register_counter_vec!(
        "trusted_group_transactions_signed_total",
        "Total signing rounds committed",
        &["stream"]
    ).expect("metric registration");

    pub static ref TX_REQUEUED: CounterVec = register_counter_vec!(
        "trusted_group_transactions_requeued_total",
        "Total transactions moved to the queue tail",
        &["stream"]
    ).expect("metric registration");

    pub static ref TX_PUBLISHED: CounterVec = register_counter_vec!(
        "trusted_group_transactions_published_total",
        "Total transactions confirmed by a snapshot",
        &["stream"]
    ).expect("metric registration");

    // Health metrics
    pub static ref RETRIES: CounterVec = register_counter_vec!(
        "trusted_group_retries_total",
        "Total loop passes retried after a transient error",
        &["stream"]
    ).expect("metric registration");

    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "trusted_group_health_check_success_total",
        "Total successful health checks",
        &[]
    ).expect("metric registration");

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "trusted_group_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).expect("metric registration");
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> GroupResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

// Helper functions to record metrics

pub fn record_outputs_drained(stream: Stream, count: usize) {
    OUTPUTS_DRAINED
        .with_label_values(&[stream.label()])
        .inc_by(count as f64);
}

pub fn record_checkpoint(stream: Stream, checkpoint: DateTime<Utc>) {
    DRAIN_CHECKPOINT
        .with_label_values(&[stream.label()])
        .set(checkpoint.timestamp() as f64);
}

pub fn record_action_dispatched(stream: Stream) {
    ACTIONS_DISPATCHED.with_label_values(&[stream.label()]).inc();
}

pub fn record_transaction_built(stream: Stream) {
    TX_BUILT.with_label_values(&[stream.label()]).inc();
}

pub fn record_transaction_signed(stream: Stream) {
    TX_SIGNED.with_label_values(&[stream.label()]).inc();
}

pub fn record_transaction_requeued(stream: Stream) {
    TX_REQUEUED.with_label_values(&[stream.label()]).inc();
}

pub fn record_transaction_published(stream: Stream) {
    TX_PUBLISHED.with_label_values(&[stream.label()]).inc();
}

pub fn record_retry(stream: Stream) {
    RETRIES.with_label_values(&[stream.label()]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_are_exported() {
        record_retry(Stream::Collectible);
        record_outputs_drained(Stream::Multisig, 3);
        let body = metrics_handler().await;
        assert!(body.contains("trusted_group_retries_total"));
        assert!(body.contains("stream=\"collectible\""));
        assert!(body.contains("trusted_group_outputs_drained_total"));
    }
}
