//! Prometheus metrics for the relayer
//!
//! One [`Metrics`] value owns its own registry and is handed to every
//! component as `Arc<Metrics>`. Series are labelled by domain ID.

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

use crate::types::DomainId;

pub struct Metrics {
    pub deposits_detected_total: IntCounterVec,
    pub messages_routed_total: IntCounterVec,
    pub messages_dropped_total: IntCounterVec,
    pub votes_submitted_total: IntCounterVec,
    pub executions_submitted_total: IntCounterVec,
    pub tx_retries_total: IntCounterVec,
    pub errors_total: IntCounterVec,
    pub last_checkpoint: IntGaugeVec,
    pub latest_block: IntGaugeVec,
    pub up: prometheus::IntGauge,
    pub registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let metric =
        IntCounterVec::new(Opts::new(name, help), labels).expect("constant metric name is valid");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric registration must not be called twice");
    metric
}

fn gauge(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    let metric =
        IntGaugeVec::new(Opts::new(name, help), labels).expect("constant metric name is valid");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric registration must not be called twice");
    metric
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let deposits_detected_total = counter(
            &registry,
            "relayer_deposits_detected_total",
            "Total number of deposit events detected",
            &["chain"],
        );
        let messages_routed_total = counter(
            &registry,
            "relayer_messages_routed_total",
            "Messages delivered to a destination writer",
            &["source", "destination"],
        );
        let messages_dropped_total = counter(
            &registry,
            "relayer_messages_dropped_total",
            "Messages dropped before reaching a writer",
            &["chain", "reason"],
        );
        let votes_submitted_total = counter(
            &registry,
            "relayer_votes_submitted_total",
            "Vote transactions confirmed",
            &["chain"],
        );
        let executions_submitted_total = counter(
            &registry,
            "relayer_executions_submitted_total",
            "Execute transactions confirmed",
            &["chain"],
        );
        let tx_retries_total = counter(
            &registry,
            "relayer_tx_retries_total",
            "Transaction attempts retried",
            &["chain", "class"],
        );
        let errors_total = counter(
            &registry,
            "relayer_errors_total",
            "Total number of reported errors",
            &["chain", "type"],
        );
        let last_checkpoint = gauge(
            &registry,
            "relayer_last_checkpoint",
            "Last block fully processed",
            &["chain"],
        );
        let latest_block = gauge(
            &registry,
            "relayer_latest_block",
            "Latest chain head observed",
            &["chain"],
        );

        let up = prometheus::IntGauge::new("relayer_up", "Whether the relayer is running")
            .expect("constant metric name is valid");
        registry
            .register(Box::new(up.clone()))
            .expect("metric registration must not be called twice");

        Self {
            deposits_detected_total,
            messages_routed_total,
            messages_dropped_total,
            votes_submitted_total,
            executions_submitted_total,
            tx_retries_total,
            errors_total,
            last_checkpoint,
            latest_block,
            up,
            registry,
        }
    }

    pub fn set_checkpoint(&self, domain_id: DomainId, block: u64) {
        self.last_checkpoint
            .with_label_values(&[&domain_id.to_string()])
            .set(block as i64);
    }

    pub fn set_latest_block(&self, domain_id: DomainId, block: u64) {
        self.latest_block
            .with_label_values(&[&domain_id.to_string()])
            .set(block as i64);
    }

    pub fn deposit_detected(&self, domain_id: DomainId) {
        self.deposits_detected_total
            .with_label_values(&[&domain_id.to_string()])
            .inc();
    }

    pub fn message_routed(&self, source: DomainId, destination: DomainId) {
        self.messages_routed_total
            .with_label_values(&[&source.to_string(), &destination.to_string()])
            .inc();
    }

    pub fn message_dropped(&self, domain_id: DomainId, reason: &str) {
        self.messages_dropped_total
            .with_label_values(&[&domain_id.to_string(), reason])
            .inc();
    }

    pub fn vote_submitted(&self, domain_id: DomainId) {
        self.votes_submitted_total
            .with_label_values(&[&domain_id.to_string()])
            .inc();
    }

    pub fn execution_submitted(&self, domain_id: DomainId) {
        self.executions_submitted_total
            .with_label_values(&[&domain_id.to_string()])
            .inc();
    }

    pub fn tx_retry(&self, domain_id: DomainId, class: &str) {
        self.tx_retries_total
            .with_label_values(&[&domain_id.to_string(), class])
            .inc();
    }

    pub fn error(&self, domain_id: DomainId, kind: &str) {
        self.errors_total
            .with_label_values(&[&domain_id.to_string(), kind])
            .inc();
    }
}
