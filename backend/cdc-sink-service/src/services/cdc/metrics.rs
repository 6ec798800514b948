use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts};

/// Metrics for CDC consumer monitoring
#[derive(Clone)]
pub struct CdcConsumerMetrics {
    /// Events pulled off the stream, tombstones included
    pub events_received_total: IntCounter,
    /// Tombstones skipped without translation
    pub tombstones_skipped_total: IntCounter,
    /// Mutations applied, by kind
    pub mutations_applied_total: IntCounterVec,
    /// Per-event faults, by category (decode, classification, apply, archive)
    pub event_faults_total: IntCounterVec,
    /// Total number of Kafka consumer errors
    pub consumer_errors_total: IntCounter,
    /// Current consecutive error count (resets on success)
    pub consecutive_errors: IntGauge,
    /// Consumer health status (1 = healthy, 0 = unhealthy)
    pub consumer_healthy: IntGauge,
    /// Current backoff duration in seconds
    pub backoff_seconds: IntGauge,
}

impl CdcConsumerMetrics {
    pub fn new() -> Self {
        let registry = prometheus::default_registry();

        let events_received_total = IntCounter::new(
            "cdc_events_received_total",
            "Total number of change events received from the stream",
        )
        .expect("valid metric for cdc_events_received_total");

        let tombstones_skipped_total = IntCounter::new(
            "cdc_tombstones_skipped_total",
            "Total number of empty-payload events skipped",
        )
        .expect("valid metric for cdc_tombstones_skipped_total");

        let mutations_applied_total = IntCounterVec::new(
            Opts::new(
                "cdc_mutations_applied_total",
                "Total number of mutations applied to the destination",
            ),
            &["kind"],
        )
        .expect("valid metric for cdc_mutations_applied_total");

        let event_faults_total = IntCounterVec::new(
            Opts::new(
                "cdc_event_faults_total",
                "Total number of per-event faults by category",
            ),
            &["category"],
        )
        .expect("valid metric for cdc_event_faults_total");

        let consumer_errors_total = IntCounter::new(
            "cdc_consumer_errors_total",
            "Total number of Kafka consumer errors encountered",
        )
        .expect("valid metric for cdc_consumer_errors_total");

        let consecutive_errors = IntGauge::new(
            "cdc_consumer_consecutive_errors",
            "Current number of consecutive Kafka consumer errors",
        )
        .expect("valid metric for cdc_consumer_consecutive_errors");

        let consumer_healthy = IntGauge::new(
            "cdc_consumer_healthy",
            "CDC consumer health status (1 = healthy, 0 = unhealthy)",
        )
        .expect("valid metric for cdc_consumer_healthy");

        let backoff_seconds = IntGauge::new(
            "cdc_consumer_backoff_seconds",
            "Current backoff duration in seconds",
        )
        .expect("valid metric for cdc_consumer_backoff_seconds");

        // A second consumer in the same process keeps its own unregistered copies
        for metric in [
            Box::new(events_received_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(tombstones_skipped_total.clone()),
            Box::new(mutations_applied_total.clone()),
            Box::new(event_faults_total.clone()),
            Box::new(consumer_errors_total.clone()),
            Box::new(consecutive_errors.clone()),
            Box::new(consumer_healthy.clone()),
            Box::new(backoff_seconds.clone()),
        ] {
            let _ = registry.register(metric);
        }

        // Start as healthy
        consumer_healthy.set(1);

        Self {
            events_received_total,
            tombstones_skipped_total,
            mutations_applied_total,
            event_faults_total,
            consumer_errors_total,
            consecutive_errors,
            consumer_healthy,
            backoff_seconds,
        }
    }

    pub fn record_fault(&self, category: &str) {
        self.event_faults_total
            .with_label_values(&[category])
            .inc();
    }

    pub fn faults(&self, category: &str) -> u64 {
        self.event_faults_total
            .with_label_values(&[category])
            .get()
    }

    pub fn applied(&self, kind: &str) -> u64 {
        self.mutations_applied_total
            .with_label_values(&[kind])
            .get()
    }
}

impl Default for CdcConsumerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Prometheus text exposition of the default registry.
pub fn render() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
