use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::applier::MutationApplier;
use super::archiver::{AuditTable, RawEventArchiver};
use super::classifier::classify;
use super::metrics::CdcConsumerMetrics;
use super::models::{ChangeEvent, MutationKind};
use super::stream::ChangeStream;
use super::translator::{translate, TableSchema};
use crate::error::{Result, SinkError};
use crate::store::DestinationStore;

/// Threshold for consecutive errors before marking consumer as unhealthy
const UNHEALTHY_ERROR_THRESHOLD: u32 = 5;

/// Threshold for consecutive errors before emitting critical warning
const CRITICAL_ERROR_THRESHOLD: u32 = 10;

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Error handling state for the CDC consumer
pub struct ConsumerErrorState {
    /// Number of consecutive errors
    consecutive_count: AtomicU32,
    /// Timestamp of last successful operation (Unix millis)
    last_success_ms: AtomicU64,
}

impl ConsumerErrorState {
    pub fn new() -> Self {
        Self {
            consecutive_count: AtomicU32::new(0),
            last_success_ms: AtomicU64::new(now_millis()),
        }
    }

    /// Record a successful receive, resetting error count
    pub fn record_success(&self) {
        self.consecutive_count.store(0, Ordering::SeqCst);
        self.last_success_ms.store(now_millis(), Ordering::SeqCst);
    }

    /// Record an error, incrementing consecutive count
    pub fn record_error(&self) -> u32 {
        self.consecutive_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_count.load(Ordering::SeqCst)
    }

    pub fn time_since_success(&self) -> Duration {
        let last = self.last_success_ms.load(Ordering::SeqCst);
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    /// Exponential backoff: 1s, 2s, 4s, ... capped at 60s
    pub fn calculate_backoff(&self) -> Duration {
        const MIN_BACKOFF_SECS: u64 = 1;
        const MAX_BACKOFF_SECS: u64 = 60;

        let errors = self.consecutive_errors();
        if errors == 0 {
            return Duration::from_secs(MIN_BACKOFF_SECS);
        }

        let backoff_secs = 2u64
            .saturating_pow(errors.saturating_sub(1))
            .min(MAX_BACKOFF_SECS);
        Duration::from_secs(backoff_secs)
    }

    /// Unhealthy after too many consecutive errors, or errors with no success
    /// for more than 5 minutes.
    pub fn is_healthy(&self) -> bool {
        let errors = self.consecutive_errors();
        if errors >= UNHEALTHY_ERROR_THRESHOLD {
            return false;
        }
        !(self.time_since_success() > Duration::from_secs(300) && errors > 0)
    }
}

impl Default for ConsumerErrorState {
    fn default() -> Self {
        Self::new()
    }
}

/// Status information for the CDC consumer
#[derive(Debug, Clone)]
pub struct ConsumerStatus {
    pub healthy: bool,
    pub consecutive_errors: u32,
    pub time_since_last_success: Duration,
    pub current_backoff: Duration,
}

/// Read-only view of consumer health for the HTTP probes.
#[derive(Clone)]
pub struct HealthHandle {
    error_state: Arc<ConsumerErrorState>,
}

impl HealthHandle {
    pub fn status(&self) -> ConsumerStatus {
        ConsumerStatus {
            healthy: self.error_state.is_healthy(),
            consecutive_errors: self.error_state.consecutive_errors(),
            time_since_last_success: self.error_state.time_since_success(),
            current_backoff: self.error_state.calculate_backoff(),
        }
    }
}

/// Lifecycle of the consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Polling,
    Processing,
    ShuttingDown,
}

/// What happened to a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied(MutationKind),
    SkippedTombstone,
}

/// CDC Consumer service
///
/// Pulls change events one at a time and runs archive, classify, translate and
/// apply for each before asking for the next. Per-key ordering relies on this
/// strict sequencing; do not process events concurrently.
pub struct CdcConsumer<S> {
    stream: S,
    archiver: RawEventArchiver,
    applier: MutationApplier,
    schema: TableSchema,
    archive_tombstones: bool,
    metrics: CdcConsumerMetrics,
    error_state: Arc<ConsumerErrorState>,
    shutdown_rx: watch::Receiver<bool>,
    state: ConsumerState,
}

impl<S: ChangeStream> CdcConsumer<S> {
    pub fn new(
        stream: S,
        store: Arc<dyn DestinationStore>,
        schema: TableSchema,
        audit: AuditTable,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        info!(
            table = %schema.table,
            primary_key = %schema.primary_key,
            audit_table = %audit.table,
            "Initializing CDC consumer"
        );

        Self {
            stream,
            archiver: RawEventArchiver::new(store.clone(), audit),
            applier: MutationApplier::new(store),
            schema,
            archive_tombstones: false,
            metrics: CdcConsumerMetrics::new(),
            error_state: Arc::new(ConsumerErrorState::new()),
            shutdown_rx,
            state: ConsumerState::Idle,
        }
    }

    /// Also write tombstones to the audit table.
    pub fn with_tombstone_archiving(mut self, enabled: bool) -> Self {
        self.archive_tombstones = enabled;
        self
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn metrics(&self) -> &CdcConsumerMetrics {
        &self.metrics
    }

    pub fn health(&self) -> HealthHandle {
        HealthHandle {
            error_state: Arc::clone(&self.error_state),
        }
    }

    pub fn status(&self) -> ConsumerStatus {
        self.health().status()
    }

    /// Run until shutdown is signalled or the stream fails for good.
    ///
    /// Shutdown is checked before each receive and raced against it; an event
    /// that has been received is always processed to completion and
    /// acknowledged first.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting CDC consumer loop");
        self.state = ConsumerState::Polling;

        let outcome = loop {
            if *self.shutdown_rx.borrow() {
                info!("Shutdown signal received, stopping CDC consumer");
                break Ok(());
            }

            let received = tokio::select! {
                biased;
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() {
                        warn!("Shutdown channel closed, stopping CDC consumer");
                        break Ok(());
                    }
                    continue;
                }
                received = self.stream.next_event() => received,
            };

            match received {
                Ok(Some(event)) => {
                    self.record_receive_success();
                    self.state = ConsumerState::Processing;
                    match self.process_event(&event).await {
                        Ok(outcome) => debug!(?outcome, "CDC event processed"),
                        // Already logged and counted; the event is skipped
                        Err(e) => debug!(category = e.category(), "CDC event skipped"),
                    }
                    if let Err(e) = self.stream.acknowledge(&event).await {
                        warn!(error = %e, "Failed to acknowledge CDC event");
                    }
                    self.state = ConsumerState::Polling;
                }
                Ok(None) => {
                    error!("CDC stream ended, no further events can be received");
                    break Err(SinkError::TransportClosed(
                        "change stream ended".to_string(),
                    ));
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Unrecoverable CDC stream failure");
                    break Err(e);
                }
                Err(e) => {
                    let backoff = self.record_receive_error(&e);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown_rx.changed() => {}
                    }
                }
            }
        };

        self.shutdown().await;
        outcome
    }

    async fn shutdown(&mut self) {
        self.state = ConsumerState::ShuttingDown;
        self.stream.close().await;
        self.metrics.consumer_healthy.set(0);
        info!("CDC consumer stopped");
    }

    /// Archive, classify, translate and apply one event.
    pub async fn process_event(&self, event: &ChangeEvent) -> Result<EventOutcome> {
        self.metrics.events_received_total.inc();

        if let Some(pos) = &event.position {
            debug!(
                topic = %pos.topic,
                partition = pos.partition,
                offset = pos.offset,
                "Received CDC message"
            );
        }

        if event.is_tombstone() {
            self.metrics.tombstones_skipped_total.inc();
            debug!(
                received_at = event.stream_offset_timestamp,
                "Skipping tombstone event"
            );
            if self.archive_tombstones {
                self.archive(event).await;
            }
            return Ok(EventOutcome::SkippedTombstone);
        }

        self.archive(event).await;

        match self.translate_and_apply(event).await {
            Ok(kind) => {
                self.metrics
                    .mutations_applied_total
                    .with_label_values(&[kind.as_str()])
                    .inc();
                Ok(EventOutcome::Applied(kind))
            }
            Err(e) => {
                self.metrics.record_fault(e.category());
                self.log_fault(event, &e);
                Err(e)
            }
        }
    }

    async fn translate_and_apply(&self, event: &ChangeEvent) -> Result<MutationKind> {
        let payload = event.decoded()?;
        let kind = classify(&payload);
        let mutation = translate(kind, &payload, &self.schema)?;

        debug!(table = %self.schema.table, kind = %kind, "Applying CDC mutation");
        self.applier.apply(&mutation).await?;
        Ok(kind)
    }

    /// Audit failures never stop the event from being applied.
    async fn archive(&self, event: &ChangeEvent) {
        if let Err(e) = self.archiver.archive(event).await {
            self.metrics.record_fault("archive");
            error!(
                error = %e,
                received_at = event.stream_offset_timestamp,
                "Failed to archive raw CDC event"
            );
        }
    }

    fn log_fault(&self, event: &ChangeEvent, err: &SinkError) {
        let (topic, partition, offset) = event
            .position
            .as_ref()
            .map(|p| (p.topic.as_str(), p.partition, p.offset))
            .unwrap_or(("-", -1, -1));

        match err {
            SinkError::Decode(_) => warn!(
                topic,
                partition,
                offset,
                error = %err,
                "Skipping undecodable CDC event"
            ),
            SinkError::Classification(_) => error!(
                topic,
                partition,
                offset,
                error = %err,
                "CDC classification fault, skipping event"
            ),
            _ => error!(
                topic,
                partition,
                offset,
                error = %err,
                "Failed to apply CDC event"
            ),
        }
    }

    fn record_receive_success(&self) {
        self.error_state.record_success();
        self.metrics.consecutive_errors.set(0);
        self.metrics.consumer_healthy.set(1);
        self.metrics.backoff_seconds.set(0);
    }

    fn record_receive_error(&self, e: &SinkError) -> Duration {
        let consecutive = self.error_state.record_error();
        self.metrics.consumer_errors_total.inc();
        self.metrics.consecutive_errors.set(consecutive as i64);

        let backoff = self.error_state.calculate_backoff();
        self.metrics.backoff_seconds.set(backoff.as_secs() as i64);
        self.metrics
            .consumer_healthy
            .set(if self.error_state.is_healthy() { 1 } else { 0 });

        if consecutive >= CRITICAL_ERROR_THRESHOLD {
            error!(
                consecutive_errors = consecutive,
                backoff_secs = backoff.as_secs(),
                time_since_success_secs = self.error_state.time_since_success().as_secs(),
                "CRITICAL: Kafka consumer experiencing persistent failures. \
                 Manual intervention may be required. Error: {}",
                e
            );
        } else if consecutive >= UNHEALTHY_ERROR_THRESHOLD {
            warn!(
                consecutive_errors = consecutive,
                backoff_secs = backoff.as_secs(),
                "Kafka consumer unhealthy - multiple consecutive errors. Error: {}",
                e
            );
        } else {
            error!(
                consecutive_errors = consecutive,
                backoff_secs = backoff.as_secs(),
                "Kafka consumer error (will retry with backoff): {}",
                e
            );
        }

        backoff
    }
}
