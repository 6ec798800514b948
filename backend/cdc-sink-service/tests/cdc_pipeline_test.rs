//! End-to-end tests for the CDC pipeline against the in-memory destination.
//!
//! Events are Debezium envelopes for the `dev.invoice` running example
//! `(order_id, invoice_number)`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cdc_sink_service::error::{Result, SinkError};
use cdc_sink_service::services::cdc::{
    AuditTable, CdcConsumer, ChangeEvent, ChangeStream, ConsumerState, EventOutcome, EventStream,
    MutationKind, StreamPosition, TableSchema,
};
use cdc_sink_service::store::{DestinationStore, MemoryStore, ResultSet, Summary};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_test::{assert_err, assert_ok};

const INVOICE: &str = "dev.invoice";
const AUDIT: &str = "dev.kafka_message_log";

fn store() -> Arc<MemoryStore> {
    Arc::new(
        MemoryStore::new()
            .with_table(INVOICE, &["order_id", "invoice_number"])
            .with_table(AUDIT, &["timestamp", "kafka_message"]),
    )
}

fn schema() -> TableSchema {
    TableSchema::new(
        INVOICE,
        "order_id",
        vec!["order_id".to_string(), "invoice_number".to_string()],
    )
    .unwrap()
}

fn json_event(value: Value) -> ChangeEvent {
    ChangeEvent::new(
        chrono::Utc::now().timestamp_millis(),
        Some(value.to_string().into_bytes()),
    )
}

fn envelope(before: Value, after: Value, op: &str) -> ChangeEvent {
    json_event(json!({
        "schema": {"type": "struct", "name": "source.dev.invoice.Envelope"},
        "payload": {
            "before": before,
            "after": after,
            "source": {"connector": "mysql", "db": "dev", "table": "invoice"},
            "op": op,
            "ts_ms": 1_700_000_000_000i64
        }
    }))
}

fn insert(order_id: i64, invoice_number: i64) -> ChangeEvent {
    envelope(
        Value::Null,
        json!({"order_id": order_id, "invoice_number": invoice_number}),
        "c",
    )
}

fn update(order_id: i64, from: i64, to: i64) -> ChangeEvent {
    envelope(
        json!({"order_id": order_id, "invoice_number": from}),
        json!({"order_id": order_id, "invoice_number": to}),
        "u",
    )
}

fn delete(order_id: i64, invoice_number: i64) -> ChangeEvent {
    envelope(
        json!({"order_id": order_id, "invoice_number": invoice_number}),
        Value::Null,
        "d",
    )
}

fn truncate() -> ChangeEvent {
    envelope(Value::Null, Value::Null, "t")
}

fn consumer_with(
    stream: impl ChangeStream,
    store: &Arc<MemoryStore>,
) -> (CdcConsumer<impl ChangeStream>, watch::Sender<bool>) {
    let (tx, rx) = watch::channel(false);
    let consumer = CdcConsumer::new(
        stream,
        store.clone(),
        schema(),
        AuditTable::default(),
        rx,
    );
    (consumer, tx)
}

fn consumer_for(
    events: Vec<ChangeEvent>,
    store: &Arc<MemoryStore>,
) -> (CdcConsumer<impl ChangeStream>, watch::Sender<bool>) {
    consumer_with(EventStream::from_events(events), store)
}

fn rows_for(store: &MemoryStore, order_id: i64) -> Vec<serde_json::Map<String, Value>> {
    store
        .rows(INVOICE)
        .into_iter()
        .filter(|row| row["order_id"] == json!(order_id))
        .collect()
}

#[tokio::test]
async fn test_insert_update_delete_in_order_leaves_no_row() {
    let store = store();
    let (consumer, _tx) = consumer_for(Vec::new(), &store);

    for event in [insert(1, 1), update(1, 1, 2), delete(1, 2)] {
        assert_ok!(consumer.process_event(&event).await);
    }

    assert!(rows_for(&store, 1).is_empty());
    assert_eq!(store.rows(AUDIT).len(), 3, "every event is archived");
    assert_eq!(consumer.metrics().applied("insert"), 1);
    assert_eq!(consumer.metrics().applied("update"), 1);
    assert_eq!(consumer.metrics().applied("delete"), 1);
}

#[tokio::test]
async fn test_out_of_order_events_for_one_key_leave_stale_row() {
    // Per-key order is the transport's guarantee. Reordered events are applied
    // as given and the destination diverges from the source, which has no row.
    let store = store();
    let (consumer, _tx) = consumer_for(Vec::new(), &store);

    for event in [delete(1, 2), insert(1, 1), update(1, 1, 2)] {
        assert_ok!(consumer.process_event(&event).await);
    }

    let rows = rows_for(&store, 1);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["invoice_number"], json!(2));
}

#[tokio::test]
async fn test_redelivered_update_is_idempotent() {
    let store = store();
    let (consumer, _tx) = consumer_for(Vec::new(), &store);

    consumer.process_event(&insert(5, 5)).await.unwrap();
    consumer.process_event(&update(5, 5, 9)).await.unwrap();
    let once = store.rows(INVOICE);
    consumer.process_event(&update(5, 5, 9)).await.unwrap();

    assert_eq!(store.rows(INVOICE), once);
    assert_eq!(rows_for(&store, 5)[0]["invoice_number"], json!(9));
}

#[tokio::test]
async fn test_redelivered_insert_duplicates_row() {
    let store = store();
    let (consumer, _tx) = consumer_for(Vec::new(), &store);

    consumer.process_event(&insert(5, 5)).await.unwrap();
    consumer.process_event(&insert(5, 5)).await.unwrap();

    // Documented gap under at-least-once delivery
    assert_eq!(rows_for(&store, 5).len(), 2);
}

#[tokio::test]
async fn test_truncate_empties_table() {
    let store = store();
    let (consumer, _tx) = consumer_for(Vec::new(), &store);

    consumer.process_event(&insert(1, 1)).await.unwrap();
    consumer.process_event(&insert(2, 2)).await.unwrap();
    let outcome = consumer.process_event(&truncate()).await.unwrap();

    assert_eq!(outcome, EventOutcome::Applied(MutationKind::Truncate));
    assert!(store.rows(INVOICE).is_empty());
}

#[tokio::test]
async fn test_tombstone_never_reaches_classifier() {
    let store = store();
    let (consumer, _tx) = consumer_for(Vec::new(), &store);

    let outcome = consumer
        .process_event(&ChangeEvent::new(1, None))
        .await
        .unwrap();
    assert_eq!(outcome, EventOutcome::SkippedTombstone);

    let outcome = consumer
        .process_event(&ChangeEvent::new(2, Some(Vec::new())))
        .await
        .unwrap();
    assert_eq!(outcome, EventOutcome::SkippedTombstone);

    assert!(store.statements().is_empty(), "tombstones touch nothing");
    assert_eq!(consumer.metrics().tombstones_skipped_total.get(), 2);
}

#[tokio::test]
async fn test_tombstone_archiving_can_be_enabled() {
    let store = store();
    let (consumer, _tx) = consumer_for(Vec::new(), &store);
    let consumer = consumer.with_tombstone_archiving(true);

    consumer
        .process_event(&ChangeEvent::new(42, None))
        .await
        .unwrap();

    let audit = store.rows(AUDIT);
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0]["timestamp"], json!(42));
    assert_eq!(audit[0]["kafka_message"], json!(""));
    assert!(store.rows(INVOICE).is_empty());
}

#[tokio::test]
async fn test_archive_failure_does_not_block_apply() {
    let store = store();
    store.reject_writes_to(AUDIT);
    let (consumer, _tx) = consumer_for(Vec::new(), &store);

    assert_ok!(consumer.process_event(&insert(1, 1)).await);

    assert_eq!(rows_for(&store, 1).len(), 1);
    assert_eq!(consumer.metrics().faults("archive"), 1);
}

#[tokio::test]
async fn test_apply_failure_is_reported_after_archiving() {
    let store = store();
    store.reject_writes_to(INVOICE);
    let (consumer, _tx) = consumer_for(Vec::new(), &store);

    let err = assert_err!(consumer.process_event(&insert(1, 1)).await);

    assert!(matches!(err, SinkError::Apply { .. }));
    assert_eq!(store.rows(AUDIT).len(), 1);
    assert_eq!(consumer.metrics().faults("apply"), 1);
}

#[tokio::test]
async fn test_undecodable_event_is_archived_and_counted() {
    let store = store();
    let (consumer, _tx) = consumer_for(Vec::new(), &store);

    let garbage = ChangeEvent::new(7, Some(b"{\"unexpected\": true}".to_vec()));
    let err = assert_err!(consumer.process_event(&garbage).await);

    assert!(matches!(err, SinkError::Decode(_)));
    assert_eq!(store.rows(AUDIT).len(), 1);
    assert!(store.rows(INVOICE).is_empty());
    assert_eq!(consumer.metrics().faults("decode"), 1);
}

#[tokio::test]
async fn test_string_values_with_quotes_round_trip() {
    let store = Arc::new(
        MemoryStore::new()
            .with_table("dev.customer", &["id", "name"])
            .with_table(AUDIT, &["timestamp", "kafka_message"]),
    );
    let schema = TableSchema::new("dev.customer", "id", vec!["id".into(), "name".into()]).unwrap();
    let (_tx, rx) = watch::channel(false);
    let consumer = CdcConsumer::new(
        EventStream::from_events(Vec::new()),
        store.clone(),
        schema,
        AuditTable::default(),
        rx,
    );

    let before = json!({"id": 1, "name": "O'Brien?"});
    let after = json!({"id": 1, "name": "x'; DROP TABLE customer; --"});
    consumer
        .process_event(&envelope(Value::Null, before.clone(), "c"))
        .await
        .unwrap();
    consumer
        .process_event(&envelope(before, after.clone(), "u"))
        .await
        .unwrap();

    let rows = store.rows("dev.customer");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], after["name"]);

    consumer
        .process_event(&envelope(after, Value::Null, "d"))
        .await
        .unwrap();
    assert!(store.rows("dev.customer").is_empty());
}

#[tokio::test]
async fn test_run_continues_past_failures_until_stream_ends() {
    let store = store();
    let events = vec![
        ChangeEvent::new(1, Some(b"not json".to_vec())),
        insert(1, 1),
        ChangeEvent::new(2, None),
        insert(2, 2),
        update(2, 2, 3),
    ];
    let (mut consumer, _tx) = consumer_for(events, &store);

    let err = assert_err!(consumer.run().await);

    assert!(matches!(err, SinkError::TransportClosed(_)));
    assert_eq!(consumer.state(), ConsumerState::ShuttingDown);
    assert_eq!(consumer.metrics().events_received_total.get(), 5);
    assert_eq!(consumer.metrics().faults("decode"), 1);

    let result = store.query("SELECT * FROM `dev`.`invoice`").await.unwrap();
    assert_eq!(
        result.rows,
        vec![
            json!({"order_id": 1, "invoice_number": 1}),
            json!({"order_id": 2, "invoice_number": 3}),
        ]
        .into_iter()
        .map(|v| match v {
            Value::Object(map) => map,
            _ => unreachable!(),
        })
        .collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_shutdown_before_start_processes_nothing() {
    let store = store();
    let (mut consumer, tx) = consumer_for(vec![insert(1, 1)], &store);
    assert_eq!(consumer.state(), ConsumerState::Idle);

    tx.send(true).unwrap();
    assert_ok!(consumer.run().await);

    assert_eq!(consumer.state(), ConsumerState::ShuttingDown);
    assert!(store.rows(INVOICE).is_empty());
}

#[tokio::test]
async fn test_shutdown_interrupts_idle_wait() {
    let store = store();
    let pending = futures::stream::pending::<Result<ChangeEvent>>();
    let (mut consumer, tx) = consumer_with(EventStream::new(pending), &store);

    let stop = async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tx
    };
    let (outcome, _tx) = tokio::join!(consumer.run(), stop);

    assert_ok!(outcome);
    assert_eq!(consumer.state(), ConsumerState::ShuttingDown);
}

#[tokio::test]
async fn test_transient_transport_error_backs_off_and_recovers() {
    let store = store();
    let items: Vec<Result<ChangeEvent>> = vec![
        Err(SinkError::Kafka("broker transport failure".to_string())),
        Ok(insert(1, 1)),
    ];
    let (mut consumer, _tx) =
        consumer_with(EventStream::new(futures::stream::iter(items)), &store);

    let err = assert_err!(consumer.run().await);

    assert!(matches!(err, SinkError::TransportClosed(_)));
    assert_eq!(consumer.metrics().consumer_errors_total.get(), 1);
    assert_eq!(rows_for(&store, 1).len(), 1);
    assert!(consumer.status().healthy);
}

#[tokio::test]
async fn test_fatal_transport_error_stops_loop() {
    let store = store();
    let items: Vec<Result<ChangeEvent>> = vec![
        Err(SinkError::TransportClosed("fatal client state".to_string())),
        Ok(insert(1, 1)),
    ];
    let (mut consumer, _tx) =
        consumer_with(EventStream::new(futures::stream::iter(items)), &store);

    let err = assert_err!(consumer.run().await);

    assert!(matches!(err, SinkError::TransportClosed(_)));
    assert!(store.rows(INVOICE).is_empty());
}

/// Destination whose inserts take `delay` before reaching the in-memory tables.
struct SlowStore {
    inner: Arc<MemoryStore>,
    delay: Duration,
}

#[async_trait]
impl DestinationStore for SlowStore {
    async fn execute(&self, statement: &str) -> Result<Summary> {
        self.inner.execute(statement).await
    }

    async fn insert(
        &self,
        table: &str,
        rows: &[Vec<Value>],
        columns: &[String],
    ) -> Result<Summary> {
        tokio::time::sleep(self.delay).await;
        self.inner.insert(table, rows, columns).await
    }

    async fn query(&self, statement: &str) -> Result<ResultSet> {
        self.inner.query(statement).await
    }
}

#[tokio::test]
async fn test_shutdown_waits_for_received_event() {
    let store = store();
    let slow = Arc::new(SlowStore {
        inner: store.clone(),
        delay: Duration::from_millis(200),
    });
    let events = futures::stream::iter(vec![Ok::<_, SinkError>(insert(1, 1))])
        .chain(futures::stream::pending());
    let (tx, rx) = watch::channel(false);
    let mut consumer = CdcConsumer::new(
        EventStream::new(events),
        slow,
        schema(),
        AuditTable::default(),
        rx,
    );

    let stop = async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tx
    };
    let (outcome, _tx) = tokio::join!(consumer.run(), stop);

    assert_ok!(outcome);
    assert_eq!(consumer.state(), ConsumerState::ShuttingDown);
    assert_eq!(rows_for(&store, 1).len(), 1);
    assert_eq!(store.rows(AUDIT).len(), 1);
}

/// Fixed list of events that records, for every acknowledgement, the event
/// offset and how many invoice rows existed at that moment.
struct RecordingStream {
    events: std::vec::IntoIter<ChangeEvent>,
    store: Arc<MemoryStore>,
    acked: Arc<Mutex<Vec<(i64, usize)>>>,
}

#[async_trait]
impl ChangeStream for RecordingStream {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>> {
        Ok(self.events.next())
    }

    async fn acknowledge(&mut self, event: &ChangeEvent) -> Result<()> {
        let offset = event.position.as_ref().map_or(-1, |p| p.offset);
        let rows = self.store.rows(INVOICE).len();
        self.acked.lock().unwrap().push((offset, rows));
        Ok(())
    }
}

fn at(event: ChangeEvent, offset: i64) -> ChangeEvent {
    event.with_position(StreamPosition {
        topic: "source.dev.invoice".to_string(),
        partition: 0,
        offset,
    })
}

#[tokio::test]
async fn test_events_are_acknowledged_after_processing() {
    let store = store();
    let acked = Arc::new(Mutex::new(Vec::new()));
    let stream = RecordingStream {
        events: vec![
            at(insert(1, 1), 0),
            at(ChangeEvent::new(1, Some(b"not json".to_vec())), 1),
            at(insert(2, 2), 2),
            at(ChangeEvent::new(2, None), 3),
        ]
        .into_iter(),
        store: store.clone(),
        acked: acked.clone(),
    };
    let (mut consumer, _tx) = consumer_with(stream, &store);

    let err = assert_err!(consumer.run().await);
    assert!(matches!(err, SinkError::TransportClosed(_)));

    // Skipped events are acknowledged too; each ack follows the apply
    assert_eq!(*acked.lock().unwrap(), vec![(0, 1), (1, 1), (2, 2), (3, 2)]);
}
