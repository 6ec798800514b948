use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::models::ChangeEvent;
use crate::error::{Result, SinkError};
use crate::store::DestinationStore;

/// Append-only audit table layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditTable {
    pub table: String,
    pub timestamp_column: String,
    pub payload_column: String,
}

impl Default for AuditTable {
    fn default() -> Self {
        Self {
            table: "dev.kafka_message_log".to_string(),
            timestamp_column: "timestamp".to_string(),
            payload_column: "kafka_message".to_string(),
        }
    }
}

/// Writes one audit row per received event, before any translation happens.
pub struct RawEventArchiver {
    store: Arc<dyn DestinationStore>,
    audit: AuditTable,
}

impl RawEventArchiver {
    pub fn new(store: Arc<dyn DestinationStore>, audit: AuditTable) -> Self {
        Self { store, audit }
    }

    /// Append `(received_at, raw_payload)` to the audit table. No deduplication:
    /// a redelivered event is archived again.
    pub async fn archive(&self, event: &ChangeEvent) -> Result<()> {
        let row = vec![
            Value::from(event.stream_offset_timestamp),
            Value::String(event.payload_text()),
        ];
        let columns = [
            self.audit.timestamp_column.clone(),
            self.audit.payload_column.clone(),
        ];

        self.store
            .insert(&self.audit.table, &[row], &columns)
            .await
            .map_err(|e| {
                SinkError::apply(format!("INSERT INTO {} (audit)", self.audit.table), e)
            })?;

        debug!(
            table = %self.audit.table,
            received_at = event.stream_offset_timestamp,
            "Archived raw CDC event"
        );
        Ok(())
    }
}
