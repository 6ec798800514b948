use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SinkError};

/// A source row snapshot: column name to scalar value, in payload order.
pub type Row = Map<String, Value>;

/// Mutation kinds inferred from which snapshots a change event carries.
///
/// Debezium change events are classified by the presence of `before` and
/// `after` only; any `op` field on the wire is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
    Truncate,
    /// Never produced by [`classify`](super::classify); rejected by the translator.
    Unknown,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Insert => "insert",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
            MutationKind::Truncate => "truncate",
            MutationKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an event was read from, kept for log context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A change event as delivered by the stream transport.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Broker timestamp in milliseconds since epoch
    pub stream_offset_timestamp: i64,
    pub raw_payload: Option<Vec<u8>>,
    pub position: Option<StreamPosition>,
}

impl ChangeEvent {
    pub fn new(stream_offset_timestamp: i64, raw_payload: Option<Vec<u8>>) -> Self {
        Self {
            stream_offset_timestamp,
            raw_payload,
            position: None,
        }
    }

    pub fn with_position(mut self, position: StreamPosition) -> Self {
        self.position = Some(position);
        self
    }

    /// Empty or absent payload. Debezium emits these after deletes for log compaction.
    pub fn is_tombstone(&self) -> bool {
        self.raw_payload.as_deref().map_or(true, <[u8]>::is_empty)
    }

    /// Payload as text for the audit log.
    pub fn payload_text(&self) -> String {
        self.raw_payload
            .as_deref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default()
    }

    /// Decode the Debezium envelope carried by this event.
    pub fn decoded(&self) -> Result<DecodedPayload> {
        let bytes = self
            .raw_payload
            .as_deref()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| SinkError::Decode("tombstone carries no payload".to_string()))?;

        let message: CdcMessage = serde_json::from_slice(bytes)
            .map_err(|e| SinkError::Decode(format!("Invalid CDC message format: {}", e)))?;

        Ok(message.into_payload())
    }
}

/// CDC message structure from Debezium
///
/// When `value.converter.schemas.enable = false`, Debezium sends the payload directly
/// without a wrapper object. Both forms are accepted.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum CdcMessage {
    /// Format with schema wrapper (value.converter.schemas.enable = true)
    WithSchema { payload: DecodedPayload },
    /// Format without schema wrapper (value.converter.schemas.enable = false)
    WithoutSchema(DecodedPayload),
}

impl CdcMessage {
    fn into_payload(self) -> DecodedPayload {
        match self {
            CdcMessage::WithSchema { payload } => payload,
            CdcMessage::WithoutSchema(payload) => payload,
        }
    }
}

/// Before/after snapshots of a change event.
///
/// Both keys must be present on the wire, either may be `null`. A document
/// without them is not a change event and must not be read as a truncate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedPayload {
    /// State before the change (null for Insert and Truncate)
    #[serde(deserialize_with = "nullable_row")]
    pub before: Option<Row>,

    /// State after the change (null for Delete and Truncate)
    #[serde(deserialize_with = "nullable_row")]
    pub after: Option<Row>,
}

impl DecodedPayload {
    pub fn new(before: Option<Row>, after: Option<Row>) -> Self {
        Self { before, after }
    }
}

// A custom deserializer turns off serde's "missing Option means None" rule.
fn nullable_row<'de, D>(deserializer: D) -> std::result::Result<Option<Row>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Row>::deserialize(deserializer)
}
