//! Debezium change events to ClickHouse mutations.
//!
//! ```text
//! stream → archive → classify → translate → apply
//! ```

mod applier;
mod archiver;
mod classifier;
mod consumer;
mod metrics;
mod models;
mod stream;
mod translator;

pub use applier::MutationApplier;
pub use archiver::{AuditTable, RawEventArchiver};
pub use classifier::classify;
pub use consumer::{
    CdcConsumer, ConsumerErrorState, ConsumerState, ConsumerStatus, EventOutcome, HealthHandle,
};
pub use metrics::{render as render_metrics, CdcConsumerMetrics};
pub use models::{ChangeEvent, DecodedPayload, MutationKind, Row, StreamPosition};
pub use stream::{ChangeStream, EventStream, KafkaChangeStream};
pub use translator::{translate, Mutation, TableSchema};
