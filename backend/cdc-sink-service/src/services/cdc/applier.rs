use std::sync::Arc;

use tracing::debug;

use super::translator::Mutation;
use crate::error::{Result, SinkError};
use crate::store::DestinationStore;

/// Executes translated mutations against the destination store.
///
/// Nothing here makes application idempotent. Updates and deletes can be
/// replayed safely, but a redelivered insert adds a second copy of the row
/// because the destination enforces no uniqueness.
pub struct MutationApplier {
    store: Arc<dyn DestinationStore>,
}

impl MutationApplier {
    pub fn new(store: Arc<dyn DestinationStore>) -> Self {
        Self { store }
    }

    pub async fn apply(&self, mutation: &Mutation) -> Result<()> {
        match mutation {
            Mutation::Insert {
                table,
                columns,
                rows,
            } => {
                let summary = self
                    .store
                    .insert(table, rows, columns)
                    .await
                    .map_err(|e| {
                        SinkError::apply(
                            format!("INSERT INTO {} ({})", table, columns.join(", ")),
                            e,
                        )
                    })?;
                debug!(table = %table, rows = summary.written_rows, "Applied CDC insert");
            }
            Mutation::Update { .. } | Mutation::Delete { .. } | Mutation::Truncate { .. } => {
                let statement = mutation.statement().ok_or_else(|| {
                    SinkError::Internal(format!("{} mutation has no statement", mutation.kind()))
                })?;
                self.store
                    .execute(&statement)
                    .await
                    .map_err(|e| SinkError::apply(statement.as_str(), e))?;
                debug!(
                    table = %mutation.table(),
                    kind = %mutation.kind(),
                    "Applied CDC statement"
                );
            }
        }

        Ok(())
    }
}
