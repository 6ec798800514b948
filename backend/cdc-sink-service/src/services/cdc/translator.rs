use serde_json::Value;
use tracing::warn;

use super::models::{DecodedPayload, MutationKind, Row};
use crate::error::{Result, SinkError};
use crate::store::literal::{quote_identifier, quote_literal, quote_table};

/// Destination table layout the translator renders mutations for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub table: String,
    pub primary_key: String,
    /// Insert column order
    pub columns: Vec<String>,
}

impl TableSchema {
    pub fn new(
        table: impl Into<String>,
        primary_key: impl Into<String>,
        columns: Vec<String>,
    ) -> Result<Self> {
        let schema = Self {
            table: table.into(),
            primary_key: primary_key.into(),
            columns,
        };

        if schema.table.is_empty() {
            return Err(SinkError::Config("table name is empty".to_string()));
        }
        if !schema.columns.contains(&schema.primary_key) {
            return Err(SinkError::Config(format!(
                "primary key '{}' is not one of the columns {:?}",
                schema.primary_key, schema.columns
            )));
        }

        Ok(schema)
    }
}

/// A concrete destination operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Insert {
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Update {
        table: String,
        assignments: Vec<(String, Value)>,
        key: (String, Value),
    },
    Delete {
        table: String,
        filter: Vec<(String, Value)>,
    },
    Truncate {
        table: String,
    },
}

impl Mutation {
    pub fn kind(&self) -> MutationKind {
        match self {
            Mutation::Insert { .. } => MutationKind::Insert,
            Mutation::Update { .. } => MutationKind::Update,
            Mutation::Delete { .. } => MutationKind::Delete,
            Mutation::Truncate { .. } => MutationKind::Truncate,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Mutation::Insert { table, .. }
            | Mutation::Update { table, .. }
            | Mutation::Delete { table, .. }
            | Mutation::Truncate { table } => table,
        }
    }

    /// Statement text for the mutations applied through `execute`.
    ///
    /// Inserts go through the bulk insert call and have no statement.
    pub fn statement(&self) -> Option<String> {
        match self {
            Mutation::Insert { .. } => None,
            Mutation::Update {
                table,
                assignments,
                key,
            } => {
                let set = assignments
                    .iter()
                    .map(|(column, value)| {
                        format!("{} = {}", quote_identifier(column), quote_literal(value))
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                Some(format!(
                    "ALTER TABLE {} UPDATE {} WHERE {}",
                    quote_table(table),
                    set,
                    predicate(&key.0, &key.1)
                ))
            }
            Mutation::Delete { table, filter } => {
                let conditions = filter
                    .iter()
                    .map(|(column, value)| predicate(column, value))
                    .collect::<Vec<_>>()
                    .join(" AND ");
                Some(format!(
                    "ALTER TABLE {} DELETE WHERE {}",
                    quote_table(table),
                    conditions
                ))
            }
            Mutation::Truncate { table } => Some(format!("TRUNCATE TABLE {}", quote_table(table))),
        }
    }
}

/// `col = NULL` never matches, so nulls compare with `IS NULL`.
fn predicate(column: &str, value: &Value) -> String {
    match value {
        Value::Null => format!("{} IS NULL", quote_identifier(column)),
        _ => format!("{} = {}", quote_identifier(column), quote_literal(value)),
    }
}

/// Convert a classified change event into a destination mutation.
pub fn translate(
    kind: MutationKind,
    payload: &DecodedPayload,
    schema: &TableSchema,
) -> Result<Mutation> {
    match kind {
        MutationKind::Insert => {
            let after = snapshot(kind, "after", payload.after.as_ref())?;
            let row = schema
                .columns
                .iter()
                .map(|column| {
                    after.get(column).cloned().ok_or_else(|| {
                        SinkError::Decode(format!(
                            "insert into {} is missing column '{}'",
                            schema.table, column
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            Ok(Mutation::Insert {
                table: schema.table.clone(),
                columns: schema.columns.clone(),
                rows: vec![row],
            })
        }
        MutationKind::Update => {
            let before = snapshot(kind, "before", payload.before.as_ref())?;
            let after = snapshot(kind, "after", payload.after.as_ref())?;

            let key_value = before.get(&schema.primary_key).cloned().ok_or_else(|| {
                SinkError::Decode(format!(
                    "update on {} has no '{}' in its before image",
                    schema.table, schema.primary_key
                ))
            })?;

            if let Some(new_key) = after.get(&schema.primary_key) {
                if *new_key != key_value {
                    warn!(
                        table = %schema.table,
                        old_key = %key_value,
                        new_key = %new_key,
                        "Primary key changed at source; updating the row found by the old key"
                    );
                }
            }

            let assignments: Vec<(String, Value)> = after
                .iter()
                .filter(|(column, _)| **column != schema.primary_key)
                .map(|(column, value)| (column.clone(), value.clone()))
                .collect();

            if assignments.is_empty() {
                return Err(SinkError::Decode(format!(
                    "update on {} carries no non-key columns",
                    schema.table
                )));
            }

            Ok(Mutation::Update {
                table: schema.table.clone(),
                assignments,
                key: (schema.primary_key.clone(), key_value),
            })
        }
        MutationKind::Delete => {
            let before = snapshot(kind, "before", payload.before.as_ref())?;
            if before.is_empty() {
                return Err(SinkError::Decode(format!(
                    "delete on {} has an empty before image",
                    schema.table
                )));
            }

            Ok(Mutation::Delete {
                table: schema.table.clone(),
                filter: before
                    .iter()
                    .map(|(column, value)| (column.clone(), value.clone()))
                    .collect(),
            })
        }
        MutationKind::Truncate => {
            if payload.before.is_some() || payload.after.is_some() {
                return Err(SinkError::Classification(
                    "truncate requested for an event that carries row data".to_string(),
                ));
            }
            Ok(Mutation::Truncate {
                table: schema.table.clone(),
            })
        }
        MutationKind::Unknown => Err(SinkError::Classification(format!(
            "unknown mutation kind for before={} after={}",
            presence(payload.before.as_ref()),
            presence(payload.after.as_ref())
        ))),
    }
}

fn snapshot<'a>(kind: MutationKind, side: &str, row: Option<&'a Row>) -> Result<&'a Row> {
    row.ok_or_else(|| {
        SinkError::Classification(format!("{} event has no '{}' snapshot", kind, side))
    })
}

fn presence(row: Option<&Row>) -> &'static str {
    if row.is_some() {
        "present"
    } else {
        "absent"
    }
}
