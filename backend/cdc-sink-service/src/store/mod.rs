//! Destination store boundary.
//!
//! The consumer only talks to the analytical store through [`DestinationStore`].
//! [`ClickHouseStore`] is the production implementation; [`MemoryStore`]
//! interprets the statements this service emits against in-process tables.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

pub mod clickhouse;
pub mod literal;
pub mod memory;

pub use self::clickhouse::ClickHouseStore;
pub use memory::MemoryStore;

/// Outcome of a write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    /// Rows written by an insert. Statements report 0, mutations are asynchronous
    /// in ClickHouse.
    pub written_rows: u64,
}

/// Rows returned by a query, each as a column-ordered JSON object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub rows: Vec<serde_json::Map<String, Value>>,
}

impl ResultSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Run a statement that returns no rows.
    async fn execute(&self, statement: &str) -> Result<Summary>;

    /// Bulk insert with an explicit column list. Each row is in `columns` order.
    async fn insert(&self, table: &str, rows: &[Vec<Value>], columns: &[String])
        -> Result<Summary>;

    async fn query(&self, statement: &str) -> Result<ResultSet>;
}
