use ::clickhouse::{Client, Row};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info};

use super::literal::{quote_identifier, quote_literal, quote_table};
use super::{DestinationStore, ResultSet, Summary};
use crate::config::ClickHouseConfig;
use crate::error::{Result, SinkError};

/// Single JSON-encoded row, produced by `formatRow('JSONEachRow', *)`.
#[derive(Debug, Row, Deserialize)]
struct JsonRow {
    row: String,
}

/// ClickHouse-backed destination.
///
/// Cheap to clone; the inner client shares its HTTP connection pool.
#[derive(Clone)]
pub struct ClickHouseStore {
    client: Client,
}

impl ClickHouseStore {
    pub fn new(config: &ClickHouseConfig) -> Self {
        let mut client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database)
            .with_user(&config.user);

        if let Some(password) = &config.password {
            client = client.with_password(password);
        }

        info!(
            url = %config.url,
            database = %config.database,
            "ClickHouse client created"
        );

        Self { client }
    }

    /// Connectivity check used at startup.
    pub async fn ping(&self) -> Result<()> {
        self.client.query("SELECT 1").execute().await.map_err(|e| {
            error!("ClickHouse connectivity check failed: {}", e);
            SinkError::ClickHouse(e.to_string())
        })
    }
}

/// `INSERT INTO t (cols) VALUES (...), (...)` with every value escaped.
pub(crate) fn render_insert(table: &str, rows: &[Vec<Value>], columns: &[String]) -> String {
    let columns = columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ");
    let values = rows
        .iter()
        .map(|row| {
            let literals = row.iter().map(quote_literal).collect::<Vec<_>>().join(", ");
            format!("({})", literals)
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_table(table),
        columns,
        values
    )
}

#[async_trait]
impl DestinationStore for ClickHouseStore {
    async fn execute(&self, statement: &str) -> Result<Summary> {
        debug!(statement, "Executing ClickHouse statement");

        self.client.query(statement).execute().await.map_err(|e| {
            error!("ClickHouse statement error: {}", e);
            SinkError::ClickHouse(e.to_string())
        })?;

        Ok(Summary::default())
    }

    async fn insert(
        &self,
        table: &str,
        rows: &[Vec<Value>],
        columns: &[String],
    ) -> Result<Summary> {
        if rows.is_empty() {
            return Ok(Summary::default());
        }
        if let Some(bad) = rows.iter().find(|row| row.len() != columns.len()) {
            return Err(SinkError::Internal(format!(
                "row has {} values for {} columns",
                bad.len(),
                columns.len()
            )));
        }

        let sql = render_insert(table, rows, columns);

        self.client.query(&sql).execute().await.map_err(|e| {
            error!("ClickHouse insert error: {}", e);
            SinkError::ClickHouse(e.to_string())
        })?;

        debug!(table, rows = rows.len(), "Inserted rows into ClickHouse");
        Ok(Summary {
            written_rows: rows.len() as u64,
        })
    }

    async fn query(&self, statement: &str) -> Result<ResultSet> {
        let sql = format!(
            "SELECT formatRow('JSONEachRow', *) AS row FROM ({})",
            statement
        );

        let raw = self
            .client
            .query(&sql)
            .fetch_all::<JsonRow>()
            .await
            .map_err(|e| {
                error!("ClickHouse query error: {}", e);
                SinkError::ClickHouse(e.to_string())
            })?;

        let rows = raw
            .into_iter()
            .map(|r| {
                serde_json::from_str(r.row.trim_end()).map_err(|e| {
                    SinkError::ClickHouse(format!("Unreadable row from ClickHouse: {}", e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ResultSet { rows })
    }
}
