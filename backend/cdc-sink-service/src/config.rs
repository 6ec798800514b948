use serde::Deserialize;

use crate::error::{Result, SinkError};
use crate::services::cdc::{AuditTable, TableSchema};

/// Service configuration, read from prefixed environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub kafka: KafkaConfig,
    pub clickhouse: ClickHouseConfig,
    pub sink: SinkConfig,
}

/// `KAFKA_*` variables.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka brokers (comma-separated)
    #[serde(default = "default_brokers")]
    pub brokers: String,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Topics to consume (comma-separated in the environment)
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
}

/// `CLICKHOUSE_*` variables.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    #[serde(default = "default_clickhouse_url")]
    pub url: String,
    #[serde(default = "default_clickhouse_database")]
    pub database: String,
    #[serde(default = "default_clickhouse_user")]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
}

/// `CDC_*` variables: destination table layout and service knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    #[serde(default = "default_columns")]
    pub columns: Vec<String>,
    #[serde(default = "default_audit_table")]
    pub audit_table: String,
    #[serde(default = "default_audit_timestamp_column")]
    pub audit_timestamp_column: String,
    #[serde(default = "default_audit_payload_column")]
    pub audit_payload_column: String,
    /// Write tombstones to the audit table too (off: they are only counted)
    #[serde(default)]
    pub archive_tombstones: bool,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_brokers() -> String {
    "kafka:29093".to_string()
}

fn default_group_id() -> String {
    "cdc-sink-service".to_string()
}

fn default_topics() -> Vec<String> {
    vec!["source.dev.invoice".to_string()]
}

fn default_auto_offset_reset() -> String {
    "latest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_clickhouse_url() -> String {
    "http://clickhouse:8123".to_string()
}

fn default_clickhouse_database() -> String {
    "dev".to_string()
}

fn default_clickhouse_user() -> String {
    "default".to_string()
}

fn default_table() -> String {
    "dev.invoice".to_string()
}

fn default_primary_key() -> String {
    "order_id".to_string()
}

fn default_columns() -> Vec<String> {
    vec!["order_id".to_string(), "invoice_number".to_string()]
}

fn default_audit_table() -> String {
    AuditTable::default().table
}

fn default_audit_timestamp_column() -> String {
    AuditTable::default().timestamp_column
}

fn default_audit_payload_column() -> String {
    AuditTable::default().payload_column
}

fn default_http_port() -> u16 {
    8080
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self {
            kafka: envy::prefixed("KAFKA_").from_env::<KafkaConfig>()?,
            clickhouse: envy::prefixed("CLICKHOUSE_").from_env::<ClickHouseConfig>()?,
            sink: envy::prefixed("CDC_").from_env::<SinkConfig>()?,
        };
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Trim names read from the environment and drop empty list entries, so
    /// `"a, b"` and `"a,,b"` both mean `[a, b]`.
    fn normalize(&mut self) {
        self.kafka.topics = clean_list(&self.kafka.topics);
        self.sink.columns = clean_list(&self.sink.columns);
        self.sink.primary_key = self.sink.primary_key.trim().to_string();
        self.sink.table = self.sink.table.trim().to_string();
    }

    pub fn validate(&self) -> Result<()> {
        if self.kafka.topics.is_empty() {
            return Err(SinkError::Config("KAFKA_TOPICS is empty".to_string()));
        }
        self.sink.table_schema()?;
        Ok(())
    }
}

fn clean_list(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

impl SinkConfig {
    pub fn table_schema(&self) -> Result<TableSchema> {
        TableSchema::new(
            self.table.clone(),
            self.primary_key.clone(),
            self.columns.clone(),
        )
    }

    pub fn audit_table(&self) -> AuditTable {
        AuditTable {
            table: self.audit_table.clone(),
            timestamp_column: self.audit_timestamp_column.clone(),
            payload_column: self.audit_payload_column.clone(),
        }
    }
}
