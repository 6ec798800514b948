//! CDC sink: applies Debezium row changes from Kafka to ClickHouse.

pub mod config;
pub mod error;
pub mod http;
pub mod services;
pub mod store;

pub use error::{Result, SinkError};
