pub mod cdc;

pub use cdc::{CdcConsumer, ConsumerState, KafkaChangeStream};
