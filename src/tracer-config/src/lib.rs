// Trace consumer configuration
//
// A single YAML document drives the consumer: Kafka subscription and batching,
// the PostgreSQL connection, partition day boundaries, table bootstrap and
// logging. `${VAR}` placeholders are expanded from the environment before
// parsing.

pub mod tracer_config;
pub mod tracer_config_processing;

pub use tracer_config::{
    BootstrapConfig, KafkaConsumerConfig, LoggingConfig, PartitionConfig, PostgresConfig,
    TracerConfig,
};
pub use tracer_config_processing::{ConfigError, Result};
