pub mod consumer;
pub mod deserializer;
pub mod source;

pub use consumer::{CommitStats, CommitStatsSnapshot, ConsumerHandle, StepOutcome, TraceConsumer};
pub use deserializer::decode_trace_record;
pub use source::{KafkaTraceSource, TraceSource};
