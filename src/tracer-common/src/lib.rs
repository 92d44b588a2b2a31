//! Types shared by the trace consumer and its storage backend.
//!
//! [`partition`] maps identifiers onto day-bucketed table names and
//! [`record`] holds the queue record, the two row shapes written per record
//! and the storage traits the consumer and the table bootstrap talk to.

pub mod partition;
pub mod record;

pub use partition::{
    EpochMillisExtractor, PartitionError, PartitionNamer, PartitionPrefix, TimestampExtractor,
    TABLE_DATE_FORMAT,
};
pub use record::{ReverseIndexRow, TableCatalog, TraceRecord, TraceRow, TraceStore};
