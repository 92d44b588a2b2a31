use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, TimeZone, Utc};
use thiserror::Error;

/// Date suffix appended to every partitioned table name.
pub const TABLE_DATE_FORMAT: &str = "%Y%m%d";

/// Number of leading digits carrying the epoch-millisecond timestamp.
const EPOCH_MILLIS_DIGITS: usize = 13;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("Identifier '{0}' does not start with a 13-digit millisecond timestamp")]
    MissingTimestamp(String),

    #[error("Timestamp {millis}ms embedded in '{id}' is out of range")]
    TimestampOutOfRange { id: String, millis: i64 },
}

/// Table families written by the consumer, each with its fixed name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionPrefix {
    Trace,
    ReverseIndex,
}

impl PartitionPrefix {
    pub const ALL: [PartitionPrefix; 2] = [PartitionPrefix::Trace, PartitionPrefix::ReverseIndex];

    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionPrefix::Trace => "trace_",
            PartitionPrefix::ReverseIndex => "reverse_index_",
        }
    }

    /// Table holding this family's rows for `date`.
    pub fn table_for_date(&self, date: NaiveDate) -> String {
        format!("{}{}", self.as_str(), date.format(TABLE_DATE_FORMAT))
    }
}

impl fmt::Display for PartitionPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovers the creation time embedded in a trace or context identifier.
pub trait TimestampExtractor: Send + Sync {
    fn extract(&self, id: &str) -> Result<DateTime<Utc>, PartitionError>;
}

/// Reads identifiers of the form `<13-digit epoch millis><anything>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EpochMillisExtractor;

impl TimestampExtractor for EpochMillisExtractor {
    fn extract(&self, id: &str) -> Result<DateTime<Utc>, PartitionError> {
        let digits = id
            .get(..EPOCH_MILLIS_DIGITS)
            .filter(|prefix| prefix.bytes().all(|b| b.is_ascii_digit()))
            .ok_or_else(|| PartitionError::MissingTimestamp(id.to_string()))?;

        let millis: i64 = digits
            .parse()
            .map_err(|_| PartitionError::MissingTimestamp(id.to_string()))?;

        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| PartitionError::TimestampOutOfRange {
                id: id.to_string(),
                millis,
            })
    }
}

/// Maps an identifier to the day-bucketed table its row belongs to.
///
/// The day is taken in `offset`, so every instance configured with the same
/// offset derives the same name for the same identifier.
#[derive(Clone)]
pub struct PartitionNamer {
    extractor: Arc<dyn TimestampExtractor>,
    offset: FixedOffset,
}

impl PartitionNamer {
    pub fn new(extractor: Arc<dyn TimestampExtractor>, offset: FixedOffset) -> Self {
        Self { extractor, offset }
    }

    pub fn table_name(&self, prefix: PartitionPrefix, id: &str) -> Result<String, PartitionError> {
        let timestamp = self.extractor.extract(id)?;
        let day = timestamp.with_timezone(&self.offset).date_naive();
        Ok(prefix.table_for_date(day))
    }
}

impl Default for PartitionNamer {
    fn default() -> Self {
        Self::new(Arc::new(EpochMillisExtractor), Utc.fix())
    }
}

impl fmt::Debug for PartitionNamer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionNamer")
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}
