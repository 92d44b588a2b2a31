use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::partition::{PartitionError, PartitionNamer, PartitionPrefix};

/// A trace node as it arrives on the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    pub trace_id: String,
    pub context_id: String,
}

/// Row of the `trace_<day>` table, bucketed by the trace id's day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRow {
    pub trace_id: String,
    pub context_id: String,
    pub table_name: String,
}

/// Row of the `reverse_index_<day>` table, bucketed by the context id's day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseIndexRow {
    pub context_id: String,
    pub trace_id: String,
    pub table_name: String,
}

impl TraceRecord {
    pub fn new(trace_id: impl Into<String>, context_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            context_id: context_id.into(),
        }
    }

    /// Builds the pair of rows persisted for this record.
    pub fn to_rows(
        &self,
        namer: &PartitionNamer,
    ) -> Result<(TraceRow, ReverseIndexRow), PartitionError> {
        let trace = TraceRow {
            trace_id: self.trace_id.clone(),
            context_id: self.context_id.clone(),
            table_name: namer.table_name(PartitionPrefix::Trace, &self.trace_id)?,
        };
        let reverse = ReverseIndexRow {
            context_id: self.context_id.clone(),
            trace_id: self.trace_id.clone(),
            table_name: namer.table_name(PartitionPrefix::ReverseIndex, &self.context_id)?,
        };
        Ok((trace, reverse))
    }
}

/// Durable sink for trace rows.
#[async_trait]
pub trait TraceStore: Send + Sync {
    /// Writes both rows as one unit: either both are persisted or neither is.
    async fn insert_trace_and_reverse_index(
        &self,
        trace: &TraceRow,
        reverse: &ReverseIndexRow,
    ) -> Result<()>;
}

/// DDL side of the storage backend. Both calls must be idempotent.
#[async_trait]
pub trait TableCatalog: Send + Sync {
    async fn create_trace_table(&self, table_name: &str) -> Result<()>;

    async fn create_reverse_index_table(&self, table_name: &str) -> Result<()>;
}
