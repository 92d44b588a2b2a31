use anyhow::{Context, Result};

use tracer_common::TraceRecord;

/// Decodes a JSON trace node payload. Fields other than `traceId` and
/// `contextId` are ignored.
pub fn decode_trace_record(payload: &[u8]) -> Result<TraceRecord> {
    let record: TraceRecord =
        serde_json::from_slice(payload).context("Failed to deserialize trace node")?;

    if record.trace_id.is_empty() || record.context_id.is_empty() {
        return Err(anyhow::anyhow!(
            "Trace node is missing traceId or contextId: {:?}",
            record
        ));
    }

    Ok(record)
}
