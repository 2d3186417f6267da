// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Binary log sink for flow execution traces.

use parking_lot::Mutex;
use std::path::Path;
use tm_core::{to_canonical_json, TraceSink, TraceSpan};
use tm_storage::{BinaryLogWriter, BinlogError};
use tracing::warn;

/// Frame type used for trace spans.
pub const FLOW_TRACE_TYPE: &str = "FlowTrace";

/// Writes each span as a `("FlowTrace", canonical-json)` frame.
///
/// Appends are best-effort: a failing write is logged and dropped rather
/// than blocking or failing the runtime. Span order per run is preserved
/// because the runtime appends under its per-run sequence lock.
pub struct FlowTraceSink {
    writer: Mutex<BinaryLogWriter>,
}

impl FlowTraceSink {
    pub fn open(dir: &Path, seg_bytes: u64) -> Result<Self, BinlogError> {
        Ok(Self {
            writer: Mutex::new(BinaryLogWriter::open(dir, seg_bytes)?),
        })
    }

    /// Force buffered frames onto disk.
    pub fn flush(&self) -> Result<(), BinlogError> {
        self.writer.lock().flush_fsync()
    }
}

impl TraceSink for FlowTraceSink {
    fn append(&self, span: &TraceSpan) {
        let payload = match serde_json::to_value(span) {
            Ok(value) => to_canonical_json(&value),
            Err(e) => {
                warn!(error = %e, "unserializable trace span, dropping");
                return;
            }
        };
        let mut writer = self.writer.lock();
        if let Err(e) = writer.append_many(&[(FLOW_TRACE_TYPE, payload.as_bytes())]) {
            warn!(error = %e, "trace span append failed, dropping");
        }
    }
}

#[cfg(test)]
#[path = "trace_sink_tests.rs"]
mod tests;
