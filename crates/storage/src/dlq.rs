// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dead-letter store: one JSON file per terminal failure.
//!
//! A pending record lives at `<entry_id>.json`; consuming it rewrites the
//! state field and renames the file to `<entry_id>.<state>.json`, so
//! `list()` only ever sees pending entries.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tm_core::{Clock, SystemClock};

tm_core::define_id! {
    /// Unique identifier for a dead-letter entry.
    #[derive(Default)]
    pub struct DlqEntryId;
}

/// Errors from dead-letter operations.
#[derive(Debug, Error)]
pub enum DlqError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Lifecycle state of a dead-letter record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterState {
    Pending,
    Purged,
    Requeued,
}

impl DeadLetterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterState::Pending => "pending",
            DeadLetterState::Purged => "purged",
            DeadLetterState::Requeued => "requeued",
        }
    }
}

impl fmt::Display for DeadLetterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A terminally failed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub entry_id: DlqEntryId,
    pub flow_id: String,
    pub task: Value,
    pub error: Value,
    pub attempt: u32,
    pub timestamp: f64,
    pub state: DeadLetterState,
}

/// File-backed list/append/consume of dead letters.
pub struct DeadLetterStore<C: Clock = SystemClock> {
    dir: PathBuf,
    clock: C,
}

impl DeadLetterStore<SystemClock> {
    pub fn new(dir: &Path) -> Result<Self, DlqError> {
        Self::with_clock(dir, SystemClock)
    }
}

impl<C: Clock> DeadLetterStore<C> {
    pub fn with_clock(dir: &Path, clock: C) -> Result<Self, DlqError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_owned(),
            clock,
        })
    }

    fn record_path(&self, entry_id: &DlqEntryId) -> PathBuf {
        self.dir.join(format!("{entry_id}.json"))
    }

    fn write_record(&self, path: &Path, record: &DeadLetterRecord) -> Result<(), DlqError> {
        let tmp_path = path.with_extension("json.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&serde_json::to_vec(record)?)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Append a new pending record.
    pub fn append(
        &self,
        flow_id: &str,
        task: Value,
        error: Value,
        attempt: u32,
    ) -> Result<DeadLetterRecord, DlqError> {
        let record = DeadLetterRecord {
            entry_id: DlqEntryId::generate(),
            flow_id: flow_id.to_string(),
            task,
            error,
            attempt,
            timestamp: self.clock.epoch_s(),
            state: DeadLetterState::Pending,
        };
        self.write_record(&self.record_path(&record.entry_id), &record)?;
        Ok(record)
    }

    /// All pending records, oldest first.
    pub fn list(&self) -> Result<Vec<DeadLetterRecord>, DlqError> {
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            // Consumed records are renamed to <id>.<state>.json
            if !name.ends_with(".json") || name.matches('.').count() != 1 {
                continue;
            }
            let raw = std::fs::read(&path)?;
            let record: DeadLetterRecord = serde_json::from_slice(&raw)?;
            records.push(record);
        }
        records.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        Ok(records)
    }

    /// Transition a pending record to a terminal state.
    ///
    /// Returns `None` when no pending record exists for the id.
    pub fn consume(
        &self,
        entry_id: &DlqEntryId,
        state: DeadLetterState,
    ) -> Result<Option<DeadLetterRecord>, DlqError> {
        let path = self.record_path(entry_id);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut record: DeadLetterRecord = serde_json::from_slice(&raw)?;
        record.state = state;

        let consumed_path = self
            .dir
            .join(format!("{}.{}.json", entry_id, state.as_str()));
        self.write_record(&consumed_path, &record)?;
        std::fs::remove_file(&path)?;
        Ok(Some(record))
    }
}

#[cfg(test)]
#[path = "dlq_tests.rs"]
mod tests;
