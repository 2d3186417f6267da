// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Work queue contract shared by the in-memory and file-backed queues.
//!
//! An entry is in exactly one of four states: pending, leased (inflight),
//! acked (terminal success), or handed off to the dead-letter store. A
//! lease token is the sole authorization to ack or nack an entry.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;
use tm_core::TaskEnvelope;

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown offset: {0}")]
    UnknownOffset(u64),
    #[error("stale lease token for offset {0}")]
    StaleToken(u64),
    #[error("corrupt segment {segment} at byte {position}: {message}")]
    Corrupt {
        segment: String,
        position: u64,
        message: String,
    },
}

/// A leased queue entry: the envelope plus the lease that authorizes
/// completing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeasedTask {
    pub envelope: TaskEnvelope,
    pub offset: u64,
    pub token: String,
    /// Monotonic deadline (ms); after this the entry is eligible again.
    pub lease_expires_at_ms: u64,
}

/// Lease-based FIFO-ish queue.
pub trait WorkQueue: Send {
    /// Append an envelope; returns its globally monotonic offset.
    fn put(&mut self, envelope: &TaskEnvelope) -> Result<u64, QueueError>;

    /// Lease up to `batch_size` eligible entries in offset order.
    ///
    /// An entry is eligible when it is unacked and its lease (if any) has
    /// expired. Each call issues fresh tokens.
    fn lease(&mut self, batch_size: usize, lease_ms: u64) -> Result<Vec<LeasedTask>, QueueError>;

    /// Mark a leased entry terminally done.
    fn ack(&mut self, offset: u64, token: &str) -> Result<(), QueueError>;

    /// Cancel a lease. With `requeue` the entry becomes immediately
    /// eligible again; without it the entry stays invisible until the
    /// original lease deadline passes.
    fn nack(&mut self, offset: u64, token: &str, requeue: bool) -> Result<(), QueueError>;

    /// Cancel a lease for redelivery after `delay_ms`, bumping the
    /// envelope's attempt counter for subsequent leases.
    fn retry(&mut self, offset: u64, token: &str, delay_ms: u64) -> Result<(), QueueError>;

    /// Number of unacked entries (leased or not).
    fn pending_count(&self) -> usize;

    /// Force buffered writes to disk (no-op for memory queues).
    fn flush(&mut self) -> Result<(), QueueError>;

    fn close(&mut self) -> Result<(), QueueError>;
}
