// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! tm-storage: durable substrates for the TraceMind core.
//!
//! Binary trace log, lease-based work queues (in-memory and file-backed),
//! the idempotency cache, and the dead-letter store.

pub mod binlog;
pub mod dlq;
pub mod idempotency;
pub mod queue;
pub mod queue_file;
pub mod queue_memory;

pub use binlog::{BinaryLogReader, BinaryLogWriter, BinlogError};
pub use dlq::{DeadLetterRecord, DeadLetterState, DeadLetterStore, DlqEntryId, DlqError};
pub use idempotency::{IdempotencyResult, IdempotencyStore};
pub use queue::{LeasedTask, QueueError, WorkQueue};
pub use queue_file::FileWorkQueue;
pub use queue_memory::InMemoryWorkQueue;
