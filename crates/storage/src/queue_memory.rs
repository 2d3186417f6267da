// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory work queue for tests and non-durable deployments.

use crate::queue::{LeasedTask, QueueError, WorkQueue};
use std::collections::BTreeMap;
use tm_core::{Clock, SystemClock, TaskEnvelope};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Entry {
    envelope: TaskEnvelope,
    lease: Option<(String, u64)>,
    visible_at_ms: u64,
}

/// Lease-based queue backed by an ordered in-memory table.
pub struct InMemoryWorkQueue<C: Clock = SystemClock> {
    clock: C,
    entries: BTreeMap<u64, Entry>,
    next_offset: u64,
}

impl InMemoryWorkQueue<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for InMemoryWorkQueue<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> InMemoryWorkQueue<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            entries: BTreeMap::new(),
            next_offset: 0,
        }
    }

    fn entry_mut(&mut self, offset: u64, token: &str) -> Result<&mut Entry, QueueError> {
        let entry = self
            .entries
            .get_mut(&offset)
            .ok_or(QueueError::UnknownOffset(offset))?;
        match &entry.lease {
            Some((held, _)) if held == token => Ok(entry),
            _ => Err(QueueError::StaleToken(offset)),
        }
    }
}

impl<C: Clock> WorkQueue for InMemoryWorkQueue<C> {
    fn put(&mut self, envelope: &TaskEnvelope) -> Result<u64, QueueError> {
        let offset = self.next_offset;
        self.next_offset += 1;
        self.entries.insert(
            offset,
            Entry {
                envelope: envelope.clone(),
                lease: None,
                visible_at_ms: 0,
            },
        );
        Ok(offset)
    }

    fn lease(&mut self, batch_size: usize, lease_ms: u64) -> Result<Vec<LeasedTask>, QueueError> {
        let now = self.clock.monotonic_ms();
        let mut leased = Vec::new();
        for (&offset, entry) in self.entries.iter_mut() {
            if leased.len() >= batch_size {
                break;
            }
            if entry.visible_at_ms > now {
                continue;
            }
            if let Some((_, expires)) = &entry.lease {
                if *expires > now {
                    continue;
                }
            }
            let token = Uuid::new_v4().simple().to_string();
            let expires = now + lease_ms;
            entry.lease = Some((token.clone(), expires));
            leased.push(LeasedTask {
                envelope: entry.envelope.clone(),
                offset,
                token,
                lease_expires_at_ms: expires,
            });
        }
        Ok(leased)
    }

    fn ack(&mut self, offset: u64, token: &str) -> Result<(), QueueError> {
        self.entry_mut(offset, token)?;
        self.entries.remove(&offset);
        Ok(())
    }

    fn nack(&mut self, offset: u64, token: &str, requeue: bool) -> Result<(), QueueError> {
        let entry = self.entry_mut(offset, token)?;
        if requeue {
            entry.lease = None;
            entry.visible_at_ms = 0;
        }
        // Without requeue the lease stays until its deadline passes.
        Ok(())
    }

    fn retry(&mut self, offset: u64, token: &str, delay_ms: u64) -> Result<(), QueueError> {
        let now = self.clock.monotonic_ms();
        let entry = self.entry_mut(offset, token)?;
        entry.envelope.attempt += 1;
        entry.lease = None;
        entry.visible_at_ms = now + delay_ms;
        Ok(())
    }

    fn pending_count(&self) -> usize {
        self.entries.len()
    }

    fn flush(&mut self) -> Result<(), QueueError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
#[path = "queue_memory_tests.rs"]
mod tests;
