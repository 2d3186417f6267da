// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Idempotency cache: LRU + TTL map of composite key to cached result,
//! persisted as a best-effort JSON snapshot.

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tm_core::{Clock, SystemClock};
use tracing::warn;

/// Snapshot file name inside the store directory.
pub const SNAPSHOT_FILE: &str = "idempotency.json";

/// Cached outcome of a completed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyResult {
    pub status: String,
    #[serde(default)]
    pub output: Value,
}

impl IdempotencyResult {
    pub fn ok(output: Value) -> Self {
        Self {
            status: "ok".to_string(),
            output,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    #[serde(flatten)]
    result: IdempotencyResult,
    expires_at_ms: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    entries: IndexMap<String, Entry>,
}

struct Inner {
    entries: IndexMap<String, Entry>,
    last_snapshot_ms: u64,
}

/// Deduplication cache keyed by composite key.
///
/// `get` on an expired entry returns `None` and removes it; hits refresh
/// LRU order; inserts beyond capacity evict the least recently used entry.
/// When a directory is configured the table is snapshotted periodically and
/// reloaded on open (best effort, loss tolerated).
pub struct IdempotencyStore<C: Clock = SystemClock> {
    dir: Option<PathBuf>,
    capacity: usize,
    snapshot_interval_ms: u64,
    clock: C,
    inner: Mutex<Inner>,
}

impl IdempotencyStore<SystemClock> {
    pub fn new(dir: Option<&Path>, capacity: usize, snapshot_interval_s: f64) -> Self {
        Self::with_clock(dir, capacity, snapshot_interval_s, SystemClock)
    }
}

impl<C: Clock> IdempotencyStore<C> {
    pub fn with_clock(
        dir: Option<&Path>,
        capacity: usize,
        snapshot_interval_s: f64,
        clock: C,
    ) -> Self {
        let store = Self {
            dir: dir.map(Path::to_owned),
            capacity,
            snapshot_interval_ms: (snapshot_interval_s * 1000.0) as u64,
            clock,
            inner: Mutex::new(Inner {
                entries: IndexMap::new(),
                last_snapshot_ms: 0,
            }),
        };
        store.load();
        store
    }

    fn snapshot_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(SNAPSHOT_FILE))
    }

    fn load(&self) {
        let path = match self.snapshot_path() {
            Some(path) => path,
            None => return,
        };
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        let snapshot: Snapshot = match serde_json::from_slice(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable idempotency snapshot, starting empty");
                return;
            }
        };
        let now = self.clock.epoch_ms();
        let mut inner = self.inner.lock();
        for (key, entry) in snapshot.entries {
            if entry.expires_at_ms > now {
                inner.entries.insert(key, entry);
            }
        }
    }

    /// Fetch a live cached result, refreshing its LRU position.
    pub fn get(&self, key: &str) -> Option<IdempotencyResult> {
        let now = self.clock.epoch_ms();
        let mut inner = self.inner.lock();
        let entry = inner.entries.get(key)?.clone();
        if entry.expires_at_ms <= now {
            inner.entries.shift_remove(key);
            return None;
        }
        // Refresh recency: move to the back of the insertion order
        inner.entries.shift_remove(key);
        inner.entries.insert(key.to_string(), entry.clone());
        Some(entry.result)
    }

    /// Cache a result under `key` for `ttl_seconds`.
    ///
    /// A zero or negative TTL disables caching for the call; a repeated
    /// `remember` within the TTL overwrites with equivalent content.
    pub fn remember(&self, key: &str, result: IdempotencyResult, ttl_seconds: f64) {
        if self.capacity == 0 || ttl_seconds <= 0.0 {
            return;
        }
        let expires_at_ms = self.clock.epoch_ms() + (ttl_seconds * 1000.0) as u64;
        let mut inner = self.inner.lock();
        inner.entries.shift_remove(key);
        inner.entries.insert(
            key.to_string(),
            Entry {
                result,
                expires_at_ms,
            },
        );
        while inner.entries.len() > self.capacity {
            inner.entries.shift_remove_index(0);
        }
        drop(inner);
        self.maybe_snapshot();
    }

    /// Drop expired entries and persist a snapshot.
    pub fn prune(&self) {
        let now = self.clock.epoch_ms();
        {
            let mut inner = self.inner.lock();
            inner.entries.retain(|_, entry| entry.expires_at_ms > now);
        }
        self.snapshot();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    fn maybe_snapshot(&self) {
        let now = self.clock.monotonic_ms();
        let due = {
            let inner = self.inner.lock();
            now.saturating_sub(inner.last_snapshot_ms) >= self.snapshot_interval_ms
        };
        if due {
            self.snapshot();
        }
    }

    /// Best-effort persistence; failures are logged and tolerated.
    fn snapshot(&self) {
        let path = match self.snapshot_path() {
            Some(path) => path,
            None => return,
        };
        let snapshot = {
            let mut inner = self.inner.lock();
            inner.last_snapshot_ms = self.clock.monotonic_ms();
            Snapshot {
                entries: inner.entries.clone(),
            }
        };
        if let Err(e) = write_snapshot(&path, &snapshot) {
            warn!(path = %path.display(), error = %e, "idempotency snapshot failed");
        }
    }
}

fn write_snapshot(path: &Path, snapshot: &Snapshot) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        let bytes = serde_json::to_vec(snapshot).map_err(std::io::Error::other)?;
        tmp.write_all(&bytes)?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)
}

#[cfg(test)]
#[path = "idempotency_tests.rs"]
mod tests;
