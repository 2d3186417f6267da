// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable work queue over rotating on-disk segments.
//!
//! Layout per queue directory:
//! - `segment-NNNNNN.log`: append-only frames, each a 4-byte big-endian
//!   length prefix plus canonical JSON `{"offset": N, "envelope": {...}}`.
//!   Offsets are globally monotonic across the queue.
//! - `segment-NNNNNN.idx`: JSON `{"acked": [offset, ...]}`, rewritten
//!   atomically (temp file + rename) on each ack batch.
//! - `lock`: lock file; writes take an exclusive `fs2` lock, tail reads a
//!   shared one, so multiple processes can enqueue into one queue.
//!
//! A sealed segment whose offsets are all acked is deleted. Lease and
//! attempt state is in-memory per process, which also enforces the
//! visibility timeout across restarts: reopening makes every unacked entry
//! eligible again.
//!
//! `TM_FILE_QUEUE_V2=1` enables fsync-on-put and strict index validation
//! (invalid `acked` entries are logged and the index is rewritten clean).

use crate::queue::{LeasedTask, QueueError, WorkQueue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tm_core::{to_canonical_json, Clock, SystemClock, TaskEnvelope};
use tracing::warn;
use uuid::Uuid;

/// Environment variable enabling fsync-on-put and strict index validation.
pub const FILE_QUEUE_V2_ENV: &str = "TM_FILE_QUEUE_V2";

/// Default segment rotation threshold.
pub const DEFAULT_SEGMENT_MAX_BYTES: u64 = 16_000_000;

/// Upper bound on a single frame, used to reject corrupt length prefixes.
const MAX_FRAME_BYTES: u32 = 64_000_000;

#[derive(Serialize, Deserialize)]
struct FrameRecord {
    offset: u64,
    envelope: TaskEnvelope,
}

#[derive(Serialize, Deserialize, Default)]
struct AckIndex {
    acked: Vec<Value>,
}

/// Either an active lease (token held) or a visibility delay (no token).
#[derive(Debug, Clone)]
struct Hold {
    token: Option<String>,
    until_ms: u64,
}

struct Segment {
    index: u32,
    log_path: PathBuf,
    idx_path: PathBuf,
    /// Every offset ever written to this segment.
    offsets: BTreeSet<u64>,
    acked: BTreeSet<u64>,
    /// Envelopes for unacked offsets.
    entries: BTreeMap<u64, TaskEnvelope>,
    /// Bytes of this segment already scanned into memory.
    known_size: u64,
}

impl Segment {
    fn fully_acked(&self) -> bool {
        !self.offsets.is_empty() && self.offsets.len() == self.acked.len()
    }
}

/// Durable lease-based queue; see module docs for the on-disk contract.
pub struct FileWorkQueue<C: Clock = SystemClock> {
    dir: PathBuf,
    segment_max_bytes: u64,
    fsync_on_put: bool,
    strict_index: bool,
    clock: C,
    segments: Vec<Segment>,
    holds: HashMap<u64, Hold>,
    attempts: HashMap<u64, u32>,
    next_offset: u64,
    lock_file: File,
    closed: bool,
}

impl FileWorkQueue<SystemClock> {
    pub fn open(dir: &Path, segment_max_bytes: u64) -> Result<Self, QueueError> {
        Self::open_with_clock(dir, segment_max_bytes, SystemClock)
    }
}

impl<C: Clock> FileWorkQueue<C> {
    pub fn open_with_clock(
        dir: &Path,
        segment_max_bytes: u64,
        clock: C,
    ) -> Result<Self, QueueError> {
        std::fs::create_dir_all(dir)?;
        let v2 = std::env::var(FILE_QUEUE_V2_ENV).map(|v| v == "1").unwrap_or(false);
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join("lock"))?;

        let mut queue = Self {
            dir: dir.to_owned(),
            segment_max_bytes,
            fsync_on_put: v2,
            strict_index: v2,
            clock,
            segments: Vec::new(),
            holds: HashMap::new(),
            attempts: HashMap::new(),
            next_offset: 0,
            lock_file,
            closed: false,
        };

        fs2::FileExt::lock_exclusive(&queue.lock_file)?;
        let result = queue.recover();
        fs2::FileExt::unlock(&queue.lock_file)?;
        result?;
        Ok(queue)
    }

    /// Whether fsync-on-put is active (V2 mode).
    pub fn fsync_on_put(&self) -> bool {
        self.fsync_on_put
    }

    fn segment_log_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("segment-{index:06}.log"))
    }

    fn segment_idx_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("segment-{index:06}.idx"))
    }

    /// Rebuild the in-memory view from disk. Runs under the exclusive lock
    /// at open; outstanding leases are implicitly reset because holds are
    /// per-process state.
    fn recover(&mut self) -> Result<(), QueueError> {
        let mut indices = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if let Some(digits) = name
                .strip_prefix("segment-")
                .and_then(|rest| rest.strip_suffix(".log"))
            {
                if let Ok(index) = digits.parse::<u32>() {
                    indices.push(index);
                }
            }
        }
        indices.sort_unstable();

        if indices.is_empty() {
            self.create_segment(1)?;
            return Ok(());
        }

        let count = indices.len();
        for (pos, index) in indices.into_iter().enumerate() {
            let newest = pos + 1 == count;
            let mut segment = Segment {
                index,
                log_path: self.segment_log_path(index),
                idx_path: self.segment_idx_path(index),
                offsets: BTreeSet::new(),
                acked: BTreeSet::new(),
                entries: BTreeMap::new(),
                known_size: 0,
            };
            Self::scan_segment(&mut segment, newest)?;
            if newest {
                Self::drop_torn_tail(&segment)?;
            }
            self.load_index(&mut segment)?;
            for offset in &segment.acked {
                segment.entries.remove(offset);
            }
            if let Some(max) = segment.offsets.iter().next_back() {
                self.next_offset = self.next_offset.max(max + 1);
            }
            self.segments.push(segment);
        }

        self.compact()?;
        if self.segments.is_empty() {
            self.create_segment(1)?;
        }
        Ok(())
    }

    fn create_segment(&mut self, index: u32) -> Result<(), QueueError> {
        let log_path = self.segment_log_path(index);
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .append(true)
            .open(&log_path)?;
        self.segments.push(Segment {
            index,
            log_path,
            idx_path: self.segment_idx_path(index),
            offsets: BTreeSet::new(),
            acked: BTreeSet::new(),
            entries: BTreeMap::new(),
            known_size: 0,
        });
        Ok(())
    }

    /// Scan frames beyond `known_size`, extending the in-memory view.
    ///
    /// A truncated trailing frame is tolerated in the newest segment (a
    /// concurrent writer may be mid-append); anywhere else it is fatal.
    fn scan_segment(segment: &mut Segment, newest: bool) -> Result<(), QueueError> {
        let mut file = File::open(&segment.log_path)?;
        let total = file.metadata()?.len();
        if total <= segment.known_size {
            return Ok(());
        }
        file.seek(SeekFrom::Start(segment.known_size))?;
        let mut buf = Vec::with_capacity((total - segment.known_size) as usize);
        file.read_to_end(&mut buf)?;

        let corrupt = |position: u64, message: &str| QueueError::Corrupt {
            segment: segment.log_path.display().to_string(),
            position,
            message: message.to_string(),
        };

        let mut pos = 0usize;
        while pos < buf.len() {
            let frame_start = segment.known_size + pos as u64;
            if pos + 4 > buf.len() {
                if newest {
                    warn!(
                        segment = %segment.log_path.display(),
                        position = frame_start,
                        "truncated frame at segment tail, ignoring",
                    );
                    break;
                }
                return Err(corrupt(frame_start, "truncated length prefix"));
            }
            let len = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
            if len == 0 || len > MAX_FRAME_BYTES {
                return Err(corrupt(frame_start, "implausible frame length"));
            }
            let body_start = pos + 4;
            let body_end = body_start + len as usize;
            if body_end > buf.len() {
                if newest {
                    warn!(
                        segment = %segment.log_path.display(),
                        position = frame_start,
                        "truncated frame at segment tail, ignoring",
                    );
                    break;
                }
                return Err(corrupt(frame_start, "truncated frame body"));
            }
            let record: FrameRecord = serde_json::from_slice(&buf[body_start..body_end])
                .map_err(|e| corrupt(frame_start, &format!("unparseable frame: {e}")))?;
            segment.offsets.insert(record.offset);
            if !segment.acked.contains(&record.offset) {
                segment.entries.insert(record.offset, record.envelope);
            }
            pos = body_end;
        }
        segment.known_size += pos as u64;
        Ok(())
    }

    /// Truncate a torn trailing frame. Only a crashed writer can leave one,
    /// so this is safe whenever the exclusive lock is held.
    fn drop_torn_tail(segment: &Segment) -> Result<(), QueueError> {
        let file = OpenOptions::new().write(true).open(&segment.log_path)?;
        let size = file.metadata()?.len();
        if size > segment.known_size {
            warn!(
                segment = %segment.log_path.display(),
                torn_bytes = size - segment.known_size,
                "dropping torn trailing frame",
            );
            file.set_len(segment.known_size)?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn load_index(&self, segment: &mut Segment) -> Result<(), QueueError> {
        let raw = match std::fs::read(&segment.idx_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let index: AckIndex = match serde_json::from_slice(&raw) {
            Ok(index) => index,
            Err(e) => {
                warn!(
                    index = %segment.idx_path.display(),
                    error = %e,
                    "unreadable ack index, treating as empty",
                );
                if self.strict_index {
                    self.write_index_file(segment)?;
                }
                return Ok(());
            }
        };

        let mut dirty = false;
        for value in index.acked {
            match value.as_u64() {
                Some(offset) => {
                    segment.acked.insert(offset);
                }
                None => {
                    warn!(
                        index = %segment.idx_path.display(),
                        entry = %value,
                        "invalid ack entry, dropping",
                    );
                    dirty = true;
                }
            }
        }
        if dirty && self.strict_index {
            self.write_index_file(segment)?;
        }
        Ok(())
    }

    /// Rewrite a segment's ack index atomically.
    fn write_index_file(&self, segment: &Segment) -> Result<(), QueueError> {
        let index = AckIndex {
            acked: segment.acked.iter().map(|o| Value::from(*o)).collect(),
        };
        let tmp_path = segment.idx_path.with_extension("idx.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(serde_json::to_vec(&index)?.as_slice())?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &segment.idx_path)?;
        Ok(())
    }

    /// Pick up frames other processes appended since the last look.
    fn refresh(&mut self) -> Result<(), QueueError> {
        // New segments may exist beyond our newest known index
        loop {
            let last_index = self.segments.last().map(|s| s.index).unwrap_or(0);
            let next_path = self.segment_log_path(last_index + 1);
            if !next_path.exists() {
                break;
            }
            self.create_segment(last_index + 1)?;
        }

        let count = self.segments.len();
        let mut max_offset = None;
        for (pos, segment) in self.segments.iter_mut().enumerate() {
            let newest = pos + 1 == count;
            Self::scan_segment(segment, newest)?;
            let acked: Vec<u64> = segment.acked.iter().copied().collect();
            for offset in acked {
                segment.entries.remove(&offset);
            }
            if let Some(max) = segment.offsets.iter().next_back() {
                max_offset = max_offset.max(Some(*max));
            }
        }
        if let Some(max) = max_offset {
            self.next_offset = self.next_offset.max(max + 1);
        }
        Ok(())
    }

    /// Delete sealed segments whose offsets are all acked.
    fn compact(&mut self) -> Result<(), QueueError> {
        while self.segments.len() > 1 {
            if !self.segments[0].fully_acked() {
                break;
            }
            let segment = self.segments.remove(0);
            std::fs::remove_file(&segment.log_path)?;
            if segment.idx_path.exists() {
                std::fs::remove_file(&segment.idx_path)?;
            }
        }
        Ok(())
    }

    fn verify_hold(&self, offset: u64, token: &str) -> Result<(), QueueError> {
        match self.holds.get(&offset) {
            Some(Hold {
                token: Some(held), ..
            }) if held == token => Ok(()),
            _ => Err(QueueError::StaleToken(offset)),
        }
    }
}

impl<C: Clock> WorkQueue for FileWorkQueue<C> {
    fn put(&mut self, envelope: &TaskEnvelope) -> Result<u64, QueueError> {
        fs2::FileExt::lock_exclusive(&self.lock_file)?;
        let result = (|| {
            self.refresh()?;
            if let Some(segment) = self.segments.last() {
                Self::drop_torn_tail(segment)?;
            }

            let active_size = self.segments.last().map(|s| s.known_size).unwrap_or(0);
            if active_size >= self.segment_max_bytes {
                let next_index = self.segments.last().map(|s| s.index + 1).unwrap_or(1);
                self.create_segment(next_index)?;
            }

            let offset = self.next_offset;
            let record = FrameRecord {
                offset,
                envelope: envelope.clone(),
            };
            let body = to_canonical_json(&serde_json::to_value(&record)?);
            let mut frame = Vec::with_capacity(4 + body.len());
            frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
            frame.extend_from_slice(body.as_bytes());

            let segment = match self.segments.last_mut() {
                Some(segment) => segment,
                None => return Err(QueueError::UnknownOffset(offset)),
            };
            let mut file = OpenOptions::new().append(true).open(&segment.log_path)?;
            file.write_all(&frame)?;
            file.flush()?;
            if self.fsync_on_put {
                file.sync_all()?;
            }

            segment.known_size += frame.len() as u64;
            segment.offsets.insert(offset);
            segment.entries.insert(offset, envelope.clone());
            self.next_offset = offset + 1;
            Ok(offset)
        })();
        fs2::FileExt::unlock(&self.lock_file)?;
        result
    }

    fn lease(&mut self, batch_size: usize, lease_ms: u64) -> Result<Vec<LeasedTask>, QueueError> {
        fs2::FileExt::lock_shared(&self.lock_file)?;
        let refresh_result = self.refresh();
        fs2::FileExt::unlock(&self.lock_file)?;
        refresh_result?;

        let now = self.clock.monotonic_ms();
        let mut leased = Vec::new();
        for segment in &self.segments {
            for (&offset, envelope) in &segment.entries {
                if leased.len() >= batch_size {
                    return Ok(leased);
                }
                if let Some(hold) = self.holds.get(&offset) {
                    if hold.until_ms > now {
                        continue;
                    }
                }
                let token = Uuid::new_v4().simple().to_string();
                let expires = now + lease_ms;
                self.holds.insert(
                    offset,
                    Hold {
                        token: Some(token.clone()),
                        until_ms: expires,
                    },
                );
                let mut envelope = envelope.clone();
                envelope.attempt += self.attempts.get(&offset).copied().unwrap_or(0);
                leased.push(LeasedTask {
                    envelope,
                    offset,
                    token,
                    lease_expires_at_ms: expires,
                });
            }
        }
        Ok(leased)
    }

    fn ack(&mut self, offset: u64, token: &str) -> Result<(), QueueError> {
        self.verify_hold(offset, token)?;
        fs2::FileExt::lock_exclusive(&self.lock_file)?;
        let result = (|| {
            let pos = self
                .segments
                .iter()
                .position(|s| s.offsets.contains(&offset))
                .ok_or(QueueError::UnknownOffset(offset))?;
            self.segments[pos].acked.insert(offset);
            self.segments[pos].entries.remove(&offset);
            self.write_index_file(&self.segments[pos])?;
            self.compact()
        })();
        fs2::FileExt::unlock(&self.lock_file)?;
        result?;
        self.holds.remove(&offset);
        self.attempts.remove(&offset);
        Ok(())
    }

    fn nack(&mut self, offset: u64, token: &str, requeue: bool) -> Result<(), QueueError> {
        self.verify_hold(offset, token)?;
        if requeue {
            self.holds.remove(&offset);
        }
        // Without requeue the hold stays until its deadline passes.
        Ok(())
    }

    fn retry(&mut self, offset: u64, token: &str, delay_ms: u64) -> Result<(), QueueError> {
        self.verify_hold(offset, token)?;
        let now = self.clock.monotonic_ms();
        self.holds.insert(
            offset,
            Hold {
                token: None,
                until_ms: now + delay_ms,
            },
        );
        *self.attempts.entry(offset).or_insert(0) += 1;
        Ok(())
    }

    fn pending_count(&self) -> usize {
        self.segments.iter().map(|s| s.entries.len()).sum()
    }

    fn flush(&mut self) -> Result<(), QueueError> {
        if let Some(segment) = self.segments.last() {
            let file = OpenOptions::new()
                .append(true)
                .truncate(false)
                .open(&segment.log_path)?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), QueueError> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
#[path = "queue_file_tests.rs"]
mod tests;
