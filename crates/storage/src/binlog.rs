// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only framed binary log with size-based segment rotation.
//!
//! A log directory holds segments named `segment-NNNNNN.tmbl`. Each frame is
//! `u16 BE type length | type bytes | u32 BE payload length | payload`.
//! The reader streams `(type, payload)` pairs across segments in order; a
//! truncated trailing frame is treated as not-yet-written.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".tmbl";

/// Default segment rotation threshold (64 MB).
pub const DEFAULT_SEG_BYTES: u64 = 64_000_000;

/// Errors from binary log operations.
#[derive(Debug, Error)]
pub enum BinlogError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("frame type too long: {0} bytes")]
    TypeTooLong(usize),
}

fn segment_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{index:06}{SEGMENT_SUFFIX}"))
}

fn list_segments(dir: &Path) -> Result<Vec<PathBuf>, BinlogError> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if name.starts_with(SEGMENT_PREFIX) && name.ends_with(SEGMENT_SUFFIX) {
            segments.push(path);
        }
    }
    segments.sort();
    Ok(segments)
}

/// Appends framed records, rotating segments at a byte threshold.
pub struct BinaryLogWriter {
    dir: PathBuf,
    seg_bytes: u64,
    seg_index: u32,
    file: File,
    written: u64,
}

impl BinaryLogWriter {
    /// Open (or create) a log directory, continuing after the newest segment.
    pub fn open(dir: &Path, seg_bytes: u64) -> Result<Self, BinlogError> {
        std::fs::create_dir_all(dir)?;
        let segments = list_segments(dir)?;
        let seg_index = segments
            .last()
            .and_then(|p| p.file_name().and_then(|n| n.to_str()))
            .and_then(|name| {
                name.strip_prefix(SEGMENT_PREFIX)
                    .and_then(|rest| rest.strip_suffix(SEGMENT_SUFFIX))
                    .and_then(|digits| digits.parse::<u32>().ok())
            })
            .unwrap_or(0)
            .max(1);

        let path = segment_path(dir, seg_index);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();

        Ok(Self {
            dir: dir.to_owned(),
            seg_bytes,
            seg_index,
            file,
            written,
        })
    }

    fn rotate(&mut self) -> Result<(), BinlogError> {
        self.file.sync_all()?;
        self.seg_index += 1;
        let path = segment_path(&self.dir, self.seg_index);
        self.file = OpenOptions::new().create(true).append(true).open(path)?;
        self.written = 0;
        Ok(())
    }

    /// Append a batch of `(type, payload)` frames.
    pub fn append_many(&mut self, frames: &[(&str, &[u8])]) -> Result<(), BinlogError> {
        for (etype, payload) in frames {
            if self.written > 0 && self.written >= self.seg_bytes {
                self.rotate()?;
            }
            let type_bytes = etype.as_bytes();
            if type_bytes.len() > u16::MAX as usize {
                return Err(BinlogError::TypeTooLong(type_bytes.len()));
            }
            let mut frame =
                Vec::with_capacity(2 + type_bytes.len() + 4 + payload.len());
            frame.extend_from_slice(&(type_bytes.len() as u16).to_be_bytes());
            frame.extend_from_slice(type_bytes);
            frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            frame.extend_from_slice(payload);
            self.file.write_all(&frame)?;
            self.written += frame.len() as u64;
        }
        Ok(())
    }

    /// Force all appended frames onto disk.
    pub fn flush_fsync(&mut self) -> Result<(), BinlogError> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Streams frames from a log directory in segment order.
pub struct BinaryLogReader {
    dir: PathBuf,
}

impl BinaryLogReader {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_owned(),
        }
    }

    /// Iterate `(type, payload)` frames across all segments in order.
    pub fn scan(&self) -> Result<FrameIter, BinlogError> {
        let segments: VecDeque<PathBuf> = list_segments(&self.dir)?.into();
        Ok(FrameIter {
            segments,
            current: None,
        })
    }
}

/// Iterator over binary log frames.
pub struct FrameIter {
    segments: VecDeque<PathBuf>,
    current: Option<(PathBuf, BufReader<File>)>,
}

impl FrameIter {
    fn read_frame(
        path: &Path,
        reader: &mut BufReader<File>,
    ) -> Result<Option<(String, Vec<u8>)>, BinlogError> {
        let mut type_len_buf = [0u8; 2];
        match reader.read_exact(&mut type_len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let type_len = u16::from_be_bytes(type_len_buf) as usize;

        let mut type_buf = vec![0u8; type_len];
        let mut payload_len_buf = [0u8; 4];
        let truncated = reader.read_exact(&mut type_buf).is_err()
            || reader.read_exact(&mut payload_len_buf).is_err();
        if truncated {
            warn!(segment = %path.display(), "truncated frame at segment tail, ignoring");
            return Ok(None);
        }
        let payload_len = u32::from_be_bytes(payload_len_buf) as usize;
        let mut payload = vec![0u8; payload_len];
        if reader.read_exact(&mut payload).is_err() {
            warn!(segment = %path.display(), "truncated frame at segment tail, ignoring");
            return Ok(None);
        }

        let etype = String::from_utf8_lossy(&type_buf).into_owned();
        Ok(Some((etype, payload)))
    }
}

impl Iterator for FrameIter {
    type Item = Result<(String, Vec<u8>), BinlogError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (path, mut reader) = match self.current.take() {
                Some(current) => current,
                None => {
                    let path = self.segments.pop_front()?;
                    let file = match File::open(&path) {
                        Ok(f) => f,
                        Err(e) => return Some(Err(e.into())),
                    };
                    (path, BufReader::new(file))
                }
            };

            match Self::read_frame(&path, &mut reader) {
                Ok(Some(frame)) => {
                    self.current = Some((path, reader));
                    return Some(Ok(frame));
                }
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
#[path = "binlog_tests.rs"]
mod tests;
