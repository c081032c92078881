//! Append-only log file storage.
//!
//! Each stream owns one byte-addressed, append-only file. [`LogFile`] exposes
//! fixed-position appends and positioned reads; [`LogFilePool`] keeps one open
//! handle per stream path and maps stream paths to collision-free filenames.

pub mod engine;
pub mod typed;

use crate::error::{HindsightError, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A byte range in a log file, as recorded by a message pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub byte_pos: u64,
    pub length: u64,
}

/// Append-only byte-addressed file.
///
/// The file only ever grows; appends are fixed-position writes at the tracked
/// in-memory size (no seeking), and reads are positioned reads that never
/// move a file offset.
pub struct LogFile {
    file: Option<File>,
    path: PathBuf,
    current_size: u64,
}

impl LogFile {
    /// Open (or create) the log file at `path`, picking up its current size.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let current_size = file.metadata()?.len();
        Ok(Self {
            file: Some(file),
            path,
            current_size,
        })
    }

    fn handle(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| HindsightError::Internal(format!("log file closed: {}", self.path.display())))
    }

    /// Append `bytes` plus a newline terminator. Returns the byte range of the
    /// payload (terminator excluded).
    pub fn append(&mut self, bytes: &[u8]) -> Result<ByteRange> {
        let byte_pos = self.current_size;
        let file = self.handle()?;
        file.write_all_at(bytes, byte_pos)?;
        file.write_all_at(b"\n", byte_pos + bytes.len() as u64)?;
        self.current_size += bytes.len() as u64 + 1;
        Ok(ByteRange {
            byte_pos,
            length: bytes.len() as u64,
        })
    }

    /// Positioned read of exactly `length` bytes at `byte_pos`.
    ///
    /// A read past the tracked end of file is a truncation error, never
    /// silently short data.
    pub fn read_at(&self, byte_pos: u64, length: u64) -> Result<Vec<u8>> {
        if byte_pos + length > self.current_size {
            return Err(HindsightError::Corruption(format!(
                "read past end of log {}: pos {byte_pos} + len {length} > size {}",
                self.path.display(),
                self.current_size
            )));
        }
        let mut buf = vec![0u8; length as usize];
        self.handle()?.read_exact_at(&mut buf, byte_pos)?;
        Ok(buf)
    }

    /// Batched positioned reads.
    pub fn read_range(&self, entries: &[ByteRange]) -> Result<Vec<Vec<u8>>> {
        entries
            .iter()
            .map(|e| self.read_at(e.byte_pos, e.length))
            .collect()
    }

    /// Read from `byte_pos` to the tracked end of file.
    pub fn read_from(&self, byte_pos: u64) -> Result<Vec<u8>> {
        if byte_pos > self.current_size {
            return Err(HindsightError::Corruption(format!(
                "read past end of log {}: pos {byte_pos} > size {}",
                self.path.display(),
                self.current_size
            )));
        }
        self.read_at(byte_pos, self.current_size - byte_pos)
    }

    /// Current tracked size in bytes (payloads plus terminators).
    pub fn size(&self) -> u64 {
        self.current_size
    }

    /// Close the underlying handle. Idempotent.
    pub fn close(&mut self) {
        self.file = None;
    }
}

/// Encode a stream path into a flat, collision-free filename.
///
/// Every byte outside `[A-Za-z0-9._-]` is percent-encoded, as is a leading
/// `.`, so distinct stream paths always map to distinct filenames and no
/// encoded name can contain a path separator, start a dotfile, or spell a
/// relative component. Rejects empty paths and control characters outright.
pub fn encode_stream_path(stream_path: &str) -> Result<String> {
    if stream_path.is_empty() {
        return Err(HindsightError::Conflict("stream path must not be empty".into()));
    }
    if stream_path.bytes().any(|b| b < 0x20 || b == 0x7f) {
        return Err(HindsightError::Conflict(format!(
            "stream path contains control characters: {stream_path:?}"
        )));
    }
    let mut out = String::with_capacity(stream_path.len() + 8);
    for (i, b) in stream_path.bytes().enumerate() {
        match b {
            // "%" itself is always encoded, so a literal "%2E" in the output
            // can only come from this rule and injectivity holds.
            b'.' if i == 0 => out.push_str("%2E"),
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(b as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    Ok(format!("{out}.log"))
}

/// One open [`LogFile`] handle per stream path, reused across operations and
/// dropped on stream deletion.
pub struct LogFilePool {
    dir: PathBuf,
    handles: Mutex<HashMap<String, Arc<Mutex<LogFile>>>>,
}

impl LogFilePool {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Get (or open) the log file for a stream path.
    pub fn get(&self, stream_path: &str) -> Result<Arc<Mutex<LogFile>>> {
        let mut handles = self
            .handles
            .lock()
            .map_err(|e| HindsightError::Internal(format!("log pool lock poisoned: {e}")))?;
        if let Some(existing) = handles.get(stream_path) {
            return Ok(Arc::clone(existing));
        }
        let filename = encode_stream_path(stream_path)?;
        let log = LogFile::open(self.dir.join(filename))?;
        let log = Arc::new(Mutex::new(log));
        handles.insert(stream_path.to_string(), Arc::clone(&log));
        Ok(log)
    }

    /// Close and drop the pooled handle, leaving the file on disk. Used on
    /// soft-delete, where old bytes stay but become unreachable.
    pub fn close_handle(&self, stream_path: &str) -> Result<()> {
        let mut handles = self
            .handles
            .lock()
            .map_err(|e| HindsightError::Internal(format!("log pool lock poisoned: {e}")))?;
        if let Some(log) = handles.remove(stream_path) {
            if let Ok(mut log) = log.lock() {
                log.close();
            }
        }
        Ok(())
    }

    /// Close and drop the pooled handle and remove the file on disk.
    pub fn remove(&self, stream_path: &str) -> Result<()> {
        let mut handles = self
            .handles
            .lock()
            .map_err(|e| HindsightError::Internal(format!("log pool lock poisoned: {e}")))?;
        if let Some(log) = handles.remove(stream_path) {
            if let Ok(mut log) = log.lock() {
                log.close();
            }
        }
        let filename = encode_stream_path(stream_path)?;
        match std::fs::remove_file(self.dir.join(filename)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
