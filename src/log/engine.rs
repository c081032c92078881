//! Pointer-indexed JSONL storage engine.
//!
//! [`JsonlEngine`] pairs per-stream [`LogFile`](super::LogFile)s with the
//! SQLite pointer table. Appends are two-phase: the file write happens first,
//! then one index transaction inserts the pointer row and advances the
//! stream's cumulative byte offset. A crash between the phases can only
//! orphan unindexed bytes, never index bytes that were not written.

use crate::error::{HindsightError, Result};
use crate::log::{ByteRange, LogFilePool};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Width of each zero-padded offset component.
const OFFSET_DIGITS: usize = 16;

/// Format an offset token: `{read_seq:016}_{byte_offset:016}`.
///
/// Zero-padding both components guarantees that lexicographic comparison of
/// tokens equals numeric comparison of the pair, which is what lets range
/// queries be expressed as string inequalities.
pub fn format_offset(read_seq: u64, byte_offset: u64) -> String {
    format!("{read_seq:0w$}_{byte_offset:0w$}", w = OFFSET_DIGITS)
}

/// Parse an offset token back into `(read_seq, byte_offset)`.
pub fn parse_offset(token: &str) -> Result<(u64, u64)> {
    let (seq, off) = token
        .split_once('_')
        .ok_or_else(|| HindsightError::Conflict(format!("malformed offset token: {token:?}")))?;
    if seq.len() != OFFSET_DIGITS || off.len() != OFFSET_DIGITS {
        return Err(HindsightError::Conflict(format!(
            "malformed offset token: {token:?}"
        )));
    }
    let read_seq = seq
        .parse::<u64>()
        .map_err(|_| HindsightError::Conflict(format!("malformed offset token: {token:?}")))?;
    let byte_offset = off
        .parse::<u64>()
        .map_err(|_| HindsightError::Conflict(format!("malformed offset token: {token:?}")))?;
    Ok((read_seq, byte_offset))
}

/// Outcome of a create-stream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Stream did not exist (or was soft-deleted) and is now active.
    Created,
    /// Stream already exists with identical config.
    Exists,
}

/// Stream metadata as stored in the `streams` table.
#[derive(Debug, Clone)]
pub struct StreamMeta {
    pub path: String,
    pub content_type: Option<String>,
    pub ttl_seconds: Option<u64>,
    pub closed: bool,
    pub closed_by: Option<String>,
    pub current_read_seq: u64,
    pub current_byte_offset: u64,
    pub created_at: String,
    pub updated_at: String,
}

impl StreamMeta {
    /// Offset token one past the last indexed record.
    pub fn next_offset(&self) -> String {
        format_offset(self.current_read_seq, self.current_byte_offset)
    }
}

/// A pointer row: the only thing ever indexed. Payload bytes live in the log.
#[derive(Debug, Clone)]
pub struct MessagePointer {
    pub stream_path: String,
    pub read_seq: u64,
    /// Cumulative byte cursor after this record; strictly increasing per
    /// generation and the record's logical offset.
    pub byte_offset: u64,
    pub byte_pos: u64,
    pub length: u64,
    pub timestamp: String,
}

impl MessagePointer {
    pub fn offset(&self) -> String {
        format_offset(self.read_seq, self.byte_offset)
    }
}

/// A pointer resolved to its payload bytes.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub pointer: MessagePointer,
    pub bytes: Vec<u8>,
}

pub struct JsonlEngine {
    conn: Arc<Mutex<Connection>>,
    pool: LogFilePool,
}

impl JsonlEngine {
    pub fn new(conn: Arc<Mutex<Connection>>, data_dir: impl AsRef<Path>) -> Self {
        Self {
            conn,
            pool: LogFilePool::new(data_dir),
        }
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| HindsightError::Internal(format!("db lock poisoned: {e}")))
    }

    /// Create a stream, resurrect a soft-deleted one, or report it exists.
    ///
    /// On resurrection the generation counter is bumped (invalidating every
    /// previously issued offset token), the byte cursor resets to zero, and
    /// stale pointer/producer rows are purged. The physical log file is left
    /// alone — its old bytes are unreachable through the new generation.
    pub fn create_stream(
        &self,
        path: &str,
        content_type: Option<&str>,
        ttl_seconds: Option<u64>,
    ) -> Result<CreateOutcome> {
        super::encode_stream_path(path)?; // validate before touching the index
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().to_rfc3339();

        let existing: Option<(bool, Option<String>, Option<u64>)> = tx
            .query_row(
                "SELECT deleted, content_type, ttl_seconds FROM streams WHERE path = ?1",
                params![path],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)? != 0,
                        row.get(1)?,
                        row.get::<_, Option<i64>>(2)?.map(|v| v as u64),
                    ))
                },
            )
            .optional()?;

        let outcome = match existing {
            None => {
                tx.execute(
                    "INSERT INTO streams (path, content_type, ttl_seconds, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    params![path, content_type, ttl_seconds.map(|v| v as i64), now],
                )?;
                CreateOutcome::Created
            }
            Some((true, _, _)) => {
                // Resurrection: bump the generation, reset the cursor, purge
                // the prior generation's index and producer state.
                tx.execute(
                    "UPDATE streams SET deleted = 0, closed = 0, closed_by = NULL, \
                     content_type = ?2, ttl_seconds = ?3, \
                     current_read_seq = current_read_seq + 1, current_byte_offset = 0, \
                     updated_at = ?4 WHERE path = ?1",
                    params![path, content_type, ttl_seconds.map(|v| v as i64), now],
                )?;
                tx.execute("DELETE FROM messages WHERE stream_path = ?1", params![path])?;
                tx.execute("DELETE FROM producers WHERE stream_path = ?1", params![path])?;
                CreateOutcome::Created
            }
            Some((false, existing_ct, existing_ttl)) => {
                if existing_ct.as_deref() != content_type || existing_ttl != ttl_seconds {
                    return Err(HindsightError::Conflict(format!(
                        "stream {path} exists with different config"
                    )));
                }
                CreateOutcome::Exists
            }
        };

        tx.commit()?;
        tracing::debug!(stream = path, ?outcome, "create_stream");
        Ok(outcome)
    }

    /// Fetch stream metadata. Soft-deleted streams are NotFound.
    pub fn stream_meta(&self, path: &str) -> Result<StreamMeta> {
        let conn = self.lock_conn()?;
        stream_meta_on(&conn, path)
    }

    /// Two-phase append: write bytes to the stream's log file, then insert
    /// the pointer row and advance the byte cursor in one transaction.
    pub fn append(&self, path: &str, bytes: &[u8]) -> Result<MessagePointer> {
        let log = self.pool.get(path)?;
        // Holding the file lock across both phases serializes appends to a
        // stream, keeping the cursor and the file size in step.
        let mut log = log
            .lock()
            .map_err(|e| HindsightError::Internal(format!("log lock poisoned: {e}")))?;

        let meta = self.stream_meta(path)?;

        // Phase 1: file write.
        let ByteRange { byte_pos, length } = log.append(bytes)?;

        // Phase 2: index transaction.
        let byte_offset = meta.current_byte_offset + length + 1;
        let now = chrono::Utc::now().to_rfc3339();
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO messages (stream_path, read_seq, byte_offset, byte_pos, length, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                path,
                meta.current_read_seq as i64,
                byte_offset as i64,
                byte_pos as i64,
                length as i64,
                now
            ],
        )?;
        tx.execute(
            "UPDATE streams SET current_byte_offset = ?2, updated_at = ?3 WHERE path = ?1",
            params![path, byte_offset as i64, now],
        )?;
        tx.commit()?;

        Ok(MessagePointer {
            stream_path: path.to_string(),
            read_seq: meta.current_read_seq,
            byte_offset,
            byte_pos,
            length,
            timestamp: now,
        })
    }

    /// Read records after the given `(read_seq, byte_offset)` pair, in append
    /// order, resolving each pointer via a positioned read.
    ///
    /// A token from an older generation reads as "before the beginning"; a
    /// token claiming a future generation is rejected.
    pub fn read_after(
        &self,
        path: &str,
        after: Option<(u64, u64)>,
        limit: Option<usize>,
    ) -> Result<Vec<StoredRecord>> {
        let meta = self.stream_meta(path)?;
        let after_offset = match after {
            None => 0,
            Some((seq, _)) if seq < meta.current_read_seq => 0,
            Some((seq, _)) if seq > meta.current_read_seq => {
                return Err(HindsightError::Conflict(format!(
                    "offset generation {seq} is ahead of stream generation {}",
                    meta.current_read_seq
                )));
            }
            Some((_, off)) => off,
        };

        let pointers = {
            let conn = self.lock_conn()?;
            let mut stmt = conn.prepare(
                "SELECT read_seq, byte_offset, byte_pos, length, timestamp FROM messages \
                 WHERE stream_path = ?1 AND read_seq = ?2 AND byte_offset > ?3 \
                 ORDER BY byte_offset LIMIT ?4",
            )?;
            let limit = limit.map(|l| l as i64).unwrap_or(-1);
            let rows = stmt
                .query_map(
                    params![path, meta.current_read_seq as i64, after_offset as i64, limit],
                    |row| {
                        Ok(MessagePointer {
                            stream_path: path.to_string(),
                            read_seq: row.get::<_, i64>(0)? as u64,
                            byte_offset: row.get::<_, i64>(1)? as u64,
                            byte_pos: row.get::<_, i64>(2)? as u64,
                            length: row.get::<_, i64>(3)? as u64,
                            timestamp: row.get(4)?,
                        })
                    },
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        if pointers.is_empty() {
            return Ok(Vec::new());
        }

        let log = self.pool.get(path)?;
        let log = log
            .lock()
            .map_err(|e| HindsightError::Internal(format!("log lock poisoned: {e}")))?;
        let ranges: Vec<ByteRange> = pointers
            .iter()
            .map(|p| ByteRange {
                byte_pos: p.byte_pos,
                length: p.length,
            })
            .collect();
        let payloads = log.read_range(&ranges)?;

        Ok(pointers
            .into_iter()
            .zip(payloads)
            .map(|(pointer, bytes)| StoredRecord { pointer, bytes })
            .collect())
    }

    /// Mark a stream closed. Further appends are rejected by the store layer.
    pub fn close_stream(&self, path: &str, closed_by: Option<&str>) -> Result<()> {
        let conn = self.lock_conn()?;
        let now = chrono::Utc::now().to_rfc3339();
        let rows = conn.execute(
            "UPDATE streams SET closed = 1, closed_by = ?2, updated_at = ?3 \
             WHERE path = ?1 AND deleted = 0",
            params![path, closed_by, now],
        )?;
        if rows == 0 {
            return Err(HindsightError::NotFound(format!("stream not found: {path}")));
        }
        Ok(())
    }

    /// Soft-delete: mark deleted and release the pooled file handle. Pointer
    /// rows stay until recreation purges them; the file itself stays on disk.
    pub fn delete_stream(&self, path: &str) -> Result<()> {
        {
            let conn = self.lock_conn()?;
            let now = chrono::Utc::now().to_rfc3339();
            let rows = conn.execute(
                "UPDATE streams SET deleted = 1, updated_at = ?2 WHERE path = ?1 AND deleted = 0",
                params![path, now],
            )?;
            if rows == 0 {
                return Err(HindsightError::NotFound(format!("stream not found: {path}")));
            }
        }
        self.pool.close_handle(path)?;
        tracing::info!(stream = path, "stream soft-deleted");
        Ok(())
    }

    /// Hard-remove the log file for a stream (TTL expiry sweep).
    pub fn purge_stream_file(&self, path: &str) -> Result<()> {
        self.pool.remove(path)
    }
}

/// Fetch stream metadata on an already-locked connection.
pub(crate) fn stream_meta_on(conn: &Connection, path: &str) -> Result<StreamMeta> {
    conn.query_row(
        "SELECT path, content_type, ttl_seconds, closed, closed_by, current_read_seq, \
         current_byte_offset, created_at, updated_at \
         FROM streams WHERE path = ?1 AND deleted = 0",
        params![path],
        |row| {
            Ok(StreamMeta {
                path: row.get(0)?,
                content_type: row.get(1)?,
                ttl_seconds: row.get::<_, Option<i64>>(2)?.map(|v| v as u64),
                closed: row.get::<_, i64>(3)? != 0,
                closed_by: row.get(4)?,
                current_read_seq: row.get::<_, i64>(5)? as u64,
                current_byte_offset: row.get::<_, i64>(6)? as u64,
                created_at: row.get(7)?,
                updated_at: row.get(8)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| HindsightError::NotFound(format!("stream not found: {path}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn test_engine() -> (tempfile::TempDir, JsonlEngine) {
        let dir = tempfile::tempdir().unwrap();
        let conn = Arc::new(Mutex::new(db::open_memory_database().unwrap()));
        let engine = JsonlEngine::new(conn, dir.path());
        (dir, engine)
    }

    #[test]
    fn offset_tokens_sort_lexicographically() {
        let a = format_offset(0, 9);
        let b = format_offset(0, 10);
        let c = format_offset(1, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.len(), 33);
    }

    #[test]
    fn offset_round_trip() {
        let token = format_offset(3, 12345);
        assert_eq!(parse_offset(&token).unwrap(), (3, 12345));
        assert!(parse_offset("not-an-offset").is_err());
        assert!(parse_offset("1_2").is_err());
    }

    #[test]
    fn create_is_idempotent_with_same_config() {
        let (_dir, engine) = test_engine();
        assert_eq!(
            engine.create_stream("/chat/s1", Some("application/json"), None).unwrap(),
            CreateOutcome::Created
        );
        assert_eq!(
            engine.create_stream("/chat/s1", Some("application/json"), None).unwrap(),
            CreateOutcome::Exists
        );
    }

    #[test]
    fn create_with_conflicting_config_fails() {
        let (_dir, engine) = test_engine();
        engine.create_stream("/chat/s1", Some("application/json"), None).unwrap();
        let err = engine
            .create_stream("/chat/s1", Some("text/plain"), None)
            .unwrap_err();
        assert!(matches!(err, HindsightError::Conflict(_)));
    }

    #[test]
    fn append_then_read_round_trips() {
        let (_dir, engine) = test_engine();
        engine.create_stream("/chat/s1", None, None).unwrap();

        let p1 = engine.append("/chat/s1", br#"{"n":1}"#).unwrap();
        let p2 = engine.append("/chat/s1", br#"{"n":2}"#).unwrap();
        assert!(p2.byte_offset > p1.byte_offset);

        let records = engine.read_after("/chat/s1", None, None).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].bytes, br#"{"n":1}"#);
        assert_eq!(records[1].bytes, br#"{"n":2}"#);
    }

    #[test]
    fn read_after_offset_is_strictly_exclusive() {
        let (_dir, engine) = test_engine();
        engine.create_stream("/chat/s1", None, None).unwrap();
        let p1 = engine.append("/chat/s1", b"first").unwrap();
        engine.append("/chat/s1", b"second").unwrap();

        let records = engine
            .read_after("/chat/s1", Some((p1.read_seq, p1.byte_offset)), None)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bytes, b"second");
        // every returned offset is strictly greater than the cursor
        for r in &records {
            assert!(r.pointer.byte_offset > p1.byte_offset);
        }
    }

    #[test]
    fn resurrection_bumps_generation_and_invalidates_old_offsets() {
        let (_dir, engine) = test_engine();
        engine.create_stream("/chat/s1", None, None).unwrap();
        let old = engine.append("/chat/s1", b"old data").unwrap();
        assert_eq!(old.read_seq, 0);

        engine.delete_stream("/chat/s1").unwrap();
        assert!(matches!(
            engine.stream_meta("/chat/s1"),
            Err(HindsightError::NotFound(_))
        ));

        engine.create_stream("/chat/s1", None, None).unwrap();
        let meta = engine.stream_meta("/chat/s1").unwrap();
        assert_eq!(meta.current_read_seq, 1);
        assert_eq!(meta.current_byte_offset, 0);

        let fresh = engine.append("/chat/s1", b"new data").unwrap();
        assert_eq!(fresh.read_seq, 1);

        // An old-generation token reads from the beginning of the new
        // generation; it can never resolve into the old one.
        let records = engine
            .read_after("/chat/s1", Some((old.read_seq, old.byte_offset)), None)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bytes, b"new data");

        // A future-generation token is rejected outright.
        let err = engine.read_after("/chat/s1", Some((9, 0)), None).unwrap_err();
        assert!(matches!(err, HindsightError::Conflict(_)));
    }

    #[test]
    fn close_marks_stream_and_records_producer() {
        let (_dir, engine) = test_engine();
        engine.create_stream("/chat/s1", None, None).unwrap();
        engine.close_stream("/chat/s1", Some("producer-a")).unwrap();

        let meta = engine.stream_meta("/chat/s1").unwrap();
        assert!(meta.closed);
        assert_eq!(meta.closed_by.as_deref(), Some("producer-a"));
    }

    #[test]
    fn read_missing_stream_is_not_found() {
        let (_dir, engine) = test_engine();
        assert!(matches!(
            engine.read_after("/nope", None, None),
            Err(HindsightError::NotFound(_))
        ));
    }
}
