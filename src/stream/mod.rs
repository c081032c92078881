//! Durable stream store: the stream protocol state machine.
//!
//! [`DurableStore`] implements create/read/append/subscribe/delete on top of
//! the [`JsonlEngine`](crate::log::engine::JsonlEngine), adding producer
//! idempotency, close semantics, JSON-array splitting, and live fan-out.
//!
//! Lifecycle per stream: `nonexistent → active → closed`, with soft-delete
//! from either live state and recreation bumping the generation counter.

pub mod producers;
pub mod subscribers;

use crate::config::StreamConfig;
use crate::error::{HindsightError, Result};
use crate::log::engine::{CreateOutcome, JsonlEngine, StreamMeta};
use producers::{ProducerCheck, ProducerInfo};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use subscribers::{StreamEvent, SubscriberRegistry};
use tokio::sync::broadcast;

/// Where a read starts. Offset tokens have two sentinels alongside the
/// `{read_seq}_{byte_offset}` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    /// Everything in the current generation.
    Beginning,
    /// Only records appended after this moment.
    Now,
    /// Strictly after the given `(read_seq, byte_offset)` pair.
    At(u64, u64),
}

impl StartOffset {
    pub fn parse(token: Option<&str>) -> Result<Self> {
        match token {
            None | Some("beginning") => Ok(Self::Beginning),
            Some("now") => Ok(Self::Now),
            Some(other) => {
                let (seq, off) = crate::log::engine::parse_offset(other)?;
                Ok(Self::At(seq, off))
            }
        }
    }
}

/// One record as returned by a read.
#[derive(Debug, Clone)]
pub struct RecordOut {
    pub offset: String,
    pub timestamp: String,
    pub bytes: Vec<u8>,
}

/// Result of a read in any live mode.
#[derive(Debug, Clone)]
pub struct ReadResponse {
    pub records: Vec<RecordOut>,
    pub next_offset: String,
    pub up_to_date: bool,
    pub closed: bool,
    /// Set when a long-poll gave up waiting. A normal outcome, not an error.
    pub timed_out: bool,
}

/// Result of an append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Stored `records` new records; the stream cursor is now `next_offset`.
    Accepted { next_offset: String, records: usize },
    /// Producer replayed an already-seen sequence number; nothing stored.
    Duplicate { next_offset: String },
}

impl AppendOutcome {
    pub fn next_offset(&self) -> &str {
        match self {
            Self::Accepted { next_offset, .. } | Self::Duplicate { next_offset } => next_offset,
        }
    }
}

pub struct DurableStore {
    conn: Arc<Mutex<Connection>>,
    engine: Arc<JsonlEngine>,
    subscribers: SubscriberRegistry,
    config: StreamConfig,
}

impl DurableStore {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        engine: Arc<JsonlEngine>,
        config: StreamConfig,
    ) -> Self {
        Self {
            conn,
            engine,
            subscribers: SubscriberRegistry::new(),
            config,
        }
    }

    pub fn engine(&self) -> &Arc<JsonlEngine> {
        &self.engine
    }

    /// Create a stream (idempotent). A recreate after soft-delete bumps the
    /// generation; old subscribers were already notified at delete time.
    pub fn create(
        &self,
        path: &str,
        content_type: Option<&str>,
        ttl_seconds: Option<u64>,
    ) -> Result<CreateOutcome> {
        self.engine.create_stream(path, content_type, ttl_seconds)
    }

    /// Metadata only.
    pub fn exists(&self, path: &str) -> Result<StreamMeta> {
        self.engine.stream_meta(path)
    }

    /// Append a payload, validating the producer triple when supplied.
    ///
    /// JSON-array payloads are split into one record per element before
    /// indexing; every other payload is stored as a single record. `close`
    /// marks the stream closed after this final write.
    pub fn append(
        &self,
        path: &str,
        payload: &[u8],
        producer: Option<&ProducerInfo>,
        close: bool,
    ) -> Result<AppendOutcome> {
        let meta = self.engine.stream_meta(path)?;
        if meta.closed {
            return Err(HindsightError::Conflict(format!(
                "stream {path} is closed"
            )));
        }
        if payload.len() > self.config.max_append_bytes {
            return Err(HindsightError::ResourceExhausted(format!(
                "payload of {} bytes exceeds limit of {}",
                payload.len(),
                self.config.max_append_bytes
            )));
        }

        // The advance commits before the physical write, so remember the
        // prior state and undo the advance if the write fails. Otherwise a
        // retry of the same sequence would be suppressed as a duplicate of a
        // record that was never stored.
        let mut advanced: Option<Option<(u64, u64)>> = None;
        if let Some(producer) = producer {
            let mut conn = self
                .conn
                .lock()
                .map_err(|e| HindsightError::Internal(format!("db lock poisoned: {e}")))?;
            let prior = producers::snapshot(&conn, path, &producer.producer_id)?;
            let check = producers::check_and_advance(&mut conn, path, producer)?;
            if check == ProducerCheck::Duplicate {
                tracing::debug!(
                    stream = path,
                    producer = %producer.producer_id,
                    seq = producer.seq,
                    "duplicate append suppressed"
                );
                return Ok(AppendOutcome::Duplicate {
                    next_offset: meta.next_offset(),
                });
            }
            advanced = Some(prior);
        }

        let write = || -> Result<(String, usize)> {
            let items = split_payload(payload)?;
            let mut last_offset = meta.next_offset();
            let count = items.len();
            for item in items {
                let pointer = self.engine.append(path, &item)?;
                last_offset = pointer.offset();
            }
            if close {
                self.engine
                    .close_stream(path, producer.map(|p| p.producer_id.as_str()))?;
            }
            Ok((last_offset, count))
        };
        let (last_offset, count) = match write() {
            Ok(result) => result,
            Err(e) => {
                if let (Some(prior), Some(producer)) = (advanced, producer) {
                    self.rollback_producer(path, &producer.producer_id, prior);
                }
                return Err(e);
            }
        };

        if count > 0 {
            self.subscribers.publish(
                path,
                StreamEvent::Appended {
                    next_offset: last_offset.clone(),
                },
            );
        }
        if close {
            self.subscribers.publish(
                path,
                StreamEvent::Closed {
                    next_offset: last_offset.clone(),
                },
            );
        }

        Ok(AppendOutcome::Accepted {
            next_offset: last_offset,
            records: count,
        })
    }

    /// Undo a committed producer advance after a failed write. Failures are
    /// logged; the original write error is the one the caller sees.
    fn rollback_producer(&self, path: &str, producer_id: &str, prior: Option<(u64, u64)>) {
        let result = self
            .conn
            .lock()
            .map_err(|e| HindsightError::Internal(format!("db lock poisoned: {e}")))
            .and_then(|conn| producers::restore(&conn, path, producer_id, prior));
        if let Err(e) = result {
            tracing::warn!(
                stream = path,
                producer = producer_id,
                error = %e,
                "failed to roll back producer advance"
            );
        }
    }

    /// Catch-up read: everything after `start`, returned immediately.
    pub fn read(&self, path: &str, start: StartOffset, limit: Option<usize>) -> Result<ReadResponse> {
        Self::read_with(&self.engine, path, start, limit)
    }

    fn read_with(
        engine: &JsonlEngine,
        path: &str,
        start: StartOffset,
        limit: Option<usize>,
    ) -> Result<ReadResponse> {
        let meta = engine.stream_meta(path)?;
        let after = match start {
            StartOffset::Beginning => None,
            StartOffset::Now => Some((meta.current_read_seq, meta.current_byte_offset)),
            StartOffset::At(seq, off) => Some((seq, off)),
        };

        let stored = engine.read_after(path, after, limit)?;
        let next_offset = stored
            .last()
            .map(|r| r.pointer.offset())
            .unwrap_or_else(|| meta.next_offset());
        let last_byte = stored
            .last()
            .map(|r| r.pointer.byte_offset)
            .unwrap_or(meta.current_byte_offset);

        Ok(ReadResponse {
            records: stored
                .into_iter()
                .map(|r| RecordOut {
                    offset: r.pointer.offset(),
                    timestamp: r.pointer.timestamp,
                    bytes: r.bytes,
                })
                .collect(),
            next_offset,
            up_to_date: last_byte >= meta.current_byte_offset,
            closed: meta.closed,
            timed_out: false,
        })
    }

    /// Long-poll read: if already caught up, block until new data, close,
    /// delete, or the configured timeout. Timeout yields an empty response
    /// flagged `timed_out`, never an error.
    pub async fn long_poll(
        &self,
        path: &str,
        start: StartOffset,
        limit: Option<usize>,
    ) -> Result<ReadResponse> {
        // Subscribe before the initial read so an append racing the read
        // cannot be missed.
        let mut rx = self.subscribers.subscribe(path);

        let first = self.blocking_read(path, start, limit).await?;
        if !first.records.is_empty() || first.closed {
            return Ok(first);
        }

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.long_poll_timeout_secs);
        let cursor = StartOffset::parse(Some(&first.next_offset))?;

        loop {
            let event = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => {
                    let mut response = first.clone();
                    response.timed_out = true;
                    response.up_to_date = true;
                    return Ok(response);
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                    // Missed wakeups; the index has everything we need.
                    StreamEvent::Appended {
                        next_offset: String::new(),
                    }
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => StreamEvent::Deleted,
                Ok(Ok(event)) => event,
            };

            match event {
                StreamEvent::Appended { .. } | StreamEvent::Closed { .. } => {
                    let response = self.blocking_read(path, cursor, limit).await?;
                    if !response.records.is_empty() || response.closed {
                        return Ok(response);
                    }
                }
                StreamEvent::Deleted => {
                    return Err(HindsightError::NotFound(format!(
                        "stream deleted: {path}"
                    )));
                }
            }
        }
    }

    /// Open a push subscription: the caught-up state plus a receiver of
    /// subsequent wakeups. Dropping the receiver unsubscribes immediately.
    pub fn subscribe(
        &self,
        path: &str,
        start: StartOffset,
        limit: Option<usize>,
    ) -> Result<(ReadResponse, broadcast::Receiver<StreamEvent>)> {
        let rx = self.subscribers.subscribe(path);
        let initial = self.read(path, start, limit)?;
        Ok((initial, rx))
    }

    /// Soft-delete and notify every live subscriber with a terminal event.
    pub fn delete(&self, path: &str) -> Result<()> {
        self.engine.delete_stream(path)?;
        self.subscribers.publish_terminal(path, StreamEvent::Deleted);
        Ok(())
    }

    /// Soft-delete streams whose TTL elapsed since their last update, and
    /// collect expired producer rows. Returns (streams, producers) swept.
    pub fn sweep_expired(&self) -> Result<(usize, usize)> {
        let expired: Vec<String> = {
            let conn = self
                .conn
                .lock()
                .map_err(|e| HindsightError::Internal(format!("db lock poisoned: {e}")))?;
            let now = chrono::Utc::now();
            let mut stmt = conn.prepare(
                "SELECT path, ttl_seconds, updated_at FROM streams \
                 WHERE deleted = 0 AND ttl_seconds IS NOT NULL",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)? as u64,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter()
                .filter(|(_, ttl, updated_at)| {
                    chrono::DateTime::parse_from_rfc3339(updated_at)
                        .map(|t| now - t.with_timezone(&chrono::Utc) > chrono::Duration::seconds(*ttl as i64))
                        .unwrap_or(false)
                })
                .map(|(path, _, _)| path)
                .collect()
        };

        for path in &expired {
            tracing::info!(stream = %path, "ttl expired, sweeping stream");
            self.delete(path)?;
            self.engine.purge_stream_file(path)?;
        }

        let producers_removed = {
            let conn = self
                .conn
                .lock()
                .map_err(|e| HindsightError::Internal(format!("db lock poisoned: {e}")))?;
            producers::gc_expired(&conn, self.config.producer_ttl_days)?
        };

        Ok((expired.len(), producers_removed))
    }

    async fn blocking_read(
        &self,
        path: &str,
        start: StartOffset,
        limit: Option<usize>,
    ) -> Result<ReadResponse> {
        let engine = Arc::clone(&self.engine);
        let path = path.to_string();
        tokio::task::spawn_blocking(move || Self::read_with(&engine, &path, start, limit))
            .await
            .map_err(|e| HindsightError::Internal(format!("read task failed: {e}")))?
    }
}

/// Split a JSON-array payload into per-element records; anything else is a
/// single record.
fn split_payload(payload: &[u8]) -> Result<Vec<Vec<u8>>> {
    if let Ok(serde_json::Value::Array(items)) = serde_json::from_slice(payload) {
        let mut records = Vec::with_capacity(items.len());
        for item in items {
            records.push(serde_json::to_vec(&item)?);
        }
        Ok(records)
    } else {
        Ok(vec![payload.to_vec()])
    }
}
