//! Producer idempotency state machine.
//!
//! Each `(stream_path, producer_id)` pair owns one row holding `(epoch,
//! last_seq)`. The total order enforced here is what gives at-most-once
//! delivery per sequence number even with concurrent producers retrying
//! after network failures: duplicates are no-ops, zombies with stale epochs
//! are fenced, and gaps are rejected with the expected sequence.

use crate::error::{HindsightError, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// Producer header triple sent with an append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerInfo {
    pub producer_id: String,
    pub epoch: u64,
    pub seq: u64,
}

/// Outcome of validating a producer triple against stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerCheck {
    /// New sequence number — append and advance.
    Accept,
    /// Already seen `(epoch, seq)` — report success without re-appending.
    Duplicate,
}

/// Validate and, on acceptance, advance producer state in one transaction.
pub fn check_and_advance(
    conn: &mut Connection,
    stream_path: &str,
    producer: &ProducerInfo,
) -> Result<ProducerCheck> {
    let tx = conn.transaction()?;
    let now = chrono::Utc::now().to_rfc3339();

    let stored: Option<(u64, u64)> = tx
        .query_row(
            "SELECT epoch, last_seq FROM producers WHERE stream_path = ?1 AND producer_id = ?2",
            params![stream_path, producer.producer_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, i64>(1)? as u64,
                ))
            },
        )
        .optional()?;

    let check = match stored {
        None => {
            if producer.seq != 0 {
                return Err(HindsightError::sequence_gap(0, producer.seq));
            }
            tx.execute(
                "INSERT INTO producers (stream_path, producer_id, epoch, last_seq, last_updated) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    stream_path,
                    producer.producer_id,
                    producer.epoch as i64,
                    0i64,
                    now
                ],
            )?;
            ProducerCheck::Accept
        }
        Some((stored_epoch, last_seq)) => {
            if producer.epoch < stored_epoch {
                return Err(HindsightError::Forbidden(format!(
                    "producer {} epoch {} fenced by epoch {}",
                    producer.producer_id, producer.epoch, stored_epoch
                )));
            }
            if producer.epoch > stored_epoch {
                // Epoch reset: a restarted producer starts its new epoch at 0.
                if producer.seq != 0 {
                    return Err(HindsightError::sequence_gap(0, producer.seq));
                }
                tx.execute(
                    "UPDATE producers SET epoch = ?3, last_seq = 0, last_updated = ?4 \
                     WHERE stream_path = ?1 AND producer_id = ?2",
                    params![stream_path, producer.producer_id, producer.epoch as i64, now],
                )?;
                ProducerCheck::Accept
            } else if producer.seq == last_seq + 1 {
                tx.execute(
                    "UPDATE producers SET last_seq = ?3, last_updated = ?4 \
                     WHERE stream_path = ?1 AND producer_id = ?2",
                    params![stream_path, producer.producer_id, producer.seq as i64, now],
                )?;
                ProducerCheck::Accept
            } else if producer.seq <= last_seq {
                ProducerCheck::Duplicate
            } else {
                return Err(HindsightError::sequence_gap(last_seq + 1, producer.seq));
            }
        }
    };

    tx.commit()?;
    Ok(check)
}

/// Stored `(epoch, last_seq)` for a producer, if any.
pub fn snapshot(
    conn: &Connection,
    stream_path: &str,
    producer_id: &str,
) -> Result<Option<(u64, u64)>> {
    let stored = conn
        .query_row(
            "SELECT epoch, last_seq FROM producers WHERE stream_path = ?1 AND producer_id = ?2",
            params![stream_path, producer_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, i64>(1)? as u64,
                ))
            },
        )
        .optional()?;
    Ok(stored)
}

/// Restore a producer row to a prior snapshot. Used when an append fails
/// after the advance committed, so a client retry of the same sequence is
/// accepted again instead of reported as a duplicate of a lost record.
pub fn restore(
    conn: &Connection,
    stream_path: &str,
    producer_id: &str,
    prior: Option<(u64, u64)>,
) -> Result<()> {
    match prior {
        None => {
            conn.execute(
                "DELETE FROM producers WHERE stream_path = ?1 AND producer_id = ?2",
                params![stream_path, producer_id],
            )?;
        }
        Some((epoch, last_seq)) => {
            conn.execute(
                "UPDATE producers SET epoch = ?3, last_seq = ?4 \
                 WHERE stream_path = ?1 AND producer_id = ?2",
                params![stream_path, producer_id, epoch as i64, last_seq as i64],
            )?;
        }
    }
    Ok(())
}

/// Garbage-collect producer rows with no update for `ttl_days` days.
pub fn gc_expired(conn: &Connection, ttl_days: u64) -> Result<usize> {
    let cutoff = (chrono::Utc::now() - chrono::Duration::days(ttl_days as i64)).to_rfc3339();
    let removed = conn.execute(
        "DELETE FROM producers WHERE last_updated < ?1",
        params![cutoff],
    )?;
    if removed > 0 {
        tracing::info!(removed, "expired producer rows collected");
    }
    Ok(removed)
}
