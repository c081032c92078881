use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

/// Snapshot of store-wide counts and sizes.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub banks: u64,
    pub memory_units: u64,
    pub by_fact_type: HashMap<String, u64>,
    pub entities: u64,
    pub episodes: u64,
    pub memory_links: u64,
    pub streams_active: u64,
    pub streams_deleted: u64,
    pub stream_records: u64,
    pub db_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_memory: Option<String>,
}

/// Compute statistics, optionally scoped to one bank.
///
/// `db_path` is used for file size calculation; pass None for in-memory
/// databases.
pub fn stats(
    conn: &Connection,
    bank: Option<&str>,
    db_path: Option<&Path>,
) -> Result<StatsResponse> {
    let banks = conn.query_row("SELECT COUNT(*) FROM banks", [], |r| r.get::<_, i64>(0))? as u64;
    let memory_units = count_units(conn, bank)?;
    let by_fact_type = count_by_fact_type(conn, bank)?;
    let entities = scoped_count(conn, "entities", "bank_id", bank)?;
    let episodes = scoped_count(conn, "episodes", "bank_id", bank)?;
    let memory_links = conn
        .query_row("SELECT COUNT(*) FROM memory_links", [], |r| r.get::<_, i64>(0))?
        as u64;
    let streams_active = conn.query_row(
        "SELECT COUNT(*) FROM streams WHERE deleted = 0",
        [],
        |r| r.get::<_, i64>(0),
    )? as u64;
    let streams_deleted = conn.query_row(
        "SELECT COUNT(*) FROM streams WHERE deleted = 1",
        [],
        |r| r.get::<_, i64>(0),
    )? as u64;
    let stream_records = conn
        .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get::<_, i64>(0))?
        as u64;
    let (oldest, newest) = memory_time_range(conn, bank)?;

    let db_size_bytes = db_path
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(StatsResponse {
        banks,
        memory_units,
        by_fact_type,
        entities,
        episodes,
        memory_links,
        streams_active,
        streams_deleted,
        stream_records,
        db_size_bytes,
        oldest_memory: oldest,
        newest_memory: newest,
    })
}

fn count_units(conn: &Connection, bank: Option<&str>) -> Result<u64> {
    scoped_count(conn, "memory_units", "bank_id", bank)
}

fn scoped_count(
    conn: &Connection,
    table: &str,
    bank_column: &str,
    bank: Option<&str>,
) -> Result<u64> {
    let count: i64 = match bank {
        Some(bank) => conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE {bank_column} = ?1"),
            params![bank],
            |r| r.get(0),
        )?,
        None => conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?,
    };
    Ok(count as u64)
}

fn count_by_fact_type(conn: &Connection, bank: Option<&str>) -> Result<HashMap<String, u64>> {
    let mut out = HashMap::new();
    match bank {
        Some(bank) => {
            let mut stmt = conn.prepare(
                "SELECT fact_type, COUNT(*) FROM memory_units WHERE bank_id = ?1 GROUP BY fact_type",
            )?;
            let rows = stmt.query_map(params![bank], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (fact_type, count) = row?;
                out.insert(fact_type, count as u64);
            }
        }
        None => {
            let mut stmt =
                conn.prepare("SELECT fact_type, COUNT(*) FROM memory_units GROUP BY fact_type")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (fact_type, count) = row?;
                out.insert(fact_type, count as u64);
            }
        }
    }
    Ok(out)
}

fn memory_time_range(
    conn: &Connection,
    bank: Option<&str>,
) -> Result<(Option<String>, Option<String>)> {
    let row = match bank {
        Some(bank) => conn
            .query_row(
                "SELECT MIN(created_at), MAX(created_at) FROM memory_units WHERE bank_id = ?1",
                params![bank],
                |r| Ok((r.get::<_, Option<String>>(0)?, r.get::<_, Option<String>>(1)?)),
            )
            .optional()?,
        None => conn
            .query_row(
                "SELECT MIN(created_at), MAX(created_at) FROM memory_units",
                [],
                |r| Ok((r.get::<_, Option<String>>(0)?, r.get::<_, Option<String>>(1)?)),
            )
            .optional()?,
    };
    Ok(row.unwrap_or((None, None)))
}
