//! SQL DDL for all Hindsight tables.
//!
//! Two table families share one database: the durable-stream index
//! (`streams`, `messages`, `producers`) and the memory schema (`banks`,
//! `memory_units`, `memory_fts` (FTS5), `memory_vec` (vec0), `entities`,
//! `memory_entities`, `entity_cooccurrence`, `episodes`, `episode_links`,
//! `memory_links`). All DDL uses `IF NOT EXISTS` for idempotent
//! initialization.

use rusqlite::Connection;

/// All schema DDL statements for Hindsight's core tables.
const SCHEMA_SQL: &str = r#"
-- Stream metadata. A soft-deleted stream keeps its row so recreation can
-- bump the generation counter (read_seq) and invalidate old offsets.
CREATE TABLE IF NOT EXISTS streams (
    path TEXT PRIMARY KEY,
    content_type TEXT,
    ttl_seconds INTEGER,
    closed INTEGER NOT NULL DEFAULT 0,
    closed_by TEXT,
    current_read_seq INTEGER NOT NULL DEFAULT 0,
    current_byte_offset INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Message pointers. Payload bytes live only in the per-stream log file;
-- this table maps logical offsets to byte ranges.
CREATE TABLE IF NOT EXISTS messages (
    stream_path TEXT NOT NULL REFERENCES streams(path) ON DELETE CASCADE,
    read_seq INTEGER NOT NULL,
    byte_offset INTEGER NOT NULL,
    byte_pos INTEGER NOT NULL,
    length INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    PRIMARY KEY (stream_path, read_seq, byte_offset)
);

CREATE INDEX IF NOT EXISTS idx_messages_stream ON messages(stream_path, read_seq, byte_offset);

-- Producer idempotency state, one row per (stream, producer).
CREATE TABLE IF NOT EXISTS producers (
    stream_path TEXT NOT NULL,
    producer_id TEXT NOT NULL,
    epoch INTEGER NOT NULL,
    last_seq INTEGER NOT NULL,
    last_updated TEXT NOT NULL,
    PRIMARY KEY (stream_path, producer_id)
);

-- Memory banks (isolation boundary for memory units).
CREATE TABLE IF NOT EXISTS banks (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

-- Memory units.
CREATE TABLE IF NOT EXISTS memory_units (
    id TEXT PRIMARY KEY,
    bank_id TEXT NOT NULL REFERENCES banks(id) ON DELETE CASCADE,
    content TEXT NOT NULL,
    fact_type TEXT NOT NULL CHECK(fact_type IN ('world','experience','opinion','observation')),
    confidence REAL NOT NULL DEFAULT 1.0 CHECK(confidence >= 0.0 AND confidence <= 1.0),
    occurred_start TEXT,
    occurred_end TEXT,
    mentioned_at TEXT,
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed TEXT,
    encoding_strength REAL NOT NULL DEFAULT 1.0 CHECK(encoding_strength >= 0.0 AND encoding_strength <= 3.0),
    proof_count INTEGER NOT NULL DEFAULT 1,
    source_memory_ids TEXT,
    history TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_units_bank ON memory_units(bank_id);
CREATE INDEX IF NOT EXISTS idx_units_fact_type ON memory_units(fact_type);
CREATE INDEX IF NOT EXISTS idx_units_mentioned ON memory_units(mentioned_at);
CREATE INDEX IF NOT EXISTS idx_units_confidence ON memory_units(confidence);

-- Full-text search (BM25)
CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts USING fts5(
    content,
    id UNINDEXED,
    bank_id UNINDEXED,
    content='memory_units',
    content_rowid='rowid'
);

-- Entities and their mentions.
CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    bank_id TEXT NOT NULL REFERENCES banks(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entities_bank_name ON entities(bank_id, name);

CREATE TABLE IF NOT EXISTS memory_entities (
    memory_id TEXT NOT NULL REFERENCES memory_units(id) ON DELETE CASCADE,
    entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    PRIMARY KEY (memory_id, entity_id)
);

CREATE INDEX IF NOT EXISTS idx_mentions_entity ON memory_entities(entity_id);

-- Per-bank co-occurrence counts, canonical ordering entity_a <= entity_b.
CREATE TABLE IF NOT EXISTS entity_cooccurrence (
    bank_id TEXT NOT NULL,
    entity_a TEXT NOT NULL,
    entity_b TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (bank_id, entity_a, entity_b),
    CHECK (entity_a <= entity_b)
);

-- Episodes and boundary links.
CREATE TABLE IF NOT EXISTS episodes (
    id TEXT PRIMARY KEY,
    bank_id TEXT NOT NULL REFERENCES banks(id) ON DELETE CASCADE,
    profile TEXT NOT NULL DEFAULT '',
    project TEXT NOT NULL DEFAULT '',
    session TEXT NOT NULL DEFAULT '',
    start_at TEXT NOT NULL,
    end_at TEXT,
    last_event_at TEXT NOT NULL,
    event_count INTEGER NOT NULL DEFAULT 0,
    boundary_reason TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_episodes_scope ON episodes(bank_id, profile, project, session);

CREATE TABLE IF NOT EXISTS episode_links (
    from_episode TEXT NOT NULL REFERENCES episodes(id) ON DELETE CASCADE,
    to_episode TEXT NOT NULL REFERENCES episodes(id) ON DELETE CASCADE,
    reason TEXT NOT NULL,
    gap_ms INTEGER NOT NULL,
    PRIMARY KEY (from_episode, to_episode)
);

-- Typed weighted edges between memory units.
CREATE TABLE IF NOT EXISTS memory_links (
    source_id TEXT NOT NULL REFERENCES memory_units(id) ON DELETE CASCADE,
    target_id TEXT NOT NULL REFERENCES memory_units(id) ON DELETE CASCADE,
    link_type TEXT NOT NULL CHECK(link_type IN ('temporal','semantic','entity','causes','caused_by','enables','prevents')),
    weight REAL NOT NULL DEFAULT 1.0,
    created_at TEXT NOT NULL,
    PRIMARY KEY (source_id, target_id, link_type)
);

CREATE INDEX IF NOT EXISTS idx_links_source ON memory_links(source_id);
CREATE INDEX IF NOT EXISTS idx_links_target ON memory_links(target_id);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual table must be created separately (sqlite-vec syntax).
const VEC_TABLE_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS memory_vec USING vec0(
    id TEXT PRIMARY KEY,
    embedding FLOAT[384]
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(VEC_TABLE_SQL)?;

    // Set initial schema version if not already present
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for expected in [
            "streams",
            "messages",
            "producers",
            "banks",
            "memory_units",
            "entities",
            "memory_entities",
            "entity_cooccurrence",
            "episodes",
            "episode_links",
            "memory_links",
            "schema_meta",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }

        // Verify the vec0 virtual table loaded
        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn schema_is_idempotent() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap(); // second call should not error
    }

    #[test]
    fn cooccurrence_rejects_uncanonical_order() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO entity_cooccurrence (bank_id, entity_a, entity_b, count) VALUES ('b', 'zeta', 'alpha', 1)",
            [],
        );
        assert!(result.is_err(), "entity_a > entity_b must violate the CHECK");
    }
}
