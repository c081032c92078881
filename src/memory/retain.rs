//! The retain pipeline: dedup gate, unit insertion, entity linking, and
//! episode tracking, all inside one transaction per fact.

use crate::embedding::EmbeddingProvider;
use crate::error::{HindsightError, Result};
use crate::memory::entities::{link_mentions, Mention};
use crate::memory::episodes;
use crate::memory::types::{FactType, HistoryEntry};
use crate::memory::{cosine_threshold_to_l2, embedding_to_bytes};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

/// One fact to retain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactInput {
    pub content: String,
    #[serde(default)]
    pub fact_type: FactType,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub occurred_start: Option<String>,
    #[serde(default)]
    pub occurred_end: Option<String>,
    #[serde(default)]
    pub mentioned_at: Option<String>,
    /// Entity mentions extracted by the caller.
    #[serde(default)]
    pub entities: Vec<MentionInput>,
}

fn default_confidence() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MentionInput {
    pub name: String,
    #[serde(default = "default_entity_type")]
    pub entity_type: String,
}

fn default_entity_type() -> String {
    "concept".to_string()
}

/// Scope and tuning options for a retain call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetainOptions {
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub session: String,
    /// Free-form tags, stored as entities of type `tag`.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Cosine similarity above which an incoming fact reinforces an
    /// existing unit instead of inserting. Defaults from config.
    #[serde(default)]
    pub dedup_threshold: Option<f64>,
    /// Merge near-duplicate units in the bank after retaining.
    #[serde(default)]
    pub consolidate: bool,
}

/// Outcome for one retained fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetainedFact {
    pub id: String,
    /// True when the fact reinforced an existing unit.
    pub deduplicated: bool,
    pub episode_id: String,
}

/// Retain a batch of facts into a bank.
pub fn retain(
    conn: &mut Connection,
    embedder: &dyn EmbeddingProvider,
    bank_id: &str,
    facts: &[FactInput],
    opts: &RetainOptions,
    default_dedup_threshold: f64,
    episode_gap_ms: i64,
) -> Result<Vec<RetainedFact>> {
    ensure_bank(conn, bank_id)?;
    let threshold = opts.dedup_threshold.unwrap_or(default_dedup_threshold);
    let mut out = Vec::with_capacity(facts.len());

    for fact in facts {
        if fact.content.trim().is_empty() {
            return Err(HindsightError::Internal("empty fact content".to_string()));
        }
        let embedding = embedder.embed(&fact.content)?;
        let now = Utc::now();
        let tx = conn.transaction()?;

        let (episode_id, _) = episodes::track_event(
            &tx,
            bank_id,
            &opts.profile,
            &opts.project,
            &opts.session,
            now,
            Some(&fact.content),
            episode_gap_ms,
        )?;

        let retained = match find_duplicate(&tx, bank_id, fact.fact_type, &embedding, threshold)? {
            Some(existing_id) => {
                reinforce(&tx, &existing_id, &now.to_rfc3339())?;
                RetainedFact {
                    id: existing_id,
                    deduplicated: true,
                    episode_id,
                }
            }
            None => {
                let id = insert_fact(&tx, bank_id, fact, &embedding, &now.to_rfc3339())?;
                RetainedFact {
                    id,
                    deduplicated: false,
                    episode_id,
                }
            }
        };

        let mut mentions: Vec<Mention> = fact
            .entities
            .iter()
            .map(|m| Mention {
                name: m.name.clone(),
                entity_type: m.entity_type.clone(),
            })
            .collect();
        mentions.extend(opts.tags.iter().map(|t| Mention {
            name: t.clone(),
            entity_type: "tag".to_string(),
        }));
        if !mentions.is_empty() {
            link_mentions(&tx, bank_id, &retained.id, &mentions, now)?;
        }

        tx.commit()?;
        tracing::debug!(
            bank = bank_id,
            id = %retained.id,
            deduplicated = retained.deduplicated,
            "fact retained"
        );
        out.push(retained);
    }

    if opts.consolidate {
        let merged = consolidate_bank(conn, bank_id, threshold)?;
        if merged > 0 {
            tracing::info!(bank = bank_id, merged, "consolidation merged units");
        }
    }

    Ok(out)
}

/// Create the bank row if it does not exist yet.
pub fn ensure_bank(conn: &Connection, bank_id: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO banks (id, name, created_at) VALUES (?1, ?1, ?2)",
        params![bank_id, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// KNN lookup for an existing unit of the same bank and fact type within the
/// cosine dedup threshold. Candidates come back ordered by distance, so the
/// first qualifying row is the best match.
fn find_duplicate(
    tx: &Transaction,
    bank_id: &str,
    fact_type: FactType,
    embedding: &[f32],
    threshold: f64,
) -> Result<Option<String>> {
    let max_distance = cosine_threshold_to_l2(threshold);
    let mut stmt = tx.prepare(
        "SELECT id, distance FROM memory_vec WHERE embedding MATCH ?1 ORDER BY distance LIMIT 20",
    )?;
    let candidates: Vec<(String, f64)> = stmt
        .query_map(params![embedding_to_bytes(embedding)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (candidate_id, distance) in candidates {
        if distance > max_distance {
            break;
        }
        let row: Option<(String, String)> = tx
            .query_row(
                "SELECT bank_id, fact_type FROM memory_units WHERE id = ?1",
                params![candidate_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((candidate_bank, candidate_type)) = row {
            if candidate_bank == bank_id && candidate_type == fact_type.as_str() {
                return Ok(Some(candidate_id));
            }
        }
    }
    Ok(None)
}

/// Bump proof count and record a reinforcement history entry.
fn reinforce(tx: &Transaction, memory_id: &str, now: &str) -> Result<()> {
    tx.execute(
        "UPDATE memory_units SET proof_count = proof_count + 1, updated_at = ?2 WHERE id = ?1",
        params![memory_id, now],
    )?;
    let proof_count: u32 = tx.query_row(
        "SELECT proof_count FROM memory_units WHERE id = ?1",
        params![memory_id],
        |r| r.get(0),
    )?;
    append_history(
        tx,
        memory_id,
        HistoryEntry::Reinforced {
            at: now.to_string(),
            proof_count,
        },
    )
}

/// Insert the unit plus its FTS and vector rows. The FTS row must reuse the
/// unit's rowid because the index is an external-content table.
fn insert_fact(
    tx: &Transaction,
    bank_id: &str,
    fact: &FactInput,
    embedding: &[f32],
    now: &str,
) -> Result<String> {
    let id = uuid::Uuid::now_v7().to_string();
    let history = serde_json::to_string(&vec![HistoryEntry::Created {
        at: now.to_string(),
    }])?;
    tx.execute(
        "INSERT INTO memory_units \
         (id, bank_id, content, fact_type, confidence, occurred_start, occurred_end, \
          mentioned_at, history, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            id,
            bank_id,
            fact.content,
            fact.fact_type.as_str(),
            fact.confidence.clamp(0.0, 1.0),
            fact.occurred_start,
            fact.occurred_end,
            fact.mentioned_at,
            history,
            now,
        ],
    )?;
    let rowid = tx.last_insert_rowid();
    tx.execute(
        "INSERT INTO memory_fts (rowid, content, id, bank_id) VALUES (?1, ?2, ?3, ?4)",
        params![rowid, fact.content, id, bank_id],
    )?;
    tx.execute(
        "INSERT INTO memory_vec (id, embedding) VALUES (?1, ?2)",
        params![id, embedding_to_bytes(embedding)],
    )?;
    Ok(id)
}

fn append_history(tx: &Transaction, memory_id: &str, entry: HistoryEntry) -> Result<()> {
    let raw: Option<String> = tx.query_row(
        "SELECT history FROM memory_units WHERE id = ?1",
        params![memory_id],
        |r| r.get(0),
    )?;
    let mut entries: Vec<HistoryEntry> = match raw {
        Some(json) => serde_json::from_str(&json)?,
        None => Vec::new(),
    };
    entries.push(entry);
    tx.execute(
        "UPDATE memory_units SET history = ?2 WHERE id = ?1",
        params![memory_id, serde_json::to_string(&entries)?],
    )?;
    Ok(())
}

/// Merge near-duplicate units of the same fact type within a bank.
///
/// The oldest unit of each duplicate pair survives: it absorbs the other's
/// proof count, records the merged id in `source_memory_ids`, and gains a
/// consolidation history entry. The absorbed unit and its index rows are
/// deleted. Returns the number of merges performed.
pub fn consolidate_bank(conn: &mut Connection, bank_id: &str, threshold: f64) -> Result<usize> {
    let tx = conn.transaction()?;
    let max_distance = cosine_threshold_to_l2(threshold);
    let now = Utc::now().to_rfc3339();
    let mut merged = 0usize;

    let ids: Vec<String> = {
        let mut stmt = tx.prepare(
            "SELECT id FROM memory_units WHERE bank_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![bank_id], |r| r.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()?
    };

    for keeper_id in ids {
        // Skip units already absorbed earlier in this pass.
        let keeper: Option<(String, u32, Option<String>, Option<String>)> = tx
            .query_row(
                "SELECT fact_type, proof_count, source_memory_ids, history \
                 FROM memory_units WHERE id = ?1",
                params![keeper_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;
        let Some((fact_type, _, source_ids_raw, _)) = keeper else {
            continue;
        };

        let embedding: Option<Vec<u8>> = tx
            .query_row(
                "SELECT embedding FROM memory_vec WHERE id = ?1",
                params![keeper_id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(embedding) = embedding else { continue };

        let duplicates: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT v.id, v.distance FROM memory_vec v \
                 WHERE v.embedding MATCH ?1 ORDER BY v.distance LIMIT 20",
            )?;
            let rows = stmt.query_map(params![embedding], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?;
            let mut dup = Vec::new();
            for row in rows {
                let (id, distance) = row?;
                if distance > max_distance {
                    break;
                }
                if id == keeper_id {
                    continue;
                }
                let same: Option<u32> = tx
                    .query_row(
                        "SELECT proof_count FROM memory_units \
                         WHERE id = ?1 AND bank_id = ?2 AND fact_type = ?3 AND created_at >= \
                         (SELECT created_at FROM memory_units WHERE id = ?4)",
                        params![id, bank_id, fact_type, keeper_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                if let Some(proof) = same {
                    dup.push((id, proof));
                }
            }
            let mut merged_ids = Vec::new();
            for (dup_id, dup_proof) in dup {
                tx.execute(
                    "UPDATE memory_units SET proof_count = proof_count + ?2, updated_at = ?3 \
                     WHERE id = ?1",
                    params![keeper_id, dup_proof, now],
                )?;
                delete_unit(&tx, &dup_id)?;
                merged_ids.push(dup_id);
            }
            merged_ids
        };

        if duplicates.is_empty() {
            continue;
        }
        merged += duplicates.len();

        let mut sources: Vec<String> = match source_ids_raw {
            Some(json) => serde_json::from_str(&json)?,
            None => Vec::new(),
        };
        sources.extend(duplicates.iter().cloned());
        tx.execute(
            "UPDATE memory_units SET source_memory_ids = ?2 WHERE id = ?1",
            params![keeper_id, serde_json::to_string(&sources)?],
        )?;
        append_history(
            &tx,
            &keeper_id,
            HistoryEntry::Consolidated {
                at: now.clone(),
                merged_ids: duplicates,
            },
        )?;
    }

    tx.commit()?;
    Ok(merged)
}

/// Remove a unit and its FTS/vector index rows.
fn delete_unit(tx: &Transaction, memory_id: &str) -> Result<()> {
    let rowid: Option<i64> = tx
        .query_row(
            "SELECT rowid FROM memory_units WHERE id = ?1",
            params![memory_id],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(rowid) = rowid {
        let content: String = tx.query_row(
            "SELECT content FROM memory_units WHERE id = ?1",
            params![memory_id],
            |r| r.get(0),
        )?;
        // External-content FTS requires the delete command form.
        tx.execute(
            "INSERT INTO memory_fts (memory_fts, rowid, content) VALUES ('delete', ?1, ?2)",
            params![rowid, content],
        )?;
    }
    tx.execute("DELETE FROM memory_vec WHERE id = ?1", params![memory_id])?;
    tx.execute(
        "DELETE FROM memory_units WHERE id = ?1",
        params![memory_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::embedding::create_provider;

    fn fact(content: &str) -> FactInput {
        FactInput {
            content: content.to_string(),
            fact_type: FactType::World,
            confidence: 0.9,
            occurred_start: None,
            occurred_end: None,
            mentioned_at: None,
            entities: Vec::new(),
        }
    }

    #[test]
    fn retain_inserts_unit_with_indexes() {
        let mut conn = db::open_memory_database().unwrap();
        let embedder = create_provider();

        let results = retain(
            &mut conn,
            embedder.as_ref(),
            "default",
            &[fact("the deploy pipeline uses blue-green rollouts")],
            &RetainOptions::default(),
            0.92,
            45 * 60 * 1000,
        )
        .unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].deduplicated);

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM memory_units", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let fts_hit: u32 = conn
            .query_row(
                "SELECT COUNT(*) FROM memory_fts WHERE memory_fts MATCH '\"deploy\"'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(fts_hit, 1);

        let vec_count: u32 = conn
            .query_row("SELECT COUNT(*) FROM memory_vec", [], |r| r.get(0))
            .unwrap();
        assert_eq!(vec_count, 1);
    }

    #[test]
    fn identical_fact_reinforces_instead_of_inserting() {
        let mut conn = db::open_memory_database().unwrap();
        let embedder = create_provider();
        let opts = RetainOptions::default();

        let first = retain(
            &mut conn,
            embedder.as_ref(),
            "default",
            &[fact("sqlite wal mode allows concurrent readers")],
            &opts,
            0.92,
            45 * 60 * 1000,
        )
        .unwrap();
        let second = retain(
            &mut conn,
            embedder.as_ref(),
            "default",
            &[fact("sqlite wal mode allows concurrent readers")],
            &opts,
            0.92,
            45 * 60 * 1000,
        )
        .unwrap();

        assert!(second[0].deduplicated);
        assert_eq!(first[0].id, second[0].id);

        let (proof, history): (u32, String) = conn
            .query_row(
                "SELECT proof_count, history FROM memory_units WHERE id = ?1",
                params![first[0].id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(proof, 2);
        let entries: Vec<HistoryEntry> = serde_json::from_str(&history).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[1], HistoryEntry::Reinforced { proof_count: 2, .. }));
    }

    #[test]
    fn different_fact_types_do_not_dedup() {
        let mut conn = db::open_memory_database().unwrap();
        let embedder = create_provider();
        let opts = RetainOptions::default();
        let mut opinion = fact("rust is the right tool for this service");
        opinion.fact_type = FactType::Opinion;
        let mut world = fact("rust is the right tool for this service");
        world.fact_type = FactType::World;

        retain(&mut conn, embedder.as_ref(), "default", &[opinion], &opts, 0.92, 45 * 60 * 1000)
            .unwrap();
        let second = retain(
            &mut conn,
            embedder.as_ref(),
            "default",
            &[world],
            &opts,
            0.92,
            45 * 60 * 1000,
        )
        .unwrap();
        assert!(!second[0].deduplicated);

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM memory_units", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn mentions_and_tags_are_linked() {
        let mut conn = db::open_memory_database().unwrap();
        let embedder = create_provider();
        let mut input = fact("migrated the search index to sqlite-vec");
        input.entities.push(MentionInput {
            name: "sqlite-vec".into(),
            entity_type: "tool".into(),
        });
        let opts = RetainOptions {
            tags: vec!["infra".into()],
            ..Default::default()
        };

        let results = retain(
            &mut conn,
            embedder.as_ref(),
            "default",
            &[input],
            &opts,
            0.92,
            45 * 60 * 1000,
        )
        .unwrap();

        let linked: u32 = conn
            .query_row(
                "SELECT COUNT(*) FROM memory_entities WHERE memory_id = ?1",
                params![results[0].id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(linked, 2);

        let tag_type: String = conn
            .query_row(
                "SELECT entity_type FROM entities WHERE name = 'infra'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tag_type, "tag");
    }

    #[test]
    fn consolidate_merges_duplicates_into_oldest() {
        let mut conn = db::open_memory_database().unwrap();
        let embedder = create_provider();
        let opts = RetainOptions::default();

        let first = retain(
            &mut conn,
            embedder.as_ref(),
            "default",
            &[fact("cache invalidation follows the write path")],
            &opts,
            0.92,
            45 * 60 * 1000,
        )
        .unwrap();

        // Plant a duplicate behind the dedup gate's back.
        let embedding = embedder
            .embed("cache invalidation follows the write path")
            .unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO memory_units (id, bank_id, content, fact_type, confidence, created_at, updated_at) \
             VALUES ('dup-1', 'default', 'cache invalidation follows the write path', 'world', 0.9, ?1, ?1)",
            params![now],
        )
        .unwrap();
        let rowid = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO memory_fts (rowid, content, id, bank_id) \
             VALUES (?1, 'cache invalidation follows the write path', 'dup-1', 'default')",
            params![rowid],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO memory_vec (id, embedding) VALUES ('dup-1', ?1)",
            params![embedding_to_bytes(&embedding)],
        )
        .unwrap();

        let merged = consolidate_bank(&mut conn, "default", 0.92).unwrap();
        assert_eq!(merged, 1);

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM memory_units", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let (proof, sources): (u32, Option<String>) = conn
            .query_row(
                "SELECT proof_count, source_memory_ids FROM memory_units WHERE id = ?1",
                params![first[0].id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(proof, 2);
        let sources: Vec<String> = serde_json::from_str(&sources.unwrap()).unwrap();
        assert_eq!(sources.len(), 1);
    }
}
