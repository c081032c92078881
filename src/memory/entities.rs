//! Entity resolution and mention linking.
//!
//! Incoming mentions are matched against existing entities in the bank by a
//! combined score: character-bigram Dice similarity, a recency boost for
//! entities touched within the last week, and a boost for candidates that
//! historically co-occur with other entities mentioned in the same context.

use crate::error::Result;
use crate::memory::types::Entity;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;

const SIMILARITY_WEIGHT: f64 = 0.5;
const RECENCY_BOOST: f64 = 0.2;
const RECENCY_WINDOW_DAYS: f64 = 7.0;
const COOCCURRENCE_BOOST_PER_LINK: f64 = 0.05;
const COOCCURRENCE_BOOST_CAP: f64 = 0.15;
const ACCEPT_THRESHOLD: f64 = 0.6;

/// An entity mention extracted from retained content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    pub name: String,
    pub entity_type: String,
}

/// Dice coefficient over character bigrams of the lowercased names.
///
/// Names shorter than two characters fall back to exact equality.
pub fn dice_similarity(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    if a == b {
        return 1.0;
    }
    let bigrams = |s: &str| -> Vec<(char, char)> {
        let chars: Vec<char> = s.chars().collect();
        chars.windows(2).map(|w| (w[0], w[1])).collect()
    };
    let mut left = bigrams(&a);
    let right = bigrams(&b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let total = left.len() + right.len();
    let mut shared = 0usize;
    for bg in &right {
        if let Some(pos) = left.iter().position(|x| x == bg) {
            left.swap_remove(pos);
            shared += 1;
        }
    }
    (2.0 * shared as f64) / total as f64
}

/// Score a single candidate against an incoming mention.
///
/// An exact case-insensitive name match contributes its full similarity of
/// 1.0 so it clears the acceptance threshold on its own; partial matches
/// are down-weighted and need recency or co-occurrence support.
pub fn score_candidate(
    name: &str,
    candidate: &Entity,
    cooccurrence_with_nearby: u32,
    now: DateTime<Utc>,
) -> f64 {
    let sim = dice_similarity(name, &candidate.name);
    let mut score = if sim >= 1.0 { 1.0 } else { sim * SIMILARITY_WEIGHT };

    if let Ok(updated) = DateTime::parse_from_rfc3339(&candidate.updated_at) {
        let age_days = (now - updated.with_timezone(&Utc)).num_seconds() as f64 / 86_400.0;
        if age_days >= 0.0 && age_days < RECENCY_WINDOW_DAYS {
            score += RECENCY_BOOST * (1.0 - age_days / RECENCY_WINDOW_DAYS);
        }
    }

    let cooc = (cooccurrence_with_nearby as f64 * COOCCURRENCE_BOOST_PER_LINK)
        .min(COOCCURRENCE_BOOST_CAP);
    score + cooc
}

/// Pick the best candidate clearing the acceptance threshold, if any.
///
/// `cooccurrence` maps candidate entity id to its historical co-occurrence
/// count with entities mentioned nearby in the current context. Ties break
/// by entity id for determinism.
pub fn resolve_entity(
    name: &str,
    entity_type: &str,
    candidates: &[Entity],
    cooccurrence: &HashMap<String, u32>,
    now: DateTime<Utc>,
) -> Option<String> {
    let mut best: Option<(f64, &Entity)> = None;
    for candidate in candidates {
        if candidate.entity_type != entity_type {
            continue;
        }
        let cooc = cooccurrence.get(&candidate.id).copied().unwrap_or(0);
        let score = score_candidate(name, candidate, cooc, now);
        if score <= ACCEPT_THRESHOLD {
            continue;
        }
        let better = match &best {
            None => true,
            Some((s, e)) => score > *s || (score == *s && candidate.id < e.id),
        };
        if better {
            best = Some((score, candidate));
        }
    }
    best.map(|(_, e)| e.id.clone())
}

/// Resolve each mention against the bank, creating entities as needed, and
/// link them all to the memory unit. Co-occurrence counts are bumped for
/// every pair of entities linked here.
///
/// Returns the resolved entity ids in mention order.
pub fn link_mentions(
    conn: &Connection,
    bank_id: &str,
    memory_id: &str,
    mentions: &[Mention],
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let candidates = bank_entities(conn, bank_id)?;
    let now_str = now.to_rfc3339();

    // Entities resolved earlier in this batch count as "nearby context" for
    // later mentions.
    let mut resolved: Vec<String> = Vec::with_capacity(mentions.len());
    for mention in mentions {
        let cooc = cooccurrence_counts(conn, bank_id, &resolved)?;
        let entity_id = match resolve_entity(&mention.name, &mention.entity_type, &candidates, &cooc, now)
        {
            Some(id) => {
                conn.execute(
                    "UPDATE entities SET updated_at = ?2 WHERE id = ?1",
                    params![id, now_str],
                )?;
                id
            }
            None => {
                let id = uuid::Uuid::now_v7().to_string();
                conn.execute(
                    "INSERT INTO entities (id, bank_id, name, entity_type, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![id, bank_id, mention.name, mention.entity_type, now_str],
                )?;
                id
            }
        };
        if !resolved.contains(&entity_id) {
            resolved.push(entity_id);
        }
    }

    for entity_id in &resolved {
        conn.execute(
            "INSERT OR IGNORE INTO memory_entities (memory_id, entity_id) VALUES (?1, ?2)",
            params![memory_id, entity_id],
        )?;
    }

    for i in 0..resolved.len() {
        for j in (i + 1)..resolved.len() {
            let (a, b) = canonical_pair(&resolved[i], &resolved[j]);
            conn.execute(
                "INSERT INTO entity_cooccurrence (bank_id, entity_a, entity_b, count) \
                 VALUES (?1, ?2, ?3, 1) \
                 ON CONFLICT (bank_id, entity_a, entity_b) DO UPDATE SET count = count + 1",
                params![bank_id, a, b],
            )?;
        }
    }

    Ok(resolved)
}

fn canonical_pair<'a>(x: &'a str, y: &'a str) -> (&'a str, &'a str) {
    if x <= y {
        (x, y)
    } else {
        (y, x)
    }
}

fn bank_entities(conn: &Connection, bank_id: &str) -> Result<Vec<Entity>> {
    let mut stmt = conn.prepare(
        "SELECT id, bank_id, name, entity_type, created_at, updated_at \
         FROM entities WHERE bank_id = ?1",
    )?;
    let rows = stmt.query_map(params![bank_id], |row| {
        Ok(Entity {
            id: row.get(0)?,
            bank_id: row.get(1)?,
            name: row.get(2)?,
            entity_type: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Total co-occurrence count of every bank entity with the given nearby set.
fn cooccurrence_counts(
    conn: &Connection,
    bank_id: &str,
    nearby: &[String],
) -> Result<HashMap<String, u32>> {
    let mut counts: HashMap<String, u32> = HashMap::new();
    if nearby.is_empty() {
        return Ok(counts);
    }
    let mut stmt = conn.prepare(
        "SELECT entity_a, entity_b, count FROM entity_cooccurrence \
         WHERE bank_id = ?1 AND (entity_a = ?2 OR entity_b = ?2)",
    )?;
    for near in nearby {
        let rows = stmt.query_map(params![bank_id, near], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
            ))
        })?;
        for row in rows {
            let (a, b, count) = row?;
            let other = if &a == near { b } else { a };
            *counts.entry(other).or_insert(0) += count;
        }
    }
    Ok(counts)
}
