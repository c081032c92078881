//! The recall engine: four retrieval methods fused with Reciprocal Rank
//! Fusion, post-filters, a token budget, and the access write-through.

use crate::embedding::EmbeddingProvider;
use crate::error::{HindsightError, Result};
use crate::memory::embedding_to_bytes;
use crate::memory::types::{FactType, MemoryUnit};
use crate::memory::working::WorkingMemory;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Instant;

/// How many candidates each method contributes before fusion.
const CANDIDATE_POOL: usize = 50;

/// Encoding-strength bump applied to every returned memory.
const ACCESS_STRENGTH_BUMP: f64 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecallMethod {
    Semantic,
    Fulltext,
    Graph,
    Temporal,
}

impl RecallMethod {
    pub const ALL: [RecallMethod; 4] = [
        RecallMethod::Semantic,
        RecallMethod::Fulltext,
        RecallMethod::Graph,
        RecallMethod::Temporal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecallMethod::Semantic => "semantic",
            RecallMethod::Fulltext => "fulltext",
            RecallMethod::Graph => "graph",
            RecallMethod::Temporal => "temporal",
        }
    }
}

impl FromStr for RecallMethod {
    type Err = HindsightError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "semantic" => Ok(RecallMethod::Semantic),
            "fulltext" => Ok(RecallMethod::Fulltext),
            "graph" => Ok(RecallMethod::Graph),
            "temporal" => Ok(RecallMethod::Temporal),
            other => Err(HindsightError::Internal(format!(
                "unknown recall method: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecallMode {
    #[default]
    Hybrid,
    Cognitive,
}

/// Inclusive time window matched against a unit's temporal anchors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecallOptions {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub fact_types: Vec<FactType>,
    #[serde(default)]
    pub min_confidence: Option<f64>,
    /// Restrict results to units linked to any of these entity names.
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    /// Approximate token budget for returned content. The top result is
    /// always included, even if it alone exceeds the budget.
    #[serde(default)]
    pub max_tokens: Option<usize>,
    /// Subset of retrieval methods to run; all four when empty.
    #[serde(default)]
    pub methods: Vec<RecallMethod>,
    #[serde(default)]
    pub mode: RecallMode,
    /// Working-memory session key; only meaningful in cognitive mode.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub enable_trace: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredMemory {
    #[serde(flatten)]
    pub memory: MemoryUnit,
    pub score: f64,
    /// Methods that surfaced this candidate.
    pub sources: Vec<RecallMethod>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecallResponse {
    pub memories: Vec<ScoredMemory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<RecallTrace>,
}

/// Debug trace of a recall run. Not required for correctness.
#[derive(Debug, Clone, Serialize)]
pub struct RecallTrace {
    /// Ranked (id, method score) lists keyed by method name.
    pub per_method: HashMap<String, Vec<(String, f64)>>,
    /// Fused candidate set before filters and budgets, sorted.
    pub fused: Vec<(String, f64)>,
    pub timings: PhaseTimings,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PhaseTimings {
    pub embedding_us: u64,
    pub retrieval_us: u64,
    pub fusion_us: u64,
    pub scoring_us: u64,
}

/// Estimated token cost of a unit's content (~4 chars per token).
fn estimate_tokens(content: &str) -> usize {
    content.len() / 4
}

/// Run a recall query against a bank.
#[allow(clippy::too_many_arguments)]
pub fn recall(
    conn: &Connection,
    embedder: &dyn EmbeddingProvider,
    working: &WorkingMemory,
    bank_id: &str,
    query: &str,
    opts: &RecallOptions,
    cfg: &crate::config::RecallConfig,
) -> Result<RecallResponse> {
    let methods: &[RecallMethod] = if opts.methods.is_empty() {
        &RecallMethod::ALL
    } else {
        &opts.methods
    };

    let t0 = Instant::now();
    let query_embedding = if methods.contains(&RecallMethod::Semantic) {
        Some(embedder.embed(query)?)
    } else {
        None
    };
    let embedding_us = t0.elapsed().as_micros() as u64;

    let t1 = Instant::now();
    let mut per_method: HashMap<String, Vec<(String, f64)>> = HashMap::new();
    for method in methods {
        let ranked = match method {
            RecallMethod::Semantic => match &query_embedding {
                Some(embedding) => semantic_candidates(conn, bank_id, embedding)?,
                None => Vec::new(),
            },
            RecallMethod::Fulltext => fulltext_candidates(conn, bank_id, query)?,
            RecallMethod::Graph => graph_candidates(conn, bank_id, query, &opts.entities)?,
            RecallMethod::Temporal => temporal_candidates(conn, bank_id, opts.time_range.as_ref())?,
        };
        per_method.insert(method.as_str().to_string(), ranked);
    }
    let retrieval_us = t1.elapsed().as_micros() as u64;

    let t2 = Instant::now();
    let mut fused: HashMap<String, (f64, Vec<RecallMethod>)> = HashMap::new();
    for method in methods {
        if let Some(ranked) = per_method.get(method.as_str()) {
            for (rank, (id, _)) in ranked.iter().enumerate() {
                let entry = fused.entry(id.clone()).or_insert((0.0, Vec::new()));
                entry.0 += 1.0 / (cfg.rrf_k as f64 + (rank + 1) as f64);
                entry.1.push(*method);
            }
        }
    }
    let mut fused_sorted: Vec<(String, f64)> = fused
        .iter()
        .map(|(id, (score, _))| (id.clone(), *score))
        .collect();
    fused_sorted.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    let fusion_us = t2.elapsed().as_micros() as u64;

    let t3 = Instant::now();
    let mut candidates: Vec<ScoredMemory> = Vec::new();
    for (id, score) in &fused_sorted {
        let Some(unit) = load_unit(conn, id)? else {
            continue;
        };
        if unit.bank_id != bank_id {
            continue;
        }
        if !passes_filters(conn, &unit, opts)? {
            continue;
        }
        let sources = fused
            .get(id)
            .map(|(_, s)| s.clone())
            .unwrap_or_default();
        candidates.push(ScoredMemory {
            memory: unit,
            score: *score,
            sources,
        });
    }

    if opts.mode == RecallMode::Cognitive {
        for candidate in &mut candidates {
            let mut activation =
                candidate.score + cfg.encoding_weight * candidate.memory.encoding_strength;
            if let Some(session) = &opts.session_id {
                if let Some(recency) = working.recency(session, &candidate.memory.id) {
                    activation += cfg.working_memory_boost * (1.0 - recency);
                }
            }
            candidate.score = activation;
        }
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.memory.id.cmp(&b.memory.id))
        });
    }

    // Token budget, then the final limit cap. The top candidate always
    // lands even when it alone exceeds the budget, so a matching recall is
    // never emptied by the budget; the budget bounds everything after it.
    let max_tokens = opts.max_tokens.unwrap_or(cfg.token_budget);
    let mut budget_used = 0usize;
    let mut results: Vec<ScoredMemory> = Vec::new();
    for candidate in candidates {
        let cost = estimate_tokens(&candidate.memory.content);
        if budget_used + cost > max_tokens && !results.is_empty() {
            break;
        }
        budget_used += cost;
        results.push(candidate);
    }
    let limit = opts.limit.unwrap_or(cfg.default_limit);
    results.truncate(limit);
    let scoring_us = t3.elapsed().as_micros() as u64;

    // Write-through applies only to what is actually returned.
    let returned_ids: Vec<String> = results.iter().map(|m| m.memory.id.clone()).collect();
    record_access(conn, &returned_ids)?;
    if opts.mode == RecallMode::Cognitive {
        if let Some(session) = &opts.session_id {
            working.touch(session, &returned_ids);
        }
    }

    tracing::debug!(
        bank = bank_id,
        candidates = fused_sorted.len(),
        returned = results.len(),
        "recall served"
    );

    let trace = opts.enable_trace.then(|| RecallTrace {
        per_method,
        fused: fused_sorted,
        timings: PhaseTimings {
            embedding_us,
            retrieval_us,
            fusion_us,
            scoring_us,
        },
    });

    Ok(RecallResponse {
        memories: results,
        trace,
    })
}

/// Vector KNN over the vec0 table, scored by L2 distance (closer is better).
fn semantic_candidates(
    conn: &Connection,
    bank_id: &str,
    embedding: &[f32],
) -> Result<Vec<(String, f64)>> {
    let mut stmt = conn.prepare(
        "SELECT id, distance FROM memory_vec WHERE embedding MATCH ?1 \
         ORDER BY distance LIMIT ?2",
    )?;
    let rows = stmt.query_map(
        params![embedding_to_bytes(embedding), CANDIDATE_POOL as i64],
        |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
    )?;
    let mut out = Vec::new();
    for row in rows {
        let (id, distance) = row?;
        let in_bank: Option<u8> = conn
            .query_row(
                "SELECT 1 FROM memory_units WHERE id = ?1 AND bank_id = ?2",
                params![id, bank_id],
                |r| r.get(0),
            )
            .optional()?;
        if in_bank.is_some() {
            out.push((id, distance));
        }
    }
    Ok(out)
}

/// BM25 full-text search; rank is negative-better in FTS5, already sorted.
fn fulltext_candidates(
    conn: &Connection,
    bank_id: &str,
    query: &str,
) -> Result<Vec<(String, f64)>> {
    let escaped = escape_fts_query(query);
    if escaped.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT id, rank FROM memory_fts WHERE memory_fts MATCH ?1 AND bank_id = ?2 \
         ORDER BY rank LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![escaped, bank_id, CANDIDATE_POOL as i64], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Graph expansion: seed on the top fulltext hits plus any explicitly named
/// entities, then walk one hop over typed links and shared entity mentions.
fn graph_candidates(
    conn: &Connection,
    bank_id: &str,
    query: &str,
    entity_names: &[String],
) -> Result<Vec<(String, f64)>> {
    let mut seeds: Vec<String> = fulltext_candidates(conn, bank_id, query)?
        .into_iter()
        .take(10)
        .map(|(id, _)| id)
        .collect();

    for name in entity_names {
        let mut stmt = conn.prepare(
            "SELECT me.memory_id FROM memory_entities me \
             JOIN entities e ON e.id = me.entity_id \
             WHERE e.bank_id = ?1 AND e.name = ?2 COLLATE NOCASE",
        )?;
        let rows = stmt.query_map(params![bank_id, name], |r| r.get::<_, String>(0))?;
        for row in rows {
            let id = row?;
            if !seeds.contains(&id) {
                seeds.push(id);
            }
        }
    }
    if seeds.is_empty() {
        return Ok(Vec::new());
    }

    // Neighbors over typed links, strongest first.
    let mut scored: HashMap<String, f64> = HashMap::new();
    for seed in &seeds {
        let mut stmt = conn.prepare(
            "SELECT CASE WHEN source_id = ?1 THEN target_id ELSE source_id END, weight \
             FROM memory_links WHERE source_id = ?1 OR target_id = ?1",
        )?;
        let rows = stmt.query_map(params![seed], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;
        for row in rows {
            let (neighbor, weight) = row?;
            let entry = scored.entry(neighbor).or_insert(0.0);
            *entry = entry.max(weight);
        }

        // Units that share an entity with the seed.
        let mut stmt = conn.prepare(
            "SELECT other.memory_id, COUNT(*) FROM memory_entities own \
             JOIN memory_entities other ON other.entity_id = own.entity_id \
             WHERE own.memory_id = ?1 AND other.memory_id != ?1 \
             GROUP BY other.memory_id",
        )?;
        let rows = stmt.query_map(params![seed], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (neighbor, shared) = row?;
            let boost = 0.5 + 0.1 * shared as f64;
            let entry = scored.entry(neighbor).or_insert(0.0);
            *entry = entry.max(boost);
        }
    }
    for seed in &seeds {
        scored.remove(seed);
    }

    let mut out: Vec<(String, f64)> = scored.into_iter().collect();
    out.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    out.truncate(CANDIDATE_POOL);
    Ok(out)
}

/// Most recent units, optionally constrained to an anchor time window.
fn temporal_candidates(
    conn: &Connection,
    bank_id: &str,
    range: Option<&TimeRange>,
) -> Result<Vec<(String, f64)>> {
    let (start, end) = match range {
        Some(r) => (
            r.start.clone().unwrap_or_default(),
            r.end.clone().unwrap_or_else(|| "9999".to_string()),
        ),
        None => (String::new(), "9999".to_string()),
    };
    let mut stmt = conn.prepare(
        "SELECT id FROM memory_units WHERE bank_id = ?1 \
         AND COALESCE(mentioned_at, occurred_start, created_at) >= ?2 \
         AND COALESCE(mentioned_at, occurred_end, created_at) <= ?3 \
         ORDER BY COALESCE(mentioned_at, created_at) DESC, id LIMIT ?4",
    )?;
    let rows = stmt.query_map(
        params![bank_id, start, end, CANDIDATE_POOL as i64],
        |r| r.get::<_, String>(0),
    )?;
    let mut out = Vec::new();
    for (rank, row) in rows.enumerate() {
        out.push((row?, 1.0 / (rank + 1) as f64));
    }
    Ok(out)
}

/// Escape a user query for FTS5 MATCH syntax by quoting each token.
fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" ")
}

fn load_unit(conn: &Connection, id: &str) -> Result<Option<MemoryUnit>> {
    conn.query_row(
        "SELECT id, bank_id, content, fact_type, confidence, occurred_start, occurred_end, \
         mentioned_at, access_count, last_accessed, encoding_strength, proof_count, \
         source_memory_ids, history, created_at, updated_at \
         FROM memory_units WHERE id = ?1",
        params![id],
        |row| {
            let fact_type: String = row.get(3)?;
            let source_ids: Option<String> = row.get(12)?;
            let history: Option<String> = row.get(13)?;
            Ok(MemoryUnit {
                id: row.get(0)?,
                bank_id: row.get(1)?,
                content: row.get(2)?,
                fact_type: FactType::from_str(&fact_type).unwrap_or_default(),
                confidence: row.get(4)?,
                occurred_start: row.get(5)?,
                occurred_end: row.get(6)?,
                mentioned_at: row.get(7)?,
                access_count: row.get(8)?,
                last_accessed: row.get(9)?,
                encoding_strength: row.get(10)?,
                proof_count: row.get(11)?,
                source_memory_ids: source_ids
                    .and_then(|json| serde_json::from_str(&json).ok())
                    .unwrap_or_default(),
                history: history
                    .and_then(|json| serde_json::from_str(&json).ok())
                    .unwrap_or_default(),
                created_at: row.get(14)?,
                updated_at: row.get(15)?,
            })
        },
    )
    .optional()
    .map_err(HindsightError::from)
}

fn passes_filters(conn: &Connection, unit: &MemoryUnit, opts: &RecallOptions) -> Result<bool> {
    if !opts.fact_types.is_empty() && !opts.fact_types.contains(&unit.fact_type) {
        return Ok(false);
    }
    if let Some(min) = opts.min_confidence {
        if unit.confidence < min {
            return Ok(false);
        }
    }
    if let Some(range) = &opts.time_range {
        let anchor = unit
            .mentioned_at
            .as_deref()
            .or(unit.occurred_start.as_deref())
            .unwrap_or(&unit.created_at);
        if let Some(anchor) = parse_time(anchor) {
            if let Some(start) = range.start.as_deref().and_then(parse_time) {
                if anchor < start {
                    return Ok(false);
                }
            }
            if let Some(end) = range.end.as_deref().and_then(parse_time) {
                if anchor > end {
                    return Ok(false);
                }
            }
        }
    }
    if !opts.entities.is_empty() {
        let mut matched = false;
        for name in &opts.entities {
            let hit: Option<u8> = conn
                .query_row(
                    "SELECT 1 FROM memory_entities me \
                     JOIN entities e ON e.id = me.entity_id \
                     WHERE me.memory_id = ?1 AND e.name = ?2 COLLATE NOCASE",
                    params![unit.id, name],
                    |r| r.get(0),
                )
                .optional()?;
            if hit.is_some() {
                matched = true;
                break;
            }
        }
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Persist the access bump for every returned unit.
fn record_access(conn: &Connection, ids: &[String]) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    for id in ids {
        conn.execute(
            "UPDATE memory_units SET access_count = access_count + 1, last_accessed = ?2, \
             encoding_strength = MIN(encoding_strength + ?3, 3.0) WHERE id = ?1",
            params![id, now, ACCESS_STRENGTH_BUMP],
        )?;
    }
    Ok(())
}
