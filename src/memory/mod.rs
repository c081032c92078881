//! The memory engine: retain, recall, linking, and statistics over the
//! relational memory schema (`banks`, `memory_units`, `memory_fts`,
//! `memory_vec`, entities, episodes, and typed links).

use crate::config::RecallConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{HindsightError, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

pub mod entities;
pub mod episodes;
pub mod recall;
pub mod retain;
pub mod stats;
pub mod types;
pub mod working;

use recall::{RecallOptions, RecallResponse};
use retain::{FactInput, RetainOptions, RetainedFact};
use types::LinkType;
use working::WorkingMemory;

/// Reinterpret an f32 slice as bytes for sqlite-vec binding.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Convert a cosine-similarity threshold to the equivalent L2 distance for
/// unit vectors: `d = sqrt(2 * (1 - cos))`.
pub fn cosine_threshold_to_l2(cosine_threshold: f64) -> f64 {
    (2.0 * (1.0 - cosine_threshold)).max(0.0).sqrt()
}

/// Facade over the memory subsystem. Shares the SQLite connection with the
/// stream engine; per-session working memory lives here.
pub struct MemoryEngine {
    conn: Arc<Mutex<Connection>>,
    embedder: Box<dyn EmbeddingProvider>,
    working: WorkingMemory,
    recall_config: RecallConfig,
    episode_gap_ms: i64,
    db_path: Option<PathBuf>,
}

impl MemoryEngine {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        embedder: Box<dyn EmbeddingProvider>,
        recall_config: RecallConfig,
        episode_gap_ms: i64,
        db_path: Option<PathBuf>,
    ) -> Self {
        let working = WorkingMemory::new(recall_config.working_memory_capacity);
        Self {
            conn,
            embedder,
            working,
            recall_config,
            episode_gap_ms,
            db_path,
        }
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| HindsightError::Internal(format!("db lock poisoned: {e}")))
    }

    /// Retain a batch of facts into a bank.
    pub fn retain(
        &self,
        bank_id: &str,
        facts: &[FactInput],
        opts: &RetainOptions,
    ) -> Result<Vec<RetainedFact>> {
        let mut conn = self.lock_conn()?;
        retain::retain(
            &mut conn,
            self.embedder.as_ref(),
            bank_id,
            facts,
            opts,
            self.recall_config.dedup_threshold,
            self.episode_gap_ms,
        )
    }

    /// Run a recall query against a bank.
    pub fn recall(
        &self,
        bank_id: &str,
        query: &str,
        opts: &RecallOptions,
    ) -> Result<RecallResponse> {
        let conn = self.lock_conn()?;
        recall::recall(
            &conn,
            self.embedder.as_ref(),
            &self.working,
            bank_id,
            query,
            opts,
            &self.recall_config,
        )
    }

    /// Create (or reweight) a typed link between two memory units.
    pub fn link(
        &self,
        source_id: &str,
        target_id: &str,
        link_type: LinkType,
        weight: f64,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO memory_links (source_id, target_id, link_type, weight, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT (source_id, target_id, link_type) DO UPDATE SET weight = excluded.weight",
            params![
                source_id,
                target_id,
                link_type.as_str(),
                weight,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Store-wide statistics, optionally scoped to one bank.
    pub fn stats(&self, bank: Option<&str>) -> Result<stats::StatsResponse> {
        let conn = self.lock_conn()?;
        stats::stats(&conn, bank, self.db_path.as_deref())
    }
}
