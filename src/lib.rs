//! Durable append-only event streams with a multi-strategy memory recall
//! engine, backed by a single SQLite database.
//!
//! Hindsight has two halves sharing one index store:
//!
//! - **Streams**: append-only JSONL logs with positioned file IO, opaque
//!   lexicographic offset tokens, producer idempotency (epoch/sequence
//!   fencing), soft-delete with generation bumping, and three read modes
//!   (catch-up, long-poll, SSE push).
//! - **Memory**: banks of typed memory units retrieved by four parallel
//!   methods (semantic vector KNN, FTS5 full-text, entity-graph expansion,
//!   temporal) fused with Reciprocal Rank Fusion, with an ACT-R style
//!   cognitive mode and per-session working memory.
//!
//! # Architecture
//!
//! - **Storage**: one SQLite database (WAL) holding stream pointer rows and
//!   the memory schema; payload bytes live in per-stream log files
//! - **Search**: FTS5 BM25 plus [sqlite-vec](https://github.com/asg017/sqlite-vec)
//!   vector KNN, merged via Reciprocal Rank Fusion
//! - **Embeddings**: deterministic char-trigram feature hashing (384 dims)
//! - **Transport**: HTTP/SSE via axum
//!
//! # Modules
//!
//! - [`config`] — TOML configuration with environment overrides
//! - [`db`] — SQLite initialization, schema, and migrations
//! - [`log`] — positioned-IO log files and the JSONL engine
//! - [`stream`] — the durable stream protocol state machine
//! - [`memory`] — retain, recall, entities, episodes, working memory
//! - [`protocol`] — the HTTP surface

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod log;
pub mod memory;
pub mod protocol;
pub mod stream;

pub use error::{HindsightError, Result};
