#![allow(dead_code)]

use hindsight::config::{RecallConfig, StreamConfig};
use hindsight::db;
use hindsight::embedding::create_provider;
use hindsight::log::engine::JsonlEngine;
use hindsight::memory::MemoryEngine;
use hindsight::stream::DurableStore;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// A store over an in-memory index and a temp directory of log files.
pub fn test_store() -> (Arc<DurableStore>, TempDir) {
    test_store_with(StreamConfig::default())
}

pub fn test_store_with(config: StreamConfig) -> (Arc<DurableStore>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let conn = Arc::new(Mutex::new(db::open_memory_database().unwrap()));
    let engine = Arc::new(JsonlEngine::new(conn.clone(), dir.path()));
    let store = Arc::new(DurableStore::new(conn, engine, config));
    (store, dir)
}

/// A memory engine over a fresh in-memory database.
pub fn test_memory() -> MemoryEngine {
    let conn = Arc::new(Mutex::new(db::open_memory_database().unwrap()));
    MemoryEngine::new(
        conn,
        create_provider(),
        RecallConfig::default(),
        45 * 60 * 1000,
        None,
    )
}
