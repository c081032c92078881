//! HTTP protocol surface: the stream endpoints under `/v1/stream/{path}`
//! and the memory endpoints under `/v1/banks/{bank}`.
//!
//! Stream reads support three live modes selected by the `live` query
//! parameter: catch-up (default), `long-poll` (bounded block, 204 on
//! timeout), and `sse` (push with periodic control events).

use crate::config::HindsightConfig;
use crate::error::{HindsightError, Result};
use crate::memory::recall::{RecallOptions, RecallResponse};
use crate::memory::retain::{FactInput, RetainOptions, RetainedFact};
use crate::memory::types::LinkType;
use crate::memory::MemoryEngine;
use crate::stream::producers::ProducerInfo;
use crate::stream::{DurableStore, ReadResponse, StartOffset};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderMap, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

const PRODUCER_ID: &str = "producer-id";
const PRODUCER_EPOCH: &str = "producer-epoch";
const PRODUCER_SEQ: &str = "producer-seq";
const STREAM_CLOSED: &str = "stream-closed";
const STREAM_TTL: &str = "stream-ttl-seconds";
const NEXT_OFFSET: &str = "stream-next-offset";
const UP_TO_DATE: &str = "stream-up-to-date";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<DurableStore>,
    pub memory: Arc<MemoryEngine>,
    pub config: Arc<HindsightConfig>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/v1/stream/{*path}",
            put(create_stream)
                .get(read_stream)
                .post(append_stream)
                .delete(delete_stream),
        )
        .route("/v1/banks/{bank}/retain", post(retain_bank))
        .route("/v1/banks/{bank}/recall", post(recall_bank))
        .route("/v1/banks/{bank}/stats", get(bank_stats))
        .route("/v1/links", post(create_link))
        .route("/v1/stats", get(global_stats))
        .with_state(state)
}

/// Serve the API until ctrl-c, sweeping expired streams and producers in
/// the background.
pub async fn serve(config: HindsightConfig) -> anyhow::Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let state = build_state(config)?;

    let sweeper = state.store.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            match sweeper.sweep_expired() {
                Ok((streams, producers)) if streams + producers > 0 => {
                    tracing::info!(streams, producers, "expiry sweep");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "expiry sweep failed"),
            }
        }
    });

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "hindsight listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}

/// Open the database and wire up the store and memory engine.
pub fn build_state(config: HindsightConfig) -> anyhow::Result<AppState> {
    use crate::log::engine::JsonlEngine;

    let db_path = config.resolved_db_path();
    let data_dir = config.resolved_data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let conn = crate::db::open_database(&db_path)?;
    tracing::info!(db = %db_path.display(), data = %data_dir.display(), "storage ready");

    let conn = Arc::new(std::sync::Mutex::new(conn));
    let engine = Arc::new(JsonlEngine::new(conn.clone(), &data_dir));
    let store = Arc::new(DurableStore::new(
        conn.clone(),
        engine,
        config.streams.clone(),
    ));

    let memory = Arc::new(MemoryEngine::new(
        conn,
        crate::embedding::create_provider(),
        config.recall.clone(),
        (config.episodes.time_gap_mins * 60 * 1000) as i64,
        Some(db_path),
    ));

    Ok(AppState {
        store,
        memory,
        config: Arc::new(config),
    })
}

#[derive(Debug, Deserialize)]
struct ReadQuery {
    offset: Option<String>,
    live: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct AppendResponse {
    next_offset: String,
    records: usize,
    duplicate: bool,
}

async fn create_stream(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let path = normalize(&path);
    let content_type = header_str(&headers, CONTENT_TYPE.as_str());
    let ttl_seconds = match header_str(&headers, STREAM_TTL) {
        Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
            HindsightError::Corruption(format!("invalid {STREAM_TTL} header: {raw}"))
        })?),
        None => None,
    };

    let outcome = state
        .store
        .create(&path, content_type.as_deref(), ttl_seconds)?;
    let meta = state.store.exists(&path)?;
    let (status, label) = match outcome {
        crate::log::engine::CreateOutcome::Created => (StatusCode::CREATED, "created"),
        crate::log::engine::CreateOutcome::Exists => (StatusCode::OK, "exists"),
    };
    Ok((
        status,
        Json(json!({ "status": label, "next_offset": meta.next_offset() })),
    )
        .into_response())
}

async fn append_stream(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let path = normalize(&path);
    let producer = parse_producer(&headers)?;
    let close = header_str(&headers, STREAM_CLOSED)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let outcome = state
        .store
        .append(&path, &body, producer.as_ref(), close)?;
    let response = match outcome {
        crate::stream::AppendOutcome::Accepted {
            next_offset,
            records,
        } => AppendResponse {
            next_offset,
            records,
            duplicate: false,
        },
        crate::stream::AppendOutcome::Duplicate { next_offset } => AppendResponse {
            next_offset,
            records: 0,
            duplicate: true,
        },
    };
    Ok(Json(response).into_response())
}

async fn read_stream(
    State(state): State<AppState>,
    Path(path): Path<String>,
    method: Method,
    Query(query): Query<ReadQuery>,
) -> Result<Response> {
    let path = normalize(&path);

    // HEAD returns metadata without touching records.
    if method == Method::HEAD {
        let meta = state.store.exists(&path)?;
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, NEXT_OFFSET, &meta.next_offset());
        insert_header(&mut headers, STREAM_CLOSED, &meta.closed.to_string());
        return Ok((StatusCode::OK, headers).into_response());
    }

    let start = StartOffset::parse(query.offset.as_deref())?;
    match query.live.as_deref() {
        Some("sse") => serve_sse(state, path, start).await,
        Some("long-poll") => {
            let response = state.store.long_poll(&path, start, query.limit).await?;
            if response.timed_out {
                let mut headers = HeaderMap::new();
                insert_header(&mut headers, NEXT_OFFSET, &response.next_offset);
                insert_header(&mut headers, UP_TO_DATE, "true");
                return Ok((StatusCode::NO_CONTENT, headers).into_response());
            }
            Ok(read_response_json(&response).into_response())
        }
        Some(other) => Err(HindsightError::Corruption(format!(
            "unknown live mode: {other}"
        ))),
        None => {
            let response = state.store.read(&path, start, query.limit)?;
            Ok(read_response_json(&response).into_response())
        }
    }
}

async fn delete_stream(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<StatusCode> {
    state.store.delete(&normalize(&path))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Push mode: replay from the requested offset, then forward appends as they
/// land, interleaved with periodic control events carrying the cursor.
async fn serve_sse(state: AppState, path: String, start: StartOffset) -> Result<Response> {
    let (initial, mut rx) = state.store.subscribe(&path, start, None)?;
    let control_interval = Duration::from_secs(state.config.streams.control_interval_secs);
    let (tx, events_rx) = tokio::sync::mpsc::channel::<Event>(64);

    tokio::spawn(async move {
        let mut cursor = initial.next_offset.clone();
        let closed = initial.closed;
        for record in &initial.records {
            if tx.send(record_event(record)).await.is_err() {
                return;
            }
        }
        let _ = tx.send(control_event(&initial.next_offset, initial.up_to_date, closed)).await;
        if closed {
            return;
        }

        let mut tick = tokio::time::interval(control_interval);
        tick.tick().await;
        loop {
            tokio::select! {
                event = rx.recv() => {
                    use crate::stream::subscribers::StreamEvent;
                    use tokio::sync::broadcast::error::RecvError;
                    match event {
                        Ok(StreamEvent::Appended { .. }) | Err(RecvError::Lagged(_)) => {
                            let from = match StartOffset::parse(Some(&cursor)) {
                                Ok(start) => start,
                                Err(_) => return,
                            };
                            let Ok(batch) = state.store.read(&path, from, None) else {
                                return;
                            };
                            for record in &batch.records {
                                if tx.send(record_event(record)).await.is_err() {
                                    return;
                                }
                            }
                            cursor = batch.next_offset;
                            if batch.closed {
                                let _ = tx.send(control_event(&cursor, true, true)).await;
                                return;
                            }
                        }
                        Ok(StreamEvent::Closed { next_offset }) => {
                            let _ = tx.send(control_event(&next_offset, true, true)).await;
                            return;
                        }
                        Ok(StreamEvent::Deleted) | Err(RecvError::Closed) => {
                            let _ = tx
                                .send(Event::default().event("deleted").data("{}"))
                                .await;
                            return;
                        }
                    }
                }
                _ = tick.tick() => {
                    // Control events report current stream state, not the
                    // state captured at subscribe time.
                    let Ok(meta) = state.store.exists(&path) else {
                        let _ = tx.send(Event::default().event("deleted").data("{}")).await;
                        return;
                    };
                    if tx.send(control_event(&cursor, true, meta.closed)).await.is_err() {
                        return;
                    }
                    if meta.closed {
                        return;
                    }
                }
            }
        }
    });

    let stream = futures::stream::unfold(events_rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok::<_, Infallible>(event), rx))
    });
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

fn record_event(record: &crate::stream::RecordOut) -> Event {
    let data = json!({
        "offset": record.offset,
        "timestamp": record.timestamp,
        "data": decode_payload(&record.bytes),
    });
    Event::default().event("record").data(data.to_string())
}

fn control_event(next_offset: &str, up_to_date: bool, closed: bool) -> Event {
    let data = json!({
        "next_offset": next_offset,
        "up_to_date": up_to_date,
        "closed": closed,
    });
    Event::default().event("control").data(data.to_string())
}

fn read_response_json(response: &ReadResponse) -> Json<serde_json::Value> {
    let records: Vec<serde_json::Value> = response
        .records
        .iter()
        .map(|r| {
            json!({
                "offset": r.offset,
                "timestamp": r.timestamp,
                "data": decode_payload(&r.bytes),
            })
        })
        .collect();
    Json(json!({
        "records": records,
        "next_offset": response.next_offset,
        "up_to_date": response.up_to_date,
        "closed": response.closed,
    }))
}

/// Stored payloads are JSON lines; anything unparseable degrades to a string.
fn decode_payload(bytes: &[u8]) -> serde_json::Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// All three producer headers, or none. A partial triple is malformed.
fn parse_producer(headers: &HeaderMap) -> Result<Option<ProducerInfo>> {
    let id = header_str(headers, PRODUCER_ID);
    let epoch = header_str(headers, PRODUCER_EPOCH);
    let seq = header_str(headers, PRODUCER_SEQ);
    match (id, epoch, seq) {
        (None, None, None) => Ok(None),
        (Some(id), Some(epoch), Some(seq)) => {
            let epoch = epoch.parse::<u64>().map_err(|_| {
                HindsightError::Corruption(format!("invalid {PRODUCER_EPOCH}: {epoch}"))
            })?;
            let seq = seq.parse::<u64>().map_err(|_| {
                HindsightError::Corruption(format!("invalid {PRODUCER_SEQ}: {seq}"))
            })?;
            Ok(Some(ProducerInfo {
                producer_id: id,
                epoch,
                seq,
            }))
        }
        _ => Err(HindsightError::Corruption(
            "producer headers must be supplied together".to_string(),
        )),
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = value.parse() {
        headers.insert(name, value);
    }
}

/// Wildcard captures lack the leading slash; stream paths always carry one.
fn normalize(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

#[derive(Debug, Deserialize)]
struct RetainRequest {
    facts: Vec<FactInput>,
    #[serde(flatten)]
    options: RetainOptions,
}

#[derive(Debug, Deserialize)]
struct RecallRequest {
    query: String,
    #[serde(flatten)]
    options: RecallOptions,
}

#[derive(Debug, Deserialize)]
struct LinkRequest {
    source_id: String,
    target_id: String,
    link_type: LinkType,
    #[serde(default = "default_weight")]
    weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

async fn retain_bank(
    State(state): State<AppState>,
    Path(bank): Path<String>,
    Json(request): Json<RetainRequest>,
) -> Result<Json<Vec<RetainedFact>>> {
    let memory = state.memory.clone();
    let results = tokio::task::spawn_blocking(move || {
        memory.retain(&bank, &request.facts, &request.options)
    })
    .await
    .map_err(|e| HindsightError::Internal(format!("retain task: {e}")))??;
    Ok(Json(results))
}

async fn recall_bank(
    State(state): State<AppState>,
    Path(bank): Path<String>,
    Json(request): Json<RecallRequest>,
) -> Result<Json<RecallResponse>> {
    let memory = state.memory.clone();
    let response = tokio::task::spawn_blocking(move || {
        memory.recall(&bank, &request.query, &request.options)
    })
    .await
    .map_err(|e| HindsightError::Internal(format!("recall task: {e}")))??;
    Ok(Json(response))
}

async fn create_link(
    State(state): State<AppState>,
    Json(request): Json<LinkRequest>,
) -> Result<StatusCode> {
    state.memory.link(
        &request.source_id,
        &request.target_id,
        request.link_type,
        request.weight,
    )?;
    Ok(StatusCode::CREATED)
}

async fn bank_stats(
    State(state): State<AppState>,
    Path(bank): Path<String>,
) -> Result<Json<crate::memory::stats::StatsResponse>> {
    Ok(Json(state.memory.stats(Some(&bank))?))
}

async fn global_stats(
    State(state): State<AppState>,
) -> Result<Json<crate::memory::stats::StatsResponse>> {
    Ok(Json(state.memory.stats(None)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HindsightConfig::default();
        config.storage.db_path = dir
            .path()
            .join("index.db")
            .to_string_lossy()
            .into_owned();
        config.storage.data_dir = dir.path().join("streams").to_string_lossy().into_owned();
        let state = build_state(config).unwrap();
        (state, dir)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn create_append_read_over_http() {
        let (state, _dir) = test_state();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/v1/stream/events/chat")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/stream/events/chat")
                    .body(Body::from(r#"{"kind":"greeting"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let appended = body_json(response).await;
        assert_eq!(appended["records"], 1);
        assert_eq!(appended["duplicate"], false);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/stream/events/chat?offset=beginning")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let read = body_json(response).await;
        assert_eq!(read["records"].as_array().unwrap().len(), 1);
        assert_eq!(read["records"][0]["data"]["kind"], "greeting");
        assert_eq!(read["up_to_date"], true);
    }

    #[tokio::test]
    async fn producer_duplicate_reports_via_http() {
        let (state, _dir) = test_state();
        let app = router(state);

        let put = Request::builder()
            .method("PUT")
            .uri("/v1/stream/orders")
            .body(Body::empty())
            .unwrap();
        app.clone().oneshot(put).await.unwrap();

        let append = |seq: u64| {
            Request::builder()
                .method("POST")
                .uri("/v1/stream/orders")
                .header("producer-id", "p1")
                .header("producer-epoch", "1")
                .header("producer-seq", seq.to_string())
                .body(Body::from(r#"{"n":1}"#))
                .unwrap()
        };

        let first = app.clone().oneshot(append(0)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let replay = app.clone().oneshot(append(0)).await.unwrap();
        let replay = body_json(replay).await;
        assert_eq!(replay["duplicate"], true);

        // Skipping a sequence number is a conflict.
        let gapped = app.oneshot(append(5)).await.unwrap();
        assert_eq!(gapped.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn missing_stream_is_404() {
        let (state, _dir) = test_state();
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/stream/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn retain_and_recall_over_http() {
        let (state, _dir) = test_state();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/banks/default/retain")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"facts":[{"content":"the api gateway terminates tls"}]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let retained = body_json(response).await;
        assert_eq!(retained.as_array().unwrap().len(), 1);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/banks/default/recall")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"query":"api gateway tls"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let recalled = body_json(response).await;
        assert_eq!(recalled["memories"].as_array().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sse_control_events_track_current_stream_state() {
        use futures::StreamExt;

        let dir = tempfile::tempdir().unwrap();
        let mut config = HindsightConfig::default();
        config.storage.db_path = dir
            .path()
            .join("index.db")
            .to_string_lossy()
            .into_owned();
        config.storage.data_dir = dir.path().join("streams").to_string_lossy().into_owned();
        config.streams.control_interval_secs = 1;
        let state = build_state(config).unwrap();
        let app = router(state.clone());

        state.store.create("/live", None, None).unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/stream/live?live=sse")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let mut frames = response.into_body().into_data_stream();

        // Close through the engine without a broadcast event; the periodic
        // control event must still pick the new state up.
        state.store.engine().close_stream("/live", None).unwrap();

        let mut saw_closed = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_secs(3), frames.next()).await {
                Ok(Some(Ok(bytes))) => {
                    if String::from_utf8_lossy(&bytes).contains("\"closed\":true") {
                        saw_closed = true;
                        break;
                    }
                }
                _ => break,
            }
        }
        assert!(saw_closed, "control events kept reporting the stream open");
    }

    #[tokio::test]
    async fn stats_endpoint_counts_streams() {
        let (state, _dir) = test_state();
        let app = router(state);

        app.clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/v1/stream/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let stats = body_json(response).await;
        assert_eq!(stats["streams_active"], 1);
    }
}
