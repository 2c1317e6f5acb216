//! HTTP API handlers for the AtomVault boundary. Routes are thin: parse, call one `Engine` method,
//! serialize the result.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Json, Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};

use atomvault_core::engine::{Engine, IngestRequest, IngestStatus};
use atomvault_core::error::EngineError;
use atomvault_core::model::Provenance;

#[derive(Clone)]
pub struct AppContext {
    pub engine: Arc<Engine>,
    pub start_time: Instant,
}

fn engine_error_response(err: EngineError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &err {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Cancelled | EngineError::Timeout => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::StorageTransient(_) | EngineError::StorageFatal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(serde_json::json!({ "error": err.to_string() })))
}

/// `/healthz` — reports bucket count and uptime.
pub async fn api_health(State(ctx): State<AppContext>) -> impl IntoResponse {
    let buckets = ctx.engine.list_buckets().await.unwrap_or_default();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "buckets": buckets.len(),
        "uptime_seconds": ctx.start_time.elapsed().as_secs(),
    }))
}

#[derive(Deserialize)]
pub struct IngestBody {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub buckets: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

pub async fn api_ingest(
    State(ctx): State<AppContext>,
    Json(body): Json<IngestBody>,
) -> Result<Json<IngestOutcomeResponse>, (StatusCode, Json<serde_json::Value>)> {
    let req = IngestRequest {
        bytes: body.content.into_bytes(),
        path: body.path,
        source: if body.external { Provenance::External } else { Provenance::Internal },
        type_hint: None,
        buckets: body.buckets,
        tags: body.tags,
    };
    let outcome = ctx.engine.ingest(req).await.map_err(engine_error_response)?;
    Ok(Json(IngestOutcomeResponse {
        id: outcome.id,
        status: outcome.status,
        message: outcome.message,
    }))
}

#[derive(Serialize)]
pub struct IngestOutcomeResponse {
    pub id: String,
    pub status: IngestStatus,
    pub message: String,
}

#[derive(Deserialize)]
pub struct SearchQuery {
    pub q: String,
    #[serde(default)]
    pub buckets: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub max_chars: Option<usize>,
    #[serde(default)]
    pub molecule: Option<bool>,
}

fn split_csv(raw: &Option<String>) -> Option<Vec<String>> {
    raw.as_ref().map(|s| s.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect())
}

pub async fn api_search(
    State(ctx): State<AppContext>,
    Query(q): Query<SearchQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let buckets = split_csv(&q.buckets);
    let tags = split_csv(&q.tags);
    let max_chars = q.max_chars.unwrap_or(20_000);

    let response = if q.molecule.unwrap_or(false) {
        ctx.engine
            .molecule_search(&q.q, buckets.as_deref(), tags.as_deref(), max_chars, None)
            .await
    } else {
        ctx.engine.search(&q.q, buckets.as_deref(), tags.as_deref(), max_chars, None).await
    }
    .map_err(engine_error_response)?;

    Ok(Json(serde_json::json!({
        "results": response.results.iter().map(|r| serde_json::json!({
            "id": r.molecule_id,
            "compound_id": r.compound_id,
            "content": r.content,
            "source": r.source_path,
            "timestamp": r.timestamp,
            "bucket": r.bucket,
            "tags": r.tags,
            "score": r.score,
        })).collect::<Vec<_>>(),
        "context": response.context.iter().map(|c| serde_json::json!({
            "compound_id": c.compound_id,
            "source": c.source_path,
            "timestamp": c.timestamp,
            "bucket": c.bucket,
            "tags": c.tags,
            "content": c.content,
            "score": c.score,
        })).collect::<Vec<_>>(),
    })))
}

pub async fn api_list_buckets(
    State(ctx): State<AppContext>,
) -> Result<Json<Vec<String>>, (StatusCode, Json<serde_json::Value>)> {
    Ok(Json(ctx.engine.list_buckets().await.map_err(engine_error_response)?))
}

#[derive(Deserialize)]
pub struct TagsQuery {
    #[serde(default)]
    pub buckets: Option<String>,
}

pub async fn api_list_tags(
    State(ctx): State<AppContext>,
    Query(q): Query<TagsQuery>,
) -> Result<Json<Vec<String>>, (StatusCode, Json<serde_json::Value>)> {
    let buckets = split_csv(&q.buckets);
    Ok(Json(ctx.engine.list_tags(buckets.as_deref()).await.map_err(engine_error_response)?))
}

#[derive(Deserialize)]
pub struct WatchPathBody {
    pub path: String,
}

pub async fn api_add_watch(
    State(ctx): State<AppContext>,
    Json(body): Json<WatchPathBody>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    ctx.engine.add_watch_path(body.path.into()).await.map_err(engine_error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn api_remove_watch(
    State(ctx): State<AppContext>,
    Json(body): Json<WatchPathBody>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    ctx.engine
        .remove_watch_path(std::path::Path::new(&body.path))
        .await
        .map_err(engine_error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn api_list_watches(State(ctx): State<AppContext>) -> impl IntoResponse {
    let paths: Vec<String> =
        ctx.engine.list_watch_paths().into_iter().map(|p| p.to_string_lossy().to_string()).collect();
    Json(paths)
}

pub async fn api_quarantine_atom(
    State(ctx): State<AppContext>,
    AxumPath(atom_id): AxumPath<String>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    ctx.engine.quarantine_atom(&atom_id).await.map_err(engine_error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn api_restore_atom(
    State(ctx): State<AppContext>,
    AxumPath(atom_id): AxumPath<String>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    ctx.engine.restore_atom(&atom_id).await.map_err(engine_error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct UpdateContentBody {
    pub content: String,
}

pub async fn api_update_molecule_content(
    State(ctx): State<AppContext>,
    AxumPath(molecule_id): AxumPath<String>,
    Json(body): Json<UpdateContentBody>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    ctx.engine
        .update_atom_content(&molecule_id, &body.content)
        .await
        .map_err(engine_error_response)?;
    Ok(StatusCode::NO_CONTENT)
}
