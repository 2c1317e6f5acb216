//! Exercises the HTTP handlers directly against a real on-disk `Engine`,
//! the same way the teacher's MCP tests dispatch against `ServerState`
//! without going through a socket.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Json, Path as AxumPath, Query, State};

use atomvault_server::api::{self, AppContext, IngestBody, SearchQuery, WatchPathBody};

use atomvault_core::engine::Engine;

fn ctx(tmp: &tempfile::TempDir) -> AppContext {
    let engine = Engine::new(tmp.path().to_path_buf()).unwrap();
    AppContext { engine: Arc::new(engine), start_time: Instant::now() }
}

#[tokio::test]
async fn health_reports_zero_buckets_on_an_empty_vault() {
    let tmp = tempfile::tempdir().unwrap();
    let response = api::api_health(State(ctx(&tmp))).await;
    let body = axum::response::IntoResponse::into_response(response);
    assert_eq!(body.status(), axum::http::StatusCode::OK);
}

#[tokio::test]
async fn ingest_then_search_round_trips_through_the_handlers() {
    let tmp = tempfile::tempdir().unwrap();
    let app = ctx(&tmp);

    let ingest_body = IngestBody {
        path: "inbox/note.md".to_string(),
        content: "a durable note about rust ownership".to_string(),
        external: false,
        buckets: vec!["inbox".to_string()],
        tags: vec![],
    };
    let outcome = api::api_ingest(State(app.clone()), Json(ingest_body)).await.unwrap();
    assert_eq!(outcome.0.status, atomvault_core::engine::IngestStatus::Success);

    let query = SearchQuery {
        q: "ownership".to_string(),
        buckets: None,
        tags: None,
        max_chars: None,
        molecule: None,
    };
    let response = api::api_search(State(app), Query(query)).await.unwrap();
    let results = response.0["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0]["content"].as_str().unwrap().contains("ownership"));
}

#[tokio::test]
async fn ingest_validation_failure_surfaces_as_bad_request() {
    let tmp = tempfile::tempdir().unwrap();
    let app = ctx(&tmp);

    let body = IngestBody {
        path: "inbox/empty.md".to_string(),
        content: String::new(),
        external: false,
        buckets: vec![],
        tags: vec![],
    };
    let err = api::api_ingest(State(app), Json(body)).await.unwrap_err();
    assert_eq!(err.0, axum::http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn watch_path_add_then_list_then_remove_round_trips() {
    let tmp = tempfile::tempdir().unwrap();
    let app = ctx(&tmp);
    let extra = tmp.path().join("side-channel");
    std::fs::create_dir_all(&extra).unwrap();

    api::api_add_watch(State(app.clone()), Json(WatchPathBody { path: extra.to_string_lossy().to_string() }))
        .await
        .unwrap();

    let listed = axum::response::IntoResponse::into_response(api::api_list_watches(State(app.clone())).await);
    assert_eq!(listed.status(), axum::http::StatusCode::OK);

    api::api_remove_watch(State(app), Json(WatchPathBody { path: extra.to_string_lossy().to_string() }))
        .await
        .unwrap();
}

#[tokio::test]
async fn updating_an_unknown_molecule_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let app = ctx(&tmp);
    let err = api::api_update_molecule_content(
        State(app),
        AxumPath("does-not-exist".to_string()),
        Json(api::UpdateContentBody { content: "new body".to_string() }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.0, axum::http::StatusCode::NOT_FOUND);
}
