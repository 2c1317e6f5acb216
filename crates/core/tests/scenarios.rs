//! End-to-end scenarios driven through the `Engine` facade against a real
//! on-disk database, rather than the in-process unit tests each module
//! already carries for its own internals.

use atomvault_core::engine::{Engine, IngestRequest, IngestStatus};
use atomvault_core::model::Provenance;

fn vault(tmp: &tempfile::TempDir) -> Engine {
    Engine::new(tmp.path().to_path_buf()).unwrap()
}

fn ingest(
    engine: &Engine,
    path: &str,
    body: &[u8],
    provenance: Provenance,
    bucket: &str,
) -> impl std::future::Future<Output = atomvault_core::engine::IngestOutcome> + '_ {
    let req = IngestRequest {
        bytes: body.to_vec(),
        path: path.to_string(),
        source: provenance,
        type_hint: None,
        buckets: vec![bucket.to_string()],
        tags: vec![],
    };
    async move { engine.ingest(req).await.unwrap() }
}

#[tokio::test]
async fn s1_sanitize_and_dedup() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = vault(&tmp);
    let raw = br#"{"response_content":"Alpha beta gamma.", "timestamp":"2024-01-01T00:00:00Z"}"#;

    let first = ingest(&engine, "inbox/a.json", raw, Provenance::Internal, "inbox").await;
    assert_eq!(first.status, IngestStatus::Success);

    let second = ingest(&engine, "inbox/a.json", raw, Provenance::Internal, "inbox").await;
    assert_eq!(second.status, IngestStatus::Skipped);

    let response = engine.search("Alpha", None, None, 20_000, None).await.unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].content, "Alpha beta gamma.");
}

#[tokio::test]
async fn s2_split_produces_exact_byte_ranges() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = vault(&tmp);
    ingest(&engine, "inbox/quotes.md", b"Alpha. Beta! Gamma?", Provenance::Internal, "inbox").await;

    let response = engine.search("Beta", None, None, 20_000, None).await.unwrap();
    assert_eq!(response.results.len(), 1);
    let row = &response.results[0];
    assert_eq!(row.content, "Beta!");

    let body = engine.store().read_compound_body(&row.compound_id, 0, usize::MAX).await.unwrap();
    assert_eq!(body, "Alpha. Beta! Gamma?");
    assert_eq!(&body[row.start_byte..row.end_byte], row.content);
}

#[tokio::test]
async fn s3_bucket_isolation() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = vault(&tmp);
    ingest(
        &engine,
        "inbox/diary.md",
        b"My personal diary entry about sensitive stuff",
        Provenance::Internal,
        "personal",
    )
    .await;
    ingest(
        &engine,
        "inbox/code.rs",
        b"function sensitiveCode() {}",
        Provenance::Internal,
        "code",
    )
    .await;

    let buckets = vec!["personal".to_string()];
    let response = engine.search("sensitive", Some(&buckets), None, 20_000, None).await.unwrap();
    assert!(!response.results.is_empty());
    assert!(response.results.iter().all(|r| r.bucket == "personal"));
}

#[tokio::test]
async fn s4_tag_walker_surfaces_linked_molecule() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = vault(&tmp);
    ingest(
        &engine,
        "inbox/work/project-apollo/launch.md",
        b"preparing the launch schedule",
        Provenance::Internal,
        "work",
    )
    .await;
    ingest(
        &engine,
        "inbox/work/project-apollo/notes.md",
        b"no matching terms here at all",
        Provenance::Internal,
        "work",
    )
    .await;

    let response = engine.search("launch", None, None, 20_000, None).await.unwrap();
    assert!(response.results.iter().any(|r| r.content.contains("launch")));
    let anchor_score =
        response.results.iter().find(|r| r.content.contains("launch")).unwrap().score;
    let walked = response
        .results
        .iter()
        .find(|r| !r.content.contains("launch"))
        .expect("tag walker should surface notes.md via the shared #project:project-apollo tag");
    assert!(walked.score > 0.0);
    assert!(anchor_score > walked.score);
}

#[tokio::test]
async fn s5_internal_provenance_outscores_external_for_identical_content() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = vault(&tmp);
    let body = b"an identical phrase shared across both sources";
    ingest(&engine, "inbox/a.md", body, Provenance::Internal, "inbox").await;
    ingest(&engine, "external-inbox/b.md", body, Provenance::External, "inbox").await;

    let response =
        engine.search("identical phrase shared", None, None, 20_000, None).await.unwrap();
    assert_eq!(response.results.len(), 2);
    let internal = response.results.iter().find(|r| r.provenance == Provenance::Internal).unwrap();
    let external = response.results.iter().find(|r| r.provenance == Provenance::External).unwrap();
    assert!(internal.score >= 3.0 * external.score);
}

#[tokio::test]
async fn i4_bucket_filtered_search_never_leaks_other_buckets() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = vault(&tmp);
    ingest(&engine, "inbox/a.md", b"shared keyword alpha", Provenance::Internal, "one").await;
    ingest(&engine, "inbox/b.md", b"shared keyword beta", Provenance::Internal, "two").await;

    let buckets = vec!["one".to_string()];
    let response = engine.search("shared keyword", Some(&buckets), None, 20_000, None).await.unwrap();
    assert!(response.results.iter().all(|r| r.bucket == "one"));
}

#[tokio::test]
async fn watch_path_management_round_trips_through_the_facade() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = vault(&tmp);
    let extra = tmp.path().join("extra-notes");
    std::fs::create_dir_all(&extra).unwrap();

    engine.add_watch_path(extra.clone()).await.unwrap();
    assert!(engine.list_watch_paths().contains(&extra));

    engine.remove_watch_path(&extra).await.unwrap();
    assert!(!engine.list_watch_paths().contains(&extra));
}

#[tokio::test]
async fn quarantine_then_restore_round_trips_without_error() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = vault(&tmp);
    ingest(&engine, "inbox/a.md", b"unique searchable phrase", Provenance::Internal, "inbox").await;

    let response = engine.search("unique searchable", None, None, 20_000, None).await.unwrap();
    let atom_id = atomvault_core::tags::atom_id(&response.results[0].tags[0]);

    engine.quarantine_atom(&atom_id).await.unwrap();
    engine.restore_atom(&atom_id).await.unwrap();
}

#[tokio::test]
async fn update_molecule_content_recomputes_fingerprint_and_positions() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = vault(&tmp);
    ingest(&engine, "inbox/a.md", b"deploying to kubernetes cluster", Provenance::Internal, "inbox")
        .await;

    let response = engine.search("kubernetes", None, None, 20_000, None).await.unwrap();
    let molecule_id = response.results[0].molecule_id.clone();

    engine.update_atom_content(&molecule_id, "migrated off kubernetes entirely").await.unwrap();

    let updated = engine.store().molecule_by_id(&molecule_id).await.unwrap().unwrap();
    assert_eq!(updated.content, "migrated off kubernetes entirely");
}
