//! Engine facade: the single boundary the CLI and HTTP
//! adapters speak to. Grounded on the source project's `AppContext` —
//! one struct wrapping the store/scheduler/config trio behind a small set
//! of async methods, constructed once per process and shared via `Arc`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, instrument};

use crate::atomizer::{atomize, surface_offset};
use crate::config::{EngineConfig, KeywordCatalog};
use crate::error::{EngineError, EngineResult};
use crate::fingerprint::fingerprint;
use crate::inflate::{self, InflatedSpan};
use crate::model::{AtomPosition, Provenance, SourceRecord};
use crate::scheduler::Scheduler;
use crate::search::{self, ScoredResult, SearchRequest};
use crate::store::Store;

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// Explicit, out-of-band ingestion request — distinct
/// from the scheduler's filesystem-driven path, for callers handing bytes
/// directly to the boundary.
pub struct IngestRequest {
    pub bytes: Vec<u8>,
    pub path: String,
    pub source: Provenance,
    pub type_hint: Option<String>,
    pub buckets: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Success,
    Skipped,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub id: String,
    pub status: IngestStatus,
    pub message: String,
}

/// `search`/`molecule_search` response shape: the raw scored
/// results plus an inflated, budget-truncated context built from them.
#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub context: Vec<InflatedSpan>,
    pub results: Vec<ScoredResult>,
}

pub struct Engine {
    store: Arc<Store>,
    config: EngineConfig,
    catalog: Arc<KeywordCatalog>,
    scheduler: Arc<Scheduler>,
}

impl Engine {
    pub fn new(root: PathBuf) -> EngineResult<Self> {
        let config = EngineConfig::new(root);
        let db_path = config.data_dir().join("atomvault.db");
        let store = Arc::new(Store::open(&db_path)?);
        let catalog = Arc::new(KeywordCatalog::load(&config.keyword_catalog_path()));
        let settings_path = config.settings_path();
        let scheduler = Scheduler::new(store.clone(), config.clone(), catalog.clone(), settings_path);
        Ok(Self { store, config, catalog, scheduler })
    }

    #[cfg(test)]
    pub fn in_memory(root: PathBuf) -> EngineResult<Self> {
        let config = EngineConfig::new(root);
        let store = Arc::new(Store::open_in_memory()?);
        let catalog = Arc::new(KeywordCatalog::empty());
        let settings_path = config.settings_path();
        let scheduler = Scheduler::new(store.clone(), config.clone(), catalog.clone(), settings_path);
        Ok(Self { store, config, catalog, scheduler })
    }

    /// Starts the filesystem watcher across the configured roots. Does not
    /// block; ingestion happens on spawned tasks as events settle.
    pub async fn start_watching(&self) -> EngineResult<()> {
        self.scheduler.start().await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Runs one Tag Infector sweep over every stored molecule,
    /// re-applying the current keyword catalog. Returns the number of
    /// molecules whose tag set changed.
    pub async fn run_tag_infector_sweep(&self) -> EngineResult<usize> {
        crate::infector::sweep(&self.store, &self.catalog).await
    }

    /// `ingest(path | bytes, source, type, buckets[], tags[])`.
    /// Runs the atomizer directly rather than waiting on the watcher, so a
    /// caller gets a synchronous success/skipped/error verdict.
    #[instrument(skip(self, req), fields(path = %req.path))]
    pub async fn ingest(&self, req: IngestRequest) -> EngineResult<IngestOutcome> {
        if req.bytes.is_empty() {
            return Err(EngineError::Validation("ingest body must not be empty".to_string()));
        }

        let hash: String = Sha256::digest(&req.bytes).iter().map(|b| format!("{b:02x}")).collect();
        if let Some(existing) = self.store.source_hash(&req.path).await? {
            if existing == hash {
                info!(path = %req.path, "ingest skipped, unchanged content");
                return Ok(IngestOutcome {
                    id: req.path.clone(),
                    status: IngestStatus::Skipped,
                    message: "unchanged content".to_string(),
                });
            }
        }

        let bucket = req.buckets.first().cloned().unwrap_or_else(|| "inbox".to_string());
        let path = Path::new(&req.path);
        let relative_path = path.strip_prefix(&self.config.root).unwrap_or(path);

        let mut atomized = atomize(
            &req.bytes,
            path,
            relative_path,
            bucket,
            req.source,
            &self.catalog,
            self.config.max_molecule_bytes,
            now_ms(),
            now_ms(),
        )
        .await;

        for extra_tag in &req.tags {
            let atom = crate::model::Atom {
                id: crate::tags::atom_id(extra_tag),
                label: extra_tag.clone(),
                r#type: crate::model::AtomType::Concept,
                weight: 1.0,
            };
            let id = atom.id.clone();
            if !atomized.atoms.iter().any(|a| a.id == id) {
                atomized.atoms.push(atom);
            }
            atomized.tags.push(crate::model::TagRow {
                atom_id: id.clone(),
                tag: extra_tag.clone(),
                bucket: atomized.compound.bucket.clone(),
            });
            atomized.edges.push(crate::model::Edge {
                source_id: atomized.compound.id.clone(),
                target_id: id.clone(),
                relation: crate::model::RELATION_HAS_TAG.to_string(),
                weight: 1.0,
            });
            if !atomized.compound.atom_ids.contains(&id) {
                atomized.compound.atom_ids.push(id.clone());
            }
            // An explicit ingest-level tag applies to the whole file, so
            // every molecule picks it up rather than just the compound.
            for molecule in &mut atomized.molecules {
                if !molecule.atom_ids.contains(&id) {
                    molecule.atom_ids.push(id.clone());
                }
            }
        }

        let total_atoms = atomized.atoms.len();
        let compound_id = atomized.compound.id.clone();

        self.store.upsert_atoms(&atomized.atoms).await?;
        self.store.upsert_tags(&atomized.tags).await?;
        self.store.upsert_molecules(&atomized.molecules).await?;
        self.store.upsert_edges(&atomized.edges).await?;
        self.store.upsert_compounds(std::slice::from_ref(&atomized.compound)).await?;
        self.store.upsert_atom_positions(&atomized.atom_positions).await?;

        self.store
            .upsert_sources(&[SourceRecord {
                path: req.path.clone(),
                hash,
                total_atoms,
                last_ingest: now_ms(),
            }])
            .await?;

        let _ = req.type_hint;
        info!(path = %req.path, total_atoms, "ingest completed");
        Ok(IngestOutcome { id: compound_id, status: IngestStatus::Success, message: "ingested".to_string() })
    }

    #[instrument(skip(self, query), fields(max_chars))]
    pub async fn search(
        &self,
        query: &str,
        buckets: Option<&[String]>,
        tags: Option<&[String]>,
        max_chars: usize,
        provenance: Option<Provenance>,
    ) -> EngineResult<SearchResponse> {
        if query.trim().is_empty() {
            return Err(EngineError::Validation("query must not be empty".to_string()));
        }
        let req = SearchRequest { query, buckets, tags, max_chars, provenance };
        let results = search::search(&self.store, &req, now_ms()).await;
        tracing::debug!(result_count = results.len(), "search completed");
        let context = inflate::inflate(&self.store, results.clone(), max_chars).await;
        Ok(SearchResponse { context, results })
    }

    #[instrument(skip(self, query), fields(max_chars))]
    pub async fn molecule_search(
        &self,
        query: &str,
        buckets: Option<&[String]>,
        tags: Option<&[String]>,
        max_chars: usize,
        provenance: Option<Provenance>,
    ) -> EngineResult<SearchResponse> {
        if query.trim().is_empty() {
            return Err(EngineError::Validation("query must not be empty".to_string()));
        }
        let results =
            search::molecule_search(&self.store, query, buckets, tags, max_chars, provenance, now_ms()).await;
        let context = inflate::inflate(&self.store, results.clone(), max_chars).await;
        Ok(SearchResponse { context, results })
    }

    pub async fn list_buckets(&self) -> EngineResult<Vec<String>> {
        self.store.list_buckets().await
    }

    pub async fn list_tags(&self, buckets: Option<&[String]>) -> EngineResult<Vec<String>> {
        self.store.list_tags(buckets).await
    }

    pub async fn add_watch_path(&self, path: PathBuf) -> EngineResult<()> {
        self.scheduler.add_watch(path).await
    }

    pub async fn remove_watch_path(&self, path: &Path) -> EngineResult<()> {
        self.scheduler.remove_watch(path).await
    }

    pub fn list_watch_paths(&self) -> Vec<PathBuf> {
        self.scheduler.list_watch_paths()
    }

    pub async fn quarantine_atom(&self, atom_id: &str) -> EngineResult<()> {
        self.store.quarantine_atom(atom_id, now_ms()).await
    }

    pub async fn restore_atom(&self, atom_id: &str) -> EngineResult<()> {
        self.store.restore_atom(atom_id).await
    }

    /// `update_atom_content(id, content)`: `id` addresses a
    /// molecule. Re-runs fingerprinting over the new content and re-emits
    /// that molecule's atom positions; tag/atom assignment is left
    /// untouched.
    pub async fn update_atom_content(&self, molecule_id: &str, content: &str) -> EngineResult<()> {
        let molecule = self
            .store
            .molecule_by_id(molecule_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("molecule {molecule_id} not found")))?;

        self.store.update_molecule_content(molecule_id, content).await?;
        self.store.update_molecule_signature(molecule_id, fingerprint(content)).await?;

        for label in &molecule.tags {
            self.store.delete_atom_position(&molecule.compound_id, label).await?;
            if let Some(offset) = surface_offset(content, label) {
                self.store
                    .upsert_atom_positions(&[AtomPosition {
                        compound_id: molecule.compound_id.clone(),
                        atom_label: label.clone(),
                        byte_offset: offset,
                    }])
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ingest_then_search_round_trips_through_the_facade() {
        let engine = Engine::in_memory(PathBuf::from("/vault")).unwrap();
        let outcome = engine
            .ingest(IngestRequest {
                bytes: b"Alpha beta gamma.".to_vec(),
                path: "/vault/inbox/notes.md".to_string(),
                source: Provenance::Internal,
                type_hint: None,
                buckets: vec!["personal".to_string()],
                tags: vec!["#manual".to_string()],
            })
            .await
            .unwrap();
        assert_eq!(outcome.status, IngestStatus::Success);

        let response = engine.search("gamma", None, None, 20_000, None).await.unwrap();
        assert_eq!(response.results.len(), 1);
        assert!(response.results[0].tags.contains(&"#manual".to_string()));
        assert!(!response.context.is_empty());
    }

    #[tokio::test]
    async fn repeat_ingest_of_unchanged_bytes_is_skipped() {
        let engine = Engine::in_memory(PathBuf::from("/vault")).unwrap();
        let req = || IngestRequest {
            bytes: b"Alpha beta gamma.".to_vec(),
            path: "/vault/inbox/notes.md".to_string(),
            source: Provenance::Internal,
            type_hint: None,
            buckets: vec!["personal".to_string()],
            tags: vec![],
        };
        let first = engine.ingest(req()).await.unwrap();
        assert_eq!(first.status, IngestStatus::Success);
        let second = engine.ingest(req()).await.unwrap();
        assert_eq!(second.status, IngestStatus::Skipped);
    }

    #[tokio::test]
    async fn empty_query_is_a_validation_error() {
        let engine = Engine::in_memory(PathBuf::from("/vault")).unwrap();
        let err = engine.search("   ", None, None, 1000, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn list_buckets_reflects_ingested_content() {
        let engine = Engine::in_memory(PathBuf::from("/vault")).unwrap();
        engine
            .ingest(IngestRequest {
                bytes: b"hello world".to_vec(),
                path: "/vault/inbox/a.md".to_string(),
                source: Provenance::Internal,
                type_hint: None,
                buckets: vec!["work".to_string()],
                tags: vec![],
            })
            .await
            .unwrap();
        let buckets = engine.list_buckets().await.unwrap();
        assert_eq!(buckets, vec!["work".to_string()]);
    }
}
