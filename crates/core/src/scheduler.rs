//! Ingest Scheduler: directory watcher, stability debounce,
//! hash-based change dedup, and per-path/global concurrency control.
//!
//! Grounded on the source project's `watch.rs` debounce-and-reindex loop:
//! same `notify` channel-to-processor shape, generalized from a fixed
//! 500ms quiet window to the size/mtime stability poll this spec specifies,
//! and from its in-memory reindex to the atomize → store persistence
//! pipeline this data model requires.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tracing::{info, warn};

use crate::atomizer::{atomize, AtomizedFile};
use crate::config::{EngineConfig, KeywordCatalog, UserSettings};
use crate::error::{EngineError, EngineResult};
use crate::model::{Provenance, SourceRecord};
use crate::store::Store;

/// Poll cadence while a changed path's metadata is settling.
const POLL_INTERVAL_MS: u64 = 100;

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes).iter().map(|b| format!("{b:02x}")).collect()
}

fn epoch_ms(t: std::time::SystemTime) -> i64 {
    t.duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// `inbox`/`external-inbox` bucket and provenance derivation.
fn derive_bucket_and_provenance(config: &EngineConfig, path: &Path) -> (String, Provenance) {
    let lower = path.to_string_lossy().to_lowercase();
    let provenance = if lower.contains("external-inbox") || lower.contains("web_scrape") {
        Provenance::External
    } else {
        Provenance::Internal
    };

    let fixed_roots = [config.inbox_dir(), config.external_inbox_dir()];
    let bucket = fixed_roots
        .iter()
        .find_map(|root| path.strip_prefix(root).ok())
        .and_then(|rel| rel.iter().next())
        .map(|seg| seg.to_string_lossy().to_string())
        .or_else(|| {
            path.strip_prefix(&config.root)
                .ok()
                .and_then(|rel| rel.iter().next())
                .map(|seg| seg.to_string_lossy().to_string())
        })
        .unwrap_or_else(|| "inbox".to_string());

    (bucket, provenance)
}

/// Tracks a single pending path until its size/mtime stop changing.
struct Tracked {
    last_stat: Option<(u64, i64)>,
    stable_since: Instant,
}

fn stat_of(path: &Path) -> Option<(u64, i64)> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime = meta.modified().ok().map(epoch_ms).unwrap_or(0);
    Some((meta.len(), mtime))
}

pub struct Scheduler {
    store: Arc<Store>,
    config: EngineConfig,
    catalog: Arc<KeywordCatalog>,
    settings_path: PathBuf,
    path_locks: DashMap<PathBuf, Arc<AsyncMutex<()>>>,
    concurrency: Arc<Semaphore>,
    watcher: AsyncMutex<Option<RecommendedWatcher>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        config: EngineConfig,
        catalog: Arc<KeywordCatalog>,
        settings_path: PathBuf,
    ) -> Arc<Self> {
        let concurrency = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Arc::new(Self {
            store,
            config,
            catalog,
            settings_path,
            path_locks: DashMap::new(),
            concurrency,
            watcher: AsyncMutex::new(None),
        })
    }

    fn is_allowed_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.config.allowed_extensions.contains(&e.to_lowercase()))
            .unwrap_or(false)
    }

    /// Builds and starts the filesystem watcher across every configured
    /// root (the two fixed inboxes plus any persisted extra paths), and
    /// spawns the debounce/ingest task. Idempotent: a second call replaces
    /// the previous watcher handle, dropping it.
    pub async fn start(self: &Arc<Self>) -> EngineResult<()> {
        let (tx, rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| EngineError::StorageFatal(e.to_string()))?;

        let settings = UserSettings::load(&self.settings_path);
        let mut roots = self.config.watch_roots();
        roots.extend(settings.watcher.extra_paths);

        for root in &roots {
            if let Err(e) = std::fs::create_dir_all(root) {
                warn!(?e, path = %root.display(), "failed to create watch root");
                continue;
            }
            match watcher.watch(root, RecursiveMode::Recursive) {
                Ok(()) => info!(path = %root.display(), "watching"),
                Err(e) => warn!(?e, path = %root.display(), "failed to watch root"),
            }
        }

        *self.watcher.lock().await = Some(watcher);

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.debounce_loop(rx).await;
        });

        Ok(())
    }

    /// Adds a path to the live watcher (if running) and persists it to
    /// `user_settings.json`.
    pub async fn add_watch(&self, path: PathBuf) -> EngineResult<()> {
        std::fs::create_dir_all(&path).map_err(|e| EngineError::StorageFatal(e.to_string()))?;
        if let Some(w) = self.watcher.lock().await.as_mut() {
            if let Err(e) = w.watch(&path, RecursiveMode::Recursive) {
                warn!(?e, path = %path.display(), "failed to add live watch");
            }
        }
        let mut settings = UserSettings::load(&self.settings_path);
        settings.add_watch_path(path);
        settings.save(&self.settings_path).map_err(|e| EngineError::StorageFatal(e.to_string()))
    }

    pub async fn remove_watch(&self, path: &Path) -> EngineResult<()> {
        if let Some(w) = self.watcher.lock().await.as_mut() {
            let _ = w.unwatch(path);
        }
        let mut settings = UserSettings::load(&self.settings_path);
        settings.remove_watch_path(path);
        settings.save(&self.settings_path).map_err(|e| EngineError::StorageFatal(e.to_string()))
    }

    pub fn list_watch_paths(&self) -> Vec<PathBuf> {
        let mut roots = self.config.watch_roots();
        roots.extend(UserSettings::load(&self.settings_path).watcher.extra_paths);
        roots
    }

    async fn debounce_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Event>) {
        let mut tracked: HashMap<PathBuf, Tracked> = HashMap::new();
        let poll = Duration::from_millis(POLL_INTERVAL_MS);
        let stability = Duration::from_millis(self.config.stability_threshold_ms.max(1));

        loop {
            match tokio::time::timeout(poll, rx.recv()).await {
                Ok(Some(event)) => {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        let now = Instant::now();
                        for path in event.paths {
                            tracked.insert(path, Tracked { last_stat: None, stable_since: now });
                        }
                    } else if matches!(event.kind, EventKind::Other) {
                        // addDir and other informational events are logged only.
                        for path in &event.paths {
                            info!(path = %path.display(), "directory event");
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {}
            }

            if tracked.is_empty() {
                continue;
            }

            let now = Instant::now();
            let mut ready = Vec::new();
            for (path, state) in tracked.iter_mut() {
                let current = stat_of(path);
                if current != state.last_stat {
                    state.last_stat = current;
                    state.stable_since = now;
                    continue;
                }
                if now.duration_since(state.stable_since) >= stability {
                    ready.push(path.clone());
                }
            }
            for path in &ready {
                tracked.remove(path);
            }
            for path in ready {
                let scheduler = Arc::clone(&self);
                tokio::spawn(async move {
                    scheduler.handle_path(path).await;
                });
            }
        }
    }

    fn lock_for(&self, path: &Path) -> Arc<AsyncMutex<()>> {
        self.path_locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Dotfiles are never ingested regardless of extension.
    fn is_hidden(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(false)
    }

    /// Runs the full per-event pipeline for one
    /// settled path. Same-path events are serialized via `path_locks`;
    /// distinct paths proceed up to `concurrency` in parallel.
    async fn handle_path(self: Arc<Self>, path: PathBuf) {
        if path.is_dir() {
            return;
        }
        if Self::is_hidden(&path) {
            return;
        }
        if !self.is_allowed_extension(&path) {
            return;
        }

        let lock = self.lock_for(&path);
        let _path_guard = lock.lock().await;
        let _permit = match self.concurrency.acquire().await {
            Ok(p) => p,
            Err(_) => return,
        };

        let Ok(raw) = tokio::fs::read(&path).await else {
            info!(path = %path.display(), "file unreadable, skipping (deleted mid-debounce?)");
            return;
        };

        let hash = hex_digest(&raw);
        let path_str = path.to_string_lossy().to_string();

        match self.store.source_hash(&path_str).await {
            Ok(Some(existing)) if existing == hash => return,
            Ok(_) => {}
            Err(e) => {
                warn!(?e, path = %path_str, "source_hash lookup failed, skipping");
                return;
            }
        }

        let (bucket, provenance) = derive_bucket_and_provenance(&self.config, &path);
        let relative_path = path.strip_prefix(&self.config.root).unwrap_or(&path).to_path_buf();

        let mtime_ms = tokio::fs::metadata(&path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(epoch_ms)
            .unwrap_or(0);
        let now_ms = epoch_ms(std::time::SystemTime::now());

        let atomized = atomize(
            &raw,
            &path,
            &relative_path,
            bucket,
            provenance,
            &self.catalog,
            self.config.max_molecule_bytes,
            mtime_ms,
            now_ms,
        )
        .await;

        if let Err(e) = self.persist(&atomized).await {
            warn!(?e, path = %path_str, "ingest persistence failed");
            return;
        }

        let source = SourceRecord {
            path: path_str.clone(),
            hash,
            total_atoms: atomized.atoms.len(),
            last_ingest: now_ms,
        };
        if let Err(e) = self.store.upsert_sources(&[source]).await {
            warn!(?e, path = %path_str, "failed to record source hash");
        }
    }

    /// Persists one atomized file's rows in dependency order: atoms, tags,
    /// molecules, edges (the compound→atom "memory bridge"), compound, then
    /// atom positions. Each call batches internally.
    async fn persist(&self, file: &AtomizedFile) -> EngineResult<()> {
        self.store.upsert_atoms(&file.atoms).await?;
        self.store.upsert_tags(&file.tags).await?;
        self.store.upsert_molecules(&file.molecules).await?;
        self.store.upsert_edges(&file.edges).await?;
        self.store.upsert_compounds(std::slice::from_ref(&file.compound)).await?;
        self.store.upsert_atom_positions(&file.atom_positions).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_derives_from_first_subdir_under_inbox() {
        let config = EngineConfig::new(PathBuf::from("/vault"));
        let (bucket, provenance) =
            derive_bucket_and_provenance(&config, Path::new("/vault/inbox/personal/note.md"));
        assert_eq!(bucket, "personal");
        assert_eq!(provenance, Provenance::Internal);
    }

    #[test]
    fn external_inbox_path_is_external_provenance() {
        let config = EngineConfig::new(PathBuf::from("/vault"));
        let (bucket, provenance) =
            derive_bucket_and_provenance(&config, Path::new("/vault/external-inbox/feeds/a.md"));
        assert_eq!(bucket, "feeds");
        assert_eq!(provenance, Provenance::External);
    }

    #[test]
    fn web_scrape_path_segment_forces_external_provenance() {
        let config = EngineConfig::new(PathBuf::from("/vault"));
        let (_, provenance) =
            derive_bucket_and_provenance(&config, Path::new("/vault/inbox/web_scrape/x.md"));
        assert_eq!(provenance, Provenance::External);
    }

    #[test]
    fn falls_back_to_root_segment_outside_fixed_inboxes() {
        let config = EngineConfig::new(PathBuf::from("/vault"));
        let (bucket, _) = derive_bucket_and_provenance(&config, Path::new("/vault/extra/deep/file.md"));
        assert_eq!(bucket, "extra");
    }

    #[tokio::test]
    async fn handle_path_skips_disallowed_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = EngineConfig::new(dir.path().to_path_buf());
        let catalog = Arc::new(KeywordCatalog::empty());
        let scheduler =
            Scheduler::new(store.clone(), config, catalog, dir.path().join("user_settings.json"));

        let path = dir.path().join("inbox").join("note.exe");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not ingestible").unwrap();

        scheduler.clone().handle_path(path.clone()).await;
        let hash = store.source_hash(&path.to_string_lossy()).await.unwrap();
        assert!(hash.is_none());
    }

    #[tokio::test]
    async fn handle_path_skips_hidden_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = EngineConfig::new(dir.path().to_path_buf());
        let catalog = Arc::new(KeywordCatalog::empty());
        let scheduler =
            Scheduler::new(store.clone(), config, catalog, dir.path().join("user_settings.json"));

        let path = dir.path().join("inbox").join(".hidden.md");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "Alpha beta gamma.").unwrap();

        scheduler.clone().handle_path(path.clone()).await;
        let hash = store.source_hash(&path.to_string_lossy()).await.unwrap();
        assert!(hash.is_none());
    }

    #[tokio::test]
    async fn handle_path_ingests_and_dedups_unchanged_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = EngineConfig::new(dir.path().to_path_buf());
        let catalog = Arc::new(KeywordCatalog::empty());
        let scheduler =
            Scheduler::new(store.clone(), config, catalog, dir.path().join("user_settings.json"));

        let path = dir.path().join("inbox").join("personal").join("note.md");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "Alpha beta gamma.").unwrap();

        scheduler.clone().handle_path(path.clone()).await;
        let first_hash = store.source_hash(&path.to_string_lossy()).await.unwrap();
        assert!(first_hash.is_some());

        let results = store.search_fts("gamma", None, None, 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].bucket, "personal");

        // Re-running on unchanged content must be a no-op, not a duplicate row.
        scheduler.clone().handle_path(path.clone()).await;
        let results_again = store.search_fts("gamma", None, None, 10).await.unwrap();
        assert_eq!(results_again.len(), 1);
    }
}
