//! Typed configuration, path resolution, and catalog loading.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Runtime configuration for a single engine instance, one per data
/// directory.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub root: PathBuf,
    pub extra_watch_paths: Vec<PathBuf>,
    pub max_molecule_bytes: usize,
    pub max_body_bytes: usize,
    pub stability_threshold_ms: u64,
    pub search_default_max_chars: usize,
    pub search_anchor_share: f64,
    pub allowed_extensions: HashSet<String>,
    pub concurrency: usize,
    /// Reserved for future vector use; never consulted for retrieval.
    pub embedding_dim: usize,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            warn!(key, value = %v, "unparsable env var, using default");
            default
        }),
        Err(_) => default,
    }
}

impl EngineConfig {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            extra_watch_paths: Vec::new(),
            max_molecule_bytes: env_or("MAX_MOLECULE_BYTES", 1024),
            max_body_bytes: env_or("MAX_BODY_BYTES", 500 * 1024),
            stability_threshold_ms: env_or("WATCHER_STABILITY_THRESHOLD_MS", 2000),
            search_default_max_chars: env_or("SEARCH_DEFAULT_MAX_CHARS", 20_000),
            search_anchor_share: env_or("SEARCH_ANCHOR_SHARE", 0.7),
            allowed_extensions: ["md", "txt", "yaml", "yml", "csv", "json"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            embedding_dim: env_or("EMBEDDING_DIM", 384),
        }
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.root.join("inbox")
    }

    pub fn external_inbox_dir(&self) -> PathBuf {
        self.root.join("external-inbox")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join(".atomvault")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join("user_settings.json")
    }

    pub fn keyword_catalog_path(&self) -> PathBuf {
        self.root.join("context").join("internal_tags.json")
    }

    /// All directories the scheduler should watch: the two fixed roots
    /// plus any user-added extra paths.
    pub fn watch_roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![self.inbox_dir(), self.external_inbox_dir()];
        roots.extend(self.extra_watch_paths.iter().cloned());
        roots
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(PathBuf::from("."))
    }
}

// ---------------------------------------------------------------------------
// Persisted user settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerSettings {
    pub port: Option<u16>,
    pub host: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WatcherSettings {
    pub stability_threshold_ms: Option<u64>,
    #[serde(default)]
    pub extra_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IngestSettings {
    pub max_molecule_bytes: Option<usize>,
    pub max_body_bytes: Option<usize>,
}

/// Persisted settings file. `llm` is round-tripped as an opaque JSON value
/// since the core never interprets it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserSettings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub watcher: WatcherSettings,
    #[serde(default)]
    pub ingest: IngestSettings,
    #[serde(default)]
    pub llm: serde_json::Value,
}

impl UserSettings {
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(?e, "malformed user_settings.json, using defaults");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self).unwrap_or_default();
        std::fs::write(path, text)
    }

    pub fn add_watch_path(&mut self, path: PathBuf) {
        if !self.watcher.extra_paths.contains(&path) {
            self.watcher.extra_paths.push(path);
        }
    }

    pub fn remove_watch_path(&mut self, path: &Path) {
        self.watcher.extra_paths.retain(|p| p != path);
    }
}

// ---------------------------------------------------------------------------
// Keyword catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct KeywordCatalogFile {
    #[serde(default)]
    keywords: Vec<String>,
}

/// The keyword catalog and its compiled alternation regex, built once and
/// shared read-only for the lifetime of the process.
pub struct KeywordCatalog {
    pub keywords: Vec<String>,
    pub pattern: Option<Regex>,
}

impl KeywordCatalog {
    /// An unreadable or malformed catalog yields an empty keyword set and a
    /// warning rather than a fatal error.
    pub fn load(path: &Path) -> Self {
        let keywords = match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<KeywordCatalogFile>(&text) {
                Ok(f) => f.keywords,
                Err(e) => {
                    warn!(?e, path = %path.display(), "malformed keyword catalog");
                    Vec::new()
                }
            },
            Err(_) => {
                warn!(path = %path.display(), "keyword catalog not found, using empty set");
                Vec::new()
            }
        };

        let pattern = build_alternation(&keywords);
        Self { keywords, pattern }
    }

    pub fn empty() -> Self {
        Self { keywords: Vec::new(), pattern: None }
    }
}

/// Builds a single case-insensitive word-boundary alternation over the
/// catalog, escaping regex metacharacters in each keyword.
fn build_alternation(keywords: &[String]) -> Option<Regex> {
    if keywords.is_empty() {
        return None;
    }
    let escaped: Vec<String> = keywords
        .iter()
        .filter(|k| !k.is_empty())
        .map(|k| regex::escape(k))
        .collect();
    if escaped.is_empty() {
        return None;
    }
    let pattern = format!(r"(?i)\b(?:{})\b", escaped.join("|"));
    match Regex::new(&pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(?e, "failed to compile keyword catalog regex");
            None
        }
    }
}

static GLOBAL_CATALOG: OnceLock<KeywordCatalog> = OnceLock::new();

/// Process-wide singleton accessor; initializes on first use under a
/// one-time lock.
pub fn global_keyword_catalog(root: &Path) -> &'static KeywordCatalog {
    GLOBAL_CATALOG.get_or_init(|| {
        let config = EngineConfig::new(root.to_path_buf());
        KeywordCatalog::load(&config.keyword_catalog_path())
    })
}
