//! Data model — compound/molecule/atom hierarchy and the relational rows
//! that index it.

use serde::{Deserialize, Serialize};

/// `internal` content is user-sovereign and scored higher; `external` is
/// scraped/imported. `system` is a dead branch in the source material
/// and is not modeled here — writers only ever
/// produce `Internal`/`External`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Internal,
    External,
}

impl Provenance {
    /// `provenance_boost` term of the Tag-Walker scoring formula.
    pub fn boost(self) -> f64 {
        match self {
            Provenance::Internal => 3.0,
            Provenance::External => 1.0,
        }
    }
}

/// A molecule's content class, set by the splitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoleculeType {
    Prose,
    Code,
    Data,
}

/// An atom's provenance: derived from the filesystem path/extension, or a
/// free-form concept extracted from content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtomType {
    System,
    Concept,
}

/// One ingested file version — the root of the atomic hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compound {
    pub id: String,
    pub path: String,
    pub timestamp: i64,
    pub provenance: Provenance,
    pub molecular_signature: u64,
    pub compound_body: String,
    pub bucket: String,
    pub molecule_ids: Vec<String>,
    pub atom_ids: Vec<String>,
}

/// A semantic segment of a compound, addressed by an exact half-open byte
/// range into `compound_body`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Molecule {
    pub id: String,
    pub compound_id: String,
    pub sequence: u32,
    pub content: String,
    pub r#type: MoleculeType,
    pub start_byte: usize,
    pub end_byte: usize,
    pub numeric_value: Option<f64>,
    pub numeric_unit: Option<String>,
    pub molecular_signature: u64,
    pub timestamp: i64,
    pub atom_ids: Vec<String>,
}

/// A tag/concept node. Identity is the label: two molecules referencing
/// the same label must reference the same atom id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Atom {
    pub id: String,
    pub label: String,
    pub r#type: AtomType,
    pub weight: f64,
}

/// Associative row used by the Tag-Walker's graph walk: `(atom_id, tag,
/// bucket)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagRow {
    pub atom_id: String,
    pub tag: String,
    pub bucket: String,
}

/// A `has_tag` edge from a compound to an atom.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source_id: String,
    pub target_id: String,
    pub relation: String,
    pub weight: f64,
}

/// Lazy-inflation index: maps an atom label occurrence back to a byte
/// offset in a compound's body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomPosition {
    pub compound_id: String,
    pub atom_label: String,
    pub byte_offset: usize,
}

/// The ingestion scheduler's dedup memory, one row per watched path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    pub path: String,
    pub hash: String,
    pub total_atoms: usize,
    pub last_ingest: i64,
}

/// `has_tag` relation name used for every compound -> atom edge.
pub const RELATION_HAS_TAG: &str = "has_tag";

/// Truncation sentinel appended to any value that exceeds a configured
/// byte/array ceiling.
pub const TRUNCATION_SENTINEL: &str = "\u{2026}[truncated]";
