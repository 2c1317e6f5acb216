//! Relational schema. One SQLite file per engine instance.

use rusqlite::Connection;

use crate::error::EngineResult;

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS compounds (
    id TEXT PRIMARY KEY,
    path TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    provenance TEXT NOT NULL,
    molecular_signature INTEGER NOT NULL,
    compound_body TEXT NOT NULL,
    bucket TEXT NOT NULL,
    molecule_ids TEXT NOT NULL,
    atom_ids TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS molecules (
    id TEXT PRIMARY KEY,
    compound_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    content TEXT NOT NULL,
    type TEXT NOT NULL,
    start_byte INTEGER NOT NULL,
    end_byte INTEGER NOT NULL,
    numeric_value REAL,
    numeric_unit TEXT,
    molecular_signature INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    atom_ids TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_molecules_compound ON molecules(compound_id);

CREATE TABLE IF NOT EXISTS atoms (
    id TEXT PRIMARY KEY,
    label TEXT NOT NULL,
    type TEXT NOT NULL,
    weight REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS tags (
    atom_id TEXT NOT NULL,
    tag TEXT NOT NULL,
    bucket TEXT NOT NULL,
    PRIMARY KEY (atom_id, tag, bucket)
);
CREATE INDEX IF NOT EXISTS idx_tags_tag_bucket ON tags(tag, bucket);

CREATE TABLE IF NOT EXISTS edges (
    source_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    relation TEXT NOT NULL,
    weight REAL NOT NULL,
    PRIMARY KEY (source_id, target_id, relation)
);
CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id, relation);

CREATE TABLE IF NOT EXISTS atom_positions (
    compound_id TEXT NOT NULL,
    atom_label TEXT NOT NULL,
    byte_offset INTEGER NOT NULL,
    PRIMARY KEY (compound_id, atom_label, byte_offset)
);
CREATE INDEX IF NOT EXISTS idx_atom_positions_label ON atom_positions(atom_label);

CREATE TABLE IF NOT EXISTS sources (
    path TEXT PRIMARY KEY,
    hash TEXT NOT NULL,
    total_atoms INTEGER NOT NULL,
    last_ingest INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS quarantined_atoms (
    atom_id TEXT PRIMARY KEY,
    quarantined_at INTEGER NOT NULL
);

-- Full-text search over molecule content. Tag/concept atoms carry a label,
-- not a body, so the molecule is the per-hit content unit.
CREATE VIRTUAL TABLE IF NOT EXISTS molecules_fts USING fts5(content);
CREATE TABLE IF NOT EXISTS molecules_fts_map (
    fts_rowid INTEGER PRIMARY KEY,
    molecule_id TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_molecules_fts_map_id ON molecules_fts_map(molecule_id);

CREATE VIRTUAL TABLE IF NOT EXISTS compounds_fts USING fts5(content);
CREATE TABLE IF NOT EXISTS compounds_fts_map (
    fts_rowid INTEGER PRIMARY KEY,
    compound_id TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_compounds_fts_map_id ON compounds_fts_map(compound_id);
"#;

pub fn init(conn: &Connection) -> EngineResult<()> {
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000; PRAGMA foreign_keys=OFF;")?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
