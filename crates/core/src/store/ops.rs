//! Store operations: batched upserts, byte-accurate reads, FTS search, and
//! the tag-sharing graph walk.
//!
//! The transaction-per-batch, reindex-by-delete-then-insert FTS5 pattern
//! is grounded on the source project's `flush_batch`/`content_fts` +
//! `fts_node_map` handling: a standalone (non-external-content) FTS5
//! table kept in sync by a side mapping table, rather than SQLite's
//! external-content triggers.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::error::{EngineError, EngineResult};
use crate::model::{
    Atom, AtomPosition, AtomType, Compound, Edge, Molecule, MoleculeType, Provenance, SourceRecord,
    TagRow, TRUNCATION_SENTINEL,
};

use super::{retry_transient, Store, BATCH_SIZE};

const CONTENT_BYTE_CEILING: usize = 500 * 1024;
const ID_ARRAY_CEILING: usize = 10_000;

fn truncate_body(body: &str) -> String {
    if body.len() <= CONTENT_BYTE_CEILING {
        return body.to_string();
    }
    let mut end = CONTENT_BYTE_CEILING.min(body.len());
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &body[..end], TRUNCATION_SENTINEL)
}

fn truncate_ids(ids: &[String]) -> Vec<String> {
    if ids.len() <= ID_ARRAY_CEILING {
        return ids.to_vec();
    }
    let mut out = ids[..ID_ARRAY_CEILING].to_vec();
    out.push(TRUNCATION_SENTINEL.to_string());
    out
}

fn ids_to_json(ids: &[String]) -> String {
    serde_json::to_string(&truncate_ids(ids)).unwrap_or_else(|_| "[]".to_string())
}

fn json_to_ids(text: &str) -> Vec<String> {
    serde_json::from_str(text).unwrap_or_default()
}

fn provenance_str(p: Provenance) -> &'static str {
    match p {
        Provenance::Internal => "internal",
        Provenance::External => "external",
    }
}

fn parse_provenance(s: &str) -> Provenance {
    if s == "internal" {
        Provenance::Internal
    } else {
        Provenance::External
    }
}

fn molecule_type_str(t: MoleculeType) -> &'static str {
    match t {
        MoleculeType::Prose => "prose",
        MoleculeType::Code => "code",
        MoleculeType::Data => "data",
    }
}

fn atom_type_str(t: AtomType) -> &'static str {
    match t {
        AtomType::System => "system",
        AtomType::Concept => "concept",
    }
}

/// Reindexes a standalone FTS5 table for `id` by deleting any prior rows
/// via the side mapping table, then inserting the current content.
fn reindex_fts(
    tx: &rusqlite::Transaction<'_>,
    fts_table: &str,
    map_table: &str,
    map_id_col: &str,
    id: &str,
    content: &str,
) -> EngineResult<()> {
    let select = format!("SELECT fts_rowid FROM {map_table} WHERE {map_id_col} = ?1");
    let mut stmt = tx.prepare(&select)?;
    let rowids: Vec<i64> = stmt
        .query_map(params![id], |r| r.get(0))?
        .collect::<Result<_, _>>()?;
    drop(stmt);

    for rowid in rowids {
        tx.execute(&format!("DELETE FROM {fts_table} WHERE rowid = ?1"), params![rowid])?;
    }
    tx.execute(&format!("DELETE FROM {map_table} WHERE {map_id_col} = ?1"), params![id])?;
    tx.execute(&format!("INSERT INTO {fts_table}(content) VALUES (?1)"), params![content])?;
    let new_rowid = tx.last_insert_rowid();
    tx.execute(
        &format!("INSERT INTO {map_table}(fts_rowid, {map_id_col}) VALUES (?1, ?2)"),
        params![new_rowid, id],
    )?;
    Ok(())
}

async fn run_batched<T, F>(store: &Store, items: &[T], op: F) -> EngineResult<()>
where
    T: Clone,
    F: Fn(&rusqlite::Transaction<'_>, &[T]) -> EngineResult<()>,
{
    for chunk in items.chunks(BATCH_SIZE) {
        let chunk_owned: Vec<T> = chunk.to_vec();
        retry_transient(|| {
            let mut guard = store.conn.lock().unwrap();
            let tx = guard.transaction()?;
            op(&tx, &chunk_owned)?;
            tx.commit()?;
            Ok(())
        })
        .await?;
        tokio::task::yield_now().await;
    }
    Ok(())
}

impl Store {
    pub async fn upsert_compounds(&self, batch: &[Compound]) -> EngineResult<()> {
        run_batched(self, batch, |tx, chunk| {
            for c in chunk {
                let body = truncate_body(&c.compound_body);
                tx.execute(
                    "INSERT INTO compounds (id, path, timestamp, provenance, molecular_signature, compound_body, bucket, molecule_ids, atom_ids)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(id) DO UPDATE SET path=excluded.path, timestamp=excluded.timestamp,
                        provenance=excluded.provenance, molecular_signature=excluded.molecular_signature,
                        compound_body=excluded.compound_body, bucket=excluded.bucket,
                        molecule_ids=excluded.molecule_ids, atom_ids=excluded.atom_ids",
                    params![
                        c.id,
                        c.path,
                        c.timestamp,
                        provenance_str(c.provenance),
                        c.molecular_signature as i64,
                        body,
                        c.bucket,
                        ids_to_json(&c.molecule_ids),
                        ids_to_json(&c.atom_ids),
                    ],
                )?;
                reindex_fts(tx, "compounds_fts", "compounds_fts_map", "compound_id", &c.id, &c.compound_body)?;
            }
            Ok(())
        })
        .await
    }

    pub async fn upsert_molecules(&self, batch: &[Molecule]) -> EngineResult<()> {
        run_batched(self, batch, |tx, chunk| {
            for m in chunk {
                tx.execute(
                    "INSERT INTO molecules (id, compound_id, sequence, content, type, start_byte, end_byte, numeric_value, numeric_unit, molecular_signature, timestamp, atom_ids)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(id) DO UPDATE SET compound_id=excluded.compound_id, sequence=excluded.sequence,
                        content=excluded.content, type=excluded.type, start_byte=excluded.start_byte,
                        end_byte=excluded.end_byte, numeric_value=excluded.numeric_value,
                        numeric_unit=excluded.numeric_unit, molecular_signature=excluded.molecular_signature,
                        timestamp=excluded.timestamp, atom_ids=excluded.atom_ids",
                    params![
                        m.id,
                        m.compound_id,
                        m.sequence,
                        m.content,
                        molecule_type_str(m.r#type),
                        m.start_byte as i64,
                        m.end_byte as i64,
                        m.numeric_value,
                        m.numeric_unit,
                        m.molecular_signature as i64,
                        m.timestamp,
                        ids_to_json(&m.atom_ids),
                    ],
                )?;
                reindex_fts(tx, "molecules_fts", "molecules_fts_map", "molecule_id", &m.id, &m.content)?;
            }
            Ok(())
        })
        .await
    }

    pub async fn upsert_atoms(&self, batch: &[Atom]) -> EngineResult<()> {
        run_batched(self, batch, |tx, chunk| {
            for a in chunk {
                tx.execute(
                    "INSERT INTO atoms (id, label, type, weight) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET label=excluded.label, type=excluded.type, weight=excluded.weight",
                    params![a.id, a.label, atom_type_str(a.r#type), a.weight],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn upsert_tags(&self, batch: &[TagRow]) -> EngineResult<()> {
        run_batched(self, batch, |tx, chunk| {
            for t in chunk {
                tx.execute(
                    "INSERT OR IGNORE INTO tags (atom_id, tag, bucket) VALUES (?1, ?2, ?3)",
                    params![t.atom_id, t.tag, t.bucket],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn upsert_edges(&self, batch: &[Edge]) -> EngineResult<()> {
        run_batched(self, batch, |tx, chunk| {
            for e in chunk {
                tx.execute(
                    "INSERT INTO edges (source_id, target_id, relation, weight) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(source_id, target_id, relation) DO UPDATE SET weight=excluded.weight",
                    params![e.source_id, e.target_id, e.relation, e.weight],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn upsert_atom_positions(&self, batch: &[AtomPosition]) -> EngineResult<()> {
        run_batched(self, batch, |tx, chunk| {
            for p in chunk {
                tx.execute(
                    "INSERT OR IGNORE INTO atom_positions (compound_id, atom_label, byte_offset) VALUES (?1, ?2, ?3)",
                    params![p.compound_id, p.atom_label, p.byte_offset as i64],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn upsert_sources(&self, batch: &[SourceRecord]) -> EngineResult<()> {
        run_batched(self, batch, |tx, chunk| {
            for s in chunk {
                tx.execute(
                    "INSERT INTO sources (path, hash, total_atoms, last_ingest) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(path) DO UPDATE SET hash=excluded.hash, total_atoms=excluded.total_atoms,
                        last_ingest=excluded.last_ingest",
                    params![s.path, s.hash, s.total_atoms as i64, s.last_ingest],
                )?;
            }
            Ok(())
        })
        .await
    }

    /// Looks up the stored content hash for `path`, used by the scheduler
    /// to decide whether an event is a no-op.
    pub async fn source_hash(&self, path: &str) -> EngineResult<Option<String>> {
        let path = path.to_string();
        retry_transient(|| {
            let guard = self.conn.lock().unwrap();
            guard
                .query_row("SELECT hash FROM sources WHERE path = ?1", params![path], |r| r.get(0))
                .optional()
                .map_err(EngineError::from)
        })
        .await
    }

    /// Byte-accurate slice of a compound's body.
    pub async fn read_compound_body(
        &self,
        compound_id: &str,
        start_byte: usize,
        end_byte: usize,
    ) -> EngineResult<String> {
        let compound_id = compound_id.to_string();
        let body: String = retry_transient(|| {
            let guard = self.conn.lock().unwrap();
            guard
                .query_row(
                    "SELECT compound_body FROM compounds WHERE id = ?1",
                    params![compound_id],
                    |r| r.get(0),
                )
                .map_err(EngineError::from)
        })
        .await?;

        let start = start_byte.min(body.len());
        let end = end_byte.min(body.len()).max(start);
        Ok(body.get(start..end).unwrap_or("").to_string())
    }

    pub async fn quarantine_atom(&self, atom_id: &str, at_ms: i64) -> EngineResult<()> {
        let atom_id = atom_id.to_string();
        retry_transient(|| {
            let guard = self.conn.lock().unwrap();
            guard.execute(
                "INSERT OR REPLACE INTO quarantined_atoms (atom_id, quarantined_at) VALUES (?1, ?2)",
                params![atom_id, at_ms],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn restore_atom(&self, atom_id: &str) -> EngineResult<()> {
        let atom_id = atom_id.to_string();
        retry_transient(|| {
            let guard = self.conn.lock().unwrap();
            guard.execute("DELETE FROM quarantined_atoms WHERE atom_id = ?1", params![atom_id])?;
            Ok(())
        })
        .await
    }

    pub async fn update_molecule_content(&self, molecule_id: &str, content: &str) -> EngineResult<()> {
        let molecule_id = molecule_id.to_string();
        let content = content.to_string();
        retry_transient(|| {
            let mut guard = self.conn.lock().unwrap();
            let tx = guard.transaction()?;
            tx.execute(
                "UPDATE molecules SET content = ?1 WHERE id = ?2",
                params![content, molecule_id],
            )?;
            reindex_fts(&tx, "molecules_fts", "molecules_fts_map", "molecule_id", &molecule_id, &content)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Updates a molecule's `molecular_signature` in place, used by
    /// `update_atom_content` after the content itself has changed.
    pub async fn update_molecule_signature(&self, molecule_id: &str, signature: u64) -> EngineResult<()> {
        let molecule_id = molecule_id.to_string();
        let signature = signature as i64;
        retry_transient(|| {
            let guard = self.conn.lock().unwrap();
            guard.execute(
                "UPDATE molecules SET molecular_signature = ?1 WHERE id = ?2",
                params![signature, molecule_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_atom_position(&self, compound_id: &str, atom_label: &str) -> EngineResult<()> {
        let compound_id = compound_id.to_string();
        let atom_label = atom_label.to_string();
        retry_transient(|| {
            let guard = self.conn.lock().unwrap();
            guard.execute(
                "DELETE FROM atom_positions WHERE compound_id = ?1 AND atom_label = ?2",
                params![compound_id, atom_label],
            )?;
            Ok(())
        })
        .await
    }

    /// Every distinct bucket any compound has been ingested under.
    pub async fn list_buckets(&self) -> EngineResult<Vec<String>> {
        retry_transient(|| {
            let guard = self.conn.lock().unwrap();
            let mut stmt = guard.prepare("SELECT DISTINCT bucket FROM compounds ORDER BY bucket")?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?.collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Every distinct tag label, optionally restricted to the given
    /// buckets.
    pub async fn list_tags(&self, buckets: Option<&[String]>) -> EngineResult<Vec<String>> {
        let buckets = buckets.map(|b| b.to_vec());
        retry_transient(|| {
            let guard = self.conn.lock().unwrap();
            let rows = match &buckets {
                Some(buckets) if !buckets.is_empty() => {
                    let placeholders = buckets.iter().map(|_| "?").collect::<Vec<_>>().join(",");
                    let sql = format!(
                        "SELECT DISTINCT tag FROM tags WHERE bucket IN ({placeholders}) ORDER BY tag"
                    );
                    let mut stmt = guard.prepare(&sql)?;
                    let bind_values: Vec<&dyn rusqlite::ToSql> =
                        buckets.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
                    stmt.query_map(params_from_iter(bind_values), |r| r.get::<_, String>(0))?
                        .collect::<Result<Vec<_>, _>>()?
                }
                _ => {
                    let mut stmt = guard.prepare("SELECT DISTINCT tag FROM tags ORDER BY tag")?;
                    stmt.query_map([], |r| r.get::<_, String>(0))?.collect::<Result<Vec<_>, _>>()?
                }
            };
            Ok(rows)
        })
        .await
    }

    /// One page of `(molecule_id, compound_bucket, content)` ordered by id,
    /// strictly greater than `after_id`, for the Tag Infector's
    /// cursor-paginated sweep.
    pub async fn molecule_content_page(
        &self,
        after_id: Option<&str>,
        limit: usize,
    ) -> EngineResult<Vec<(String, String, String)>> {
        let after_id = after_id.map(|s| s.to_string());
        let limit = limit as i64;
        retry_transient(|| {
            let guard = self.conn.lock().unwrap();
            let mut stmt = guard.prepare(
                "SELECT m.id, c.bucket, m.content FROM molecules m
                 JOIN compounds c ON c.id = m.compound_id
                 WHERE (?1 IS NULL OR m.id > ?1)
                 ORDER BY m.id LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![after_id, limit], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Replaces a molecule's `atom_ids` array, used by the Tag Infector
    /// when a re-scan's tag set differs from what is already stored.
    pub async fn update_molecule_atom_ids(&self, molecule_id: &str, atom_ids: &[String]) -> EngineResult<()> {
        let molecule_id = molecule_id.to_string();
        let atom_ids_json = ids_to_json(atom_ids);
        retry_transient(|| {
            let guard = self.conn.lock().unwrap();
            guard.execute(
                "UPDATE molecules SET atom_ids = ?1 WHERE id = ?2",
                params![atom_ids_json, molecule_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn positions_for(
        &self,
        compound_id: &str,
        atom_labels: &[String],
    ) -> EngineResult<Vec<AtomPosition>> {
        let compound_id = compound_id.to_string();
        let atom_labels = atom_labels.to_vec();
        retry_transient(|| {
            let guard = self.conn.lock().unwrap();
            if atom_labels.is_empty() {
                let mut stmt = guard.prepare(
                    "SELECT compound_id, atom_label, byte_offset FROM atom_positions WHERE compound_id = ?1",
                )?;
                let rows = stmt
                    .query_map(params![compound_id], |r| {
                        Ok(AtomPosition {
                            compound_id: r.get(0)?,
                            atom_label: r.get(1)?,
                            byte_offset: r.get::<_, i64>(2)? as usize,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                return Ok(rows);
            }

            let placeholders = atom_labels.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "SELECT compound_id, atom_label, byte_offset FROM atom_positions
                 WHERE compound_id = ? AND atom_label IN ({placeholders})"
            );
            let mut stmt = guard.prepare(&sql)?;
            let mut bind_values: Vec<&dyn rusqlite::ToSql> = vec![&compound_id];
            for label in &atom_labels {
                bind_values.push(label);
            }
            let rows = stmt
                .query_map(params_from_iter(bind_values), |r| {
                    Ok(AtomPosition {
                        compound_id: r.get(0)?,
                        atom_label: r.get(1)?,
                        byte_offset: r.get::<_, i64>(2)? as usize,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

/// One hit from [`Store::search_fts`].
#[derive(Debug, Clone)]
pub struct FtsRow {
    pub id: String,
    pub compound_id: String,
    pub content: String,
    pub source_path: String,
    pub timestamp: i64,
    pub bucket: String,
    pub tags: Vec<String>,
    pub provenance: Provenance,
    pub molecular_signature: u64,
    pub start_byte: usize,
    pub end_byte: usize,
    pub fts_score: f64,
}

impl Store {
    /// Runs `fts_query` (caller-assembled, AND or OR semantics) against
    /// molecule content, optionally restricted by bucket and provenance.
    pub async fn search_fts(
        &self,
        fts_query: &str,
        buckets: Option<&[String]>,
        provenance: Option<Provenance>,
        limit: usize,
    ) -> EngineResult<Vec<FtsRow>> {
        let fts_query = fts_query.to_string();
        let buckets = buckets.map(|b| b.to_vec());
        let rows = retry_transient(|| {
            let guard = self.conn.lock().unwrap();
            run_search(&guard, &fts_query, buckets.as_deref(), provenance, limit)
        })
        .await?;
        Ok(rows)
    }

    /// Looks up a single molecule by id with the same shape `search_fts`
    /// returns, for candidates surfaced by the walk phase rather than FTS
    ///. `fts_score` is always `0.0`; the caller supplies
    /// whatever baseline the scoring step uses for non-anchor hits.
    pub async fn molecule_by_id(&self, molecule_id: &str) -> EngineResult<Option<FtsRow>> {
        let molecule_id = molecule_id.to_string();
        retry_transient(|| {
            let guard = self.conn.lock().unwrap();
            #[allow(clippy::type_complexity)]
            let row: Option<(String, String, String, i64, String, String, String, i64, i64, i64)> = guard
                .query_row(
                    "SELECT m.id, m.content, c.path, m.timestamp, c.bucket, c.provenance, m.compound_id, m.molecular_signature, m.start_byte, m.end_byte
                     FROM molecules m JOIN compounds c ON c.id = m.compound_id
                     WHERE m.id = ?1",
                    params![molecule_id],
                    |r| {
                        Ok((
                            r.get(0)?,
                            r.get(1)?,
                            r.get(2)?,
                            r.get(3)?,
                            r.get(4)?,
                            r.get(5)?,
                            r.get(6)?,
                            r.get(7)?,
                            r.get(8)?,
                            r.get(9)?,
                        ))
                    },
                )
                .optional()?;
            let Some((
                id,
                content,
                source_path,
                timestamp,
                bucket,
                provenance_raw,
                compound_id,
                sig,
                start_byte,
                end_byte,
            )) = row
            else {
                return Ok(None);
            };
            Ok(Some(FtsRow {
                tags: tags_for_molecule(&guard, &id)?,
                id,
                compound_id,
                content,
                source_path,
                timestamp,
                bucket,
                provenance: parse_provenance(&provenance_raw),
                molecular_signature: sig as u64,
                start_byte: start_byte as usize,
                end_byte: end_byte as usize,
                fts_score: 0.0,
            }))
        })
        .await
    }

    /// Breadth-first walk over the tag-sharing relation, seeded from a set
    /// of atom ids. Radius is normally `1`; larger
    /// values repeat the same hop rule outward.
    pub async fn walk(
        &self,
        seed_atom_ids: &[String],
        buckets: Option<&[String]>,
        max_per_hop: usize,
        radius: usize,
    ) -> EngineResult<Vec<WalkHit>> {
        let seeds = seed_atom_ids.to_vec();
        let buckets = buckets.map(|b| b.to_vec());
        retry_transient(|| {
            let guard = self.conn.lock().unwrap();
            run_walk(&guard, &seeds, buckets.as_deref(), max_per_hop, radius)
        })
        .await
    }
}

fn run_search(
    conn: &Connection,
    fts_query: &str,
    buckets: Option<&[String]>,
    provenance: Option<Provenance>,
    limit: usize,
) -> EngineResult<Vec<FtsRow>> {
    let mut sql = String::from(
        "SELECT m.id, m.content, c.path, m.timestamp, c.bucket, c.provenance, m.compound_id, m.molecular_signature, m.start_byte, m.end_byte, -bm25(molecules_fts) AS score
         FROM molecules_fts
         JOIN molecules_fts_map map ON map.fts_rowid = molecules_fts.rowid
         JOIN molecules m ON m.id = map.molecule_id
         JOIN compounds c ON c.id = m.compound_id
         WHERE molecules_fts MATCH ?",
    );

    let mut bind_strings: Vec<String> = vec![fts_query.to_string()];

    if let Some(buckets) = buckets {
        if !buckets.is_empty() {
            let placeholders = buckets.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            sql.push_str(&format!(" AND c.bucket IN ({placeholders})"));
            bind_strings.extend(buckets.iter().cloned());
        }
    }
    if let Some(p) = provenance {
        sql.push_str(" AND c.provenance = ?");
        bind_strings.push(provenance_str(p).to_string());
    }
    sql.push_str(" ORDER BY score DESC LIMIT ?");
    let limit = limit as i64;

    let mut stmt = conn.prepare(&sql)?;
    let mut bind_values: Vec<&dyn rusqlite::ToSql> =
        bind_strings.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
    bind_values.push(&limit);

    let mut out = Vec::new();
    let mut rows = stmt.query(params_from_iter(bind_values))?;
    while let Some(row) = rows.next()? {
        let molecule_id: String = row.get(0)?;
        let provenance_raw: String = row.get(5)?;
        let molecular_signature: i64 = row.get(7)?;
        let start_byte: i64 = row.get(8)?;
        let end_byte: i64 = row.get(9)?;
        out.push(FtsRow {
            id: molecule_id.clone(),
            content: row.get(1)?,
            source_path: row.get(2)?,
            timestamp: row.get(3)?,
            bucket: row.get(4)?,
            tags: tags_for_molecule(conn, &molecule_id)?,
            provenance: parse_provenance(&provenance_raw),
            compound_id: row.get(6)?,
            molecular_signature: molecular_signature as u64,
            start_byte: start_byte as usize,
            end_byte: end_byte as usize,
            fts_score: row.get(10)?,
        });
    }
    Ok(out)
}

fn atoms_for_molecule(conn: &Connection, molecule_id: &str) -> EngineResult<Vec<String>> {
    let atom_ids_json: Option<String> = conn
        .query_row("SELECT atom_ids FROM molecules WHERE id = ?1", params![molecule_id], |r| r.get(0))
        .optional()?;
    Ok(atom_ids_json.map(|j| json_to_ids(&j)).unwrap_or_default())
}

fn tags_for_molecule(conn: &Connection, molecule_id: &str) -> EngineResult<Vec<String>> {
    let atom_ids = atoms_for_molecule(conn, molecule_id)?;
    if atom_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = atom_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!("SELECT DISTINCT tag FROM tags WHERE atom_id IN ({placeholders})");
    let mut stmt = conn.prepare(&sql)?;
    let bind_values: Vec<&dyn rusqlite::ToSql> =
        atom_ids.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
    let tags = stmt
        .query_map(params_from_iter(bind_values), |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tags)
}

/// A candidate surfaced by the walk phase, with its hop distance from the
/// anchor set (0 for a seed itself is never returned; hops start at 1).
#[derive(Debug, Clone)]
pub struct WalkHit {
    pub molecule_id: String,
    pub compound_id: String,
    pub hop_distance: u32,
}

/// Tag labels carried by any of `atom_ids`, per the `tags` table.
fn tag_labels_for_atoms(
    conn: &Connection,
    atom_ids: &[String],
    buckets: Option<&[String]>,
) -> EngineResult<Vec<String>> {
    if atom_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = atom_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let mut sql = format!("SELECT DISTINCT tag FROM tags WHERE atom_id IN ({placeholders})");
    let mut bind_strings: Vec<String> = atom_ids.to_vec();
    if let Some(buckets) = buckets {
        if !buckets.is_empty() {
            let bucket_placeholders = buckets.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            sql.push_str(&format!(" AND bucket IN ({bucket_placeholders})"));
            bind_strings.extend(buckets.iter().cloned());
        }
    }
    let mut stmt = conn.prepare(&sql)?;
    let bind_values: Vec<&dyn rusqlite::ToSql> =
        bind_strings.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
    let labels = stmt
        .query_map(params_from_iter(bind_values), |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(labels)
}

/// Every atom id carrying any of `labels`, per the `tags` table — this is
/// the bridge across distinct atom ids that share a tag label, per the
/// `(tags) ⋈ (edges has_tag)` relation the walk traverses.
fn atoms_for_tag_labels(
    conn: &Connection,
    labels: &[String],
    buckets: Option<&[String]>,
) -> EngineResult<Vec<String>> {
    if labels.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = labels.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let mut sql = format!("SELECT DISTINCT atom_id FROM tags WHERE tag IN ({placeholders})");
    let mut bind_strings: Vec<String> = labels.to_vec();
    if let Some(buckets) = buckets {
        if !buckets.is_empty() {
            let bucket_placeholders = buckets.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            sql.push_str(&format!(" AND bucket IN ({bucket_placeholders})"));
            bind_strings.extend(buckets.iter().cloned());
        }
    }
    let mut stmt = conn.prepare(&sql)?;
    let bind_values: Vec<&dyn rusqlite::ToSql> =
        bind_strings.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
    let ids = stmt
        .query_map(params_from_iter(bind_values), |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn molecules_for_atoms(
    conn: &Connection,
    atom_ids: &[String],
    buckets: Option<&[String]>,
) -> EngineResult<Vec<(String, String)>> {
    if atom_ids.is_empty() {
        return Ok(Vec::new());
    }
    // molecules.atom_ids is a JSON array; json_each lets us match membership
    // without a normalized join table for this direction of the relation.
    let placeholders = atom_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let mut sql = format!(
        "SELECT DISTINCT m.id, m.compound_id FROM molecules m, json_each(m.atom_ids) je
         JOIN compounds c ON c.id = m.compound_id
         WHERE je.value IN ({placeholders})"
    );
    let mut bind_strings: Vec<String> = atom_ids.to_vec();
    if let Some(buckets) = buckets {
        if !buckets.is_empty() {
            let bucket_placeholders = buckets.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            sql.push_str(&format!(" AND c.bucket IN ({bucket_placeholders})"));
            bind_strings.extend(buckets.iter().cloned());
        }
    }
    let mut stmt = conn.prepare(&sql)?;
    let bind_values: Vec<&dyn rusqlite::ToSql> =
        bind_strings.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
    let rows = stmt
        .query_map(params_from_iter(bind_values), |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Breadth-first over the `(tags) ⋈ (edges has_tag)` relation: a hop steps
/// from a frontier of atom ids to their tag labels, then to every *other*
/// atom id carrying one of those labels, then to the molecules those atoms
/// appear on, for as many `radius` rounds as requested. Bridging through
/// tag labels (rather than atom id membership alone) is what lets two
/// distinct atoms that happen to share a label — e.g. a path-derived system
/// tag recorded under two different ids — link their molecules.
fn run_walk(
    conn: &Connection,
    seed_atom_ids: &[String],
    buckets: Option<&[String]>,
    max_per_hop: usize,
    radius: usize,
) -> EngineResult<Vec<WalkHit>> {
    use std::collections::HashSet;

    let mut visited_atoms: HashSet<String> = seed_atom_ids.iter().cloned().collect();
    let mut visited_molecules: HashSet<String> = HashSet::new();
    let mut frontier_atoms: Vec<String> = seed_atom_ids.to_vec();
    let mut hits: Vec<WalkHit> = Vec::new();

    for hop in 1..=radius.max(1) {
        let labels = tag_labels_for_atoms(conn, &frontier_atoms, buckets)?;
        if labels.is_empty() {
            break;
        }

        // Every atom carrying one of those labels, including the frontier
        // atoms themselves: a molecule may reference the seed atom id
        // directly, or a distinct atom id that only shares its tag label.
        let bridged_atoms = atoms_for_tag_labels(conn, &labels, buckets)?;

        let reached = molecules_for_atoms(conn, &bridged_atoms, buckets)?;
        for (molecule_id, compound_id) in reached {
            if visited_molecules.insert(molecule_id.clone()) {
                hits.push(WalkHit { molecule_id, compound_id, hop_distance: hop as u32 });
            }
        }

        let next_atoms: Vec<String> = bridged_atoms
            .into_iter()
            .filter(|id| visited_atoms.insert(id.clone()))
            .take(max_per_hop.max(1))
            .collect();
        if next_atoms.is_empty() {
            break;
        }
        frontier_atoms = next_atoms;
    }

    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AtomType, MoleculeType, Provenance};

    fn sample_compound(id: &str, bucket: &str, provenance: Provenance, body: &str) -> Compound {
        Compound {
            id: id.to_string(),
            path: format!("{bucket}/{id}.md"),
            timestamp: 1_700_000_000_000,
            provenance,
            molecular_signature: 123,
            compound_body: body.to_string(),
            bucket: bucket.to_string(),
            molecule_ids: vec![format!("{id}-m0")],
            atom_ids: vec![],
        }
    }

    fn sample_molecule(id: &str, compound_id: &str, content: &str, atom_ids: Vec<String>) -> Molecule {
        Molecule {
            id: id.to_string(),
            compound_id: compound_id.to_string(),
            sequence: 0,
            content: content.to_string(),
            r#type: MoleculeType::Prose,
            start_byte: 0,
            end_byte: content.len(),
            numeric_value: None,
            numeric_unit: None,
            molecular_signature: 123,
            timestamp: 1_700_000_000_000,
            atom_ids,
        }
    }

    #[tokio::test]
    async fn upsert_then_search_finds_content() {
        let store = Store::open_in_memory().unwrap();
        let compound = sample_compound("c1", "personal", Provenance::Internal, "My personal diary entry about sensitive stuff");
        let molecule = sample_molecule("c1-m0", "c1", "My personal diary entry about sensitive stuff", vec![]);

        store.upsert_compounds(&[compound]).await.unwrap();
        store.upsert_molecules(&[molecule]).await.unwrap();

        let results = store.search_fts("sensitive", None, None, 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].bucket, "personal");
    }

    #[tokio::test]
    async fn bucket_filter_excludes_other_buckets() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_compounds(&[
                sample_compound("c1", "personal", Provenance::Internal, "sensitive diary content"),
                sample_compound("c2", "code", Provenance::Internal, "function sensitiveCode() {}"),
            ])
            .await
            .unwrap();
        store
            .upsert_molecules(&[
                sample_molecule("c1-m0", "c1", "sensitive diary content", vec![]),
                sample_molecule("c2-m0", "c2", "function sensitiveCode() {}", vec![]),
            ])
            .await
            .unwrap();

        let buckets = vec!["personal".to_string()];
        let results = store.search_fts("sensitive", Some(&buckets), None, 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].bucket, "personal");
    }

    #[tokio::test]
    async fn read_compound_body_slices_exactly() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_compounds(&[sample_compound("c1", "inbox", Provenance::Internal, "Alpha. Beta! Gamma?")])
            .await
            .unwrap();
        let slice = store.read_compound_body("c1", 7, 12).await.unwrap();
        assert_eq!(slice, "Beta!");
    }

    #[tokio::test]
    async fn walk_finds_atoms_sharing_a_tag() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_atoms(&[
                Atom { id: "a1".into(), label: "#project:apollo".into(), r#type: AtomType::System, weight: 1.0 },
                Atom { id: "a2".into(), label: "launch".into(), r#type: AtomType::Concept, weight: 1.0 },
                Atom { id: "a3".into(), label: "other".into(), r#type: AtomType::Concept, weight: 1.0 },
            ])
            .await
            .unwrap();
        store
            .upsert_tags(&[
                TagRow { atom_id: "a1".into(), tag: "#project:apollo".into(), bucket: "work".into() },
                TagRow { atom_id: "a3".into(), tag: "#project:apollo".into(), bucket: "work".into() },
            ])
            .await
            .unwrap();
        store
            .upsert_compounds(&[
                sample_compound("b", "work", Provenance::Internal, "no relevant terms here"),
            ])
            .await
            .unwrap();
        store
            .upsert_molecules(&[sample_molecule("b-m0", "b", "no relevant terms here", vec!["a3".into()])])
            .await
            .unwrap();

        let hits = store.walk(&["a1".to_string()], None, 50, 1).await.unwrap();
        assert!(hits.iter().any(|h| h.molecule_id == "b-m0"));
    }

    #[tokio::test]
    async fn list_buckets_and_tags_are_distinct_and_filterable() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_compounds(&[
                sample_compound("c1", "personal", Provenance::Internal, "diary entry"),
                sample_compound("c2", "work", Provenance::Internal, "apollo launch"),
            ])
            .await
            .unwrap();
        store
            .upsert_atoms(&[Atom { id: "a1".into(), label: "#project:apollo".into(), r#type: AtomType::System, weight: 1.0 }])
            .await
            .unwrap();
        store
            .upsert_tags(&[TagRow { atom_id: "a1".into(), tag: "#project:apollo".into(), bucket: "work".into() }])
            .await
            .unwrap();

        let buckets = store.list_buckets().await.unwrap();
        assert_eq!(buckets, vec!["personal".to_string(), "work".to_string()]);

        let all_tags = store.list_tags(None).await.unwrap();
        assert_eq!(all_tags, vec!["#project:apollo".to_string()]);

        let personal_only = vec!["personal".to_string()];
        let filtered = store.list_tags(Some(&personal_only)).await.unwrap();
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn update_molecule_signature_and_delete_atom_position_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_compounds(&[sample_compound("c1", "inbox", Provenance::Internal, "hello world")])
            .await
            .unwrap();
        store
            .upsert_atom_positions(&[AtomPosition {
                compound_id: "c1".into(),
                atom_label: "hello".into(),
                byte_offset: 0,
            }])
            .await
            .unwrap();

        store.update_molecule_signature("c1-m0", 42).await.unwrap();
        store.delete_atom_position("c1", "hello").await.unwrap();

        let positions = store.positions_for("c1", &[]).await.unwrap();
        assert!(positions.is_empty());
    }

    #[tokio::test]
    async fn molecule_content_page_paginates_past_a_cursor() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_compounds(&[sample_compound("c1", "inbox", Provenance::Internal, "a b")])
            .await
            .unwrap();
        store
            .upsert_molecules(&[
                sample_molecule("c1-m0", "c1", "first", vec![]),
                sample_molecule("c1-m1", "c1", "second", vec![]),
            ])
            .await
            .unwrap();

        let first_page = store.molecule_content_page(None, 1).await.unwrap();
        assert_eq!(first_page.len(), 1);
        assert_eq!(first_page[0].0, "c1-m0");

        let second_page = store.molecule_content_page(Some(&first_page[0].0), 10).await.unwrap();
        assert_eq!(second_page.len(), 1);
        assert_eq!(second_page[0].0, "c1-m1");
    }

    #[tokio::test]
    async fn update_molecule_atom_ids_changes_downstream_tag_lookup() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_compounds(&[sample_compound("c1", "inbox", Provenance::Internal, "rust rocks")])
            .await
            .unwrap();
        store
            .upsert_molecules(&[sample_molecule("c1-m0", "c1", "rust rocks", vec![])])
            .await
            .unwrap();
        store
            .upsert_atoms(&[Atom { id: "a1".into(), label: "rust".into(), r#type: AtomType::Concept, weight: 1.0 }])
            .await
            .unwrap();
        store
            .upsert_tags(&[TagRow { atom_id: "a1".into(), tag: "rust".into(), bucket: "inbox".into() }])
            .await
            .unwrap();

        store.update_molecule_atom_ids("c1-m0", &["a1".to_string()]).await.unwrap();
        let row = store.molecule_by_id("c1-m0").await.unwrap().unwrap();
        assert_eq!(row.tags, vec!["rust".to_string()]);
    }

    #[tokio::test]
    async fn reindexing_a_molecule_replaces_prior_fts_entry() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_compounds(&[sample_compound("c1", "inbox", Provenance::Internal, "original words here")])
            .await
            .unwrap();
        store
            .upsert_molecules(&[sample_molecule("c1-m0", "c1", "original words here", vec![])])
            .await
            .unwrap();
        store.update_molecule_content("c1-m0", "updated words here").await.unwrap();

        let stale = store.search_fts("original", None, None, 10).await.unwrap();
        assert!(stale.is_empty());
        let fresh = store.search_fts("updated", None, None, 10).await.unwrap();
        assert_eq!(fresh.len(), 1);
    }
}
