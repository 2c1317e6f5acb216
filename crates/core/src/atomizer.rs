//! Atomizer: orchestrates sanitize → split → tag extraction
//! into the full set of rows a single file contributes to the store.
//!
//! Grounded on the source project's `process_changes` event handler for
//! the overall per-file pipeline shape, generalized to the molecule/atom
//! hierarchy and timestamp fallback this spec defines.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::config::KeywordCatalog;
use crate::fingerprint::fingerprint;
use crate::model::{
    Atom, AtomPosition, AtomType, Compound, Edge, Molecule, Provenance, TagRow,
    RELATION_HAS_TAG,
};
use crate::sanitize::sanitize_async;
use crate::splitter::{classify, split};
use crate::tags::{atom_id, content_tags, system_tags_for_path, ExtractedTag};
use crate::timestamp::extract_in_content_timestamp;

/// Everything the atomizer produces for one ingested file; the scheduler
/// persists these in the order §4.7 step 5 specifies.
#[derive(Debug, Clone)]
pub struct AtomizedFile {
    pub compound: Compound,
    pub molecules: Vec<Molecule>,
    pub atoms: Vec<Atom>,
    pub tags: Vec<TagRow>,
    pub edges: Vec<Edge>,
    pub atom_positions: Vec<AtomPosition>,
}

fn numeric_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"([\d,]+\.?\d*)\s?([A-Za-z%]+)?").unwrap())
}

/// Numeric value/unit extraction for `data`-typed molecules. Bare integer years are discarded as false positives.
fn extract_numeric(content: &str) -> (Option<f64>, Option<String>) {
    let mut best: Option<(f64, Option<String>)> = None;
    for caps in numeric_pattern().captures_iter(content) {
        let raw_num = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let unit = caps.get(2).map(|m| m.as_str().to_string());
        let cleaned: String = raw_num.chars().filter(|c| *c != ',').collect();
        let Ok(value) = cleaned.parse::<f64>() else { continue };

        let looks_like_bare_year = unit.is_none()
            && value.fract() == 0.0
            && (1900.0..=2100.0).contains(&value);
        if looks_like_bare_year {
            continue;
        }

        match &best {
            None => best = Some((value, unit)),
            Some((_, existing_unit)) if existing_unit.is_none() && unit.is_some() => {
                best = Some((value, unit));
            }
            _ => {}
        }
    }
    match best {
        Some((v, u)) => (Some(v), u),
        None => (None, None),
    }
}

fn compound_id_for(cleaned: &str, path: &str) -> String {
    let digest = Sha256::digest(format!("{cleaned}\u{1f}{path}").as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn molecule_id_for(compound_id: &str, sequence: u32) -> String {
    format!("{compound_id}-m{sequence}")
}

/// Finds the byte offset of `label`'s surface form inside `content`, used
/// to populate `atom_positions`. System tags and derived concept tags
/// whose surface text does not literally appear are skipped: a row is
/// only emitted where the text actually occurs.
pub(crate) fn surface_offset(content: &str, label: &str) -> Option<usize> {
    let needle = label.strip_prefix('#').unwrap_or(label);
    let needle = needle.split(':').next_back().unwrap_or(needle);
    let lower_content = content.to_lowercase();
    let lower_needle = needle.to_lowercase();
    lower_content.find(&lower_needle)
}

fn atom_for(tag: &ExtractedTag) -> Atom {
    Atom {
        id: atom_id(&tag.label),
        label: tag.label.clone(),
        r#type: tag.r#type,
        weight: tag.weight,
    }
}

/// Runs the full atomization pipeline for one file's raw bytes.
///
/// `bucket` and `provenance` are derived by the scheduler before calling in. `file_mtime_ms`/`now_ms` feed the timestamp
/// fallback hierarchy's steps 2 and 3.
pub async fn atomize(
    raw: &[u8],
    path: &Path,
    relative_path: &Path,
    bucket: String,
    provenance: Provenance,
    catalog: &KeywordCatalog,
    max_molecule_bytes: usize,
    file_mtime_ms: i64,
    now_ms: i64,
) -> AtomizedFile {
    let raw_text = String::from_utf8_lossy(raw);
    let cleaned = sanitize_async(&raw_text).await;
    let compound_id = compound_id_for(&cleaned, &path.to_string_lossy());

    let mut atoms: BTreeMap<String, Atom> = BTreeMap::new();
    let mut tag_rows = Vec::new();
    let mut edges = Vec::new();
    let mut atom_positions = Vec::new();
    let mut molecules = Vec::new();
    let mut compound_atom_ids: Vec<String> = Vec::new();

    let closure_bucket = bucket.clone();
    let closure_compound_id = compound_id.clone();
    let mut record_tags = move |extracted: Vec<ExtractedTag>,
                            molecule_body: &str,
                            atoms: &mut BTreeMap<String, Atom>,
                            tag_rows: &mut Vec<TagRow>,
                            edges: &mut Vec<Edge>,
                            atom_positions: &mut Vec<AtomPosition>,
                            compound_atom_ids: &mut Vec<String>|
     -> Vec<String> {
        let mut ids = Vec::new();
        for extracted in extracted {
            let atom = atom_for(&extracted);
            let id = atom.id.clone();
            atoms.entry(id.clone()).or_insert(atom);
            tag_rows.push(TagRow {
                atom_id: id.clone(),
                tag: extracted.label.clone(),
                bucket: closure_bucket.clone(),
            });
            edges.push(Edge {
                source_id: closure_compound_id.clone(),
                target_id: id.clone(),
                relation: RELATION_HAS_TAG.to_string(),
                weight: extracted.weight,
            });
            if let Some(offset) = surface_offset(molecule_body, &extracted.label) {
                atom_positions.push(AtomPosition {
                    compound_id: closure_compound_id.clone(),
                    atom_label: extracted.label.clone(),
                    byte_offset: offset,
                });
            }
            if !ids.contains(&id) {
                ids.push(id.clone());
            }
            if !compound_atom_ids.contains(&id) {
                compound_atom_ids.push(id);
            }
        }
        ids
    };

    let system_tags = system_tags_for_path(relative_path);
    let system_tag_ids = record_tags(
        system_tags,
        &cleaned,
        &mut atoms,
        &mut tag_rows,
        &mut edges,
        &mut atom_positions,
        &mut compound_atom_ids,
    );

    let type_hint = classify(&cleaned, path.extension().and_then(|e| e.to_str()));
    let split_molecules = split(&cleaned, type_hint, max_molecule_bytes);

    let mut current_timestamp = extract_in_content_timestamp(&cleaned).unwrap_or(file_mtime_ms);
    if current_timestamp == 0 {
        current_timestamp = now_ms;
    }

    let mut sequence = 0u32;
    for m in split_molecules {
        if let Some(ts) = extract_in_content_timestamp(&m.content) {
            current_timestamp = ts;
        }
        let molecule_timestamp = current_timestamp;

        let molecular_signature = fingerprint(&m.content);
        let (numeric_value, numeric_unit) = if m.r#type == crate::model::MoleculeType::Data {
            extract_numeric(&m.content)
        } else {
            (None, None)
        };

        let molecule_tags = content_tags(&m.content, catalog);
        let molecule_id = molecule_id_for(&compound_id, sequence);
        let atom_ids = record_tags(
            molecule_tags,
            &m.content,
            &mut atoms,
            &mut tag_rows,
            &mut edges,
            &mut atom_positions,
            &mut compound_atom_ids,
        );

        molecules.push(Molecule {
            id: molecule_id,
            compound_id: compound_id.clone(),
            sequence,
            content: m.content,
            r#type: m.r#type,
            start_byte: m.start_byte,
            end_byte: m.end_byte,
            numeric_value,
            numeric_unit,
            molecular_signature,
            timestamp: molecule_timestamp,
            atom_ids,
        });
        sequence += 1;

        if sequence % 100 == 0 {
            tokio::task::yield_now().await;
        }
    }

    for molecule in &mut molecules {
        for id in &system_tag_ids {
            if !molecule.atom_ids.contains(id) {
                molecule.atom_ids.push(id.clone());
            }
        }
    }

    let compound_timestamp = extract_in_content_timestamp(&cleaned)
        .unwrap_or(file_mtime_ms)
        .max(0);
    let compound_timestamp = if compound_timestamp == 0 { now_ms } else { compound_timestamp };

    let molecule_ids: Vec<String> = molecules.iter().map(|m| m.id.clone()).collect();
    let compound = Compound {
        id: compound_id,
        path: path.to_string_lossy().to_string(),
        timestamp: compound_timestamp,
        provenance,
        molecular_signature: fingerprint(&cleaned),
        compound_body: cleaned,
        bucket,
        molecule_ids,
        atom_ids: compound_atom_ids,
    };

    AtomizedFile {
        compound,
        molecules,
        atoms: atoms.into_values().collect(),
        tags: tag_rows,
        edges,
        atom_positions,
    }
}
