//! Tag Infector: a background sweep that re-applies the
//! keyword catalog against every stored molecule so tagging converges
//! after the catalog changes, without requiring re-ingestion.
//!
//! Grounded on the source project's `par_iter`-over-files indexing pass in
//! `server/src/main.rs`: the same parallel-recompute-then-serialize-writes
//! shape, narrowed here to a cursor-paginated page of molecules rather than
//! a full repo walk.

use rayon::prelude::*;
use tracing::info;

use crate::config::KeywordCatalog;
use crate::error::EngineResult;
use crate::model::{Atom, Edge, TagRow, RELATION_HAS_TAG};
use crate::store::Store;
use crate::tags::{atom_id, content_tags};

/// Molecules re-scanned per cursor page.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Runs one full sweep over every stored molecule with the default batch
/// size, returning the number of molecules whose tag set changed.
pub async fn sweep(store: &Store, catalog: &KeywordCatalog) -> EngineResult<usize> {
    sweep_with_batch_size(store, catalog, DEFAULT_BATCH_SIZE).await
}

/// Cursor-paginates by molecule id, recomputing each page's keyword/temporal
/// tag set in parallel via rayon, then serially upserting whatever changed.
/// Yields between pages.
pub async fn sweep_with_batch_size(
    store: &Store,
    catalog: &KeywordCatalog,
    batch_size: usize,
) -> EngineResult<usize> {
    let mut cursor: Option<String> = None;
    let mut changed = 0usize;

    loop {
        let page = store.molecule_content_page(cursor.as_deref(), batch_size).await?;
        if page.is_empty() {
            break;
        }
        cursor = page.last().map(|(id, _, _)| id.clone());

        let recomputed: Vec<_> = page
            .par_iter()
            .map(|(molecule_id, bucket, content)| {
                (molecule_id.clone(), bucket.clone(), content_tags(content, catalog))
            })
            .collect();

        for (molecule_id, bucket, tags) in recomputed {
            let Some(existing) = store.molecule_by_id(&molecule_id).await? else { continue };

            let mut new_labels: Vec<String> = tags.iter().map(|t| t.label.clone()).collect();
            new_labels.sort();
            let mut old_labels = existing.tags.clone();
            old_labels.sort();
            if new_labels == old_labels {
                continue;
            }

            let mut atoms = Vec::with_capacity(tags.len());
            let mut tag_rows = Vec::with_capacity(tags.len());
            let mut edges = Vec::with_capacity(tags.len());
            let mut atom_ids = Vec::with_capacity(tags.len());
            for extracted in &tags {
                let id = atom_id(&extracted.label);
                atoms.push(Atom {
                    id: id.clone(),
                    label: extracted.label.clone(),
                    r#type: extracted.r#type,
                    weight: extracted.weight,
                });
                tag_rows.push(TagRow { atom_id: id.clone(), tag: extracted.label.clone(), bucket: bucket.clone() });
                edges.push(Edge {
                    source_id: existing.compound_id.clone(),
                    target_id: id.clone(),
                    relation: RELATION_HAS_TAG.to_string(),
                    weight: extracted.weight,
                });
                atom_ids.push(id);
            }

            store.upsert_atoms(&atoms).await?;
            store.upsert_tags(&tag_rows).await?;
            store.upsert_edges(&edges).await?;
            store.update_molecule_atom_ids(&molecule_id, &atom_ids).await?;
            changed += 1;
        }

        info!(page_size = page.len(), changed, "tag infector sweep batch complete");
        tokio::task::yield_now().await;
    }

    Ok(changed)
}
