//! Store: the relational substitution point. SQLite via
//! `rusqlite` with bundled SQLite and FTS5, chosen the way the source
//! project reaches for `rusqlite` + a transaction-batched write path for
//! its own index — see `ops.rs` for the batch-flush pattern grounded on
//! that file.

mod schema;

pub mod ops;

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;

use crate::error::{EngineError, EngineResult};

pub use ops::{FtsRow, WalkHit};

/// Rows per batch in every bulk upsert.
pub const BATCH_SIZE: usize = 50;

/// Bounded retry schedule for transient storage errors.
const RETRY_BACKOFF_MS: [u64; 3] = [50, 200, 1000];

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::StorageFatal(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        schema::init(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

/// Runs a fallible, blocking store operation, retrying up to
/// `RETRY_BACKOFF_MS.len()` times on `StorageTransient` with an exponential
/// backoff schedule. Exhaustion is reported as-is: the last attempt's
/// `StorageTransient` is what the caller sees, so repeated transient
/// failures accumulate into a fatal-looking terminal error upstream.
pub(crate) async fn retry_transient<F, T>(mut op: F) -> EngineResult<T>
where
    F: FnMut() -> EngineResult<T>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(EngineError::StorageTransient(msg)) => {
                if attempt >= RETRY_BACKOFF_MS.len() {
                    return Err(EngineError::StorageFatal(format!(
                        "transient error persisted after {attempt} retries: {msg}"
                    )));
                }
                tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS[attempt])).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
