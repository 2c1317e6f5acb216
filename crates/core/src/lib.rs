//! AtomVault core — content atomization, persistence, and tag-walk retrieval.

pub mod atomizer;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod inflate;
pub mod infector;
pub mod model;
pub mod sanitize;
pub mod scheduler;
pub mod search;
pub mod splitter;
pub mod store;
pub mod tags;
pub mod timestamp;

pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use model::{Atom, AtomPosition, AtomType, Compound, Edge, Molecule, MoleculeType, Provenance, SourceRecord, TagRow};
