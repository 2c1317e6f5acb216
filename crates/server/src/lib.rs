//! AtomVault HTTP boundary library — the `api` module is also used directly
//! by integration tests, so it's exposed here rather than only inside the bin.

pub mod api;
