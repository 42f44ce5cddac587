//! Dual-index engines for the Argus authorization search index.
//!
//! # Purpose
//! Policies live in exactly one of two engines: the document engine (an
//! inverted index for `any` and term-representable policies) or the
//! evaluation engine (per-action in-memory policy maps evaluated per
//! request). The [`facade::Index`] routes mutations between them and fans
//! queries out across both.
pub mod doc;
pub mod eval;
pub mod facade;

pub use doc::DocEngine;
pub use doc::store::{DocumentStore, StoreError, StoreResult};
pub use eval::EvalEngine;
pub use facade::{Index, IndexStats, SearchDebug, SearchError};
