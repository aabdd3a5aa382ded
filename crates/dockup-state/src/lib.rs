//! dockup-state: embedded state store for dockup.
//!
//! Backed by [redb](https://docs.rs/redb), persists the version history,
//! settings overrides, container snapshots, and finished jobs.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! History keys (`{container}/{applied_at_ms}/{seq}`) sort chronologically
//! per container, so retention trimming and descending listings are prefix
//! scans.
//!
//! Every mutation (history insert + trim, settings patch, import) runs in a
//! single write transaction: partial results are never observable.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{ImportSummary, StateStore};
pub use types::*;
