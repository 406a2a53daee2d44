//! swarmgrid-state: the worker registry for SwarmGrid.
//!
//! Backed by [redb](https://docs.rs/redb), the registry is the source of
//! truth for which workers are part of the cluster and what hardware they
//! contribute.
//!
//! # Architecture
//!
//! Every [`WorkerRecord`] is JSON-serialized into redb's `&[u8]` value
//! column under the composite key `{hostname}/{node_id}`. A hostname that
//! reconnects under a new orchestrator node id therefore owns two rows, and
//! all per-hostname queries are prefix scans over `{hostname}/`.
//!
//! Each mutation is one redb write transaction. redb admits a single writer
//! at a time, so concurrent calls for the same hostname are serialized and
//! either commit completely or not at all.
//!
//! The `WorkerRegistry` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`) and is handed explicitly to every component that needs it.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{epoch_secs, WorkerRegistry};
pub use types::*;
