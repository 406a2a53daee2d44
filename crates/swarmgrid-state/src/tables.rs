//! redb table definitions for the worker registry.
//!
//! Keys are `{hostname}/{node_id}`; values are JSON-serialized
//! [`WorkerRecord`](crate::WorkerRecord)s.

use redb::TableDefinition;

/// Worker records keyed by `{hostname}/{node_id}`.
pub const WORKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("workers");

/// Separator between hostname and node id in [`WORKERS`] keys.
pub const KEY_SEPARATOR: char = '/';
