//! redb table definitions for the catalog state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys join their parts with `\0`, see [`key`].

use redb::TableDefinition;

use crate::error::{StateError, StateResult};

/// Node records keyed by `{node}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Service instances keyed by `{node}\0{service_id}`.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

/// Secondary index `{service_name}\0{node}\0{service_id}`, empty values.
pub const SERVICE_INDEX: TableDefinition<&str, &[u8]> = TableDefinition::new("service_index");

/// Health checks keyed by `{node}\0{check_id}`.
pub const CHECKS: TableDefinition<&str, &[u8]> = TableDefinition::new("checks");

/// Secondary index `{status}\0{node}\0{check_id}`, empty values.
pub const CHECK_STATUS_INDEX: TableDefinition<&str, &[u8]> =
    TableDefinition::new("check_status_index");

/// KV entries keyed by their user key.
pub const KVS: TableDefinition<&str, &[u8]> = TableDefinition::new("kvs");

/// Sessions keyed by session id.
pub const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

/// Network coordinates keyed by `{node}`.
pub const COORDINATES: TableDefinition<&str, &[u8]> = TableDefinition::new("coordinates");

/// Opaque metadata owned by the replication layer (applied log id,
/// membership). Not part of snapshots.
pub const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

/// Last modifying log index per logical table, keyed by [`Table::as_str`].
pub const INDEXES: TableDefinition<&str, u64> = TableDefinition::new("indexes");

/// Logical tables tracked for modification indexes and watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    Nodes,
    Services,
    Checks,
    Kvs,
    Sessions,
    Coordinates,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::Nodes,
        Table::Services,
        Table::Checks,
        Table::Kvs,
        Table::Sessions,
        Table::Coordinates,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Table::Nodes => "nodes",
            Table::Services => "services",
            Table::Checks => "checks",
            Table::Kvs => "kvs",
            Table::Sessions => "sessions",
            Table::Coordinates => "coordinates",
        }
    }

    pub(crate) fn slot(self) -> usize {
        self as usize
    }
}

/// Build a composite key from its parts.
pub fn key(parts: &[&str]) -> String {
    parts.join("\0")
}

/// Prefix matching every composite key whose leading parts are `parts`.
pub fn prefix(parts: &[&str]) -> String {
    let mut p = parts.join("\0");
    p.push('\0');
    p
}

/// Reject a name that cannot be a composite key part: a `\0` inside it
/// would let its prefix scans reach into other rows.
pub fn check_key_part(what: &str, part: &str) -> StateResult<()> {
    if part.contains('\0') {
        return Err(StateError::Invalid(format!("{what} {part:?} contains a NUL character")));
    }
    Ok(())
}

/// Split a composite key back into its parts.
pub fn split(key: &str) -> Vec<&str> {
    key.split('\0').collect()
}
