//! Request and reply structs for the catalog RPC surface.
//!
//! Write requests double as replicated log payloads, so everything here is
//! plain data with serde derives and no behavior beyond defaulting.

use crate::types::{
    CheckServiceNode, Coordinate, DirEntry, HealthCheck, HealthStatus, Node, NodeService,
    NodeServices, ServiceNode, Session,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ── Blocking queries ───────────────────────────────────────────────

/// Options common to every read endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryOptions {
    /// Block until the relevant index exceeds this value. Zero never blocks.
    #[serde(default)]
    pub min_query_index: u64,
    /// Upper bound on how long to block. Server default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_query_time: Option<Duration>,
    /// Serve from a follower's local store instead of forwarding to the leader.
    #[serde(default)]
    pub allow_stale: bool,
}

/// Metadata attached to every read reply.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryMeta {
    pub index: u64,
    pub known_leader: bool,
}

// ── Catalog ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterRequest {
    pub datacenter: String,
    pub node: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<NodeService>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<HealthCheck>,
}

impl RegisterRequest {
    /// Fill the identity defaults the catalog relies on: a service without
    /// an ID takes its name, a check without an ID takes its name, and a
    /// check always belongs to the registering node.
    pub fn normalize(&mut self) {
        if let Some(svc) = self.service.as_mut() {
            if svc.id.is_empty() {
                svc.id = svc.service.clone();
            }
        }
        if let Some(chk) = self.check.as_mut() {
            if chk.check_id.is_empty() {
                chk.check_id = chk.name.clone();
            }
            if chk.node.is_empty() {
                chk.node = self.node.clone();
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeregisterRequest {
    pub datacenter: String,
    pub node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_id: Option<String>,
}

/// A read scoped only by datacenter (`ListNodes`, `ListServices`, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DcSpecificRequest {
    pub datacenter: String,
    /// Sort results by estimated round trip time from this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub near: Option<String>,
    #[serde(default)]
    pub options: QueryOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceNodesRequest {
    pub datacenter: String,
    pub service_name: String,
    /// Only instances carrying exactly this tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_tag: Option<String>,
    /// Health queries only: drop instances with any non-passing check.
    #[serde(default)]
    pub passing_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub near: Option<String>,
    #[serde(default)]
    pub options: QueryOptions,
}

/// A read scoped to one node (`NodeServices`, `NodeChecks`, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSpecificRequest {
    pub datacenter: String,
    pub node: String,
    #[serde(default)]
    pub options: QueryOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChecksInStateRequest {
    pub datacenter: String,
    pub state: HealthStatus,
    #[serde(default)]
    pub options: QueryOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexedNodes {
    pub nodes: Vec<Node>,
    pub meta: QueryMeta,
}

/// Service name to the set of tags seen on its instances.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexedServices {
    pub services: BTreeMap<String, Vec<String>>,
    pub meta: QueryMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexedServiceNodes {
    pub service_nodes: Vec<ServiceNode>,
    pub meta: QueryMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexedNodeServices {
    pub node_services: Option<NodeServices>,
    pub meta: QueryMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexedHealthChecks {
    pub checks: Vec<HealthCheck>,
    pub meta: QueryMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexedCheckServiceNodes {
    pub nodes: Vec<CheckServiceNode>,
    pub meta: QueryMeta,
}

// ── KV ─────────────────────────────────────────────────────────────

/// Operation carried by `KVS.Apply`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KvsOp {
    #[default]
    Set,
    Delete,
    /// Delete only if `modify_index` matches.
    DeleteCas,
    DeleteTree,
    /// Set only if `modify_index` matches (zero means "must not exist").
    Cas,
    Lock,
    Unlock,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvsRequest {
    pub datacenter: String,
    pub op: KvsOp,
    pub dir_ent: DirEntry,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyRequest {
    pub datacenter: String,
    pub key: String,
    #[serde(default)]
    pub options: QueryOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyListRequest {
    pub datacenter: String,
    pub prefix: String,
    /// Collapse keys below the first separator after the prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
    #[serde(default)]
    pub options: QueryOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexedDirEntries {
    pub entries: Vec<DirEntry>,
    pub meta: QueryMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexedKeyList {
    pub keys: Vec<String>,
    pub meta: QueryMeta,
}

// ── Transactions ───────────────────────────────────────────────────

/// Verb of a single operation inside a KV transaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KvsAtomicVerb {
    Set,
    Delete,
    DeleteCas,
    DeleteTree,
    Cas,
    Lock,
    Unlock,
    Get,
    GetTree,
    /// Fail unless the key is locked by `dir_ent.session`.
    CheckSession,
    /// Fail unless the key's modify index equals `dir_ent.modify_index`.
    CheckIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvsAtomicOp {
    pub verb: KvsAtomicVerb,
    pub dir_ent: DirEntry,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvsAtomicRequest {
    pub datacenter: String,
    pub ops: Vec<KvsAtomicOp>,
}

/// Why a transaction operation failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvsAtomicError {
    pub op_index: usize,
    pub what: String,
}

/// Outcome of a transaction: either results (one per read/write op that
/// yields an entry) or errors, never both.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvsAtomicResponse {
    pub results: Vec<DirEntry>,
    pub errors: Vec<KvsAtomicError>,
}

// ── Sessions ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionOp {
    #[default]
    Create,
    Destroy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRequest {
    pub datacenter: String,
    pub op: SessionOp,
    pub session: Session,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSpecificRequest {
    pub datacenter: String,
    pub session_id: String,
    #[serde(default)]
    pub options: QueryOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexedSessions {
    pub sessions: Vec<Session>,
    pub meta: QueryMeta,
}

// ── Coordinates ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinateUpdateRequest {
    pub datacenter: String,
    pub node: String,
    pub coord: Coordinate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IndexedCoordinate {
    pub coord: Option<Coordinate>,
    pub meta: QueryMeta,
}
