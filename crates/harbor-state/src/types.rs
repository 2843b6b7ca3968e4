//! Domain types for the catalog.
//!
//! These are the records persisted by the state store and carried over the
//! RPC layer. All types are serializable to/from JSON for storage in redb
//! tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Service ID (and name) the servers register themselves under.
pub const CLUSTER_SERVICE_ID: &str = "harbor";
pub const CLUSTER_SERVICE_NAME: &str = "harbor";

/// Check ID of the membership-derived node health check.
pub const SERF_CHECK_ID: &str = "serfHealth";
pub const SERF_CHECK_NAME: &str = "Serf Health Status";

// ── Nodes ──────────────────────────────────────────────────────────

/// A catalog node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub node: String,
    pub address: String,
}

// ── Services ───────────────────────────────────────────────────────

/// A service instance registered on a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeService {
    /// Unique within the node. Defaults to `service` when registered empty.
    pub id: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub port: u16,
}

/// All services on one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeServices {
    pub node: Node,
    pub services: BTreeMap<String, NodeService>,
}

/// Flattened (node, service instance) pair returned by service queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceNode {
    pub node: String,
    pub address: String,
    pub service_id: String,
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_tag: Option<String>,
    pub service_port: u16,
}

/// A service instance together with its node and every relevant check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckServiceNode {
    pub node: Node,
    pub service: NodeService,
    pub checks: Vec<HealthCheck>,
}

// ── Health ─────────────────────────────────────────────────────────

/// Health state of a check.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Passing,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Passing => "passing",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(HealthStatus::Unknown),
            "passing" => Ok(HealthStatus::Passing),
            "warning" => Ok(HealthStatus::Warning),
            "critical" => Ok(HealthStatus::Critical),
            other => Err(format!("unknown health status: {other}")),
        }
    }
}

/// A health check bound to a node and optionally to one of its services.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheck {
    pub node: String,
    /// Unique within the node. Defaults to `name` when registered empty.
    pub check_id: String,
    pub name: String,
    pub status: HealthStatus,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
}

// ── KV ─────────────────────────────────────────────────────────────

/// A key/value entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirEntry {
    pub key: String,
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub value: Vec<u8>,
    /// Session currently holding the lock on this key, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default)]
    pub lock_index: u64,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

// ── Sessions ───────────────────────────────────────────────────────

/// Default delay before a lock released by an invalidated session can be
/// re-acquired.
pub const DEFAULT_LOCK_DELAY: Duration = Duration::from_secs(15);

/// A session owned by a node. KV locks are held by sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    #[serde(default)]
    pub id: String,
    pub node: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_lock_delay")]
    pub lock_delay: Duration,
    #[serde(default)]
    pub create_index: u64,
}

fn default_lock_delay() -> Duration {
    DEFAULT_LOCK_DELAY
}

// ── Coordinates ────────────────────────────────────────────────────

/// A Vivaldi network coordinate. Distances are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Coordinate {
    pub vec: Vec<f64>,
    pub error: f64,
    pub adjustment: f64,
    pub height: f64,
}

impl Coordinate {
    /// Coordinate at the origin with the given dimensionality.
    pub fn new(dimensionality: usize) -> Self {
        Self {
            vec: vec![0.0; dimensionality],
            error: 1.5,
            adjustment: 0.0,
            height: 1.0e-5,
        }
    }

    /// Whether both coordinates live in the same space.
    pub fn is_compatible_with(&self, other: &Coordinate) -> bool {
        self.vec.len() == other.vec.len()
    }

    /// Estimated round trip time to `other`. `None` if the coordinates
    /// have different dimensionality.
    pub fn distance_to(&self, other: &Coordinate) -> Option<Duration> {
        if !self.is_compatible_with(other) {
            return None;
        }
        let sq: f64 = self
            .vec
            .iter()
            .zip(&other.vec)
            .map(|(a, b)| (a - b) * (a - b))
            .sum();
        let dist = sq.sqrt() + self.height + other.height;
        let adjusted = dist + self.adjustment + other.adjustment;
        let secs = if adjusted > 0.0 { adjusted } else { dist };
        Some(Duration::from_secs_f64(secs.max(0.0)))
    }
}

/// A node's coordinate as stored in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinateEntry {
    pub node: String,
    pub coord: Coordinate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_status_parses_and_displays() {
        for s in [
            HealthStatus::Unknown,
            HealthStatus::Passing,
            HealthStatus::Warning,
            HealthStatus::Critical,
        ] {
            assert_eq!(s.to_string().parse::<HealthStatus>().unwrap(), s);
        }
        assert!("bogus".parse::<HealthStatus>().is_err());
    }

    #[test]
    fn distance_uses_height_and_adjustment() {
        let mut a = Coordinate::new(2);
        let mut b = Coordinate::new(2);
        a.vec = vec![0.0, 0.0];
        b.vec = vec![3.0, 4.0];
        a.height = 0.0;
        b.height = 0.0;
        assert_eq!(a.distance_to(&b), Some(Duration::from_secs(5)));

        a.adjustment = 1.0;
        assert_eq!(a.distance_to(&b), Some(Duration::from_secs(6)));

        // Negative adjustments that would go below zero are ignored.
        a.adjustment = -10.0;
        assert_eq!(a.distance_to(&b), Some(Duration::from_secs(5)));
    }

    #[test]
    fn incompatible_coordinates_have_no_distance() {
        assert_eq!(Coordinate::new(2).distance_to(&Coordinate::new(3)), None);
    }

    #[test]
    fn dir_entry_defaults_from_partial_json() {
        let ent: DirEntry = serde_json::from_str(r#"{"key":"foo"}"#).unwrap();
        assert_eq!(ent.key, "foo");
        assert_eq!(ent.session, None);
        assert_eq!(ent.modify_index, 0);
    }
}
