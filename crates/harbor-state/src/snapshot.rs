//! Point-in-time read views over the catalog.

use std::collections::{BTreeMap, BTreeSet};

use redb::{ReadOnlyTable, ReadTransaction};
use serde::{Deserialize, Serialize};

use crate::error::StateResult;
use crate::store::{get_json, scan_json, scan_keys};
use crate::tables::{self, *};
use crate::types::*;

/// Full contents of the store, as written into FSM snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoreDump {
    pub nodes: Vec<Node>,
    /// `(node, service)` pairs.
    pub services: Vec<(String, NodeService)>,
    pub checks: Vec<HealthCheck>,
    pub kvs: Vec<DirEntry>,
    pub sessions: Vec<Session>,
    pub coordinates: Vec<CoordinateEntry>,
    /// Per-table modify index keyed by [`Table::as_str`].
    pub indexes: BTreeMap<String, u64>,
}

/// An isolated read view. Writes committed after it was taken are not
/// visible through it.
pub struct StateSnapshot {
    txn: ReadTransaction,
}

type JsonReadTable = ReadOnlyTable<&'static str, &'static [u8]>;

impl StateSnapshot {
    pub(crate) fn new(txn: ReadTransaction) -> Self {
        Self { txn }
    }

    fn table(
        &self,
        def: redb::TableDefinition<'static, &'static str, &'static [u8]>,
    ) -> StateResult<JsonReadTable> {
        self.txn.open_table(def).map_err(map_err!(Table))
    }

    fn all<T: serde::de::DeserializeOwned>(
        &self,
        def: redb::TableDefinition<'static, &'static str, &'static [u8]>,
    ) -> StateResult<Vec<T>> {
        let table = self.table(def)?;
        Ok(scan_json(&table, "")?.into_iter().map(|(_, v)| v).collect())
    }

    // ── Indexes ────────────────────────────────────────────────────

    /// Last log index that modified `table`.
    pub fn index(&self, table: Table) -> StateResult<u64> {
        let idx = self.txn.open_table(INDEXES).map_err(map_err!(Table))?;
        let value = idx
            .get(table.as_str())
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0);
        Ok(value)
    }

    /// Highest modify index among `tables`.
    pub fn max_index(&self, tables: &[Table]) -> StateResult<u64> {
        let mut max = 0;
        for table in tables {
            max = max.max(self.index(*table)?);
        }
        Ok(max)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    pub fn get_node(&self, name: &str) -> StateResult<Option<Node>> {
        get_json(&self.table(NODES)?, name)
    }

    /// Every node, ordered by name.
    pub fn nodes(&self) -> StateResult<Vec<Node>> {
        self.all(NODES)
    }

    // ── Services ───────────────────────────────────────────────────

    /// The node record and every service on it, or `None` for an unknown
    /// node.
    pub fn node_services(&self, node: &str) -> StateResult<Option<NodeServices>> {
        let Some(record) = self.get_node(node)? else {
            return Ok(None);
        };
        let table = self.table(SERVICES)?;
        let services = scan_json::<NodeService>(&table, &tables::prefix(&[node]))?
            .into_iter()
            .map(|(_, svc)| (svc.id.clone(), svc))
            .collect();
        Ok(Some(NodeServices {
            node: record,
            services,
        }))
    }

    /// Service name to the sorted set of tags across its instances.
    pub fn services(&self) -> StateResult<BTreeMap<String, Vec<String>>> {
        let mut out: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for svc in self.all::<NodeService>(SERVICES)? {
            let tags = out.entry(svc.service).or_default();
            if let Some(tag) = svc.tag {
                tags.insert(tag);
            }
        }
        Ok(out
            .into_iter()
            .map(|(name, tags)| (name, tags.into_iter().collect()))
            .collect())
    }

    /// Every instance of `service`, ordered by node then service ID.
    pub fn service_nodes(&self, service: &str) -> StateResult<Vec<ServiceNode>> {
        let nodes = self.table(NODES)?;
        let services = self.table(SERVICES)?;
        let index = self.table(SERVICE_INDEX)?;

        let mut out = Vec::new();
        for key in scan_keys(&index, &tables::prefix(&[service]))? {
            let parts = tables::split(&key);
            let &[_, node, id] = parts.as_slice() else {
                continue;
            };
            let Some(svc) = get_json::<NodeService>(&services, &tables::key(&[node, id]))? else {
                continue;
            };
            let Some(record) = get_json::<Node>(&nodes, node)? else {
                continue;
            };
            out.push(ServiceNode {
                node: record.node,
                address: record.address,
                service_id: svc.id,
                service_name: svc.service,
                service_tag: svc.tag,
                service_port: svc.port,
            });
        }
        Ok(out)
    }

    /// Instances of `service` carrying exactly `tag`.
    pub fn service_tag_nodes(&self, service: &str, tag: &str) -> StateResult<Vec<ServiceNode>> {
        let mut out = self.service_nodes(service)?;
        out.retain(|sn| sn.service_tag.as_deref() == Some(tag));
        Ok(out)
    }

    // ── Checks ─────────────────────────────────────────────────────

    /// Checks on `node`, ordered by check ID.
    pub fn node_checks(&self, node: &str) -> StateResult<Vec<HealthCheck>> {
        let table = self.table(CHECKS)?;
        Ok(scan_json(&table, &tables::prefix(&[node]))?
            .into_iter()
            .map(|(_, c)| c)
            .collect())
    }

    /// Checks bound to any instance of `service`.
    pub fn service_checks(&self, service: &str) -> StateResult<Vec<HealthCheck>> {
        let mut out = self.all::<HealthCheck>(CHECKS)?;
        out.retain(|c| c.service_name.as_deref() == Some(service));
        Ok(out)
    }

    pub fn checks_in_state(&self, status: HealthStatus) -> StateResult<Vec<HealthCheck>> {
        let checks = self.table(CHECKS)?;
        let index = self.table(CHECK_STATUS_INDEX)?;
        let mut out = Vec::new();
        for key in scan_keys(&index, &tables::prefix(&[status.as_str()]))? {
            let parts = tables::split(&key);
            let &[_, node, id] = parts.as_slice() else {
                continue;
            };
            if let Some(check) = get_json(&checks, &tables::key(&[node, id]))? {
                out.push(check);
            }
        }
        Ok(out)
    }

    /// Each instance of `service` with its node and checks. The checks of
    /// one entry are the instance's own checks first, then the node-level
    /// checks, each group ordered by check ID.
    pub fn check_service_nodes(&self, service: &str) -> StateResult<Vec<CheckServiceNode>> {
        let instances = self.service_nodes(service)?;
        self.join_checks(instances)
    }

    pub fn check_service_tag_nodes(
        &self,
        service: &str,
        tag: &str,
    ) -> StateResult<Vec<CheckServiceNode>> {
        let instances = self.service_tag_nodes(service, tag)?;
        self.join_checks(instances)
    }

    fn join_checks(&self, instances: Vec<ServiceNode>) -> StateResult<Vec<CheckServiceNode>> {
        let mut out = Vec::with_capacity(instances.len());
        for sn in instances {
            let (mut own, mut node_level) = (Vec::new(), Vec::new());
            for check in self.node_checks(&sn.node)? {
                match check.service_id.as_deref() {
                    Some(id) if id == sn.service_id => own.push(check),
                    Some(_) => {}
                    None => node_level.push(check),
                }
            }
            own.append(&mut node_level);
            out.push(CheckServiceNode {
                node: Node {
                    node: sn.node,
                    address: sn.address,
                },
                service: NodeService {
                    id: sn.service_id,
                    service: sn.service_name,
                    tag: sn.service_tag,
                    port: sn.service_port,
                },
                checks: own,
            });
        }
        Ok(out)
    }

    // ── KV ─────────────────────────────────────────────────────────

    pub fn kvs_get(&self, key: &str) -> StateResult<Option<DirEntry>> {
        get_json(&self.table(KVS)?, key)
    }

    /// Entries whose key starts with `prefix`, in key order.
    pub fn kvs_list(&self, prefix: &str) -> StateResult<Vec<DirEntry>> {
        let table = self.table(KVS)?;
        Ok(scan_json(&table, prefix)?.into_iter().map(|(_, e)| e).collect())
    }

    /// Keys under `prefix`. With a separator, keys that continue past the
    /// next separator collapse into one entry ending at that separator.
    pub fn kvs_list_keys(&self, prefix: &str, separator: Option<&str>) -> StateResult<Vec<String>> {
        let keys = scan_keys(&self.table(KVS)?, prefix)?;
        let Some(sep) = separator.filter(|s| !s.is_empty()) else {
            return Ok(keys);
        };
        let mut out: Vec<String> = Vec::new();
        for key in keys {
            let collapsed = match key[prefix.len()..].find(sep) {
                Some(pos) => key[..prefix.len() + pos + sep.len()].to_string(),
                None => key,
            };
            if out.last() != Some(&collapsed) {
                out.push(collapsed);
            }
        }
        Ok(out)
    }

    // ── Sessions ───────────────────────────────────────────────────

    pub fn session_get(&self, id: &str) -> StateResult<Option<Session>> {
        get_json(&self.table(SESSIONS)?, id)
    }

    pub fn session_list(&self) -> StateResult<Vec<Session>> {
        self.all(SESSIONS)
    }

    pub fn node_sessions(&self, node: &str) -> StateResult<Vec<Session>> {
        let mut out = self.session_list()?;
        out.retain(|s| s.node == node);
        Ok(out)
    }

    // ── Coordinates ────────────────────────────────────────────────

    pub fn coordinate_get(&self, node: &str) -> StateResult<Option<Coordinate>> {
        get_json(&self.table(COORDINATES)?, node)
    }

    pub fn coordinates(&self) -> StateResult<Vec<CoordinateEntry>> {
        let table = self.table(COORDINATES)?;
        Ok(scan_json::<Coordinate>(&table, "")?
            .into_iter()
            .map(|(node, coord)| CoordinateEntry { node, coord })
            .collect())
    }

    // ── Dump ───────────────────────────────────────────────────────

    /// Everything in the store, for FSM snapshots.
    pub fn dump(&self) -> StateResult<StoreDump> {
        let services = scan_json::<NodeService>(&self.table(SERVICES)?, "")?
            .into_iter()
            .map(|(key, svc)| {
                let node = tables::split(&key)[0].to_string();
                (node, svc)
            })
            .collect();
        let mut indexes = BTreeMap::new();
        for table in Table::ALL {
            indexes.insert(table.as_str().to_string(), self.index(table)?);
        }
        Ok(StoreDump {
            nodes: self.nodes()?,
            services,
            checks: self.all(CHECKS)?,
            kvs: self.all(KVS)?,
            sessions: self.session_list()?,
            coordinates: self.coordinates()?,
            indexes,
        })
    }
}
