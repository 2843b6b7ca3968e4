//! Stable mapping from node names to Raft node ids.
//!
//! Membership speaks in node names; openraft needs a `u64`. A server's raft
//! id is the FNV-1a hash of its name unless that id is already taken, in
//! which case the next free id is used. Assignments are persisted so a
//! restarted server keeps the id its peers know it by.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::debug;

const ID_TABLE: TableDefinition<u64, &str> = TableDefinition::new("raft_node_ids");

#[derive(Default)]
struct Ids {
    by_name: HashMap<String, u64>,
    by_id: HashMap<u64, String>,
}

/// Persistent name ↔ raft id map.
pub struct NodeIdMap {
    db: Arc<Database>,
    ids: RwLock<Ids>,
}

impl NodeIdMap {
    /// Load the map stored in `db`, creating its table if needed.
    pub fn open(db: Arc<Database>) -> Result<Self, redb::Error> {
        let txn = db.begin_write()?;
        txn.open_table(ID_TABLE)?;
        txn.commit()?;

        let mut ids = Ids::default();
        {
            let txn = db.begin_read()?;
            let table = txn.open_table(ID_TABLE)?;
            for item in table.iter()? {
                let (k, v) = item?;
                ids.by_name.insert(v.value().to_string(), k.value());
                ids.by_id.insert(k.value(), v.value().to_string());
            }
        }
        debug!(entries = ids.by_name.len(), "node id map loaded");

        Ok(Self {
            db,
            ids: RwLock::new(ids),
        })
    }

    /// Raft id for `name`, assigning and persisting one if needed.
    pub fn get_or_insert(&self, name: &str) -> Result<u64, redb::Error> {
        if let Some(id) = self.raft_id(name) {
            return Ok(id);
        }

        let mut ids = self.ids.write().unwrap_or_else(|e| e.into_inner());
        if let Some(&id) = ids.by_name.get(name) {
            return Ok(id);
        }
        let mut id = name_hash(name);
        while ids.by_id.contains_key(&id) {
            id = id.wrapping_add(1).max(1);
        }

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(ID_TABLE)?;
            table.insert(id, name)?;
        }
        txn.commit()?;

        ids.by_name.insert(name.to_string(), id);
        ids.by_id.insert(id, name.to_string());
        debug!(name, raft_id = id, "assigned raft id");
        Ok(id)
    }

    pub fn raft_id(&self, name: &str) -> Option<u64> {
        let ids = self.ids.read().unwrap_or_else(|e| e.into_inner());
        ids.by_name.get(name).copied()
    }

    pub fn name(&self, raft_id: u64) -> Option<String> {
        let ids = self.ids.read().unwrap_or_else(|e| e.into_inner());
        ids.by_id.get(&raft_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.ids.read().unwrap_or_else(|e| e.into_inner()).by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// FNV-1a 64-bit, never zero (openraft reads 0 as "no node").
pub fn name_hash(name: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in name.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash.max(1)
}
