//! Membership oracle — tracks cluster members from heartbeats.
//!
//! Every member periodically heartbeats the peers it was told to join.
//! A member not heard from within the dead timeout is marked failed; the
//! leader later reconciles that into the catalog. Server members carry
//! tags describing their datacenter, RPC port and raft identity.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Tag values understood by [`ServerParts::from_member`].
pub const TAG_ROLE: &str = "role";
pub const ROLE_SERVER: &str = "harbor";
pub const ROLE_NODE: &str = "node";
pub const TAG_DC: &str = "dc";
pub const TAG_PORT: &str = "port";
pub const TAG_RAFT_ID: &str = "raft_id";
pub const TAG_BOOTSTRAP: &str = "bootstrap";
pub const TAG_EXPECT: &str = "expect";
pub const TAG_NON_VOTER: &str = "nonvoter";

/// Status of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Alive,
    Leaving,
    Left,
    Failed,
}

/// A cluster member as seen by the membership oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    /// Host part of the member's advertised address.
    pub addr: String,
    pub port: u16,
    pub tags: BTreeMap<String, String>,
    pub status: MemberStatus,
}

impl Member {
    pub fn new(name: impl Into<String>, addr: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            port,
            tags: BTreeMap::new(),
            status: MemberStatus::Alive,
        }
    }

    pub fn with_tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }

    pub fn datacenter(&self) -> Option<&str> {
        self.tags.get(TAG_DC).map(String::as_str)
    }
}

/// Everything needed to talk to a server, extracted from its tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerParts {
    pub name: String,
    pub datacenter: String,
    /// `host:port` for RPC (and the raft transport, which shares it).
    pub rpc_addr: String,
    pub raft_id: u64,
    pub bootstrap: bool,
    pub expect: u32,
    pub voter: bool,
    pub status: MemberStatus,
}

impl ServerParts {
    /// `None` unless the member advertises the server role with a valid
    /// datacenter and port.
    pub fn from_member(m: &Member) -> Option<Self> {
        if m.tags.get(TAG_ROLE).map(String::as_str) != Some(ROLE_SERVER) {
            return None;
        }
        let datacenter = m.tags.get(TAG_DC)?.clone();
        let port: u16 = match m.tags.get(TAG_PORT) {
            Some(p) => p.parse().ok()?,
            None => m.port,
        };
        let raft_id = m
            .tags
            .get(TAG_RAFT_ID)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let expect = m
            .tags
            .get(TAG_EXPECT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Some(Self {
            name: m.name.clone(),
            datacenter,
            rpc_addr: format!("{}:{}", m.addr, port),
            raft_id,
            bootstrap: m.tags.contains_key(TAG_BOOTSTRAP),
            expect,
            voter: !m.tags.contains_key(TAG_NON_VOTER),
            status: m.status,
        })
    }
}

/// The membership capability consumed by agents and servers.
pub trait Membership: Send + Sync {
    /// This node's own member record.
    fn local_member(&self) -> Member;

    /// Members of the local datacenter, including this node.
    fn lan_members(&self) -> Vec<Member>;

    /// Every known member in every datacenter.
    fn members(&self) -> Vec<Member>;

    /// Fires whenever a server becomes reachable.
    fn server_up(&self) -> watch::Receiver<u64>;

    /// Fires on any member status change.
    fn changes(&self) -> watch::Receiver<u64>;

    /// Alive servers of `datacenter`.
    fn servers(&self, datacenter: &str) -> Vec<ServerParts> {
        self.members()
            .iter()
            .filter_map(ServerParts::from_member)
            .filter(|s| s.datacenter == datacenter && s.status == MemberStatus::Alive)
            .collect()
    }

    /// Datacenters with at least one known server, sorted.
    fn datacenters(&self) -> Vec<String> {
        let dcs: BTreeSet<String> = self
            .members()
            .iter()
            .filter_map(ServerParts::from_member)
            .map(|s| s.datacenter)
            .collect();
        dcs.into_iter().collect()
    }
}

struct Tracked {
    member: Member,
    last_seen: Instant,
}

/// Heartbeat-driven membership over a fixed set of peers.
pub struct StaticMembership {
    local: Member,
    members: Mutex<HashMap<String, Tracked>>,
    /// Dead node detection threshold.
    dead_timeout: Duration,
    /// How long a failed or left member is kept before being forgotten.
    reap_timeout: Duration,
    server_up: watch::Sender<u64>,
    changes: watch::Sender<u64>,
}

impl StaticMembership {
    pub fn new(local: Member) -> Self {
        Self {
            local,
            members: Mutex::new(HashMap::new()),
            dead_timeout: Duration::from_secs(30),
            reap_timeout: Duration::from_secs(72 * 3600),
            server_up: watch::channel(0).0,
            changes: watch::channel(0).0,
        }
    }

    /// Set the dead node detection timeout.
    pub fn with_dead_timeout(mut self, timeout: Duration) -> Self {
        self.dead_timeout = timeout;
        self
    }

    /// Set how long failed members linger before removal.
    pub fn with_reap_timeout(mut self, timeout: Duration) -> Self {
        self.reap_timeout = timeout;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Tracked>> {
        self.members.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(tx: &watch::Sender<u64>) {
        tx.send_modify(|n| *n += 1);
    }

    /// Record a heartbeat from `member`. Returns true if it was not alive
    /// before (new, failed or left).
    pub fn heartbeat(&self, mut member: Member) -> bool {
        if member.name == self.local.name {
            return false;
        }
        member.status = MemberStatus::Alive;
        let is_server = ServerParts::from_member(&member).is_some();
        let mut members = self.lock();
        let previous = members.insert(
            member.name.clone(),
            Tracked {
                member: member.clone(),
                last_seen: Instant::now(),
            },
        );
        drop(members);

        let revived = previous
            .as_ref()
            .is_none_or(|p| p.member.status != MemberStatus::Alive);
        let changed = previous.as_ref().is_none_or(|p| p.member != member);
        if revived {
            info!(member = %member.name, addr = %member.addr, is_server, "member alive");
            if is_server {
                Self::bump(&self.server_up);
            }
        } else {
            debug!(member = %member.name, "heartbeat received");
        }
        if changed {
            Self::bump(&self.changes);
        }
        revived
    }

    /// Mark a member as having left gracefully.
    pub fn leave(&self, name: &str) -> bool {
        let mut members = self.lock();
        let Some(tracked) = members.get_mut(name) else {
            return false;
        };
        tracked.member.status = MemberStatus::Left;
        tracked.last_seen = Instant::now();
        drop(members);
        info!(member = %name, "member left");
        Self::bump(&self.changes);
        true
    }

    /// Mark members silent for longer than the dead timeout as failed and
    /// forget members failed or left for longer than the reap timeout.
    /// Returns the names newly marked failed.
    pub fn reap_dead_nodes(&self) -> Vec<String> {
        let now = Instant::now();
        let mut failed = Vec::new();
        let mut removed = Vec::new();
        let mut members = self.lock();
        for (name, tracked) in members.iter_mut() {
            let silent = now.duration_since(tracked.last_seen);
            match tracked.member.status {
                MemberStatus::Alive | MemberStatus::Leaving if silent > self.dead_timeout => {
                    tracked.member.status = MemberStatus::Failed;
                    failed.push(name.clone());
                }
                MemberStatus::Failed | MemberStatus::Left if silent > self.reap_timeout => {
                    removed.push(name.clone());
                }
                _ => {}
            }
        }
        for name in &removed {
            members.remove(name);
        }
        drop(members);

        for name in &failed {
            warn!(member = %name, "member failed, no heartbeat within timeout");
        }
        for name in &removed {
            info!(member = %name, "member reaped");
        }
        if !failed.is_empty() || !removed.is_empty() {
            Self::bump(&self.changes);
        }
        failed
    }

    pub fn get(&self, name: &str) -> Option<Member> {
        if name == self.local.name {
            return Some(self.local.clone());
        }
        self.lock().get(name).map(|t| t.member.clone())
    }
}

impl Membership for StaticMembership {
    fn local_member(&self) -> Member {
        self.local.clone()
    }

    fn lan_members(&self) -> Vec<Member> {
        let dc = self.local.datacenter();
        let mut out: Vec<Member> = self
            .lock()
            .values()
            .filter(|t| t.member.datacenter() == dc)
            .map(|t| t.member.clone())
            .collect();
        out.push(self.local.clone());
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    fn members(&self) -> Vec<Member> {
        let mut out: Vec<Member> = self.lock().values().map(|t| t.member.clone()).collect();
        out.push(self.local.clone());
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    fn server_up(&self) -> watch::Receiver<u64> {
        self.server_up.subscribe()
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}
