//! harbord.toml configuration.
//!
//! Every field has a default, so an empty file (or no file at all) is a
//! valid single-node configuration. Command-line flags are applied on top
//! through [`Overrides`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use harbor_health::{CheckType, parse_duration};
use harbor_state::{HealthCheck, HealthStatus, NodeService};
use serde::{Deserialize, Deserializer, Serialize};

pub const DEFAULT_PORT: u16 = 8300;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub node_name: String,
    pub datacenter: String,
    /// Address other members use to reach this node.
    pub advertise_addr: String,
    /// Port for RPC, raft and membership traffic.
    pub bind_port: u16,
    pub data_dir: PathBuf,
    pub server: bool,
    /// Initialise a single-voter raft cluster on first start.
    pub bootstrap: bool,
    /// Fixed raft id. When unset one is derived from the node name.
    pub raft_id: Option<u64>,
    /// `host:port` of members to heartbeat on startup.
    pub join: Vec<String>,
    #[serde(
        alias = "ae_interval_secs",
        deserialize_with = "de_duration",
        serialize_with = "ser_duration"
    )]
    pub ae_interval: Duration,
    #[serde(
        alias = "check_update_interval_secs",
        deserialize_with = "de_duration",
        serialize_with = "ser_duration"
    )]
    pub check_update_interval: Duration,
    pub discard_check_output: bool,
    #[serde(rename = "service")]
    pub services: Vec<ServiceDefinition>,
    #[serde(rename = "check")]
    pub checks: Vec<CheckDefinition>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            node_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "harbor-node".to_string()),
            datacenter: "dc1".to_string(),
            advertise_addr: "127.0.0.1".to_string(),
            bind_port: DEFAULT_PORT,
            data_dir: PathBuf::from("/var/lib/harbor"),
            server: false,
            bootstrap: false,
            raft_id: None,
            join: Vec::new(),
            ae_interval: Duration::from_secs(60),
            check_update_interval: Duration::from_secs(300),
            discard_check_output: false,
            services: Vec::new(),
            checks: Vec::new(),
        }
    }
}

/// A service declared in the config file, optionally with its own check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub check: Option<CheckDefinition>,
}

impl ServiceDefinition {
    pub fn node_service(&self) -> NodeService {
        NodeService {
            id: self.id.clone(),
            service: self.name.clone(),
            tag: self.tag.clone(),
            port: self.port,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckDefinition {
    pub id: String,
    pub name: String,
    pub service_id: Option<String>,
    pub notes: String,
    pub status: Option<HealthStatus>,
    pub script: Option<String>,
    pub http: Option<String>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub ttl: Option<String>,
}

impl CheckDefinition {
    pub fn health_check(&self) -> HealthCheck {
        HealthCheck {
            check_id: self.id.clone(),
            name: self.name.clone(),
            notes: self.notes.clone(),
            status: self.status.unwrap_or_default(),
            service_id: self.service_id.clone(),
            ..Default::default()
        }
    }

    /// The runner definition, or `None` for a check only updated by hand.
    pub fn check_type(&self) -> anyhow::Result<Option<CheckType>> {
        if self.script.is_none() && self.http.is_none() && self.ttl.is_none() {
            return Ok(None);
        }
        Ok(Some(CheckType {
            script: self.script.clone(),
            http: self.http.clone(),
            interval: opt_duration(&self.interval, "interval")?,
            timeout: opt_duration(&self.timeout, "timeout")?,
            ttl: opt_duration(&self.ttl, "ttl")?,
        }))
    }
}

fn opt_duration(value: &Option<String>, field: &str) -> anyhow::Result<Option<Duration>> {
    match value {
        None => Ok(None),
        Some(s) => match parse_duration(s) {
            Some(d) => Ok(Some(d)),
            None => bail!("invalid {field} duration: {s:?}"),
        },
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Secs(u64),
    Text(String),
}

fn de_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    match RawDuration::deserialize(d)? {
        RawDuration::Secs(s) => Ok(Duration::from_secs(s)),
        RawDuration::Text(s) => parse_duration(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {s:?}"))),
    }
}

fn ser_duration<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    if d.subsec_millis() != 0 {
        s.serialize_str(&format!("{}ms", d.as_millis()))
    } else {
        s.serialize_str(&format!("{}s", d.as_secs()))
    }
}

/// Values given on the command line. Anything set here wins over the file.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct Overrides {
    /// Path to a harbord.toml file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Name of this node. Must be unique in the cluster.
    #[arg(long)]
    pub node: Option<String>,

    #[arg(long)]
    pub datacenter: Option<String>,

    /// Address advertised to other members.
    #[arg(long)]
    pub advertise: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Member address to join. Repeatable.
    #[arg(long = "join", visible_alias = "server")]
    pub join: Vec<String>,
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: DaemonConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Load the file named in `overrides` (if any) and apply the flags.
    /// The result still needs [`validate`](Self::validate) once the mode
    /// is settled.
    pub fn load(overrides: &Overrides) -> anyhow::Result<Self> {
        let mut config = match &overrides.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(overrides);
        Ok(config)
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(node) = &overrides.node {
            self.node_name = node.clone();
        }
        if let Some(dc) = &overrides.datacenter {
            self.datacenter = dc.clone();
        }
        if let Some(addr) = &overrides.advertise {
            self.advertise_addr = addr.clone();
        }
        if let Some(port) = overrides.port {
            self.bind_port = port;
        }
        if let Some(dir) = &overrides.data_dir {
            self.data_dir = dir.clone();
        }
        if !overrides.join.is_empty() {
            self.join = overrides.join.clone();
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_name.is_empty() {
            bail!("node_name must not be empty");
        }
        if self.datacenter.is_empty() {
            bail!("datacenter must not be empty");
        }
        if self.bootstrap && !self.server {
            bail!("bootstrap requires server mode");
        }
        if self.ae_interval.is_zero() {
            bail!("ae_interval must be positive");
        }
        for svc in &self.services {
            if let Some(check) = &svc.check {
                check.check_type()?;
            }
        }
        for check in &self.checks {
            check.check_type()?;
        }
        Ok(())
    }

    /// `host:port` other members reach this node at.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.advertise_addr, self.bind_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
node_name = "web-1"
datacenter = "east"
bind_port = 9300
server = true
bootstrap = true
join = ["10.0.0.2:8300"]
ae_interval_secs = 30
check_update_interval = "2m"

[[service]]
name = "web"
tag = "v1"
port = 80

[service.check]
ttl = "15s"

[[check]]
id = "mem"
name = "Memory usage"
script = "/usr/local/bin/check_mem"
interval = "10s"
"#;

    #[test]
    fn parses_a_full_file() {
        let config: DaemonConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.node_name, "web-1");
        assert_eq!(config.datacenter, "east");
        assert_eq!(config.rpc_addr(), "127.0.0.1:9300");
        assert_eq!(config.ae_interval, Duration::from_secs(30));
        assert_eq!(config.check_update_interval, Duration::from_secs(120));
        assert_eq!(config.join, vec!["10.0.0.2:8300"]);

        let web = &config.services[0];
        assert_eq!(web.node_service().tag.as_deref(), Some("v1"));
        let ct = web.check.as_ref().unwrap().check_type().unwrap().unwrap();
        assert_eq!(ct.ttl, Some(Duration::from_secs(15)));

        let mem = &config.checks[0];
        let ct = mem.check_type().unwrap().unwrap();
        assert_eq!(ct.script.as_deref(), Some("/usr/local/bin/check_mem"));
        assert_eq!(ct.interval, Some(Duration::from_secs(10)));
        assert_eq!(mem.health_check().status, HealthStatus::Unknown);
        config.validate().unwrap();
    }

    #[test]
    fn empty_file_is_the_default() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert!(!config.server);
        assert_eq!(config.bind_port, DEFAULT_PORT);
    }

    #[test]
    fn flags_override_the_file() {
        let mut config: DaemonConfig = toml::from_str(SAMPLE).unwrap();
        config.apply(&Overrides {
            node: Some("web-2".into()),
            port: Some(8500),
            join: vec!["10.0.0.9:8300".into()],
            ..Default::default()
        });
        assert_eq!(config.node_name, "web-2");
        assert_eq!(config.bind_port, 8500);
        assert_eq!(config.join, vec!["10.0.0.9:8300"]);
        // Untouched by the flags.
        assert_eq!(config.datacenter, "east");
    }

    #[test]
    fn rejects_bad_values() {
        assert!(toml::from_str::<DaemonConfig>("ae_interval = \"soon\"").is_err());

        let config: DaemonConfig = toml::from_str("bootstrap = true").unwrap();
        assert!(config.validate().is_err());

        let config: DaemonConfig =
            toml::from_str("[[check]]\nname = \"x\"\nttl = \"later\"").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harbord.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = DaemonConfig::load(&Overrides {
            config: Some(path),
            datacenter: Some("west".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(config.node_name, "web-1");
        assert_eq!(config.datacenter, "west");
    }
}
