//! Node document.
//!
//! A node is created or loaded once per agent process, mutated in place by
//! its heartbeat and superseded (not versioned) in storage on every write.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

use chrono::{DateTime, TimeDelta, Utc};
use fleet_id::{CertificateId, DocVersion, NodeId, ZoneId};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::serde_ext::null_as_default;
use crate::ValidationError;

/// Default port for a node's API listener.
pub const DEFAULT_PORT: u16 = 443;

/// Default root for virtual disk storage.
pub const DEFAULT_VIRT_PATH: &str = "/var/lib/fleet";

/// Default root for the image cache.
pub const DEFAULT_CACHE_PATH: &str = "/var/cache/fleet";

/// Capacity samples older than this are reported as zero.
pub const STALE_AFTER_SECS: i64 = 30;

/// Node capability token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Admin,
    User,
    Hypervisor,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Http,
    #[default]
    Https,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypervisorKind {
    #[default]
    Kvm,
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// One hypervisor host in the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(default)]
    pub zone: Option<ZoneId>,
    #[serde(default)]
    pub name: String,
    /// Capability set. A `BTreeSet` keeps it sorted and free of duplicates.
    #[serde(default, deserialize_with = "null_as_default")]
    pub types: BTreeSet<NodeType>,
    #[serde(default = "epoch")]
    pub timestamp: DateTime<Utc>,
    /// Zero means unset.
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub hypervisor: HypervisorKind,
    #[serde(default, deserialize_with = "null_as_default")]
    pub certificates: Vec<CertificateId>,
    #[serde(default)]
    pub admin_domain: String,
    #[serde(default)]
    pub user_domain: String,
    #[serde(default)]
    pub requests_min: u64,
    #[serde(default)]
    pub forwarded_for_header: String,
    #[serde(default)]
    pub external_interface: String,
    #[serde(default)]
    pub internal_interface: String,
    #[serde(default)]
    pub firewall: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub network_roles: Vec<String>,
    /// Fraction of memory in use, 0.0..=1.0.
    #[serde(default)]
    pub memory: f64,
    #[serde(default)]
    pub load1: f64,
    #[serde(default)]
    pub load5: f64,
    #[serde(default)]
    pub load15: f64,
    #[serde(default)]
    pub cpu_units: u32,
    /// Total memory in GiB.
    #[serde(default)]
    pub memory_units: f64,
    #[serde(default)]
    pub cpu_units_res: u32,
    #[serde(default)]
    pub memory_units_res: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub public_ips: Vec<Ipv4Addr>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub public_ips6: Vec<Ipv6Addr>,
    #[serde(default)]
    pub software_version: String,
    #[serde(default)]
    pub version: DocVersion,
    #[serde(default)]
    pub virt_path: String,
    #[serde(default)]
    pub cache_path: String,
}

impl Node {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            zone: None,
            name: String::new(),
            types: BTreeSet::new(),
            timestamp: epoch(),
            port: DEFAULT_PORT,
            protocol: Protocol::Https,
            hypervisor: HypervisorKind::Kvm,
            certificates: Vec::new(),
            admin_domain: String::new(),
            user_domain: String::new(),
            requests_min: 0,
            forwarded_for_header: String::new(),
            external_interface: String::new(),
            internal_interface: String::new(),
            firewall: false,
            network_roles: Vec::new(),
            memory: 0.0,
            load1: 0.0,
            load5: 0.0,
            load15: 0.0,
            cpu_units: 0,
            memory_units: 0.0,
            cpu_units_res: 0,
            memory_units_res: 0.0,
            public_ips: Vec::new(),
            public_ips6: Vec::new(),
            software_version: String::new(),
            version: DocVersion::INITIAL,
            virt_path: DEFAULT_VIRT_PATH.to_string(),
            cache_path: DEFAULT_CACHE_PATH.to_string(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.types.contains(&NodeType::Admin)
    }

    pub fn is_user(&self) -> bool {
        self.types.contains(&NodeType::User)
    }

    pub fn is_hypervisor(&self) -> bool {
        self.types.contains(&NodeType::Hypervisor)
    }

    pub fn virt_path(&self) -> PathBuf {
        if self.virt_path.is_empty() {
            PathBuf::from(DEFAULT_VIRT_PATH)
        } else {
            PathBuf::from(&self.virt_path)
        }
    }

    pub fn cache_path(&self) -> PathBuf {
        if self.cache_path.is_empty() {
            PathBuf::from(DEFAULT_CACHE_PATH)
        } else {
            PathBuf::from(&self.cache_path)
        }
    }

    /// Fill the defaults a starting agent applies before its identity upsert.
    ///
    /// The capability set is only defaulted for a node that has no stored
    /// document yet; an operator may legitimately leave a stored node with no
    /// capabilities.
    pub fn apply_init_defaults(&mut self, created: bool) {
        if self.name.is_empty() {
            self.name = random_name();
        }
        if created && self.types.is_empty() {
            self.types = BTreeSet::from([NodeType::Admin, NodeType::Hypervisor]);
        }
        if self.port == 0 {
            self.port = DEFAULT_PORT;
        }
    }

    /// Validate and normalize the operator-editable configuration.
    pub fn validate(&mut self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::new(
                "node_port_invalid",
                "Invalid node port",
            ));
        }

        if self.protocol != Protocol::Https {
            self.certificates.clear();
        }

        if !(self.is_admin() && self.is_user()) {
            self.admin_domain.clear();
            self.user_domain.clear();
        }

        if self.virt_path.is_empty() {
            self.virt_path = DEFAULT_VIRT_PATH.to_string();
        }
        if self.cache_path.is_empty() {
            self.cache_path = DEFAULT_CACHE_PATH.to_string();
        }

        if !self.firewall {
            self.network_roles.clear();
        } else if self.network_roles.is_empty() {
            return Err(ValidationError::new(
                "firewall_empty_roles",
                "Cannot enable firewall without network roles",
            ));
        }

        self.certificates.sort();
        self.certificates.dedup();

        Ok(())
    }

    /// Whether the capacity samples are too old to be trusted at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.timestamp) > TimeDelta::seconds(STALE_AFTER_SECS)
    }

    /// Zero every capacity field when the samples are stale.
    ///
    /// Readers call this before exposing capacity so an unreachable node
    /// reports none.
    pub fn apply_staleness(&mut self, now: DateTime<Utc>) {
        if !self.is_stale(now) {
            return;
        }
        self.requests_min = 0;
        self.memory = 0.0;
        self.load1 = 0.0;
        self.load5 = 0.0;
        self.load15 = 0.0;
        self.cpu_units = 0;
        self.cpu_units_res = 0;
        self.memory_units = 0.0;
        self.memory_units_res = 0.0;
    }

    /// Copy the identity and configuration fields from a persisted copy of
    /// this node, keeping the locally sampled telemetry.
    pub fn merge_config_from(&mut self, stored: &Node) {
        self.id = stored.id;
        self.zone = stored.zone;
        self.name.clone_from(&stored.name);
        self.types.clone_from(&stored.types);
        self.port = stored.port;
        self.protocol = stored.protocol;
        self.hypervisor = stored.hypervisor;
        self.certificates.clone_from(&stored.certificates);
        self.admin_domain.clone_from(&stored.admin_domain);
        self.user_domain.clone_from(&stored.user_domain);
        self.forwarded_for_header
            .clone_from(&stored.forwarded_for_header);
        self.external_interface.clone_from(&stored.external_interface);
        self.internal_interface.clone_from(&stored.internal_interface);
        self.firewall = stored.firewall;
        self.network_roles.clone_from(&stored.network_roles);
        self.virt_path.clone_from(&stored.virt_path);
        self.cache_path.clone_from(&stored.cache_path);
        self.version = stored.version;
    }
}

/// The only fields a heartbeat may write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatFields {
    pub timestamp: DateTime<Utc>,
    pub requests_min: u64,
    pub memory: f64,
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub cpu_units: u32,
    pub memory_units: f64,
    pub cpu_units_res: u32,
    pub memory_units_res: f64,
    pub public_ips: Vec<Ipv4Addr>,
    pub public_ips6: Vec<Ipv6Addr>,
}

impl HeartbeatFields {
    pub fn from_node(node: &Node) -> Self {
        Self {
            timestamp: node.timestamp,
            requests_min: node.requests_min,
            memory: node.memory,
            load1: node.load1,
            load5: node.load5,
            load15: node.load15,
            cpu_units: node.cpu_units,
            memory_units: node.memory_units,
            cpu_units_res: node.cpu_units_res,
            memory_units_res: node.memory_units_res,
            public_ips: node.public_ips.clone(),
            public_ips6: node.public_ips6.clone(),
        }
    }

    pub fn apply_to(&self, node: &mut Node) {
        node.timestamp = self.timestamp;
        node.requests_min = self.requests_min;
        node.memory = self.memory;
        node.load1 = self.load1;
        node.load5 = self.load5;
        node.load15 = self.load15;
        node.cpu_units = self.cpu_units;
        node.memory_units = self.memory_units;
        node.cpu_units_res = self.cpu_units_res;
        node.memory_units_res = self.memory_units_res;
        node.public_ips.clone_from(&self.public_ips);
        node.public_ips6.clone_from(&self.public_ips6);
    }
}

/// Identity fields upserted by a starting agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub id: NodeId,
    pub name: String,
    pub types: BTreeSet<NodeType>,
    pub timestamp: DateTime<Utc>,
    pub protocol: Protocol,
    pub port: u16,
    pub hypervisor: HypervisorKind,
    pub software_version: String,
}

impl NodeIdentity {
    pub fn from_node(node: &Node) -> Self {
        Self {
            id: node.id,
            name: node.name.clone(),
            types: node.types.clone(),
            timestamp: node.timestamp,
            protocol: node.protocol,
            port: node.port,
            hypervisor: node.hypervisor,
            software_version: node.software_version.clone(),
        }
    }

    pub fn apply_to(&self, node: &mut Node) {
        node.id = self.id;
        node.name.clone_from(&self.name);
        node.types.clone_from(&self.types);
        node.timestamp = self.timestamp;
        node.protocol = self.protocol;
        node.port = self.port;
        node.hypervisor = self.hypervisor;
        node.software_version.clone_from(&self.software_version);
    }
}

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "dusky", "eager", "frosty", "gentle", "hollow", "icy", "jolly",
    "keen", "lucid", "misty", "noble", "quiet", "rapid", "silent", "tidy", "vivid", "wild",
];

const NOUNS: &[&str] = &[
    "anchor", "brook", "cedar", "delta", "ember", "falcon", "glacier", "harbor", "island",
    "juniper", "kestrel", "lagoon", "meadow", "nebula", "orchid", "pebble", "ridge", "summit",
    "tundra", "willow",
];

/// A readable random name such as `misty-harbor-0412`.
pub fn random_name() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES[rng.random_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.random_range(0..NOUNS.len())];
    let number: u16 = rng.random_range(0..10_000);
    format!("{adjective}-{noun}-{number:04}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampled(now: DateTime<Utc>) -> Node {
        let mut node = Node::new(NodeId::new());
        node.timestamp = now;
        node.requests_min = 120;
        node.memory = 0.5;
        node.load1 = 1.5;
        node.load5 = 1.0;
        node.load15 = 0.75;
        node.cpu_units = 8;
        node.memory_units = 32.0;
        node.cpu_units_res = 4;
        node.memory_units_res = 8.0;
        node
    }

    #[test]
    fn test_staleness_zeroes_capacity_after_threshold() {
        let now = Utc::now();
        let mut node = sampled(now - TimeDelta::seconds(31));
        node.apply_staleness(now);

        assert_eq!(node.requests_min, 0);
        assert_eq!(node.memory, 0.0);
        assert_eq!(node.load1, 0.0);
        assert_eq!(node.load5, 0.0);
        assert_eq!(node.load15, 0.0);
        assert_eq!(node.cpu_units, 0);
        assert_eq!(node.memory_units, 0.0);
        assert_eq!(node.cpu_units_res, 0);
        assert_eq!(node.memory_units_res, 0.0);
    }

    #[test]
    fn test_staleness_keeps_recent_samples() {
        let now = Utc::now();
        let before = sampled(now - TimeDelta::seconds(29));
        let mut node = before.clone();
        node.apply_staleness(now);
        assert_eq!(node, before);
    }

    #[test]
    fn test_init_defaults_for_new_node() {
        let mut node = Node::new(NodeId::new());
        node.port = 0;
        node.apply_init_defaults(true);

        assert!(!node.name.is_empty());
        assert!(node.is_admin());
        assert!(node.is_hypervisor());
        assert!(!node.is_user());
        assert_eq!(node.port, DEFAULT_PORT);
        assert_eq!(node.protocol, Protocol::Https);
    }

    #[test]
    fn test_init_defaults_keep_stored_types() {
        let mut node = Node::new(NodeId::new());
        node.name = "existing".to_string();
        node.apply_init_defaults(false);

        assert_eq!(node.name, "existing");
        assert!(node.types.is_empty());
    }

    #[test]
    fn test_validate_clears_domains_without_both_roles() {
        let mut node = Node::new(NodeId::new());
        node.types = BTreeSet::from([NodeType::Admin]);
        node.admin_domain = "admin.example.com".to_string();
        node.user_domain = "user.example.com".to_string();
        node.validate().unwrap();
        assert!(node.admin_domain.is_empty());
        assert!(node.user_domain.is_empty());

        let mut node = Node::new(NodeId::new());
        node.types = BTreeSet::from([NodeType::Admin, NodeType::User]);
        node.admin_domain = "admin.example.com".to_string();
        node.user_domain = "user.example.com".to_string();
        node.validate().unwrap();
        assert_eq!(node.admin_domain, "admin.example.com");
        assert_eq!(node.user_domain, "user.example.com");
    }

    #[test]
    fn test_validate_clears_certificates_without_https() {
        let mut node = Node::new(NodeId::new());
        node.protocol = Protocol::Http;
        node.certificates = vec![CertificateId::new()];
        node.validate().unwrap();
        assert!(node.certificates.is_empty());
    }

    #[test]
    fn test_validate_sorts_and_dedups_certificates() {
        let a = CertificateId::new();
        let b = CertificateId::new();
        let mut node = Node::new(NodeId::new());
        node.certificates = vec![b, a, b];
        node.validate().unwrap();

        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(node.certificates, expected);
    }

    #[test]
    fn test_validate_firewall_requires_roles() {
        let mut node = Node::new(NodeId::new());
        node.firewall = true;
        let err = node.validate().unwrap_err();
        assert_eq!(err.code, "firewall_empty_roles");

        node.network_roles = vec!["web".to_string()];
        node.validate().unwrap();

        node.firewall = false;
        node.validate().unwrap();
        assert!(node.network_roles.is_empty());
    }

    #[test]
    fn test_validate_rejects_unset_port() {
        let mut node = Node::new(NodeId::new());
        node.port = 0;
        assert_eq!(node.validate().unwrap_err().code, "node_port_invalid");
    }

    #[test]
    fn test_validate_defaults_paths() {
        let mut node = Node::new(NodeId::new());
        node.virt_path.clear();
        node.cache_path.clear();
        node.validate().unwrap();
        assert_eq!(node.virt_path, DEFAULT_VIRT_PATH);
        assert_eq!(node.cache_path, DEFAULT_CACHE_PATH);
    }

    #[test]
    fn test_path_accessors_default_when_empty() {
        let mut node = Node::new(NodeId::new());
        node.cache_path = "/srv/images".to_string();
        assert_eq!(node.cache_path(), PathBuf::from("/srv/images"));

        node.virt_path.clear();
        node.cache_path.clear();
        assert_eq!(node.virt_path(), PathBuf::from(DEFAULT_VIRT_PATH));
        assert_eq!(node.cache_path(), PathBuf::from(DEFAULT_CACHE_PATH));
    }

    #[test]
    fn test_merge_config_keeps_local_samples() {
        let now = Utc::now();
        let mut local = sampled(now);
        let mut stored = Node::new(local.id);
        stored.name = "renamed".to_string();
        stored.firewall = true;
        stored.network_roles = vec!["db".to_string()];
        stored.version = DocVersion::new(7);

        local.merge_config_from(&stored);

        assert_eq!(local.name, "renamed");
        assert!(local.firewall);
        assert_eq!(local.network_roles, vec!["db".to_string()]);
        assert_eq!(local.version.value(), 7);
        assert_eq!(local.cpu_units, 8);
        assert_eq!(local.timestamp, now);
    }

    #[test]
    fn test_heartbeat_fields_apply() {
        let now = Utc::now();
        let source = sampled(now);
        let mut target = Node::new(source.id);
        target.name = "kept".to_string();

        HeartbeatFields::from_node(&source).apply_to(&mut target);

        assert_eq!(target.cpu_units, 8);
        assert_eq!(target.requests_min, 120);
        assert_eq!(target.name, "kept");
    }

    #[test]
    fn test_null_lists_deserialize_empty() {
        let id = NodeId::new();
        let json = format!(
            r#"{{"id":"{id}","types":null,"certificates":null,"public_ips":null}}"#
        );
        let node: Node = serde_json::from_str(&json).unwrap();
        assert!(node.types.is_empty());
        assert!(node.certificates.is_empty());
        assert!(node.public_ips.is_empty());
        assert_eq!(node.timestamp, epoch());
    }

    #[test]
    fn test_types_deduplicate_on_deserialize() {
        let id = NodeId::new();
        let json = format!(r#"{{"id":"{id}","types":["user","admin","user"]}}"#);
        let node: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(
            node.types.into_iter().collect::<Vec<_>>(),
            vec![NodeType::Admin, NodeType::User]
        );
    }

    #[test]
    fn test_random_name_shape() {
        let name = random_name();
        let parts: Vec<&str> = name.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 4);
        assert!(parts[2].chars().all(|c| c.is_ascii_digit()));
    }
}
