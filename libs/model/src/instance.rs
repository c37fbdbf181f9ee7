//! Instance desired state, validation and status projection.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use fleet_id::{DomainId, ImageId, InstanceId, NodeId, OrgId, VpcId, ZoneId};
use fleet_networking::derive_mac;
use fleet_reconcile::{AdapterKind, NetworkAdapter, VmDescriptor, VmDisk};
use serde::{Deserialize, Serialize};

use crate::serde_ext::null_as_default;
use crate::{disk_path, Disk, ValidationError};

/// Memory floor in MiB.
pub const MIN_MEMORY: u32 = 256;

pub const MIN_PROCESSORS: u32 = 1;

/// Smallest initial disk size in GiB when one is requested at all.
pub const MIN_INIT_DISK_SIZE: u32 = 10;

/// Operator-declared lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    #[default]
    Start,
    Stop,
    Restart,
    Destroy,
}

/// Last VM state reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Provisioning,
    Starting,
    Running,
    Stopped,
    Failed,
    Updating,
}

/// Display status shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisplayStatus {
    #[serde(rename = "Restart Required")]
    RestartRequired,
    Starting,
    Running,
    Updating,
    Provisioning,
    Stopping,
    Stopped,
    Restarting,
    Destroying,
}

impl DisplayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RestartRequired => "Restart Required",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Updating => "Updating",
            Self::Provisioning => "Provisioning",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Restarting => "Restarting",
            Self::Destroying => "Destroying",
        }
    }
}

impl fmt::Display for DisplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared state of one virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub id: InstanceId,
    #[serde(default)]
    pub organization: Option<OrgId>,
    #[serde(default)]
    pub zone: Option<ZoneId>,
    #[serde(default)]
    pub vpc: Option<VpcId>,
    #[serde(default)]
    pub image: Option<ImageId>,
    #[serde(default)]
    pub node: Option<NodeId>,
    #[serde(default)]
    pub domain: Option<DomainId>,
    #[serde(default)]
    pub name: String,
    /// Unset until validated; validation defaults it to `Start`.
    #[serde(default)]
    pub state: Option<DesiredState>,
    #[serde(default)]
    pub vm_state: Option<VmState>,
    #[serde(default)]
    pub restart: bool,
    /// GiB; zero means unset.
    #[serde(default)]
    pub init_disk_size: u32,
    /// MiB.
    #[serde(default)]
    pub memory: u32,
    #[serde(default)]
    pub processors: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub network_roles: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub public_ips: Vec<Ipv4Addr>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub public_ips6: Vec<Ipv6Addr>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub private_ips: Vec<Ipv4Addr>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub private_ips6: Vec<Ipv6Addr>,
}

/// Fields that can be written individually through a partial commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstanceField {
    Organization,
    Zone,
    Vpc,
    Image,
    Node,
    Domain,
    Name,
    State,
    VmState,
    Restart,
    InitDiskSize,
    Memory,
    Processors,
    NetworkRoles,
    PublicIps,
    PublicIps6,
    PrivateIps,
    PrivateIps6,
}

fn note(slot: &mut Option<ValidationError>, err: ValidationError) {
    if slot.is_none() {
        *slot = Some(err);
    }
}

impl InstanceSpec {
    pub fn new(id: InstanceId) -> Self {
        Self {
            id,
            organization: None,
            zone: None,
            vpc: None,
            image: None,
            node: None,
            domain: None,
            name: String::new(),
            state: None,
            vm_state: None,
            restart: false,
            init_disk_size: 0,
            memory: 0,
            processors: 0,
            network_roles: Vec::new(),
            public_ips: Vec::new(),
            public_ips6: Vec::new(),
            private_ips: Vec::new(),
            private_ips6: Vec::new(),
        }
    }

    /// Declared state, treating unset as `Start`.
    pub fn desired_state(&self) -> DesiredState {
        self.state.unwrap_or_default()
    }

    /// Apply defaults and check required fields.
    ///
    /// Defaults are always applied, even when a check fails. The first
    /// failing check, in the order organization, zone, node, image, VPC,
    /// initial disk size, is reported.
    pub fn validate(&mut self) -> Result<(), ValidationError> {
        let state = *self.state.get_or_insert(DesiredState::Start);
        if state != DesiredState::Start {
            self.restart = false;
        }

        let mut failure = None;
        if self.organization.is_none() {
            note(
                &mut failure,
                ValidationError::new("organization_required", "Missing required organization"),
            );
        }
        if self.zone.is_none() {
            note(
                &mut failure,
                ValidationError::new("zone_required", "Missing required zone"),
            );
        }
        if self.node.is_none() {
            note(
                &mut failure,
                ValidationError::new("node_required", "Missing required node"),
            );
        }
        if self.image.is_none() {
            note(
                &mut failure,
                ValidationError::new("image_required", "Missing required image"),
            );
        }
        if self.vpc.is_none() {
            note(
                &mut failure,
                ValidationError::new("vpc_required", "Missing required VPC"),
            );
        }
        if self.init_disk_size != 0 && self.init_disk_size < MIN_INIT_DISK_SIZE {
            note(
                &mut failure,
                ValidationError::new("init_disk_size_invalid", "Disk size below minimum"),
            );
        }

        self.memory = self.memory.max(MIN_MEMORY);
        self.processors = self.processors.max(MIN_PROCESSORS);

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Project declared state, restart flag and observed VM state onto the
    /// display vocabulary.
    pub fn status(&self) -> DisplayStatus {
        use DisplayStatus as S;
        use VmState as V;

        match self.desired_state() {
            DesiredState::Start if self.restart => S::RestartRequired,
            DesiredState::Start => match self.vm_state {
                None | Some(V::Provisioning) => S::Provisioning,
                Some(V::Starting | V::Stopped | V::Failed) => S::Starting,
                Some(V::Running) => S::Running,
                Some(V::Updating) => S::Updating,
            },
            DesiredState::Stop => match self.vm_state {
                Some(V::Starting | V::Running) => S::Stopping,
                Some(V::Stopped | V::Failed) => S::Stopped,
                Some(V::Updating) => S::Updating,
                None | Some(V::Provisioning) => S::Provisioning,
            },
            DesiredState::Restart => S::Restarting,
            DesiredState::Destroy => S::Destroying,
        }
    }

    /// Whether the instance still occupies reserved capacity on its node.
    pub fn is_active(&self) -> bool {
        self.desired_state() == DesiredState::Start
            || matches!(
                self.vm_state,
                Some(VmState::Running | VmState::Starting | VmState::Provisioning)
            )
    }

    /// Build the hypervisor-facing descriptor.
    ///
    /// Disks whose index is not an integer are skipped; the rest are ordered
    /// by slot. Exactly one bridge adapter is emitted, unbound while the
    /// instance has no VPC.
    pub fn translate(&self, disks: &[Disk], virt_root: &Path) -> VmDescriptor {
        let network_adapters = vec![NetworkAdapter {
            kind: AdapterKind::Bridge,
            mac_address: derive_mac(&self.id, self.vpc.as_ref()),
            vpc: self.vpc,
        }];

        let mut disks: Vec<VmDisk> = disks
            .iter()
            .filter_map(|disk| {
                disk.slot()
                    .map(|index| VmDisk::new(index, disk_path(virt_root, &disk.id)))
            })
            .collect();
        disks.sort_by_key(|disk| disk.index);

        VmDescriptor {
            id: self.id,
            image: self.image,
            processors: self.processors,
            memory: self.memory,
            disks,
            network_adapters,
        }
    }

    /// Copy `fields` from `from` into `self`.
    pub fn copy_fields(&mut self, from: &InstanceSpec, fields: &[InstanceField]) {
        for field in fields {
            match field {
                InstanceField::Organization => self.organization = from.organization,
                InstanceField::Zone => self.zone = from.zone,
                InstanceField::Vpc => self.vpc = from.vpc,
                InstanceField::Image => self.image = from.image,
                InstanceField::Node => self.node = from.node,
                InstanceField::Domain => self.domain = from.domain,
                InstanceField::Name => self.name.clone_from(&from.name),
                InstanceField::State => self.state = from.state,
                InstanceField::VmState => self.vm_state = from.vm_state,
                InstanceField::Restart => self.restart = from.restart,
                InstanceField::InitDiskSize => self.init_disk_size = from.init_disk_size,
                InstanceField::Memory => self.memory = from.memory,
                InstanceField::Processors => self.processors = from.processors,
                InstanceField::NetworkRoles => self.network_roles.clone_from(&from.network_roles),
                InstanceField::PublicIps => self.public_ips.clone_from(&from.public_ips),
                InstanceField::PublicIps6 => self.public_ips6.clone_from(&from.public_ips6),
                InstanceField::PrivateIps => self.private_ips.clone_from(&from.private_ips),
                InstanceField::PrivateIps6 => self.private_ips6.clone_from(&from.private_ips6),
            }
        }
    }
}
