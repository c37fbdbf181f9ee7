use std::path::{Path, PathBuf};

use fleet_id::{DiskId, InstanceId, NodeId};
use serde::{Deserialize, Serialize};

/// A virtual disk record.
///
/// `index` is the slot the disk occupies on its instance. It is stored as
/// text; records whose index is not an integer are skipped when the instance
/// is translated for the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub id: DiskId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub node: Option<NodeId>,
    #[serde(default)]
    pub instance: Option<InstanceId>,
    #[serde(default)]
    pub index: String,
}

impl Disk {
    pub fn new(id: DiskId, instance: InstanceId, index: impl Into<String>) -> Self {
        Self {
            id,
            name: String::new(),
            node: None,
            instance: Some(instance),
            index: index.into(),
        }
    }

    /// The numeric index slot, if the stored index parses.
    pub fn slot(&self) -> Option<u32> {
        self.index.trim().parse().ok()
    }
}

/// Location of a disk image under a node's virtual-disk root.
pub fn disk_path(virt_root: &Path, id: &DiskId) -> PathBuf {
    virt_root.join("disks").join(format!("{id}.qcow2"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_parsing() {
        let inst = InstanceId::new();
        assert_eq!(Disk::new(DiskId::new(), inst, "2").slot(), Some(2));
        assert_eq!(Disk::new(DiskId::new(), inst, "boot").slot(), None);
        assert_eq!(Disk::new(DiskId::new(), inst, "").slot(), None);
    }

    #[test]
    fn test_disk_path() {
        let id = DiskId::new();
        let path = disk_path(Path::new("/var/lib/fleet"), &id);
        assert_eq!(
            path,
            PathBuf::from(format!("/var/lib/fleet/disks/{id}.qcow2"))
        );
    }
}
