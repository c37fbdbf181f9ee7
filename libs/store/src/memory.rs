//! In-memory store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use fleet_id::{CertificateId, DiskId, DocVersion, InstanceId, NodeId, ZoneId};
use fleet_model::{
    Certificate, Disk, HeartbeatFields, InstanceField, InstanceSpec, Node, NodeIdentity,
};

use crate::{CertificateStore, DiskStore, InstanceStore, NodeStore, StoreError, ZoneStore};

#[derive(Debug, Default)]
struct Collections {
    nodes: BTreeMap<NodeId, Node>,
    instances: BTreeMap<InstanceId, InstanceSpec>,
    disks: BTreeMap<DiskId, Disk>,
    certificates: BTreeMap<CertificateId, Certificate>,
    zones: BTreeSet<ZoneId>,
}

/// Store holding every collection in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Collections> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a node document as given, version included.
    pub fn seed_node(&self, node: Node) {
        self.lock().nodes.insert(node.id, node);
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn find_node(&self, id: NodeId) -> Result<Node, StoreError> {
        self.lock()
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("node", id))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        Ok(self.lock().nodes.values().cloned().collect())
    }

    async fn upsert_identity(&self, identity: &NodeIdentity) -> Result<Node, StoreError> {
        let mut inner = self.lock();
        let node = inner
            .nodes
            .entry(identity.id)
            .or_insert_with(|| Node::new(identity.id));
        identity.apply_to(node);
        node.version = node.version.next();
        Ok(node.clone())
    }

    async fn heartbeat(&self, id: NodeId, fields: &HeartbeatFields) -> Result<Node, StoreError> {
        let mut inner = self.lock();
        let node = inner
            .nodes
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("node", id))?;
        fields.apply_to(node);
        node.version = node.version.next();
        Ok(node.clone())
    }

    async fn commit_node(&self, node: &Node) -> Result<DocVersion, StoreError> {
        let mut inner = self.lock();
        let stored = inner
            .nodes
            .get_mut(&node.id)
            .ok_or_else(|| StoreError::not_found("node", node.id))?;
        let version = stored.version.next();
        *stored = node.clone();
        stored.version = version;
        Ok(version)
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn find_instance(&self, id: InstanceId) -> Result<InstanceSpec, StoreError> {
        self.lock()
            .instances
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("instance", id))
    }

    async fn insert_instance(&self, spec: &InstanceSpec) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.instances.contains_key(&spec.id) {
            return Err(StoreError::conflict("instance", spec.id));
        }
        inner.instances.insert(spec.id, spec.clone());
        Ok(())
    }

    async fn commit_instance(&self, spec: &InstanceSpec) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let stored = inner
            .instances
            .get_mut(&spec.id)
            .ok_or_else(|| StoreError::not_found("instance", spec.id))?;
        *stored = spec.clone();
        Ok(())
    }

    async fn commit_instance_fields(
        &self,
        spec: &InstanceSpec,
        fields: &[InstanceField],
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let stored = inner
            .instances
            .get_mut(&spec.id)
            .ok_or_else(|| StoreError::not_found("instance", spec.id))?;
        stored.copy_fields(spec, fields);
        Ok(())
    }

    async fn remove_instance(&self, id: InstanceId) -> Result<(), StoreError> {
        self.lock()
            .instances
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("instance", id))
    }

    async fn list_node_instances(&self, node: NodeId) -> Result<Vec<InstanceSpec>, StoreError> {
        Ok(self
            .lock()
            .instances
            .values()
            .filter(|spec| spec.node == Some(node))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DiskStore for MemoryStore {
    async fn put_disk(&self, disk: &Disk) -> Result<(), StoreError> {
        self.lock().disks.insert(disk.id, disk.clone());
        Ok(())
    }

    async fn remove_disk(&self, id: DiskId) -> Result<(), StoreError> {
        self.lock()
            .disks
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("disk", id))
    }

    async fn instance_disks(&self, instance: InstanceId) -> Result<Vec<Disk>, StoreError> {
        Ok(self
            .lock()
            .disks
            .values()
            .filter(|disk| disk.instance == Some(instance))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CertificateStore for MemoryStore {
    async fn get_certificate(&self, id: CertificateId) -> Result<Certificate, StoreError> {
        self.lock()
            .certificates
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("certificate", id))
    }

    async fn put_certificate(&self, cert: &Certificate) -> Result<(), StoreError> {
        self.lock().certificates.insert(cert.id, cert.clone());
        Ok(())
    }
}

#[async_trait]
impl ZoneStore for MemoryStore {
    async fn zone_exists(&self, id: ZoneId) -> Result<bool, StoreError> {
        Ok(self.lock().zones.contains(&id))
    }

    async fn add_zone(&self, id: ZoneId) -> Result<(), StoreError> {
        self.lock().zones.insert(id);
        Ok(())
    }
}
