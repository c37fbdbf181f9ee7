//! Collection traits.

use async_trait::async_trait;
use fleet_id::{CertificateId, DiskId, DocVersion, InstanceId, NodeId, ZoneId};
use fleet_model::{
    Certificate, Disk, HeartbeatFields, InstanceField, InstanceSpec, Node, NodeIdentity,
};

use crate::StoreError;

#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn find_node(&self, id: NodeId) -> Result<Node, StoreError>;

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError>;

    /// Insert the node if missing, then set its identity fields. Returns the
    /// stored document.
    async fn upsert_identity(&self, identity: &NodeIdentity) -> Result<Node, StoreError>;

    /// Atomically write the heartbeat fields and return the document as
    /// stored after the write. No other field is touched.
    async fn heartbeat(&self, id: NodeId, fields: &HeartbeatFields) -> Result<Node, StoreError>;

    /// Replace an existing node document. Returns the new version.
    async fn commit_node(&self, node: &Node) -> Result<DocVersion, StoreError>;
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn find_instance(&self, id: InstanceId) -> Result<InstanceSpec, StoreError>;

    /// Fails with [`StoreError::Conflict`] if the id is taken.
    async fn insert_instance(&self, spec: &InstanceSpec) -> Result<(), StoreError>;

    async fn commit_instance(&self, spec: &InstanceSpec) -> Result<(), StoreError>;

    /// Write only `fields` of `spec`, leaving the rest of the stored document
    /// as it is.
    async fn commit_instance_fields(
        &self,
        spec: &InstanceSpec,
        fields: &[InstanceField],
    ) -> Result<(), StoreError>;

    async fn remove_instance(&self, id: InstanceId) -> Result<(), StoreError>;

    /// Instances assigned to `node`, in id order.
    async fn list_node_instances(&self, node: NodeId) -> Result<Vec<InstanceSpec>, StoreError>;
}

#[async_trait]
pub trait DiskStore: Send + Sync {
    async fn put_disk(&self, disk: &Disk) -> Result<(), StoreError>;

    async fn remove_disk(&self, id: DiskId) -> Result<(), StoreError>;

    /// Disks attached to `instance`, in id order.
    async fn instance_disks(&self, instance: InstanceId) -> Result<Vec<Disk>, StoreError>;
}

#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn get_certificate(&self, id: CertificateId) -> Result<Certificate, StoreError>;

    async fn put_certificate(&self, cert: &Certificate) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ZoneStore: Send + Sync {
    async fn zone_exists(&self, id: ZoneId) -> Result<bool, StoreError>;

    async fn add_zone(&self, id: ZoneId) -> Result<(), StoreError>;
}
