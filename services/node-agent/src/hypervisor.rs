//! Hypervisor interface and mock implementation.
//!
//! The reconciler drives VMs through [`Hypervisor`]. [`MockHypervisor`]
//! keeps VMs in memory and records every operation, for tests and for
//! running the agent on hosts without KVM.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fleet_id::InstanceId;
use fleet_model::VmState;
use fleet_reconcile::{VmDescriptor, VmDisk};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("VM not found: {0}")]
    NotFound(InstanceId),

    #[error("VM already exists: {0}")]
    AlreadyExists(InstanceId),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("hypervisor error: {0}")]
    Backend(String),
}

/// A VM as the hypervisor reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSnapshot {
    pub descriptor: VmDescriptor,
    pub state: VmState,
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// The VM for `id`, or `None` if it is not defined.
    async fn describe(&self, id: InstanceId) -> Result<Option<VmSnapshot>, HypervisorError>;

    /// Define a stopped VM with the given shape.
    async fn create(&self, want: &VmDescriptor) -> Result<(), HypervisorError>;

    /// Redefine a stopped VM's processors, memory and adapters.
    async fn redefine(&self, want: &VmDescriptor) -> Result<(), HypervisorError>;

    async fn start(&self, id: InstanceId) -> Result<(), HypervisorError>;

    async fn stop(&self, id: InstanceId) -> Result<(), HypervisorError>;

    async fn destroy(&self, id: InstanceId) -> Result<(), HypervisorError>;

    async fn attach_disk(&self, id: InstanceId, disk: &VmDisk) -> Result<(), HypervisorError>;

    async fn detach_disk(&self, id: InstanceId, disk: &VmDisk) -> Result<(), HypervisorError>;
}

/// Operation recorded by [`MockHypervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HypervisorOp {
    Create(InstanceId),
    Redefine(InstanceId),
    Start(InstanceId),
    Stop(InstanceId),
    Destroy(InstanceId),
    AttachDisk(InstanceId, u32),
    DetachDisk(InstanceId, u32),
}

/// In-memory hypervisor.
#[derive(Debug, Default)]
pub struct MockHypervisor {
    vms: Mutex<BTreeMap<InstanceId, VmSnapshot>>,
    ops: Mutex<Vec<HypervisorOp>>,
    start_attempts: AtomicU32,
    fail_starts: bool,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A hypervisor whose starts always fail.
    pub fn failing() -> Self {
        Self {
            fail_starts: true,
            ..Self::default()
        }
    }

    /// Define a VM directly, bypassing the operation log.
    pub fn insert(&self, snapshot: VmSnapshot) {
        self.vms().insert(snapshot.descriptor.id, snapshot);
    }

    /// Operations issued so far, in order.
    pub fn ops(&self) -> Vec<HypervisorOp> {
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Start calls received, successful or not.
    pub fn start_attempts(&self) -> u32 {
        self.start_attempts.load(Ordering::SeqCst)
    }

    pub fn clear_ops(&self) {
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn vms(&self) -> MutexGuard<'_, BTreeMap<InstanceId, VmSnapshot>> {
        self.vms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, op: HypervisorOp) {
        debug!(op = ?op, "[MOCK] Hypervisor operation");
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(op);
    }

    fn with_vm<T>(
        &self,
        id: InstanceId,
        f: impl FnOnce(&mut VmSnapshot) -> T,
    ) -> Result<T, HypervisorError> {
        self.vms()
            .get_mut(&id)
            .map(f)
            .ok_or(HypervisorError::NotFound(id))
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn describe(&self, id: InstanceId) -> Result<Option<VmSnapshot>, HypervisorError> {
        Ok(self.vms().get(&id).cloned())
    }

    async fn create(&self, want: &VmDescriptor) -> Result<(), HypervisorError> {
        {
            let mut vms = self.vms();
            if vms.contains_key(&want.id) {
                return Err(HypervisorError::AlreadyExists(want.id));
            }
            vms.insert(
                want.id,
                VmSnapshot {
                    descriptor: want.clone(),
                    state: VmState::Stopped,
                },
            );
        }
        info!(
            instance_id = %want.id,
            processors = want.processors,
            memory_mib = want.memory,
            disks = want.disks.len(),
            "[MOCK] VM defined"
        );
        self.record(HypervisorOp::Create(want.id));
        Ok(())
    }

    async fn redefine(&self, want: &VmDescriptor) -> Result<(), HypervisorError> {
        self.with_vm(want.id, |vm| {
            vm.descriptor.processors = want.processors;
            vm.descriptor.memory = want.memory;
            vm.descriptor.image = want.image;
            vm.descriptor.network_adapters = want.network_adapters.clone();
        })?;
        self.record(HypervisorOp::Redefine(want.id));
        Ok(())
    }

    async fn start(&self, id: InstanceId) -> Result<(), HypervisorError> {
        self.start_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_starts {
            return Err(HypervisorError::Backend(
                "mock hypervisor configured to fail".to_string(),
            ));
        }
        self.with_vm(id, |vm| vm.state = VmState::Running)?;
        self.record(HypervisorOp::Start(id));
        Ok(())
    }

    async fn stop(&self, id: InstanceId) -> Result<(), HypervisorError> {
        self.with_vm(id, |vm| vm.state = VmState::Stopped)?;
        self.record(HypervisorOp::Stop(id));
        Ok(())
    }

    async fn destroy(&self, id: InstanceId) -> Result<(), HypervisorError> {
        self.vms()
            .remove(&id)
            .ok_or(HypervisorError::NotFound(id))?;
        self.record(HypervisorOp::Destroy(id));
        Ok(())
    }

    async fn attach_disk(&self, id: InstanceId, disk: &VmDisk) -> Result<(), HypervisorError> {
        self.with_vm(id, |vm| vm.descriptor.disks.push(disk.clone()))?;
        self.record(HypervisorOp::AttachDisk(id, disk.index));
        Ok(())
    }

    async fn detach_disk(&self, id: InstanceId, disk: &VmDisk) -> Result<(), HypervisorError> {
        self.with_vm(id, |vm| vm.descriptor.disks.retain(|d| d != disk))?;
        self.record(HypervisorOp::DetachDisk(id, disk.index));
        Ok(())
    }
}
