//! Instance create, update and removal.

use std::sync::Arc;

use fleet_events::{ChangeEvent, Publisher};
use fleet_id::InstanceId;
use fleet_model::{DesiredState, InstanceField, InstanceSpec, VmState};
use fleet_networking::AddressPool;
use fleet_store::{InstanceStore, StoreError};
use tracing::{debug, info, instrument, warn};

use crate::{CommitError, NetworkLifecycleHook};

/// Runs every instance write through validation, persistence, change
/// notification and address cleanup.
pub struct InstanceService {
    store: Arc<dyn InstanceStore>,
    pool: Arc<dyn AddressPool>,
    hook: NetworkLifecycleHook,
    publisher: Arc<dyn Publisher>,
}

impl InstanceService {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        pool: Arc<dyn AddressPool>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            store,
            hook: NetworkLifecycleHook::new(Arc::clone(&pool)),
            pool,
            publisher,
        }
    }

    pub async fn get(&self, id: InstanceId) -> Result<InstanceSpec, StoreError> {
        self.store.find_instance(id).await
    }

    /// Validate and insert a new instance.
    #[instrument(skip(self, spec), fields(instance_id = %spec.id))]
    pub async fn create(&self, mut spec: InstanceSpec) -> Result<InstanceSpec, CommitError> {
        spec.validate()?;
        self.store.insert_instance(&spec).await?;

        info!(status = %spec.status(), "Instance created");
        self.publisher.publish(ChangeEvent::Instance(Some(spec.id)));
        Ok(spec)
    }

    /// Load the instance, apply `change`, validate and commit it.
    ///
    /// A rejected update writes nothing and releases nothing. When the
    /// commit moves the instance to another VPC, the address held in the old
    /// VPC is released after the write; a release failure is returned as
    /// [`CommitError::Cleanup`] with the new state already persisted.
    #[instrument(skip(self, change))]
    pub async fn update<F>(&self, id: InstanceId, change: F) -> Result<InstanceSpec, CommitError>
    where
        F: FnOnce(&mut InstanceSpec) + Send,
    {
        let mut spec = self.store.find_instance(id).await?;

        let transition = self.hook.pre_commit(&spec);
        change(&mut spec);
        spec.validate()?;

        self.store.commit_instance(&spec).await?;
        self.publisher.publish(ChangeEvent::Instance(Some(id)));

        let released = self
            .hook
            .post_commit(transition, &spec)
            .await
            .map_err(|source| CommitError::Cleanup {
                instance: id,
                source,
            })?;
        if let Some(vpc) = released {
            self.publisher.publish(ChangeEvent::Vpc(Some(vpc)));
        }

        Ok(spec)
    }

    /// Write back the VM state observed by the hypervisor, leaving every
    /// operator-edited field untouched.
    ///
    /// With `flag_restart` the restart flag is set as well, unless the stored
    /// instance is no longer declared Start.
    #[instrument(skip(self))]
    pub async fn record_vm_state(
        &self,
        id: InstanceId,
        vm_state: Option<VmState>,
        flag_restart: bool,
    ) -> Result<(), StoreError> {
        let mut observed = self.store.find_instance(id).await?;
        observed.vm_state = vm_state;

        let mut fields = vec![InstanceField::VmState];
        if flag_restart {
            if observed.desired_state() == DesiredState::Start {
                observed.restart = true;
                fields.push(InstanceField::Restart);
            } else {
                debug!(instance_id = %id, "Instance left Start, not flagging restart");
            }
        }

        self.store.commit_instance_fields(&observed, &fields).await?;
        self.publisher.publish(ChangeEvent::Instance(Some(id)));
        Ok(())
    }

    /// Delete the instance and release every address it holds.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: InstanceId) -> Result<(), CommitError> {
        self.store.remove_instance(id).await?;

        let released = self.pool.release_all(id).await;
        self.publisher.publish(ChangeEvent::Instance(Some(id)));

        released.map_err(|source| {
            warn!(instance_id = %id, error = %source, "Failed to release instance addresses");
            CommitError::Cleanup {
                instance: id,
                source,
            }
        })
    }
}
