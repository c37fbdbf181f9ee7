//! Reconciliation loop for converging VMs on this node.
//!
//! Every pass lists the instances assigned to this node and, one instance at
//! a time:
//! - translates the instance and its disks into the desired descriptor
//! - compares it with what the hypervisor reports
//! - hot-plugs disk changes and flags shape changes as needing a restart
//! - applies the declared lifecycle state
//! - writes back the observed VM state
//!
//! Instances that keep failing are skipped until their retry window passes.

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fleet_control_plane::{CommitError, InstanceService};
use fleet_id::{InstanceId, NodeId};
use fleet_model::{DesiredState, InstanceSpec, VmState};
use fleet_reconcile::{
    changed, disk_changed, RetryTracker, VmDescriptor, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW,
};
use fleet_store::{DiskStore, InstanceStore, StoreError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::HypervisorSettings;
use crate::hypervisor::{Hypervisor, HypervisorError};
use crate::task::{spawn_periodic, FirstTick};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Commit(#[from] CommitError),
}

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between passes.
    pub interval: Duration,

    pub start_timeout: Duration,

    pub stop_timeout: Duration,

    /// Failures tolerated inside `retry_window` before an instance is
    /// skipped.
    pub max_retries: u32,

    pub retry_window: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        let hypervisor = HypervisorSettings::default();
        Self {
            interval: Duration::from_secs(5),
            start_timeout: hypervisor.start_timeout,
            stop_timeout: hypervisor.stop_timeout,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_window: DEFAULT_RETRY_WINDOW,
        }
    }
}

/// What one reconciliation of one instance did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub created: bool,
    pub started: bool,
    pub stopped: bool,
    pub redefined: bool,
    pub destroyed: bool,
    /// The VM shape drifted and the instance was flagged for restart.
    pub restart_required: bool,
    pub attached: usize,
    pub detached: usize,
    /// VM state observed at the end of the pass.
    pub observed: Option<VmState>,
}

/// Collaborators the reconciler reads from and writes to.
#[derive(Clone)]
pub struct ReconcilerDeps {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub instances: Arc<dyn InstanceStore>,
    pub disks: Arc<dyn DiskStore>,
    pub service: Arc<InstanceService>,
}

pub struct Reconciler {
    node_id: NodeId,
    virt_root: PathBuf,
    deps: ReconcilerDeps,
    config: ReconcilerConfig,
    retries: Mutex<RetryTracker<InstanceId>>,
}

impl Reconciler {
    pub fn new(
        node_id: NodeId,
        virt_root: PathBuf,
        deps: ReconcilerDeps,
        config: ReconcilerConfig,
    ) -> Self {
        let retries = RetryTracker::new(config.max_retries, config.retry_window);
        Self {
            node_id,
            virt_root,
            deps,
            config,
            retries: Mutex::new(retries),
        }
    }

    /// Run passes every configured interval until shutdown.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        info!(
            node_id = %self.node_id,
            interval_secs = self.config.interval.as_secs(),
            "Starting reconciliation loop"
        );
        let interval = self.config.interval;
        spawn_periodic(
            "reconciler",
            interval,
            FirstTick::Immediately,
            shutdown,
            move || {
                let reconciler = Arc::clone(&self);
                async move {
                    reconciler.reconcile_all().await;
                }
            },
        )
    }

    fn retries(&self) -> MutexGuard<'_, RetryTracker<InstanceId>> {
        self.retries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reconcile every instance assigned to this node once.
    pub async fn reconcile_all(&self) {
        let specs = match self.deps.instances.list_node_instances(self.node_id).await {
            Ok(specs) => specs,
            Err(err) => {
                error!(node_id = %self.node_id, error = %err, "Failed to list node instances");
                return;
            }
        };

        let backing_off = {
            let mut retries = self.retries();
            retries.prune();
            retries.tracked()
        };
        if backing_off > 0 {
            debug!(node_id = %self.node_id, backing_off, "Instances with recent failures");
        }

        for spec in specs {
            if self.retries().is_exhausted(&spec.id) {
                debug!(instance_id = %spec.id, "Skipping instance with exhausted retries");
                continue;
            }

            match self.reconcile(&spec).await {
                Ok(outcome) => {
                    self.retries().clear(&spec.id);
                    if outcome != ReconcileOutcome::default() {
                        debug!(instance_id = %spec.id, outcome = ?outcome, "Instance reconciled");
                    }
                }
                Err(err) => {
                    let exhausted = self.retries().record_failure(&spec.id);
                    if exhausted {
                        error!(
                            instance_id = %spec.id,
                            error = %err,
                            "Reconciliation failed repeatedly, backing off"
                        );
                    } else {
                        warn!(instance_id = %spec.id, error = %err, "Reconciliation failed");
                    }
                }
            }
        }
    }

    /// Converge one instance.
    pub async fn reconcile(&self, spec: &InstanceSpec) -> Result<ReconcileOutcome, ReconcileError> {
        let hypervisor = self.deps.hypervisor.as_ref();
        let disks = self.deps.disks.instance_disks(spec.id).await?;
        let want = spec.translate(&disks, &self.virt_root);
        let desired = spec.desired_state();
        let mut outcome = ReconcileOutcome::default();

        match hypervisor.describe(spec.id).await? {
            None => match desired {
                DesiredState::Start | DesiredState::Restart => {
                    hypervisor.create(&want).await?;
                    outcome.created = true;
                    self.start(spec.id).await?;
                    outcome.started = true;
                }
                DesiredState::Stop | DesiredState::Destroy => {}
            },
            Some(have) => {
                if desired == DesiredState::Destroy {
                    self.stop_if_running(spec.id, have.state, &mut outcome).await?;
                    hypervisor.destroy(spec.id).await?;
                    outcome.destroyed = true;
                } else {
                    if desired == DesiredState::Start
                        && !spec.restart
                        && changed(&want, &have.descriptor)
                    {
                        outcome.restart_required = true;
                    }

                    self.apply_disk_changes(&want, &have.descriptor, &mut outcome)
                        .await?;

                    match desired {
                        DesiredState::Start => {
                            if !matches!(have.state, VmState::Running | VmState::Starting) {
                                self.start(spec.id).await?;
                                outcome.started = true;
                            }
                        }
                        DesiredState::Stop => {
                            self.stop_if_running(spec.id, have.state, &mut outcome)
                                .await?;
                        }
                        DesiredState::Restart => {
                            self.stop_if_running(spec.id, have.state, &mut outcome)
                                .await?;
                            hypervisor.redefine(&want).await?;
                            outcome.redefined = true;
                            self.start(spec.id).await?;
                            outcome.started = true;
                        }
                        DesiredState::Destroy => {}
                    }
                }
            }
        }

        if outcome.destroyed {
            info!(instance_id = %spec.id, "VM destroyed, removing instance");
            self.deps.service.remove(spec.id).await?;
            return Ok(outcome);
        }

        if desired == DesiredState::Restart && outcome.started {
            self.deps
                .service
                .update(spec.id, |s| s.state = Some(DesiredState::Start))
                .await?;
        }

        outcome.observed = hypervisor.describe(spec.id).await?.map(|vm| vm.state);
        if outcome.observed != spec.vm_state || outcome.restart_required {
            self.deps
                .service
                .record_vm_state(spec.id, outcome.observed, outcome.restart_required)
                .await?;
        }

        Ok(outcome)
    }

    async fn apply_disk_changes(
        &self,
        want: &VmDescriptor,
        have: &VmDescriptor,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), HypervisorError> {
        let changes = disk_changed(want, have);
        for disk in &changes.to_remove {
            info!(instance_id = %want.id, index = disk.index, path = %disk.path.display(), "Detaching disk");
            self.deps.hypervisor.detach_disk(want.id, disk).await?;
            outcome.detached += 1;
        }
        for disk in &changes.to_add {
            info!(instance_id = %want.id, index = disk.index, path = %disk.path.display(), "Attaching disk");
            self.deps.hypervisor.attach_disk(want.id, disk).await?;
            outcome.attached += 1;
        }
        Ok(())
    }

    async fn start(&self, id: InstanceId) -> Result<(), HypervisorError> {
        with_timeout(self.config.start_timeout, self.deps.hypervisor.start(id)).await
    }

    async fn stop_if_running(
        &self,
        id: InstanceId,
        state: VmState,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), HypervisorError> {
        if matches!(state, VmState::Running | VmState::Starting) {
            with_timeout(self.config.stop_timeout, self.deps.hypervisor.stop(id)).await?;
            outcome.stopped = true;
        }
        Ok(())
    }
}

async fn with_timeout<F>(limit: Duration, op: F) -> Result<(), HypervisorError>
where
    F: Future<Output = Result<(), HypervisorError>>,
{
    tokio::time::timeout(limit, op)
        .await
        .map_err(|_| HypervisorError::Timeout(limit))?
}
