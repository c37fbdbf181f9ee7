//! Address lifecycle around an instance commit.
//!
//! The hook runs in two phases. [`NetworkLifecycleHook::pre_commit`] records
//! the VPC binding before any incoming change is applied and returns it as a
//! [`VpcTransition`]; [`NetworkLifecycleHook::post_commit`] consumes that
//! record after the write and releases the old address when the binding
//! moved. Consuming the record makes a second release for the same
//! transition impossible.

use std::sync::Arc;

use fleet_id::{InstanceId, VpcId};
use fleet_model::InstanceSpec;
use fleet_networking::{AddressPool, PoolError};
use tracing::info;

/// VPC binding captured before an instance update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "pass the transition to post_commit after the write"]
pub struct VpcTransition {
    pub instance: InstanceId,
    pub prior_vpc: Option<VpcId>,
}

impl VpcTransition {
    /// The VPC whose address must be released once `current` is committed.
    pub fn released_vpc(&self, current: Option<VpcId>) -> Option<VpcId> {
        match self.prior_vpc {
            Some(prior) if Some(prior) != current => Some(prior),
            _ => None,
        }
    }
}

pub struct NetworkLifecycleHook {
    pool: Arc<dyn AddressPool>,
}

impl NetworkLifecycleHook {
    pub fn new(pool: Arc<dyn AddressPool>) -> Self {
        Self { pool }
    }

    /// Capture the binding in effect. Call before applying the update.
    pub fn pre_commit(&self, spec: &InstanceSpec) -> VpcTransition {
        VpcTransition {
            instance: spec.id,
            prior_vpc: spec.vpc,
        }
    }

    /// Release the instance's address in its previous VPC if the committed
    /// binding differs. Returns the VPC released from, if any.
    pub async fn post_commit(
        &self,
        transition: VpcTransition,
        committed: &InstanceSpec,
    ) -> Result<Option<VpcId>, PoolError> {
        let Some(old_vpc) = transition.released_vpc(committed.vpc) else {
            return Ok(None);
        };

        info!(
            instance_id = %transition.instance,
            old_vpc = %old_vpc,
            new_vpc = ?committed.vpc.map(|v| v.to_string()),
            "Releasing address after VPC change"
        );
        self.pool.release(transition.instance, old_vpc).await?;
        Ok(Some(old_vpc))
    }
}
