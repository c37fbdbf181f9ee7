//! Heartbeat tick.
//!
//! Each tick samples the host, writes the heartbeat fields to the node
//! document in one find-and-modify, and merges the operator-editable fields
//! of the returned document back into memory. Sampling failures zero the
//! affected fields and are logged; they never stop the loop.

use chrono::Utc;
use fleet_id::NodeId;
use fleet_model::HeartbeatFields;
use fleet_store::StoreError;
use tracing::{debug, error, warn};

use crate::node::{load_certificates, NodeRuntime};

const MIB_PER_GIB: f64 = 1024.0;

impl NodeRuntime {
    /// Run one heartbeat.
    pub async fn heartbeat(&self) {
        let id = self.id().await;

        let memory = self.deps.metrics.memory().await;
        let load = self.deps.metrics.load().await;
        let reserved = self.reserved_capacity(id).await;
        let addresses = self
            .deps
            .metrics
            .bridge_addresses(&self.settings.bridge_name)
            .await;

        let fields = {
            let mut node = self.node.write().await;
            node.timestamp = Utc::now();

            match memory {
                Ok(sample) => {
                    node.memory = sample.used_fraction;
                    node.memory_units = sample.total_gib;
                }
                Err(err) => {
                    node.memory = 0.0;
                    node.memory_units = 0.0;
                    error!(node_id = %id, error = %err, "Failed to sample memory");
                }
            }

            match load {
                Ok(sample) => {
                    node.cpu_units = sample.cpu_units;
                    node.load1 = sample.load1;
                    node.load5 = sample.load5;
                    node.load15 = sample.load15;
                }
                Err(err) => {
                    node.cpu_units = 0;
                    node.load1 = 0.0;
                    node.load5 = 0.0;
                    node.load15 = 0.0;
                    error!(node_id = %id, error = %err, "Failed to sample load");
                }
            }

            match reserved {
                Ok((cpu, memory_gib)) => {
                    node.cpu_units_res = cpu;
                    node.memory_units_res = memory_gib;
                }
                Err(err) => {
                    node.cpu_units_res = 0;
                    node.memory_units_res = 0.0;
                    error!(node_id = %id, error = %err, "Failed to sum reserved capacity");
                }
            }

            match addresses {
                Ok(found) => {
                    node.public_ips = found.ipv4;
                    node.public_ips6 = found.ipv6;
                }
                Err(err) => {
                    warn!(
                        node_id = %id,
                        bridge = %self.settings.bridge_name,
                        error = %err,
                        "Failed to discover bridge addresses, skipping heartbeat write"
                    );
                    return;
                }
            }

            HeartbeatFields::from_node(&node)
        };

        match self.deps.nodes.heartbeat(id, &fields).await {
            Ok(stored) => {
                self.node.write().await.merge_config_from(&stored);
                debug!(node_id = %id, version = %stored.version, "Heartbeat written");
            }
            Err(err) => {
                error!(node_id = %id, error = %err, "Failed to update node");
            }
        }

        let bound = self.node.read().await.certificates.clone();
        match load_certificates(self.deps.certificates.as_ref(), &bound).await {
            Ok(certificates) => *self.certificates.write().await = certificates,
            Err(err) => {
                error!(node_id = %id, error = %err, "Failed to load node certificates");
            }
        }
    }

    /// Processors and memory (GiB) reserved by active instances on this node.
    async fn reserved_capacity(&self, id: NodeId) -> Result<(u32, f64), StoreError> {
        let instances = self.deps.instances.list_node_instances(id).await?;
        Ok(instances
            .iter()
            .filter(|spec| spec.is_active())
            .fold((0u32, 0.0f64), |(cpu, memory), spec| {
                (
                    cpu.saturating_add(spec.processors),
                    memory + f64::from(spec.memory) / MIB_PER_GIB,
                )
            }))
    }
}
