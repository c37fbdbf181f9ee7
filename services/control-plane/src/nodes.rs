//! Node views and the operator configuration path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleet_events::{ChangeEvent, Publisher};
use fleet_id::NodeId;
use fleet_model::Node;
use fleet_store::{NodeStore, StoreError, ZoneStore};
use tracing::{info, instrument};

use crate::CommitError;

pub struct NodeService {
    nodes: Arc<dyn NodeStore>,
    zones: Arc<dyn ZoneStore>,
    publisher: Arc<dyn Publisher>,
}

impl NodeService {
    pub fn new(
        nodes: Arc<dyn NodeStore>,
        zones: Arc<dyn ZoneStore>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            nodes,
            zones,
            publisher,
        }
    }

    /// A node as readers should see it at `now`: stale capacity reads zero.
    pub async fn get(&self, id: NodeId, now: DateTime<Utc>) -> Result<Node, StoreError> {
        let mut node = self.nodes.find_node(id).await?;
        node.apply_staleness(now);
        Ok(node)
    }

    pub async fn list(&self, now: DateTime<Utc>) -> Result<Vec<Node>, StoreError> {
        let mut nodes = self.nodes.list_nodes().await?;
        for node in &mut nodes {
            node.apply_staleness(now);
        }
        Ok(nodes)
    }

    /// Apply an operator edit through validation and a full commit.
    ///
    /// A zone that no longer exists is dropped from the node rather than
    /// rejected. The running agent picks the change up on its next
    /// heartbeat.
    #[instrument(skip(self, change))]
    pub async fn update<F>(&self, id: NodeId, change: F) -> Result<Node, CommitError>
    where
        F: FnOnce(&mut Node) + Send,
    {
        let mut node = self.nodes.find_node(id).await?;
        change(&mut node);

        if let Some(zone) = node.zone {
            if !self.zones.zone_exists(zone).await? {
                info!(node_id = %id, zone_id = %zone, "Clearing unknown zone");
                node.zone = None;
            }
        }

        node.validate()?;
        node.version = self.nodes.commit_node(&node).await?;

        info!(node_id = %id, version = %node.version, "Node configuration updated");
        self.publisher.publish(ChangeEvent::Node(Some(id)));
        Ok(node)
    }
}
