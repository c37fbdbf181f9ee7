//! The running node's runtime context.
//!
//! One [`NodeRuntime`] is built at process start and shared through an
//! `Arc` with the heartbeat task, the request-rate task and any request
//! handler that counts requests.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_events::{ChangeEvent, Publisher};
use fleet_id::{CertificateId, NodeId};
use fleet_model::{Certificate, Node, NodeIdentity};
use fleet_store::{CertificateStore, InstanceStore, NodeStore, StoreError};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::capacity::RequestCounter;
use crate::resources::MetricsSource;
use crate::task::{spawn_periodic, FirstTick};

/// Period of the request-rate window; one bucket per tick.
pub const REQUEST_WINDOW_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to load node {id}: {source}")]
    Load {
        id: NodeId,
        #[source]
        source: StoreError,
    },

    #[error("failed to register node {id}: {source}")]
    Register {
        id: NodeId,
        #[source]
        source: StoreError,
    },

    #[error("failed to load node certificates: {0}")]
    Certificates(#[source] StoreError),
}

/// Collaborators the runtime reads from and writes to.
#[derive(Clone)]
pub struct NodeDeps {
    pub nodes: Arc<dyn NodeStore>,
    pub certificates: Arc<dyn CertificateStore>,
    pub instances: Arc<dyn InstanceStore>,
    pub metrics: Arc<dyn MetricsSource>,
    pub publisher: Arc<dyn Publisher>,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub bridge_name: String,
    pub heartbeat_interval: Duration,
}

pub struct NodeRuntime {
    pub(crate) node: RwLock<Node>,
    pub(crate) certificates: RwLock<Vec<Certificate>>,
    pub(crate) requests: RequestCounter,
    pub(crate) deps: NodeDeps,
    pub(crate) settings: RuntimeSettings,
}

impl NodeRuntime {
    /// Load or create this node's document and register its identity.
    ///
    /// A missing document is not an error; any other store failure is.
    /// Certificates that no longer exist are dropped from the bound set.
    #[instrument(skip(deps, settings))]
    pub async fn init(
        id: NodeId,
        deps: NodeDeps,
        settings: RuntimeSettings,
    ) -> Result<Arc<Self>, NodeError> {
        let (mut node, created) = match deps.nodes.find_node(id).await {
            Ok(node) => (node, false),
            Err(err) if err.is_not_found() => (Node::new(id), true),
            Err(source) => return Err(NodeError::Load { id, source }),
        };

        node.software_version = env!("CARGO_PKG_VERSION").to_string();
        node.apply_init_defaults(created);
        node.timestamp = Utc::now();

        let stored = deps
            .nodes
            .upsert_identity(&NodeIdentity::from_node(&node))
            .await
            .map_err(|source| NodeError::Register { id, source })?;
        node.merge_config_from(&stored);

        let certificates = load_certificates(deps.certificates.as_ref(), &node.certificates)
            .await
            .map_err(NodeError::Certificates)?;

        info!(
            node_id = %id,
            name = %node.name,
            created,
            version = %node.version,
            "Node initialized"
        );
        deps.publisher.publish(ChangeEvent::Node(Some(id)));

        Ok(Arc::new(Self {
            node: RwLock::new(node),
            certificates: RwLock::new(certificates),
            requests: RequestCounter::new(),
            deps,
            settings,
        }))
    }

    /// Start the heartbeat and request-rate tasks. Both run until
    /// `shutdown` flips to `true`.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let heartbeat = {
            let runtime = Arc::clone(self);
            spawn_periodic(
                "heartbeat",
                self.settings.heartbeat_interval,
                FirstTick::Immediately,
                shutdown.clone(),
                move || {
                    let runtime = Arc::clone(&runtime);
                    async move { runtime.heartbeat().await }
                },
            )
        };

        let request_rate = {
            let runtime = Arc::clone(self);
            spawn_periodic(
                "request-rate",
                REQUEST_WINDOW_TICK,
                FirstTick::AfterPeriod,
                shutdown,
                move || {
                    let runtime = Arc::clone(&runtime);
                    async move { runtime.aggregate_requests().await }
                },
            )
        };

        vec![heartbeat, request_rate]
    }

    pub async fn id(&self) -> NodeId {
        self.node.read().await.id
    }

    /// Count one handled request.
    pub fn add_request(&self) {
        self.requests.add_request();
    }

    /// Publish the trailing-minute request count and advance the window.
    pub async fn aggregate_requests(&self) {
        let total = self.requests.rotate();
        self.node.write().await.requests_min = total;
        debug!(requests_min = total, "Request rate updated");
    }

    /// The node as readers should see it: stale capacity reads zero.
    pub async fn snapshot(&self) -> Node {
        let mut node = self.node.read().await.clone();
        node.apply_staleness(Utc::now());
        node
    }

    pub async fn certificates(&self) -> Vec<Certificate> {
        self.certificates.read().await.clone()
    }
}

/// Resolve bound certificates, skipping ids that no longer exist.
pub(crate) async fn load_certificates(
    store: &dyn CertificateStore,
    ids: &[CertificateId],
) -> Result<Vec<Certificate>, StoreError> {
    let mut certificates = Vec::with_capacity(ids.len());
    for id in ids {
        match store.get_certificate(*id).await {
            Ok(cert) => certificates.push(cert),
            Err(err) if err.is_not_found() => {
                debug!(certificate_id = %id, "Bound certificate no longer exists");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(certificates)
}
