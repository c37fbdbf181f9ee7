//! Fleet node agent library.
//!
//! The node agent runs on each hypervisor host. It keeps the host's node
//! document current (identity, capacity samples, public addresses, request
//! rate) and converges the VMs assigned to the host toward their declared
//! state.
//!
//! ## Architecture
//!
//! ```text
//! NodeRuntime
//! ├── heartbeat task      (1s: sample, find-and-modify, merge back)
//! └── request-rate task   (1s: sum the 60-bucket window, rotate)
//! Reconciler              (per pass: translate, diff, hot-plug, lifecycle)
//! ```
//!
//! All three loops are [`task::spawn_periodic`] tasks sharing one shutdown
//! flag.

pub mod capacity;
pub mod config;
pub mod heartbeat;
pub mod hypervisor;
pub mod node;
pub mod reconciler;
pub mod resources;
pub mod task;

pub use capacity::{CapacityWindow, RequestCounter};
pub use config::{Config, HypervisorSettings};
pub use hypervisor::{Hypervisor, HypervisorError, MockHypervisor, VmSnapshot};
pub use node::{NodeDeps, NodeError, NodeRuntime, RuntimeSettings};
pub use reconciler::{Reconciler, ReconcilerConfig, ReconcilerDeps, ReconcileOutcome};
pub use resources::{MetricsSource, SystemMetrics};
