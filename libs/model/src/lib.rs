//! # fleet-model
//!
//! Documents the control plane persists and the rules that keep them
//! consistent:
//!
//! - [`Node`]: one hypervisor host, its capability set, configuration and
//!   the capacity samples its own heartbeat writes.
//! - [`InstanceSpec`]: the declared state of one VM, its validation and the
//!   display status projected from declared and observed state.
//! - [`Disk`] and [`Certificate`]: records referenced by the two above.
//!
//! Validation failures are user-correctable and reported as a structured
//! [`ValidationError`], never as a system error.

mod certificate;
mod disk;
mod error;
mod instance;
mod node;
mod serde_ext;

pub use certificate::Certificate;
pub use disk::{disk_path, Disk};
pub use error::ValidationError;
pub use instance::{
    DesiredState, DisplayStatus, InstanceField, InstanceSpec, VmState, MIN_INIT_DISK_SIZE,
    MIN_MEMORY, MIN_PROCESSORS,
};
pub use node::{
    random_name, HeartbeatFields, HypervisorKind, Node, NodeIdentity, NodeType, Protocol,
    DEFAULT_CACHE_PATH, DEFAULT_PORT, DEFAULT_VIRT_PATH, STALE_AFTER_SECS,
};
