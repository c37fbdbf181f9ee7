//! Fleet control plane library.
//!
//! Hosts the instance commit pipeline (validate, persist, publish, release
//! addresses) and the node views that apply the staleness rule. HTTP routing
//! lives outside this crate; everything here is callable directly and from
//! the node agent.

pub mod error;
pub mod hooks;
pub mod instances;
pub mod nodes;

pub use error::CommitError;
pub use hooks::{NetworkLifecycleHook, VpcTransition};
pub use instances::InstanceService;
pub use nodes::NodeService;
