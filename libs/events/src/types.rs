//! Change event definitions.

use fleet_id::{InstanceId, NodeId, VpcId};
use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    pub const NODE_CHANGE: &str = "node.change";
    pub const INSTANCE_CHANGE: &str = "instance.change";
    pub const VPC_CHANGE: &str = "vpc.change";
}

/// The kind of collection a change event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Node,
    Instance,
    Vpc,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Node => event_types::NODE_CHANGE,
            Self::Instance => event_types::INSTANCE_CHANGE,
            Self::Vpc => event_types::VPC_CHANGE,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            event_types::NODE_CHANGE => Ok(Self::Node),
            event_types::INSTANCE_CHANGE => Ok(Self::Instance),
            event_types::VPC_CHANGE => Ok(Self::Vpc),
            other => Err(EventError::UnknownEventType(other.to_string())),
        }
    }
}

/// A change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id")]
pub enum ChangeEvent {
    #[serde(rename = "node.change")]
    Node(Option<NodeId>),
    #[serde(rename = "instance.change")]
    Instance(Option<InstanceId>),
    #[serde(rename = "vpc.change")]
    Vpc(Option<VpcId>),
}

impl ChangeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Node(_) => EventKind::Node,
            Self::Instance(_) => EventKind::Instance,
            Self::Vpc(_) => EventKind::Vpc,
        }
    }

    /// The event name as published on the bus.
    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }
}
