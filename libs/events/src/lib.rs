//! # fleet-events
//!
//! Change notifications for downstream cache invalidation.
//!
//! Events are named after the collection that changed (`node.change`,
//! `instance.change`, ...) and carry the id of the changed document when one
//! is known. Publishing is fire-and-forget: delivery is attempted, never
//! guaranteed, and a publish never fails the operation that triggered it.

mod error;
mod publisher;
mod types;

pub use error::EventError;
pub use publisher::{BroadcastPublisher, NoopPublisher, Publisher};
pub use types::*;
