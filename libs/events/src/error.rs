//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when handling events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The event name is unknown.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
}
