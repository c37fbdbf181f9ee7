//! Structured validation failures.

use serde::Serialize;
use thiserror::Error;

/// A user-correctable validation failure.
///
/// `code` is a stable machine-readable token (`vpc_required`), `message` the
/// human-readable text.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{message} ({code})")]
pub struct ValidationError {
    #[serde(rename = "error")]
    pub code: &'static str,
    pub message: &'static str,
}

impl ValidationError {
    pub const fn new(code: &'static str, message: &'static str) -> Self {
        Self { code, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_serialization() {
        let err = ValidationError::new("zone_required", "Missing required zone");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["error"], "zone_required");
        assert_eq!(json["message"], "Missing required zone");
        assert_eq!(err.to_string(), "Missing required zone (zone_required)");
    }
}
