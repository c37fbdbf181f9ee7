use thiserror::Error;

/// Why a string is not a valid id.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("id is empty")]
    Empty,

    #[error("id is not of the form <prefix>_<ulid>")]
    MissingSeparator,

    /// A well-formed id of another resource kind.
    #[error("expected a '{expected}' id, found a '{found}' id")]
    WrongKind {
        expected: &'static str,
        found: String,
    },

    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}
