use fleet_id::CertificateId;
use serde::{Deserialize, Serialize};

/// A TLS certificate a node can be bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub id: CertificateId,
    #[serde(default)]
    pub name: String,
    /// PEM-encoded certificate chain.
    #[serde(default)]
    pub certificate: String,
    /// PEM-encoded private key.
    #[serde(default)]
    pub key: String,
}
