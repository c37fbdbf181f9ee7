//! Typed ID definitions for fleet resources.

use crate::define_id;

// =============================================================================
// Fleet topology
// =============================================================================

define_id!(NodeId, "node");
define_id!(ZoneId, "zone");
define_id!(CertificateId, "cert");

// =============================================================================
// Tenancy
// =============================================================================

define_id!(OrgId, "org");
define_id!(DomainId, "dom");

// =============================================================================
// Compute and storage
// =============================================================================

define_id!(InstanceId, "inst");
define_id!(ImageId, "img");
define_id!(DiskId, "disk");

// =============================================================================
// Networking
// =============================================================================

define_id!(VpcId, "vpc");

// =============================================================================
// Document version
// =============================================================================

/// Monotonic version counter stamped on a persisted document.
///
/// Every write bumps it; it is never reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocVersion(u64);

impl DocVersion {
    /// Version of a document that has never been written.
    pub const INITIAL: Self = Self(0);

    #[must_use]
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the next version.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl std::fmt::Display for DocVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl serde::Serialize for DocVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for DocVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let version = u64::deserialize(deserializer)?;
        Ok(Self(version))
    }
}

// =============================================================================
// Tests
// =============================================================================
