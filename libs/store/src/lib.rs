//! # fleet-store
//!
//! Persistence collaborators for the fleet documents. Each collection has a
//! trait so services can run against [`MemoryStore`] in tests and
//! [`SqliteStore`] in the agent binary.
//!
//! Every store operation distinguishes "not found" ([`StoreError::NotFound`])
//! from other failures; several callers treat it as absence rather than an
//! error.

mod error;
mod memory;
mod sqlite;
mod traits;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{CertificateStore, DiskStore, InstanceStore, NodeStore, ZoneStore};
