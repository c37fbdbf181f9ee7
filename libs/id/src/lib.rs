//! # fleet-id
//!
//! Typed identifiers for everything the fleet control plane tracks.
//!
//! All resource IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `node_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `inst_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `vpc_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! The prefix keeps a VPC id from ever being passed where an instance id is
//! expected, and the ULID keeps ids sortable by creation time.

mod error;
mod macros;
mod types;

pub use error::IdError;
#[doc(hidden)]
pub use macros::parse_prefixed;
pub use types::*;
pub use ulid::Ulid;
