//! `define_id!` and the parsing it shares across id types.

use crate::IdError;

/// Split `{prefix}_{ulid}` and check the prefix. Used by [`define_id!`].
#[doc(hidden)]
pub fn parse_prefixed(input: &str, prefix: &'static str) -> Result<ulid::Ulid, IdError> {
    let (found, raw) = input.split_once('_').ok_or_else(|| {
        if input.is_empty() {
            IdError::Empty
        } else {
            IdError::MissingSeparator
        }
    })?;

    if found != prefix {
        return Err(IdError::WrongKind {
            expected: prefix,
            found: found.to_owned(),
        });
    }

    raw.parse()
        .map_err(|err: ulid::DecodeError| IdError::InvalidUlid(err.to_string()))
}

/// Declare a ULID-backed id type rendered as `{prefix}_{ulid}`.
///
/// ```ignore
/// define_id!(NodeId, "node");
/// let id: NodeId = "node_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse()?;
/// ```
///
/// The type serializes as that same string, so ids read the same in the
/// document store, in logs and in configuration.
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// A fresh id, ordered after every id generated before it.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            #[must_use]
            pub const fn from_ulid(ulid: $crate::Ulid) -> Self {
                Self(ulid)
            }

            pub fn parse(input: &str) -> Result<Self, $crate::IdError> {
                $crate::parse_prefixed(input, Self::PREFIX).map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
                Self::parse(&raw).map_err(serde::de::Error::custom)
            }
        }
    };
}
