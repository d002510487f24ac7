//! Identifier newtypes.
//!
//! All identifiers are opaque strings on the wire. The newtypes keep maps
//! keyed by different identifier kinds from being mixed up.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! impl_string_id {
    ($name:ident) => {
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }
    };
}

impl_string_id!(AgentId);
impl_string_id!(AccountId);
impl_string_id!(CoordinatorId);
impl_string_id!(TaskId);
impl_string_id!(TxId);
impl_string_id!(MessageId);

impl TaskId {
    /// Generates a fresh random task id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl TxId {
    pub fn generate() -> Self {
        Self(format!("tx-{}", Uuid::new_v4()))
    }
}

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Issuance epoch identifier, monotonically increasing per window.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct EpochId(u64);

impl EpochId {
    pub const fn new(idx: u64) -> Self {
        Self(idx)
    }

    pub const fn idx(&self) -> u64 {
        self.0
    }

    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for EpochId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(TaskId::generate(), TaskId::generate());
        assert_ne!(MessageId::generate(), MessageId::generate());
    }

    #[test]
    fn serde_is_transparent() {
        let id = AgentId::new("a1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"a1\"");
    }
}
