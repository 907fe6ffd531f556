//! Strongly-typed identifiers.
//!
//! Every record in the platform is keyed by a UUID. Newtypes keep a run id
//! from being passed where a step id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// The underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

id_type!(
    /// Identifier of one execution instance of a task.
    RunId
);

id_type!(
    /// Identifier of one unit of work within a run.
    StepId
);

id_type!(
    /// Identifier of the tenant a run is billed against.
    TenantId
);

id_type!(
    /// Identifier of the user that started a run.
    UserId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types_and_roundtrip() {
        let run = RunId::new();
        let parsed: RunId = run.to_string().parse().unwrap();
        assert_eq!(run, parsed);

        let json = serde_json::to_string(&run).unwrap();
        let back: RunId = serde_json::from_str(&json).unwrap();
        assert_eq!(run, back);
    }

    #[test]
    fn serde_is_transparent() {
        let id = StepId::new();
        let json = serde_json::to_string(&id).unwrap();
        // A bare UUID string, not a wrapper object
        assert!(json.starts_with('"') && json.ends_with('"'));
    }
}
