//! Core identifier and settings types for BranchSync

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Declares a ULID-backed identifier newtype.
///
/// ULIDs are time-ordered and sort lexicographically, so id order
/// follows creation order within clock resolution.
macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Ulid);

        impl $name {
            /// Create a new id with the current timestamp
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Get the underlying ULID
            pub fn as_ulid(&self) -> &Ulid {
                &self.0
            }

            /// Convert to the canonical string representation
            pub fn to_string_repr(&self) -> String {
                self.0.to_string()
            }

            /// Parse from the canonical string representation
            pub fn from_string(s: &str) -> Result<Self, ulid::DecodeError> {
                Ok(Self(Ulid::from_string(s)?))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "_{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Unique identifier for an Idea (top-level conversation grouping)
    IdeaId,
    "idea"
);

id_type!(
    /// Unique identifier for a Branch within an Idea
    BranchId,
    "branch"
);

id_type!(
    /// Unique identifier for a Bind (one prompt/response turn)
    BindId,
    "bind"
);

id_type!(
    /// Unique identifier for a Message within a Bind
    MessageId,
    "msg"
);

id_type!(
    /// Unique identifier for a Snapshot of a Branch's history
    SnapshotId,
    "snap"
);

/// Device-local settings replicated in every sync payload.
///
/// Field names follow the wire format (`{temperature, maxTokens, isDark,
/// selectedModel}`), which every transport carries verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// Sampling temperature for completions
    pub temperature: f32,
    /// Completion token budget
    pub max_tokens: u32,
    /// Dark theme flag
    pub is_dark: bool,
    /// Model identifier selected on this device
    pub selected_model: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2048,
            is_dark: false,
            selected_model: "default".to_string(),
        }
    }
}
