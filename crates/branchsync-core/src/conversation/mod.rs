//! Conversation entity types
//!
//! The data model is a three-level tree: an [`Idea`] groups one or more
//! [`Branch`]es, and each Branch holds an ordered list of [`Bind`]s (one
//! user-prompt/AI-response turn each). A [`Snapshot`] is an immutable,
//! timestamped copy of a Branch's message history.
//!
//! ## Ownership
//!
//! ```text
//! Idea
//! └── Branch (may fork from a parent Branch in the same Idea)
//!     ├── Bind (user prompt + AI response)
//!     ├── Bind
//!     └── Snapshot (immutable message-history copy)
//! ```
//!
//! Entities cross-reference each other by id only; the storage layer
//! keeps one flat table per kind, so cascade deletes are iterative
//! walks over the id tables rather than graph traversals.

pub mod bind;
pub mod branch;
pub mod idea;
pub mod message;
pub mod snapshot;

pub use bind::Bind;
pub use branch::Branch;
pub use idea::Idea;
pub use message::{AttestationInfo, Message, MessageContent, MessagePart, Role};
pub use snapshot::Snapshot;
