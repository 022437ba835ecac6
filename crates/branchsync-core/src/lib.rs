//! BranchSync Core Library
//!
//! Cross-device synchronization for branching conversations, with no
//! central server of record.
//!
//! ## Overview
//!
//! BranchSync replicates a branching conversation store (Ideas →
//! Branches → Binds) between independent devices over four
//! interchangeable transports: animated QR-code frames, an anonymous
//! HTTP relay, a P2P data channel negotiated through a signaling
//! server, and Bluetooth LE. All four speak the same JSON payload and
//! share one lifecycle contract, so callers plug any of them into the
//! same coordinator.
//!
//! ## Core Principles
//!
//! - **Local-first**: the repository is fully usable offline; sync
//!   happens when a counterpart device appears
//! - **No server of record**: transports move payloads between peers;
//!   nothing central owns the data
//! - **Last-writer-wins merge**: message lists union by id, metadata
//!   follows the newer side; no causal-history tracking
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use branchsync_core::{
//!     ConversationRepository, Message, RelayConfig, RelayTransport,
//!     SendOptions, Storage, SyncCoordinator,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = Storage::new("~/.branchsync/data/store.redb")?;
//!     let repo = ConversationRepository::new(storage);
//!
//!     // Record a conversation turn
//!     let idea = repo.create_idea("Trip planning", "")?;
//!     let branch = repo.create_branch("main", &idea.id, None)?;
//!     repo.create_bind(
//!         &branch.id,
//!         Message::user("Where to in March?"),
//!         Message::assistant("Somewhere warm."),
//!     )?;
//!
//!     // Push everything through an anonymous relay
//!     let coordinator = SyncCoordinator::new(repo);
//!     let relay = Arc::new(RelayTransport::new(RelayConfig::default()));
//!     coordinator.start_sending(relay, SendOptions::default()).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod conversation;
pub mod coordinator;
pub mod error;
pub mod merge;
pub mod payload;
pub mod repository;
pub mod storage;
pub mod transport;
pub mod types;

// Re-exports
pub use conversation::{
    AttestationInfo, Bind, Branch, Idea, Message, MessageContent, MessagePart, Role, Snapshot,
};
pub use coordinator::{CoordinatorEvent, CoordinatorState, SyncCoordinator};
pub use error::{SyncError, SyncResult};
pub use merge::{ImportStats, MergeEngine};
pub use payload::{SyncBranch, SyncPayload};
pub use repository::{ConversationRepository, RepositoryEvent};
pub use storage::{SettingsRecord, Storage};
pub use transport::{
    BleConfig, BleTransport, GattLink, LoopbackLink, P2pConfig, P2pTransport, QrConfig, QrFrame,
    QrFrameSink, QrFrameSource, QrFrameTransport, ReceiveOptions, RelayConfig, RelayTransport,
    SendOptions, SyncTransport, TransportEvent, TransportKind,
};
pub use types::*;
