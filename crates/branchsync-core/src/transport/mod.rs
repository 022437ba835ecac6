//! Transport layer for device-to-device sync
//!
//! A [`SyncTransport`] moves one opaque JSON payload between two
//! devices. Four implementations share the contract: animated QR
//! frames, an anonymous HTTP relay, P2P with a signaling server, and
//! Bluetooth LE.
//!
//! ## Contract
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncTransport (per direction)                                  │
//! │                                                                 │
//! │  Idle ──start_*──▶ Active ──▶ {Completed | Failed | Cancelled}  │
//! │    ▲                                        │                   │
//! │    └────────────────────────────────────────┘                   │
//! │                                                                 │
//! │  - start_* emits exactly one *Started and one terminal event    │
//! │  - stop_* is idempotent and safe to call when idle              │
//! │  - starting anew cancels and awaits the previous operation      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Pre-flight failures (payload over the chunk budget, missing
//! capability) are returned synchronously from `start_*` before any
//! resource acquisition; everything after start is reported through
//! the event surface only.
//!
//! Each transport instance owns its own event channel - there is no
//! shared global bus, and the coordinator receives transport instances
//! by injection.

use async_trait::async_trait;
use rand::RngCore;
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SyncResult;
use crate::payload::SyncPayload;

pub mod ble;
pub mod chunk;
pub mod p2p;
pub mod qr;
pub mod relay;

pub use ble::{BleConfig, BleTransport, GattLink, LoopbackLink};
pub use chunk::{split_payload, Chunk, ChunkAssembler};
pub use p2p::{P2pConfig, P2pTransport, PeerSignal, SignalMessage};
pub use qr::{QrConfig, QrFrame, QrFrameSink, QrFrameSource, QrFrameTransport};
pub use relay::{RelayConfig, RelayTransport};

/// Default capacity for a transport's event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Which physical channel a transport drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Animated QR-code frames
    QrFrames,
    /// Anonymous HTTP relay
    Relay,
    /// Peer-to-peer data channel with signaling
    PeerToPeer,
    /// Bluetooth LE GATT characteristic
    Ble,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::QrFrames => write!(f, "qr"),
            TransportKind::Relay => write!(f, "relay"),
            TransportKind::PeerToPeer => write!(f, "p2p"),
            TransportKind::Ble => write!(f, "ble"),
        }
    }
}

/// Direction of a transport operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Transmitting a payload
    Send,
    /// Receiving a payload
    Receive,
}

/// Events emitted by a transport, per direction.
///
/// Every started operation delivers exactly one terminal event:
/// `SendCompleted`/`SendFailed`/`SendCancelled` for sends,
/// `ReceiveCompleted`/`ReceiveFailed`/`ReceiveCancelled` for receives.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Transmission began
    SendStarted,
    /// Transmission progress (chunks or frames)
    SendProgress {
        /// Units sent so far
        sent: usize,
        /// Total units
        total: usize,
    },
    /// Transmission finished successfully
    SendCompleted,
    /// Transmission failed
    SendFailed {
        /// Human-readable failure description
        message: String,
    },
    /// Transmission was cancelled by `stop_sending`
    SendCancelled,
    /// Reception began
    ReceiveStarted,
    /// Reception progress; `total` is `None` when indeterminate
    ReceiveProgress {
        /// Units received so far
        received: usize,
        /// Total units, when known
        total: Option<usize>,
    },
    /// Reception finished with a decoded payload
    ReceiveCompleted {
        /// The decoded sync payload
        payload: SyncPayload,
    },
    /// Reception failed
    ReceiveFailed {
        /// Human-readable failure description
        message: String,
    },
    /// Reception was cancelled by `stop_receiving`
    ReceiveCancelled,
    /// A connection code (relay path, room id) the caller should
    /// present to the counterpart device
    ConnectionCode {
        /// The code to show or share
        code: String,
    },
}

impl TransportEvent {
    /// Whether this event closes an operation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransportEvent::SendCompleted
                | TransportEvent::SendFailed { .. }
                | TransportEvent::SendCancelled
                | TransportEvent::ReceiveCompleted { .. }
                | TransportEvent::ReceiveFailed { .. }
                | TransportEvent::ReceiveCancelled
        )
    }

    /// The direction this event belongs to, if any.
    pub fn direction(&self) -> Option<Direction> {
        match self {
            TransportEvent::SendStarted
            | TransportEvent::SendProgress { .. }
            | TransportEvent::SendCompleted
            | TransportEvent::SendFailed { .. }
            | TransportEvent::SendCancelled => Some(Direction::Send),
            TransportEvent::ReceiveStarted
            | TransportEvent::ReceiveProgress { .. }
            | TransportEvent::ReceiveCompleted { .. }
            | TransportEvent::ReceiveFailed { .. }
            | TransportEvent::ReceiveCancelled => Some(Direction::Receive),
            TransportEvent::ConnectionCode { .. } => None,
        }
    }
}

/// Options for `start_sending`
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Connection code (relay path, room id); generated when absent
    pub code: Option<String>,
    /// For frame-cycling transports: number of full passes before
    /// completing; `None` cycles until stopped
    pub cycles: Option<u32>,
}

/// Options for `start_receiving`
#[derive(Debug, Clone, Default)]
pub struct ReceiveOptions {
    /// Connection code (relay path, room id) to receive on
    pub code: Option<String>,
    /// Payload pushed to the counterpart when a bidirectional channel
    /// opens (sync on connect); ignored by one-way transports
    pub reply_payload: Option<SyncPayload>,
}

/// A pluggable channel that moves a serialized sync payload between
/// two devices.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Which physical channel this transport drives.
    fn kind(&self) -> TransportKind;

    /// Environment capability probe, checked before any resource
    /// acquisition.
    fn is_available(&self) -> bool;

    /// Subscribe to this instance's events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Begin asynchronous transmission of `payload`.
    ///
    /// Returns an error only for pre-flight validation failures;
    /// transport faults after start arrive as a terminal `SendFailed`.
    async fn start_sending(&self, payload: SyncPayload, options: SendOptions) -> SyncResult<()>;

    /// Begin asynchronous reception.
    ///
    /// Same error discipline as [`start_sending`](Self::start_sending).
    async fn start_receiving(&self, options: ReceiveOptions) -> SyncResult<()>;

    /// Cancel the active send, if any. Idempotent; awaits closure.
    async fn stop_sending(&self);

    /// Cancel the active receive, if any. Idempotent; awaits closure.
    async fn stop_receiving(&self);
}

/// One running operation: its cancellation token and worker task.
struct ActiveOp {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Shared per-instance lifecycle state: the event channel and one
/// operation slot per direction.
///
/// Guarantees the contract mechanics every transport needs: starting a
/// new operation cancels and awaits the previous one, and `stop` is
/// idempotent.
pub(crate) struct TransportCore {
    event_tx: broadcast::Sender<TransportEvent>,
    send_op: Mutex<Option<ActiveOp>>,
    recv_op: Mutex<Option<ActiveOp>>,
}

impl TransportCore {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            event_tx,
            send_op: Mutex::new(None),
            recv_op: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event);
    }

    fn slot(&self, direction: Direction) -> &Mutex<Option<ActiveOp>> {
        match direction {
            Direction::Send => &self.send_op,
            Direction::Receive => &self.recv_op,
        }
    }

    /// Stop the previous operation in this direction (awaiting its
    /// closure) and hand back a fresh token for the next one.
    pub async fn prepare(&self, direction: Direction) -> CancellationToken {
        self.stop(direction).await;
        CancellationToken::new()
    }

    /// Register the worker for an operation started with `prepare`.
    pub async fn install(&self, direction: Direction, token: CancellationToken, task: JoinHandle<()>) {
        *self.slot(direction).lock().await = Some(ActiveOp { token, task });
    }

    /// Cancel and await the active operation, if any. Idempotent.
    pub async fn stop(&self, direction: Direction) {
        let op = self.slot(direction).lock().await.take();
        if let Some(op) = op {
            debug!(?direction, "Stopping active transport operation");
            op.token.cancel();
            let _ = op.task.await;
        }
    }
}

/// Generate a short base58 connection code (relay path, room id).
pub fn random_code() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    bs58::encode(&bytes).into_string()
}
