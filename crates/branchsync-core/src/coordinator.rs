//! SyncCoordinator - one transport-agnostic surface over device sync
//!
//! The coordinator owns at most one active transport per direction,
//! serializes repository snapshots into payloads, routes received
//! payloads to the [`MergeEngine`], and re-emits transport events on a
//! single unified channel. Transport-specific artifacts (QR frames,
//! camera previews, textual codes) are the caller's concern - the
//! coordinator only surfaces the connection code.
//!
//! Every terminal transport event - success, failure, or cancellation -
//! resets the coordinator state (sending/receiving flags cleared,
//! cached connection code dropped), so callers can always observe a
//! quiescent state and immediately retry after an error.
//!
//! Transports never touch the repository; the merge engine runs only
//! here, after a completed receive.

use std::sync::Arc;

use parking_lot::Mutex as StateMutex;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{SyncError, SyncResult};
use crate::merge::{ImportStats, MergeEngine};
use crate::payload::SyncPayload;
use crate::repository::ConversationRepository;
use crate::transport::{
    Direction, ReceiveOptions, SendOptions, SyncTransport, TransportEvent, TransportKind,
};

/// Default capacity for the coordinator's event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Observable coordinator state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorState {
    /// A send operation is in flight
    pub sending: bool,
    /// A receive operation is in flight
    pub receiving: bool,
    /// Connection code of the active operation, when the transport
    /// surfaced one
    pub connection_code: Option<String>,
}

/// Events on the coordinator's unified surface.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// A send began on the given transport
    SendStarted {
        /// The active transport kind
        kind: TransportKind,
    },
    /// Send progress
    SendProgress {
        /// The active transport kind
        kind: TransportKind,
        /// Units sent
        sent: usize,
        /// Total units
        total: usize,
    },
    /// The send finished successfully
    SendCompleted {
        /// The active transport kind
        kind: TransportKind,
    },
    /// The send failed
    SendFailed {
        /// The active transport kind
        kind: TransportKind,
        /// Failure description
        message: String,
    },
    /// The send was cancelled
    SendCancelled {
        /// The active transport kind
        kind: TransportKind,
    },
    /// A receive began on the given transport
    ReceiveStarted {
        /// The active transport kind
        kind: TransportKind,
    },
    /// Receive progress
    ReceiveProgress {
        /// The active transport kind
        kind: TransportKind,
        /// Units received
        received: usize,
        /// Total units, when known
        total: Option<usize>,
    },
    /// A payload arrived and was merged into the repository
    Imported {
        /// The active transport kind
        kind: TransportKind,
        /// What the merge changed
        stats: ImportStats,
    },
    /// The receive failed
    ReceiveFailed {
        /// The active transport kind
        kind: TransportKind,
        /// Failure description
        message: String,
    },
    /// The receive was cancelled
    ReceiveCancelled {
        /// The active transport kind
        kind: TransportKind,
    },
    /// A connection code to present to the counterpart device
    ConnectionCode {
        /// The code
        code: String,
    },
}

/// One direction's active transport and its event forwarder.
struct ActiveSync {
    transport: Arc<dyn SyncTransport>,
    forwarder: JoinHandle<()>,
}

/// Transport-agnostic coordinator for device-to-device sync.
pub struct SyncCoordinator {
    repo: ConversationRepository,
    merge: MergeEngine,
    state: Arc<StateMutex<CoordinatorState>>,
    event_tx: broadcast::Sender<CoordinatorEvent>,
    send_slot: Mutex<Option<ActiveSync>>,
    recv_slot: Mutex<Option<ActiveSync>>,
}

impl SyncCoordinator {
    /// Create a coordinator over the repository.
    pub fn new(repo: ConversationRepository) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            merge: MergeEngine::new(repo.clone()),
            repo,
            state: Arc::new(StateMutex::new(CoordinatorState::default())),
            event_tx,
            send_slot: Mutex::new(None),
            recv_slot: Mutex::new(None),
        }
    }

    /// Subscribe to the unified event surface.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.event_tx.subscribe()
    }

    /// Current coordinator state.
    pub fn state(&self) -> CoordinatorState {
        self.state.lock().clone()
    }

    /// Whether a send is in flight.
    pub fn is_sending(&self) -> bool {
        self.state.lock().sending
    }

    /// Whether a receive is in flight.
    pub fn is_receiving(&self) -> bool {
        self.state.lock().receiving
    }

    /// The repository this coordinator syncs.
    pub fn repository(&self) -> &ConversationRepository {
        &self.repo
    }

    /// Begin sending the current repository snapshot over `transport`.
    ///
    /// Any previous send is stopped and awaited first, so two
    /// transports can never hold the same hardware resource.
    pub async fn start_sending(
        &self,
        transport: Arc<dyn SyncTransport>,
        options: SendOptions,
    ) -> SyncResult<()> {
        self.stop_sending().await;

        if !transport.is_available() {
            return Err(SyncError::CapabilityUnavailable(format!(
                "{} transport is not available",
                transport.kind()
            )));
        }

        let payload = SyncPayload::from_repository(&self.repo)?;
        info!(kind = %transport.kind(), branches = payload.branches.len(), "Starting sync send");

        // Subscribe before starting so no event can be missed
        let events = transport.subscribe();
        let forwarder = tokio::spawn(Self::forward_events(
            Direction::Send,
            transport.kind(),
            events,
            self.state.clone(),
            self.event_tx.clone(),
            self.merge.clone(),
        ));

        if let Err(e) = transport.start_sending(payload, options).await {
            forwarder.abort();
            return Err(e);
        }

        self.state.lock().sending = true;
        *self.send_slot.lock().await = Some(ActiveSync {
            transport,
            forwarder,
        });
        Ok(())
    }

    /// Begin receiving over `transport`.
    ///
    /// When the transport's channel is bidirectional, the current
    /// repository snapshot is pushed to the counterpart on connect -
    /// sync on connect is implicit, not opt-in.
    pub async fn start_receiving(
        &self,
        transport: Arc<dyn SyncTransport>,
        mut options: ReceiveOptions,
    ) -> SyncResult<()> {
        self.stop_receiving().await;

        if !transport.is_available() {
            return Err(SyncError::CapabilityUnavailable(format!(
                "{} transport is not available",
                transport.kind()
            )));
        }

        if options.reply_payload.is_none() {
            options.reply_payload = Some(SyncPayload::from_repository(&self.repo)?);
        }
        info!(kind = %transport.kind(), "Starting sync receive");

        let events = transport.subscribe();
        let forwarder = tokio::spawn(Self::forward_events(
            Direction::Receive,
            transport.kind(),
            events,
            self.state.clone(),
            self.event_tx.clone(),
            self.merge.clone(),
        ));

        if let Err(e) = transport.start_receiving(options).await {
            forwarder.abort();
            return Err(e);
        }

        self.state.lock().receiving = true;
        *self.recv_slot.lock().await = Some(ActiveSync {
            transport,
            forwarder,
        });
        Ok(())
    }

    /// Stop the active send, if any. Idempotent; awaits full closure.
    pub async fn stop_sending(&self) {
        let active = self.send_slot.lock().await.take();
        if let Some(active) = active {
            active.transport.stop_sending().await;
            let _ = active.forwarder.await;
        }
        // Flags are normally cleared by the forwarder on the terminal
        // event; clear again in case it was already gone
        let mut state = self.state.lock();
        state.sending = false;
        if !state.receiving {
            state.connection_code = None;
        }
    }

    /// Stop the active receive, if any. Idempotent; awaits closure.
    pub async fn stop_receiving(&self) {
        let active = self.recv_slot.lock().await.take();
        if let Some(active) = active {
            active.transport.stop_receiving().await;
            let _ = active.forwarder.await;
        }
        let mut state = self.state.lock();
        state.receiving = false;
        if !state.sending {
            state.connection_code = None;
        }
    }

    /// Re-push the current snapshot over the active send transport
    /// ("sync now"), or report the coordinator idle.
    pub async fn sync_now(&self) -> SyncResult<()> {
        let transport = {
            let slot = self.send_slot.lock().await;
            slot.as_ref().map(|active| active.transport.clone())
        };
        match transport {
            Some(transport) => self.start_sending(transport, SendOptions::default()).await,
            None => Err(SyncError::InvalidOperation(
                "no active send transport".to_string(),
            )),
        }
    }

    /// Forward transport events to the unified surface, import
    /// received payloads, and reset state on the terminal event.
    async fn forward_events(
        direction: Direction,
        kind: TransportKind,
        mut events: broadcast::Receiver<TransportEvent>,
        state: Arc<StateMutex<CoordinatorState>>,
        event_tx: broadcast::Sender<CoordinatorEvent>,
        merge: MergeEngine,
    ) {
        let reset = |state: &Arc<StateMutex<CoordinatorState>>| {
            let mut state = state.lock();
            match direction {
                Direction::Send => state.sending = false,
                Direction::Receive => state.receiving = false,
            }
            state.connection_code = None;
        };

        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Coordinator lagged behind transport events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    reset(&state);
                    return;
                }
            };

            let terminal = event.is_terminal() && event.direction() == Some(direction);

            let mapped = match event {
                TransportEvent::SendStarted => Some(CoordinatorEvent::SendStarted { kind }),
                TransportEvent::SendProgress { sent, total } => {
                    Some(CoordinatorEvent::SendProgress { kind, sent, total })
                }
                TransportEvent::SendCompleted => Some(CoordinatorEvent::SendCompleted { kind }),
                TransportEvent::SendFailed { message } => {
                    Some(CoordinatorEvent::SendFailed { kind, message })
                }
                TransportEvent::SendCancelled => Some(CoordinatorEvent::SendCancelled { kind }),
                TransportEvent::ReceiveStarted => {
                    Some(CoordinatorEvent::ReceiveStarted { kind })
                }
                TransportEvent::ReceiveProgress { received, total } => {
                    Some(CoordinatorEvent::ReceiveProgress {
                        kind,
                        received,
                        total,
                    })
                }
                TransportEvent::ReceiveCompleted { payload } => {
                    // The merge engine is the only repository mutator
                    // on the sync path, and it runs only here, on the
                    // terminal receive event
                    match merge.import_payload(&payload) {
                        Ok(stats) => Some(CoordinatorEvent::Imported { kind, stats }),
                        Err(e) => Some(CoordinatorEvent::ReceiveFailed {
                            kind,
                            message: format!("import failed: {}", e),
                        }),
                    }
                }
                TransportEvent::ReceiveFailed { message } => {
                    Some(CoordinatorEvent::ReceiveFailed { kind, message })
                }
                TransportEvent::ReceiveCancelled => {
                    Some(CoordinatorEvent::ReceiveCancelled { kind })
                }
                TransportEvent::ConnectionCode { code } => {
                    state.lock().connection_code = Some(code.clone());
                    Some(CoordinatorEvent::ConnectionCode { code })
                }
            };

            if let Some(mapped) = mapped {
                let _ = event_tx.send(mapped);
            }

            if terminal {
                reset(&state);
                return;
            }
        }
    }
}
