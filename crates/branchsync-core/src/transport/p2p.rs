//! Peer-to-peer transport with signaling
//!
//! A lightweight WebSocket signaling channel carries only room
//! membership and connection-establishment metadata; the payload
//! itself travels over a direct peer channel, independent of the
//! signaling server.
//!
//! ## Message flow
//!
//! ```text
//! Host                    Signaling                    Joiner
//!   |--- join-room --------->|                            |
//!   |<-- room-joined --------|<--------- join-room -------|
//!   |<-- peer-joined --------|--------- room-joined ----->|
//!   |--- signal{offer:addr}->|--------- signal ---------->|
//!   |                        |                            |
//!   |<═══════ direct peer channel (length-delimited) ════▶|
//!   |              payload push, both directions          |
//! ```
//!
//! The host opens a TCP listener and advertises its address in the
//! offer; the joiner dials it. Frames on the channel are
//! length-delimited, and each side pushes its payload as soon as the
//! channel opens - sync on connect is implicit. Signaling drops during
//! negotiation reconnect with bounded exponential backoff; once the
//! peer channel is open the signaling socket is no longer load-bearing
//! and its loss cannot tear the channel down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    random_code, Direction, ReceiveOptions, SendOptions, SyncTransport, TransportCore,
    TransportEvent, TransportKind,
};
use crate::error::{SyncError, SyncResult};
use crate::payload::SyncPayload;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Attempts to establish the initial signaling connection
const CONNECT_ATTEMPTS: u32 = 3;
/// Base delay between connect attempts; doubles each retry
const CONNECT_BASE_DELAY: Duration = Duration::from_millis(100);
/// Reconnection attempts when signaling drops mid-negotiation
const RECONNECT_ATTEMPTS: u32 = 5;
/// Base reconnection delay; doubles each retry, capped below
const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(250);
/// Ceiling for the reconnection backoff
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(4);

/// Configuration for [`P2pTransport`]
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// WebSocket URL of the signaling server
    pub signaling_url: String,
    /// Bind address for the host-side peer listener; the bound address
    /// is what the offer advertises, so it must be reachable by the
    /// counterpart (same-LAN by default)
    pub listen_addr: String,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:9090".to_string(),
            listen_addr: "127.0.0.1:0".to_string(),
        }
    }
}

/// Signaling messages exchanged with the coordination server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Ask to join (or create) a room
    JoinRoom {
        /// Room identifier
        #[serde(rename = "roomId")]
        room_id: String,
        /// Our peer identifier
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    /// Server acknowledgement of room membership
    RoomJoined {
        /// Room identifier
        #[serde(rename = "roomId")]
        room_id: String,
        /// Our peer identifier, echoed by the server
        #[serde(rename = "peerId", default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
    },
    /// Another peer entered the room
    PeerJoined {
        /// The new peer's identifier
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    /// Connection-establishment metadata routed to one peer
    Signal {
        /// Target peer identifier
        #[serde(rename = "peerId")]
        peer_id: String,
        /// The connection metadata
        signal: PeerSignal,
    },
    /// Data fanned out to every peer in the room
    Broadcast {
        /// Opaque payload
        data: serde_json::Value,
    },
}

/// Connection-establishment metadata carried inside a `signal` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PeerSignal {
    /// The host's listener address for the peer channel
    Offer {
        /// Address the counterpart should dial
        addr: String,
    },
}

/// Which side of the handshake this operation plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Created the room; listens for the peer channel
    Host,
    /// Joined an existing room; dials the offered address
    Joiner,
}

/// Outcome of one cancellable establishment step.
enum Step<T> {
    Done(T),
    Cancelled,
    Failed(String),
}

/// Transport that moves payloads over a direct peer channel negotiated
/// through a signaling server.
pub struct P2pTransport {
    config: P2pConfig,
    core: Arc<TransportCore>,
}

impl P2pTransport {
    /// Create a transport against the given signaling server.
    pub fn new(config: P2pConfig) -> Self {
        Self {
            config,
            core: Arc::new(TransportCore::new()),
        }
    }
}

/// Serialize and send one signaling message.
async fn send_signal(ws: &mut WsStream, message: &SignalMessage) -> Result<(), String> {
    let text = serde_json::to_string(message).map_err(|e| e.to_string())?;
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| e.to_string())
}

/// Read the next parseable signaling message.
///
/// Unparseable frames are skipped; `Ok(None)` means the socket closed.
async fn next_signal(ws: &mut WsStream) -> Result<Option<SignalMessage>, String> {
    while let Some(message) = ws.next().await {
        match message {
            Ok(Message::Text(text)) => {
                match serde_json::from_str::<SignalMessage>(text.to_string().as_str()) {
                    Ok(signal) => return Ok(Some(signal)),
                    Err(_) => {
                        debug!("Skipping unparseable signaling frame");
                        continue;
                    }
                }
            }
            Ok(Message::Close(_)) => return Ok(None),
            Ok(_) => continue,
            Err(e) => return Err(e.to_string()),
        }
    }
    Ok(None)
}

/// Connect to the signaling server with bounded exponential backoff
/// and announce ourselves in the room.
async fn join_signaling(
    url: &str,
    room_id: &str,
    peer_id: &str,
    token: &CancellationToken,
) -> Step<WsStream> {
    for attempt in 1..=CONNECT_ATTEMPTS {
        let connect = tokio::select! {
            _ = token.cancelled() => return Step::Cancelled,
            result = connect_async(url) => result,
        };
        match connect {
            Ok((mut ws, _)) => {
                let join = SignalMessage::JoinRoom {
                    room_id: room_id.to_string(),
                    peer_id: peer_id.to_string(),
                };
                if let Err(e) = send_signal(&mut ws, &join).await {
                    return Step::Failed(format!("signaling join failed: {}", e));
                }
                return Step::Done(ws);
            }
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                let delay = CONNECT_BASE_DELAY * (1u32 << (attempt - 1));
                warn!(%url, attempt, error = %e, "Signaling connect failed, retrying");
                tokio::select! {
                    _ = token.cancelled() => return Step::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                return Step::Failed(format!("signaling unreachable: {}", e));
            }
        }
    }
    unreachable!()
}

/// Run the full establishment dance and return the open peer channel.
///
/// Signaling drops during negotiation reconnect with bounded backoff;
/// the host's TCP listener is bound once so the advertised address
/// stays stable across reconnects.
async fn establish_channel(
    config: &P2pConfig,
    role: Role,
    room_id: &str,
    peer_id: &str,
    token: &CancellationToken,
) -> Step<TcpStream> {
    let listener = match role {
        Role::Host => match TcpListener::bind(&config.listen_addr).await {
            Ok(listener) => Some(listener),
            Err(e) => return Step::Failed(format!("peer listener bind failed: {}", e)),
        },
        Role::Joiner => None,
    };

    let mut reconnects = 0u32;
    loop {
        let mut ws = match join_signaling(&config.signaling_url, room_id, peer_id, token).await {
            Step::Done(ws) => ws,
            Step::Cancelled => return Step::Cancelled,
            Step::Failed(e) => return Step::Failed(e),
        };

        // Negotiate until the channel opens or signaling drops
        let drop_reason = loop {
            match &listener {
                Some(listener) => {
                    tokio::select! {
                        _ = token.cancelled() => return Step::Cancelled,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, addr)) => {
                                info!(%addr, "Peer channel accepted");
                                return Step::Done(stream);
                            }
                            Err(e) => return Step::Failed(format!("peer accept failed: {}", e)),
                        },
                        signal = next_signal(&mut ws) => match signal {
                            Ok(Some(SignalMessage::PeerJoined { peer_id: remote })) => {
                                let addr = match listener.local_addr() {
                                    Ok(addr) => addr.to_string(),
                                    Err(e) => return Step::Failed(format!("listener address unavailable: {}", e)),
                                };
                                info!(peer = %remote, %addr, "Peer joined, offering channel address");
                                let offer = SignalMessage::Signal {
                                    peer_id: remote,
                                    signal: PeerSignal::Offer { addr },
                                };
                                if let Err(e) = send_signal(&mut ws, &offer).await {
                                    break format!("offer send failed: {}", e);
                                }
                            }
                            Ok(Some(_)) => {}
                            Ok(None) => break "signaling closed".to_string(),
                            Err(e) => break format!("signaling read failed: {}", e),
                        },
                    }
                }
                None => {
                    tokio::select! {
                        _ = token.cancelled() => return Step::Cancelled,
                        signal = next_signal(&mut ws) => match signal {
                            Ok(Some(SignalMessage::Signal { signal: PeerSignal::Offer { addr }, .. })) => {
                                info!(%addr, "Received channel offer, dialing");
                                let dial = tokio::select! {
                                    _ = token.cancelled() => return Step::Cancelled,
                                    result = TcpStream::connect(&addr) => result,
                                };
                                match dial {
                                    Ok(stream) => return Step::Done(stream),
                                    Err(e) => return Step::Failed(format!("peer dial failed: {}", e)),
                                }
                            }
                            Ok(Some(_)) => {}
                            Ok(None) => break "signaling closed".to_string(),
                            Err(e) => break format!("signaling read failed: {}", e),
                        },
                    }
                }
            }
        };

        reconnects += 1;
        if reconnects > RECONNECT_ATTEMPTS {
            return Step::Failed(format!(
                "signaling lost after {} reconnect attempts: {}",
                RECONNECT_ATTEMPTS, drop_reason
            ));
        }
        let delay = (RECONNECT_BASE_DELAY * (1u32 << (reconnects - 1))).min(RECONNECT_MAX_DELAY);
        warn!(reconnects, ?delay, reason = %drop_reason, "Signaling dropped, reconnecting");
        tokio::select! {
            _ = token.cancelled() => return Step::Cancelled,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[async_trait]
impl SyncTransport for P2pTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::PeerToPeer
    }

    /// The peer channel rides the plain network stack; reachability of
    /// the signaling server is only knowable by trying.
    fn is_available(&self) -> bool {
        true
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.core.subscribe()
    }

    async fn start_sending(&self, payload: SyncPayload, options: SendOptions) -> SyncResult<()> {
        let body = payload.encode()?;
        let (role, room_id) = match options.code {
            Some(code) if !code.is_empty() => (Role::Joiner, code),
            Some(_) => {
                return Err(SyncError::InvalidOperation(
                    "room id must not be empty".to_string(),
                ))
            }
            None => (Role::Host, random_code()),
        };
        let peer_id = random_code();
        let config = self.config.clone();

        let token = self.core.prepare(Direction::Send).await;
        let worker_token = token.clone();
        let core = self.core.clone();

        let task = tokio::spawn(async move {
            core.emit(TransportEvent::ConnectionCode {
                code: room_id.clone(),
            });
            core.emit(TransportEvent::SendStarted);

            let stream =
                match establish_channel(&config, role, &room_id, &peer_id, &worker_token).await {
                    Step::Done(stream) => stream,
                    Step::Cancelled => {
                        core.emit(TransportEvent::SendCancelled);
                        return;
                    }
                    Step::Failed(message) => {
                        core.emit(TransportEvent::SendFailed { message });
                        return;
                    }
                };

            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
            let total = body.len();
            let push = tokio::select! {
                _ = worker_token.cancelled() => {
                    core.emit(TransportEvent::SendCancelled);
                    return;
                }
                result = framed.send(Bytes::from(body)) => result,
            };
            match push {
                Ok(()) => {
                    core.emit(TransportEvent::SendProgress {
                        sent: total,
                        total,
                    });
                    info!(bytes = total, room = %room_id, "Pushed payload over peer channel");
                    core.emit(TransportEvent::SendCompleted);
                }
                Err(e) => {
                    core.emit(TransportEvent::SendFailed {
                        message: format!("peer channel write failed: {}", e),
                    });
                }
            }
        });

        self.core.install(Direction::Send, token, task).await;
        Ok(())
    }

    async fn start_receiving(&self, options: ReceiveOptions) -> SyncResult<()> {
        let reply = options
            .reply_payload
            .as_ref()
            .map(|payload| payload.encode())
            .transpose()?;
        let (role, room_id) = match options.code {
            Some(code) if !code.is_empty() => (Role::Joiner, code),
            _ => (Role::Host, random_code()),
        };
        let peer_id = random_code();
        let config = self.config.clone();

        let token = self.core.prepare(Direction::Receive).await;
        let worker_token = token.clone();
        let core = self.core.clone();

        let task = tokio::spawn(async move {
            core.emit(TransportEvent::ConnectionCode {
                code: room_id.clone(),
            });
            core.emit(TransportEvent::ReceiveStarted);

            let stream =
                match establish_channel(&config, role, &room_id, &peer_id, &worker_token).await {
                    Step::Done(stream) => stream,
                    Step::Cancelled => {
                        core.emit(TransportEvent::ReceiveCancelled);
                        return;
                    }
                    Step::Failed(message) => {
                        core.emit(TransportEvent::ReceiveFailed { message });
                        return;
                    }
                };

            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

            // Sync on connect: push our snapshot before waiting for theirs
            if let Some(reply) = reply {
                let push = tokio::select! {
                    _ = worker_token.cancelled() => {
                        core.emit(TransportEvent::ReceiveCancelled);
                        return;
                    }
                    result = framed.send(Bytes::from(reply)) => result,
                };
                if let Err(e) = push {
                    core.emit(TransportEvent::ReceiveFailed {
                        message: format!("reply push failed: {}", e),
                    });
                    return;
                }
                debug!(room = %room_id, "Pushed local snapshot on connect");
            }

            let frame = tokio::select! {
                _ = worker_token.cancelled() => {
                    core.emit(TransportEvent::ReceiveCancelled);
                    return;
                }
                frame = framed.next() => frame,
            };

            let bytes = match frame {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    core.emit(TransportEvent::ReceiveFailed {
                        message: format!("peer channel read failed: {}", e),
                    });
                    return;
                }
                None => {
                    core.emit(TransportEvent::ReceiveFailed {
                        message: "peer channel closed before payload arrived".to_string(),
                    });
                    return;
                }
            };

            core.emit(TransportEvent::ReceiveProgress {
                received: bytes.len(),
                total: Some(bytes.len()),
            });

            let text = match std::str::from_utf8(&bytes) {
                Ok(text) => text,
                Err(e) => {
                    core.emit(TransportEvent::ReceiveFailed {
                        message: format!("payload is not UTF-8: {}", e),
                    });
                    return;
                }
            };
            match SyncPayload::decode(text) {
                Ok(payload) => {
                    info!(bytes = bytes.len(), room = %room_id, "Peer payload received");
                    core.emit(TransportEvent::ReceiveCompleted { payload });
                }
                Err(e) => {
                    core.emit(TransportEvent::ReceiveFailed {
                        message: e.to_string(),
                    });
                }
            }
        });

        self.core.install(Direction::Receive, token, task).await;
        Ok(())
    }

    async fn stop_sending(&self) {
        self.core.stop(Direction::Send).await;
    }

    async fn stop_receiving(&self) {
        self.core.stop(Direction::Receive).await;
    }
}
