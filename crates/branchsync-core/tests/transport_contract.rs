//! Transport contract tests
//!
//! Exercises the uniform lifecycle contract across transports: payload
//! roundtrips, exactly-one-terminal-event on double stop, pre-flight
//! failures, and the full P2P establishment dance against a minimal
//! in-process signaling server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use branchsync_core::transport::{P2pConfig, P2pTransport, PeerSignal, SignalMessage};
use branchsync_core::{
    BleConfig, BleTransport, ConversationRepository, LoopbackLink, Message, QrConfig, QrFrame,
    QrFrameSink, QrFrameSource, QrFrameTransport, ReceiveOptions, SendOptions, Storage,
    SyncPayload, SyncResult, SyncTransport, TransportEvent,
};
use futures_util::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Build a payload with real conversation data.
fn sample_payload() -> (TempDir, SyncPayload) {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new(dir.path().join("sample.redb")).unwrap();
    let repo = ConversationRepository::new(storage);

    let idea = repo.create_idea("Contract", "transport tests").unwrap();
    let branch = repo.create_branch("main", &idea.id, None).unwrap();
    for turn in 0..4 {
        repo.create_bind(
            &branch.id,
            Message::user(format!("question {}", turn)),
            Message::assistant(format!("answer {}", turn)),
        )
        .unwrap();
    }
    let payload = SyncPayload::from_repository(&repo).unwrap();
    (dir, payload)
}

/// Await the terminal receive event and return its payload.
async fn await_received(
    events: &mut tokio::sync::broadcast::Receiver<TransportEvent>,
) -> SyncPayload {
    loop {
        match tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("timed out waiting for receive completion")
            .unwrap()
        {
            TransportEvent::ReceiveCompleted { payload } => return payload,
            TransportEvent::ReceiveFailed { message } => panic!("receive failed: {message}"),
            _ => {}
        }
    }
}

// ============================================================================
// QR Frame Transport
// ============================================================================

/// Sink that feeds decoded frame texts straight into a channel, like a
/// camera pointed at the rendering surface.
struct BridgeSink {
    tx: mpsc::UnboundedSender<String>,
}

impl QrFrameSink for BridgeSink {
    fn show_frame(&self, frame: &QrFrame) -> SyncResult<()> {
        let _ = self.tx.send(frame.text.clone());
        Ok(())
    }
}

struct BridgeSource {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl QrFrameSource for BridgeSource {
    async fn next_decoded(&mut self) -> SyncResult<Option<String>> {
        Ok(self.rx.recv().await)
    }
}

/// A cycling sender and a scanning receiver bridged frame-for-frame:
/// the receiver completes even though the sender never stops on its
/// own, then the sender is cancelled.
#[tokio::test]
async fn qr_sender_cycles_until_receiver_completes() {
    let (_dir, payload) = sample_payload();
    let (tx, rx) = mpsc::unbounded_channel();

    let config = QrConfig {
        chunk_size: 128,
        max_frames: 256,
        frame_interval: Duration::from_millis(1),
    };
    let sender =
        QrFrameTransport::new(config.clone()).with_sink(Arc::new(BridgeSink { tx }));
    let receiver =
        QrFrameTransport::new(config).with_source(Box::new(BridgeSource { rx }));

    let mut recv_events = receiver.subscribe();
    receiver
        .start_receiving(ReceiveOptions::default())
        .await
        .unwrap();
    sender
        .start_sending(payload.clone(), SendOptions::default())
        .await
        .unwrap();

    let received = await_received(&mut recv_events).await;
    assert_eq!(received, payload);

    // The sender is still cycling; stopping it yields its terminal event
    let mut send_events = sender.subscribe();
    sender.stop_sending().await;
    loop {
        match send_events.recv().await.unwrap() {
            TransportEvent::SendCancelled => break,
            event => assert!(!event.is_terminal(), "unexpected terminal: {event:?}"),
        }
    }
}

// ============================================================================
// BLE Transport
// ============================================================================

#[tokio::test]
async fn ble_roundtrip_with_multi_chunk_payload() {
    let (_dir, payload) = sample_payload();
    let (link_a, link_b) = LoopbackLink::pair();

    let config = BleConfig {
        chunk_size: 128,
        write_delay: Duration::from_millis(1),
        max_chunks: 4096,
    };
    let sender = BleTransport::new(config.clone()).with_link(Arc::new(link_a));
    let receiver = BleTransport::new(config).with_link(Arc::new(link_b));

    let mut recv_events = receiver.subscribe();
    receiver
        .start_receiving(ReceiveOptions::default())
        .await
        .unwrap();
    sender
        .start_sending(payload.clone(), SendOptions::default())
        .await
        .unwrap();

    let received = await_received(&mut recv_events).await;
    assert_eq!(received, payload);
}

/// Restarting a send while one is active first cancels the previous
/// operation; both terminal events are observed, in order.
#[tokio::test]
async fn ble_restart_cancels_previous_send() {
    let (_dir, payload) = sample_payload();
    let (link_a, _keep_alive) = LoopbackLink::pair();

    let sender = BleTransport::new(BleConfig {
        chunk_size: 16,
        write_delay: Duration::from_millis(50),
        max_chunks: 65536,
    })
    .with_link(Arc::new(link_a));
    let mut events = sender.subscribe();

    sender
        .start_sending(payload.clone(), SendOptions::default())
        .await
        .unwrap();
    sender
        .start_sending(payload, SendOptions::default())
        .await
        .unwrap();
    sender.stop_sending().await;

    let mut terminals = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.is_terminal() {
            terminals.push(event);
        }
    }
    assert_eq!(terminals.len(), 2);
    assert!(matches!(terminals[0], TransportEvent::SendCancelled));
    assert!(matches!(terminals[1], TransportEvent::SendCancelled));
}

// ============================================================================
// P2P Transport (with in-process signaling server)
// ============================================================================

type Rooms = Arc<StdMutex<HashMap<String, Vec<(String, mpsc::UnboundedSender<String>)>>>>;

/// Minimal signaling server: tracks rooms, announces peers in both
/// directions, and routes `signal` messages by target peer id.
async fn spawn_signaling_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let rooms: Rooms = Arc::new(StdMutex::new(HashMap::new()));

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let rooms = rooms.clone();
            tokio::spawn(async move {
                let Ok(ws) = accept_async(stream).await else {
                    return;
                };
                let (mut write, mut read) = ws.split();
                let (tx, mut rx) = mpsc::unbounded_channel::<String>();
                tokio::spawn(async move {
                    while let Some(text) = rx.recv().await {
                        if write.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                });

                let mut my_room: Option<String> = None;
                let mut my_id = String::new();
                while let Some(Ok(message)) = read.next().await {
                    let WsMessage::Text(text) = message else {
                        continue;
                    };
                    let Ok(signal) = serde_json::from_str::<SignalMessage>(&text.to_string())
                    else {
                        continue;
                    };
                    match signal {
                        SignalMessage::JoinRoom { room_id, peer_id } => {
                            let mut rooms = rooms.lock().unwrap();
                            let members = rooms.entry(room_id.clone()).or_default();
                            for (existing_id, member_tx) in members.iter() {
                                // Tell the room about the newcomer...
                                let note = serde_json::to_string(&SignalMessage::PeerJoined {
                                    peer_id: peer_id.clone(),
                                })
                                .unwrap();
                                let _ = member_tx.send(note);
                                // ...and the newcomer about the room
                                let note = serde_json::to_string(&SignalMessage::PeerJoined {
                                    peer_id: existing_id.clone(),
                                })
                                .unwrap();
                                let _ = tx.send(note);
                            }
                            members.push((peer_id.clone(), tx.clone()));
                            my_room = Some(room_id.clone());
                            my_id = peer_id.clone();
                            let ack = serde_json::to_string(&SignalMessage::RoomJoined {
                                room_id,
                                peer_id: Some(peer_id),
                            })
                            .unwrap();
                            let _ = tx.send(ack);
                        }
                        SignalMessage::Signal {
                            peer_id: target,
                            signal,
                        } => {
                            let Some(room) = &my_room else { continue };
                            let rooms = rooms.lock().unwrap();
                            let Some(members) = rooms.get(room) else {
                                continue;
                            };
                            for (id, member_tx) in members {
                                if id == &target {
                                    let forwarded =
                                        serde_json::to_string(&SignalMessage::Signal {
                                            peer_id: my_id.clone(),
                                            signal: signal.clone(),
                                        })
                                        .unwrap();
                                    let _ = member_tx.send(forwarded);
                                }
                            }
                        }
                        _ => {}
                    }
                }
            });
        }
    });

    format!("ws://{}", addr)
}

#[tokio::test]
async fn p2p_full_handshake_and_payload_push() {
    let signaling_url = spawn_signaling_server().await;
    let (_dir, payload) = sample_payload();

    let config = P2pConfig {
        signaling_url,
        listen_addr: "127.0.0.1:0".to_string(),
    };

    // The receiving side hosts the room
    let host = P2pTransport::new(config.clone());
    let mut host_events = host.subscribe();
    host.start_receiving(ReceiveOptions::default()).await.unwrap();

    // Grab the room code the host surfaced
    let room = loop {
        match host_events.recv().await.unwrap() {
            TransportEvent::ConnectionCode { code } => break code,
            TransportEvent::ReceiveFailed { message } => panic!("host failed: {message}"),
            _ => {}
        }
    };

    // The sending side joins with the code and pushes on connect
    let joiner = P2pTransport::new(config);
    let mut joiner_events = joiner.subscribe();
    joiner
        .start_sending(
            payload.clone(),
            SendOptions {
                code: Some(room),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let received = await_received(&mut host_events).await;
    assert_eq!(received, payload);

    // The joiner observed its own completion
    loop {
        match tokio::time::timeout(Duration::from_secs(10), joiner_events.recv())
            .await
            .expect("timed out waiting for send completion")
            .unwrap()
        {
            TransportEvent::SendCompleted => break,
            TransportEvent::SendFailed { message } => panic!("send failed: {message}"),
            _ => {}
        }
    }
}

/// The signal offer exchanged over the wire has the documented shape.
#[test]
fn p2p_offer_signal_wire_shape() {
    let offer = SignalMessage::Signal {
        peer_id: "peer-1".to_string(),
        signal: PeerSignal::Offer {
            addr: "127.0.0.1:9999".to_string(),
        },
    };
    let json = serde_json::to_value(&offer).unwrap();
    assert_eq!(json["type"], "signal");
    assert_eq!(json["peerId"], "peer-1");
    assert_eq!(json["signal"]["kind"], "offer");
    assert_eq!(json["signal"]["addr"], "127.0.0.1:9999");
}
