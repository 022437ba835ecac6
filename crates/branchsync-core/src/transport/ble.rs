//! Bluetooth LE transport
//!
//! Writes the JSON payload over a GATT characteristic as fixed-size
//! byte chunks with a small inter-write delay to respect link
//! throughput; the receiver subscribes to value-change notifications
//! and concatenates the bytes.
//!
//! ## Framing
//!
//! GATT writes carry no message boundary of their own, so the payload
//! is length-prefixed: a 4-byte big-endian byte count precedes the
//! JSON bytes, and the receiver parses only once the declared length
//! has fully arrived. Parsing after every write and hoping the bytes
//! happen to form a document is not an option.
//!
//! Device pairing and the platform GATT stack live behind the
//! [`GattLink`] seam; [`LoopbackLink`] provides an in-memory pair for
//! tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info};

use super::{
    Direction, ReceiveOptions, SendOptions, SyncTransport, TransportCore, TransportEvent,
    TransportKind,
};
use crate::error::{SyncError, SyncResult};
use crate::payload::SyncPayload;

/// Size of the big-endian length prefix.
const LENGTH_PREFIX_BYTES: usize = 4;

/// Configuration for [`BleTransport`]
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// Bytes per characteristic write
    pub chunk_size: usize,
    /// Delay between consecutive writes
    pub write_delay: Duration,
    /// Maximum number of writes a payload may need; larger payloads
    /// fail pre-flight
    pub max_chunks: usize,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            write_delay: Duration::from_millis(20),
            max_chunks: 2048,
        }
    }
}

/// An open GATT characteristic link to a paired device.
///
/// Implementations wrap the platform Bluetooth stack (device picker,
/// service discovery, characteristic subscription). `write_value`
/// performs one characteristic write; `next_notification` yields the
/// next value-change notification, or `None` when the link closed.
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Write one chunk to the characteristic.
    async fn write_value(&self, data: Bytes) -> SyncResult<()>;

    /// Await the next value-change notification.
    async fn next_notification(&self) -> SyncResult<Option<Bytes>>;
}

/// In-memory [`GattLink`] pair for tests and local loopback.
///
/// Writes on one side arrive as notifications on the other.
pub struct LoopbackLink {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl LoopbackLink {
    /// Create a connected pair of links.
    pub fn pair() -> (LoopbackLink, LoopbackLink) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (
            LoopbackLink {
                tx: tx_a,
                rx: Mutex::new(rx_b),
            },
            LoopbackLink {
                tx: tx_b,
                rx: Mutex::new(rx_a),
            },
        )
    }
}

#[async_trait]
impl GattLink for LoopbackLink {
    async fn write_value(&self, data: Bytes) -> SyncResult<()> {
        self.tx
            .send(data)
            .map_err(|_| SyncError::TransferFailed("loopback link closed".to_string()))
    }

    async fn next_notification(&self) -> SyncResult<Option<Bytes>> {
        Ok(self.rx.lock().await.recv().await)
    }
}

/// Transport that moves payloads over a Bluetooth LE GATT link.
pub struct BleTransport {
    config: BleConfig,
    core: Arc<TransportCore>,
    link: Option<Arc<dyn GattLink>>,
}

impl BleTransport {
    /// Create a transport with no link attached.
    pub fn new(config: BleConfig) -> Self {
        Self {
            config,
            core: Arc::new(TransportCore::new()),
            link: None,
        }
    }

    /// Attach an open GATT link (the paired device).
    pub fn with_link(mut self, link: Arc<dyn GattLink>) -> Self {
        self.link = Some(link);
        self
    }

    /// Frame the payload: 4-byte big-endian length, then the bytes.
    fn frame(body: &[u8]) -> Vec<u8> {
        let mut framed = Vec::with_capacity(LENGTH_PREFIX_BYTES + body.len());
        framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
        framed.extend_from_slice(body);
        framed
    }
}

#[async_trait]
impl SyncTransport for BleTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    fn is_available(&self) -> bool {
        self.link.is_some()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.core.subscribe()
    }

    async fn start_sending(&self, payload: SyncPayload, _options: SendOptions) -> SyncResult<()> {
        let link = self.link.clone().ok_or_else(|| {
            SyncError::CapabilityUnavailable("no GATT link attached".to_string())
        })?;

        let body = payload.encode()?;
        let framed = Self::frame(body.as_bytes());
        let chunk_count = framed.len().div_ceil(self.config.chunk_size);
        if chunk_count > self.config.max_chunks {
            return Err(SyncError::PayloadTooLarge {
                chunks: chunk_count,
                max: self.config.max_chunks,
            });
        }

        let chunks: Vec<Bytes> = framed
            .chunks(self.config.chunk_size)
            .map(Bytes::copy_from_slice)
            .collect();
        let delay = self.config.write_delay;

        let token = self.core.prepare(Direction::Send).await;
        let worker_token = token.clone();
        let core = self.core.clone();

        let task = tokio::spawn(async move {
            let total = chunks.len();
            core.emit(TransportEvent::SendStarted);
            info!(chunks = total, "Writing payload over GATT link");

            for (index, chunk) in chunks.iter().enumerate() {
                let write = tokio::select! {
                    _ = worker_token.cancelled() => {
                        core.emit(TransportEvent::SendCancelled);
                        return;
                    }
                    result = link.write_value(chunk.clone()) => result,
                };
                if let Err(e) = write {
                    core.emit(TransportEvent::SendFailed {
                        message: e.to_string(),
                    });
                    return;
                }
                core.emit(TransportEvent::SendProgress {
                    sent: index + 1,
                    total,
                });
                if index + 1 < total {
                    tokio::select! {
                        _ = worker_token.cancelled() => {
                            core.emit(TransportEvent::SendCancelled);
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }

            core.emit(TransportEvent::SendCompleted);
        });

        self.core.install(Direction::Send, token, task).await;
        Ok(())
    }

    async fn start_receiving(&self, _options: ReceiveOptions) -> SyncResult<()> {
        let link = self.link.clone().ok_or_else(|| {
            SyncError::CapabilityUnavailable("no GATT link attached".to_string())
        })?;
        let max_bytes = self.config.chunk_size * self.config.max_chunks;

        let token = self.core.prepare(Direction::Receive).await;
        let worker_token = token.clone();
        let core = self.core.clone();

        let task = tokio::spawn(async move {
            core.emit(TransportEvent::ReceiveStarted);
            let mut buffer: Vec<u8> = Vec::new();
            let mut declared: Option<usize> = None;

            loop {
                let next = tokio::select! {
                    _ = worker_token.cancelled() => {
                        core.emit(TransportEvent::ReceiveCancelled);
                        return;
                    }
                    next = link.next_notification() => next,
                };

                let bytes = match next {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => {
                        core.emit(TransportEvent::ReceiveFailed {
                            message: "GATT link closed before payload completed".to_string(),
                        });
                        return;
                    }
                    Err(e) => {
                        core.emit(TransportEvent::ReceiveFailed {
                            message: e.to_string(),
                        });
                        return;
                    }
                };

                buffer.extend_from_slice(&bytes);

                if declared.is_none() && buffer.len() >= LENGTH_PREFIX_BYTES {
                    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
                    prefix.copy_from_slice(&buffer[..LENGTH_PREFIX_BYTES]);
                    let length = u32::from_be_bytes(prefix) as usize;
                    if length > max_bytes {
                        core.emit(TransportEvent::ReceiveFailed {
                            message: format!(
                                "declared payload length {} exceeds limit {}",
                                length, max_bytes
                            ),
                        });
                        return;
                    }
                    declared = Some(length);
                    debug!(length, "Observed GATT payload length prefix");
                }

                core.emit(TransportEvent::ReceiveProgress {
                    received: buffer.len().saturating_sub(LENGTH_PREFIX_BYTES),
                    total: declared,
                });

                if let Some(length) = declared {
                    if buffer.len() >= LENGTH_PREFIX_BYTES + length {
                        let body = &buffer[LENGTH_PREFIX_BYTES..LENGTH_PREFIX_BYTES + length];
                        let text = match std::str::from_utf8(body) {
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
                                info!(bytes = length, "GATT receive completed");
                                core.emit(TransportEvent::ReceiveCompleted { payload });
                            }
                            Err(e) => {
                                core.emit(TransportEvent::ReceiveFailed {
                                    message: e.to_string(),
                                });
                            }
                        }
                        return;
                    }
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
