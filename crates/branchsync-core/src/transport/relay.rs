//! Anonymous HTTP relay transport
//!
//! Uses a third-party path-addressed relay (piping-server style): the
//! sender POSTs the full JSON body to `relay/<path>` and the relay
//! holds the connection open, streaming the body to the first GET on
//! the same path - first read wins. The receiver issues a streaming
//! GET and accumulates the body incrementally; progress comes from
//! `Content-Length` when the relay provides it.
//!
//! Cancellation drops the in-flight request future, which closes the
//! relay-side connection - a send cancelled before any receiver
//! connects does not leak a buffered request. The receive side has no
//! built-in timeout; it waits for a sender indefinitely and is
//! cancelled manually.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{
    random_code, Direction, ReceiveOptions, SendOptions, SyncTransport, TransportCore,
    TransportEvent, TransportKind,
};
use crate::error::{SyncError, SyncResult};
use crate::payload::SyncPayload;

/// Default public relay endpoint
const DEFAULT_BASE_URL: &str = "https://ppng.io";

/// Configuration for [`RelayTransport`]
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base URL of the relay server
    pub base_url: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

/// Transport that moves payloads through an anonymous HTTP relay.
pub struct RelayTransport {
    config: RelayConfig,
    client: reqwest::Client,
    core: Arc<TransportCore>,
}

impl RelayTransport {
    /// Create a transport against the given relay.
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            core: Arc::new(TransportCore::new()),
        }
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl SyncTransport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    /// The relay needs nothing beyond a network stack; reachability is
    /// only knowable by trying.
    fn is_available(&self) -> bool {
        true
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.core.subscribe()
    }

    async fn start_sending(&self, payload: SyncPayload, options: SendOptions) -> SyncResult<()> {
        let path = match options.code {
            Some(code) if !code.is_empty() => code,
            Some(_) => {
                return Err(SyncError::InvalidOperation(
                    "relay path must not be empty".to_string(),
                ))
            }
            None => random_code(),
        };
        let body = payload.encode()?;
        let url = self.url_for(&path);

        let token = self.core.prepare(Direction::Send).await;
        let worker_token = token.clone();
        let core = self.core.clone();
        let client = self.client.clone();

        let task = tokio::spawn(async move {
            core.emit(TransportEvent::ConnectionCode { code: path.clone() });
            core.emit(TransportEvent::SendStarted);
            info!(%url, bytes = body.len(), "Posting payload to relay");

            let request = client
                .post(&url)
                .header(CONTENT_TYPE, "application/json")
                .body(body)
                .send();

            tokio::select! {
                // Dropping the request future aborts the connection,
                // releasing the relay-side buffered request
                _ = worker_token.cancelled() => {
                    debug!(%url, "Relay send cancelled before a receiver connected");
                    core.emit(TransportEvent::SendCancelled);
                }
                result = request => match result {
                    Ok(response) if response.status().is_success() => {
                        info!(%url, "Relay send matched by a receiver");
                        core.emit(TransportEvent::SendCompleted);
                    }
                    Ok(response) => {
                        core.emit(TransportEvent::SendFailed {
                            message: format!("relay returned HTTP {}", response.status()),
                        });
                    }
                    Err(e) => {
                        core.emit(TransportEvent::SendFailed {
                            message: format!("relay request failed: {}", e),
                        });
                    }
                }
            }
        });

        self.core.install(Direction::Send, token, task).await;
        Ok(())
    }

    async fn start_receiving(&self, options: ReceiveOptions) -> SyncResult<()> {
        let path = options
            .code
            .filter(|code| !code.is_empty())
            .ok_or_else(|| {
                SyncError::InvalidOperation("relay receive requires the sender's path".to_string())
            })?;
        let url = self.url_for(&path);

        let token = self.core.prepare(Direction::Receive).await;
        let worker_token = token.clone();
        let core = self.core.clone();
        let client = self.client.clone();

        let task = tokio::spawn(async move {
            core.emit(TransportEvent::ReceiveStarted);
            info!(%url, "Waiting on relay for a sender");

            // No timeout here: the GET waits for a matching sender
            // until cancelled
            let response = tokio::select! {
                _ = worker_token.cancelled() => {
                    core.emit(TransportEvent::ReceiveCancelled);
                    return;
                }
                result = client.get(&url).send() => match result {
                    Ok(response) if response.status().is_success() => response,
                    Ok(response) => {
                        core.emit(TransportEvent::ReceiveFailed {
                            message: format!("relay returned HTTP {}", response.status()),
                        });
                        return;
                    }
                    Err(e) => {
                        core.emit(TransportEvent::ReceiveFailed {
                            message: format!("relay request failed: {}", e),
                        });
                        return;
                    }
                }
            };

            let total = response.content_length().map(|n| n as usize);
            let mut stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();

            loop {
                tokio::select! {
                    _ = worker_token.cancelled() => {
                        core.emit(TransportEvent::ReceiveCancelled);
                        return;
                    }
                    item = stream.next() => match item {
                        Some(Ok(bytes)) => {
                            buffer.extend_from_slice(&bytes);
                            core.emit(TransportEvent::ReceiveProgress {
                                received: buffer.len(),
                                total,
                            });
                        }
                        Some(Err(e)) => {
                            core.emit(TransportEvent::ReceiveFailed {
                                message: format!("relay stream failed: {}", e),
                            });
                            return;
                        }
                        None => break,
                    }
                }
            }

            let text = match String::from_utf8(buffer) {
                Ok(text) => text,
                Err(e) => {
                    core.emit(TransportEvent::ReceiveFailed {
                        message: format!("relay body is not UTF-8: {}", e),
                    });
                    return;
                }
            };

            match SyncPayload::decode(&text) {
                Ok(payload) => {
                    info!(bytes = text.len(), "Relay receive completed");
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
