//! QR frame transport
//!
//! A sync payload far exceeds what one QR code can carry at a high
//! error-correction level, so the sender splits the JSON into indexed
//! chunks and renders them as a sequence of QR frames at a bounded
//! rate, cycling through the sequence so a camera that missed a frame
//! catches it on a later pass. The receiver decodes frames in any
//! order into a sparse map and reassembles once every index has been
//! observed.
//!
//! Camera and screen are platform resources, injected at two seams:
//! [`QrFrameSink`] receives rendered SVG frames, [`QrFrameSource`]
//! yields decoded QR text from camera frames. The transport owns
//! chunking, pacing, reassembly, and the lifecycle contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use qrcode::render::svg;
use qrcode::QrCode;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use super::chunk::{split_payload, Chunk, ChunkAssembler};
use super::{
    Direction, ReceiveOptions, SendOptions, SyncTransport, TransportCore, TransportEvent,
    TransportKind,
};
use crate::error::{SyncError, SyncResult};
use crate::payload::SyncPayload;

/// Rendered pixel floor for frame SVGs; the sink's CSS controls the
/// actual display size.
const FRAME_MIN_DIMENSIONS: u32 = 256;

/// Configuration for [`QrFrameTransport`]
#[derive(Debug, Clone)]
pub struct QrConfig {
    /// Maximum payload bytes per chunk; with the frame envelope this
    /// stays inside single-QR capacity at high error correction
    pub chunk_size: usize,
    /// Maximum number of frames a payload may need; larger payloads
    /// fail pre-flight
    pub max_frames: usize,
    /// Delay between frames; bounds the rate so cameras can keep up
    pub frame_interval: Duration,
}

impl Default for QrConfig {
    fn default() -> Self {
        Self {
            chunk_size: 800,
            max_frames: 64,
            frame_interval: Duration::from_millis(150),
        }
    }
}

/// One rendered QR frame handed to the sink.
#[derive(Debug, Clone)]
pub struct QrFrame {
    /// Zero-based frame index
    pub index: usize,
    /// Total frame count
    pub total: usize,
    /// The chunk text encoded in the QR code
    pub text: String,
    /// Rendered SVG markup
    pub svg: String,
}

/// Rendering surface for outgoing QR frames (a canvas, a window, a
/// test buffer).
pub trait QrFrameSink: Send + Sync {
    /// Display one frame. An error aborts the send.
    fn show_frame(&self, frame: &QrFrame) -> SyncResult<()>;
}

/// Camera-side source of decoded QR payload texts.
///
/// Implementations wrap platform camera capture plus QR decoding and
/// yield each decoded text. Permission failures surface as errors;
/// `Ok(None)` means the stream ended.
#[async_trait]
pub trait QrFrameSource: Send + Sync {
    /// Next decoded QR text from the camera, if any.
    async fn next_decoded(&mut self) -> SyncResult<Option<String>>;
}

/// Transport that moves payloads through animated QR frames.
pub struct QrFrameTransport {
    config: QrConfig,
    core: Arc<TransportCore>,
    sink: Option<Arc<dyn QrFrameSink>>,
    source: Option<Arc<Mutex<Box<dyn QrFrameSource>>>>,
}

impl QrFrameTransport {
    /// Create a transport with no hardware seams attached.
    pub fn new(config: QrConfig) -> Self {
        Self {
            config,
            core: Arc::new(TransportCore::new()),
            sink: None,
            source: None,
        }
    }

    /// Attach the rendering surface used for sending.
    pub fn with_sink(mut self, sink: Arc<dyn QrFrameSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Attach the camera source used for receiving.
    pub fn with_source(mut self, source: Box<dyn QrFrameSource>) -> Self {
        self.source = Some(Arc::new(Mutex::new(source)));
        self
    }

    /// Render one chunk into an SVG QR frame.
    fn render_frame(chunk: &Chunk) -> SyncResult<QrFrame> {
        let text = chunk.encode()?;
        let code = QrCode::new(text.as_bytes()).map_err(|e| {
            SyncError::InvalidOperation(format!("QR encoding failed: {:?}", e))
        })?;
        let svg = code
            .render()
            .min_dimensions(FRAME_MIN_DIMENSIONS, FRAME_MIN_DIMENSIONS)
            .dark_color(svg::Color("#000000"))
            .light_color(svg::Color("#ffffff"))
            .build();
        Ok(QrFrame {
            index: chunk.index,
            total: chunk.total,
            text,
            svg,
        })
    }
}

#[async_trait]
impl SyncTransport for QrFrameTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::QrFrames
    }

    fn is_available(&self) -> bool {
        self.sink.is_some() || self.source.is_some()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.core.subscribe()
    }

    async fn start_sending(&self, payload: SyncPayload, options: SendOptions) -> SyncResult<()> {
        let sink = self.sink.clone().ok_or_else(|| {
            SyncError::CapabilityUnavailable("no QR rendering surface attached".to_string())
        })?;

        // Pre-flight: chunk budget is checked before any frame is
        // rendered or shown
        let text = payload.encode()?;
        let chunks = split_payload(&text, self.config.chunk_size);
        if chunks.len() > self.config.max_frames {
            return Err(SyncError::PayloadTooLarge {
                chunks: chunks.len(),
                max: self.config.max_frames,
            });
        }

        let frames = chunks
            .iter()
            .map(Self::render_frame)
            .collect::<SyncResult<Vec<_>>>()?;

        let token = self.core.prepare(Direction::Send).await;
        let worker_token = token.clone();
        let core = self.core.clone();
        let interval = self.config.frame_interval;
        let cycles = options.cycles;

        let task = tokio::spawn(async move {
            let total = frames.len();
            core.emit(TransportEvent::SendStarted);
            let mut completed_cycles = 0u32;
            loop {
                for frame in &frames {
                    tokio::select! {
                        _ = worker_token.cancelled() => {
                            core.emit(TransportEvent::SendCancelled);
                            return;
                        }
                        _ = tokio::time::sleep(interval) => {}
                    }
                    if let Err(e) = sink.show_frame(frame) {
                        warn!(error = %e, "QR frame sink failed");
                        core.emit(TransportEvent::SendFailed {
                            message: e.to_string(),
                        });
                        return;
                    }
                    core.emit(TransportEvent::SendProgress {
                        sent: frame.index + 1,
                        total,
                    });
                }
                completed_cycles += 1;
                if let Some(max) = cycles {
                    if completed_cycles >= max {
                        core.emit(TransportEvent::SendCompleted);
                        return;
                    }
                }
            }
        });

        self.core.install(Direction::Send, token, task).await;
        Ok(())
    }

    async fn start_receiving(&self, _options: ReceiveOptions) -> SyncResult<()> {
        let source = self.source.clone().ok_or_else(|| {
            SyncError::CapabilityUnavailable("no camera frame source attached".to_string())
        })?;

        let token = self.core.prepare(Direction::Receive).await;
        let worker_token = token.clone();
        let core = self.core.clone();

        let task = tokio::spawn(async move {
            core.emit(TransportEvent::ReceiveStarted);
            let mut assembler = ChunkAssembler::new();
            loop {
                let next = tokio::select! {
                    _ = worker_token.cancelled() => {
                        core.emit(TransportEvent::ReceiveCancelled);
                        return;
                    }
                    next = async { source.lock().await.next_decoded().await } => next,
                };

                let text = match next {
                    Ok(Some(text)) => text,
                    Ok(None) => {
                        core.emit(TransportEvent::ReceiveFailed {
                            message: "camera stream ended before payload completed".to_string(),
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

                let chunk = match Chunk::decode(&text) {
                    Ok(chunk) => chunk,
                    Err(_) => {
                        // Transient: a half-scanned or foreign QR code
                        debug!("Skipping undecodable QR frame");
                        continue;
                    }
                };

                if assembler.insert(chunk.clone()).is_err() {
                    // The sender restarted with a different chunking;
                    // start over with the new sequence
                    debug!(total = chunk.total, "Chunk sequence changed, resetting");
                    assembler = ChunkAssembler::new();
                    if assembler.insert(chunk).is_err() {
                        continue;
                    }
                }

                core.emit(TransportEvent::ReceiveProgress {
                    received: assembler.received(),
                    total: assembler.total(),
                });

                if assembler.is_complete() {
                    let Some(text) = assembler.assemble() else {
                        continue;
                    };
                    match SyncPayload::decode(&text) {
                        Ok(payload) => {
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
