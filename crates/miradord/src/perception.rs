//! Bridge to the external inference sidecar. The models (detection,
//! landmarks, embedding) live in a separate process behind a Unix socket;
//! the daemon ships it raw frames and gets observations back.
//!
//! Wire format, one request per frame: a JSON header line
//! `{"width":..,"height":..,"channels":..,"len":..}` followed by `len`
//! bytes of row-major pixels; the reply is one JSON line
//! `{"observations":[{"bbox":{..},"embedding":[..],"quality":..}]}`.
//!
//! The blocking socket I/O runs on a dedicated OS thread; pipelines talk
//! to it through an async handle.

use mirador_core::types::{BoundingBox, Embedding, Observation};
use mirador_core::{InferenceError, Perception};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};

#[derive(Serialize)]
struct WireHeader {
    width: u32,
    height: u32,
    channels: u8,
    len: usize,
}

#[derive(Deserialize)]
struct WireObservation {
    bbox: BoundingBox,
    embedding: Vec<f32>,
    quality: f32,
}

#[derive(Deserialize)]
struct WireResponse {
    observations: Vec<WireObservation>,
}

/// [`Perception`] implementation backed by the sidecar socket. Connects
/// lazily and drops the connection on any I/O error so the next frame
/// reconnects.
pub struct SidecarPerception {
    socket: PathBuf,
    conn: Option<(UnixStream, BufReader<UnixStream>)>,
}

impl SidecarPerception {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self { socket: socket.into(), conn: None }
    }

    fn connect(&mut self) -> Result<&mut (UnixStream, BufReader<UnixStream>), InferenceError> {
        if self.conn.is_none() {
            let stream = UnixStream::connect(&self.socket).map_err(|e| {
                InferenceError::BackendUnavailable(format!(
                    "connect {}: {e}",
                    self.socket.display()
                ))
            })?;
            let reader = stream
                .try_clone()
                .map_err(|e| InferenceError::BackendUnavailable(format!("clone socket: {e}")))?;
            tracing::info!(socket = %self.socket.display(), "connected to perception sidecar");
            self.conn = Some((stream, BufReader::new(reader)));
        }
        Ok(self.conn.as_mut().unwrap_or_else(|| unreachable!()))
    }

    fn exchange(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        channels: u8,
    ) -> Result<String, InferenceError> {
        let header = serde_json::to_string(&WireHeader {
            width,
            height,
            channels,
            len: pixels.len(),
        })
        .map_err(|e| InferenceError::InvalidOutput(e.to_string()))?;

        let (writer, reader) = self.connect()?;
        let io = (|| -> std::io::Result<String> {
            writer.write_all(header.as_bytes())?;
            writer.write_all(b"\n")?;
            writer.write_all(pixels)?;
            writer.flush()?;

            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            Ok(line)
        })();

        io.map_err(|e| {
            self.conn = None;
            InferenceError::BackendUnavailable(format!("sidecar i/o: {e}"))
        })
    }
}

impl Perception for SidecarPerception {
    fn infer(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        channels: u8,
    ) -> Result<Vec<Observation>, InferenceError> {
        let expected = width as usize * height as usize * channels as usize;
        if pixels.len() != expected {
            return Err(InferenceError::MalformedFrame(format!(
                "expected {expected} bytes for {width}x{height}x{channels}, got {}",
                pixels.len()
            )));
        }

        let line = self.exchange(pixels, width, height, channels)?;
        let response: WireResponse = serde_json::from_str(&line)
            .map_err(|e| InferenceError::InvalidOutput(e.to_string()))?;

        Ok(response
            .observations
            .into_iter()
            .map(|o| Observation {
                bbox: o.bbox,
                embedding: Embedding::new(o.embedding),
                quality: o.quality.clamp(0.0, 1.0),
            })
            .collect())
    }
}

struct InferRequest {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    channels: u8,
    reply: oneshot::Sender<Result<Vec<Observation>, InferenceError>>,
}

/// Async handle to a [`Perception`] backend running on its own thread.
/// Cloned into every camera pipeline; requests serialize through one
/// channel so the backend never sees concurrent frames.
#[derive(Clone)]
pub struct PerceptionHandle {
    tx: mpsc::Sender<InferRequest>,
}

impl PerceptionHandle {
    pub async fn infer(
        &self,
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        channels: u8,
    ) -> Result<Vec<Observation>, InferenceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(InferRequest { pixels, width, height, channels, reply })
            .await
            .map_err(|_| InferenceError::BackendUnavailable("perception thread gone".into()))?;
        rx.await
            .map_err(|_| InferenceError::BackendUnavailable("perception thread gone".into()))?
    }
}

/// Move a backend onto a dedicated OS thread and return its handle. The
/// thread exits when the last handle is dropped.
pub fn spawn_perception(mut backend: Box<dyn Perception>) -> PerceptionHandle {
    let (tx, mut rx) = mpsc::channel::<InferRequest>(8);
    std::thread::Builder::new()
        .name("mirador-perception".into())
        .spawn(move || {
            while let Some(req) = rx.blocking_recv() {
                let result = backend.infer(&req.pixels, req.width, req.height, req.channels);
                let _ = req.reply.send(result);
            }
            tracing::debug!("perception thread exiting");
        })
        .map(|_| ())
        .unwrap_or_else(|e| tracing::error!(error = %e, "failed to spawn perception thread"));
    PerceptionHandle { tx }
}
