//! V4L2 connector for local devices (`v4l:/dev/videoN`).

use crate::frame::{self, Frame, PixelFormat};
use crate::source::{CameraConnector, FrameStream, SourceError};
use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use tokio::sync::mpsc;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;

/// Connector for local V4L2 capture devices.
pub struct V4lConnector;

#[async_trait]
impl CameraConnector for V4lConnector {
    async fn connect(&self, target: &str) -> Result<Box<dyn FrameStream>, SourceError> {
        let target = target.to_string();
        let rx = tokio::task::spawn_blocking(move || open_and_stream(&target))
            .await
            .map_err(|e| SourceError::Connect(format!("open task failed: {e}")))??;
        Ok(Box::new(V4lStream { frames: rx }))
    }
}

struct V4lStream {
    frames: mpsc::Receiver<Result<Frame, SourceError>>,
}

#[async_trait]
impl FrameStream for V4lStream {
    async fn next_frame(&mut self) -> Result<Frame, SourceError> {
        self.frames.recv().await.unwrap_or(Err(SourceError::Closed))
    }
}

/// Open the device, negotiate a format, and hand the blocking capture loop
/// to a dedicated OS thread feeding a bounded channel. Dropping the stream
/// closes the channel, which stops the thread on its next send.
fn open_and_stream(
    device_path: &str,
) -> Result<mpsc::Receiver<Result<Frame, SourceError>>, SourceError> {
    if !Path::new(device_path).exists() {
        return Err(SourceError::Connect(format!("device not found: {device_path}")));
    }

    let device = Device::with_path(device_path)
        .map_err(|e| SourceError::Connect(format!("{device_path}: {e}")))?;

    let caps = device
        .query_caps()
        .map_err(|e| SourceError::Connect(format!("failed to query capabilities: {e}")))?;
    if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
        return Err(SourceError::Connect("device does not support video capture".into()));
    }
    tracing::info!(device = device_path, driver = %caps.driver, card = %caps.card, "opened camera");

    let mut fmt = device
        .format()
        .map_err(|e| SourceError::Connect(format!("failed to get format: {e}")))?;
    fmt.fourcc = FourCC::new(b"YUYV");
    fmt.width = CAPTURE_WIDTH;
    fmt.height = CAPTURE_HEIGHT;
    let negotiated = device
        .set_format(&fmt)
        .map_err(|e| SourceError::Connect(format!("failed to set format: {e}")))?;

    let fourcc = negotiated.fourcc;
    let yuyv = if fourcc == FourCC::new(b"YUYV") {
        true
    } else if fourcc == FourCC::new(b"GREY") {
        false
    } else {
        return Err(SourceError::Connect(format!(
            "unsupported pixel format {fourcc:?} (need YUYV or GREY)"
        )));
    };
    let (width, height) = (negotiated.width, negotiated.height);
    tracing::info!(width, height, fourcc = ?fourcc, "negotiated format");

    let (tx, rx) = mpsc::channel(4);
    std::thread::Builder::new()
        .name("mirador-v4l".into())
        .spawn(move || {
            // The mmap stream borrows the device, so both live on this thread.
            let mut stream = match MmapStream::with_buffers(&device, BufType::VideoCapture, 4) {
                Ok(s) => s,
                Err(e) => {
                    let _ = tx.blocking_send(Err(SourceError::Capture(format!(
                        "failed to create mmap stream: {e}"
                    ))));
                    return;
                }
            };
            loop {
                let item = match stream.next() {
                    Ok((buf, meta)) => convert_frame(buf, width, height, yuyv, meta.sequence),
                    Err(e) => Err(SourceError::Capture(format!("failed to dequeue buffer: {e}"))),
                };
                let failed = item.is_err();
                if tx.blocking_send(item).is_err() {
                    break; // stream dropped
                }
                if failed {
                    break;
                }
            }
            tracing::debug!("v4l capture thread exiting");
        })
        .map_err(|e| SourceError::Connect(format!("failed to spawn capture thread: {e}")))?;

    Ok(rx)
}

fn convert_frame(
    buf: &[u8],
    width: u32,
    height: u32,
    yuyv: bool,
    sequence: u32,
) -> Result<Frame, SourceError> {
    let pixels = if yuyv {
        frame::yuyv_to_gray(buf, width, height)
            .map_err(|e| SourceError::Capture(e.to_string()))?
    } else {
        let expected = (width * height) as usize;
        if buf.len() < expected {
            return Err(SourceError::Capture(format!(
                "GREY buffer too short: expected {expected}, got {}",
                buf.len()
            )));
        }
        buf[..expected].to_vec()
    };

    Ok(Frame {
        pixels,
        width,
        height,
        format: PixelFormat::Gray8,
        captured_at: Utc::now(),
        sequence: sequence as u64,
    })
}
