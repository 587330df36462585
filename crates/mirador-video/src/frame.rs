//! Frame type and pixel utilities — YUYV conversion, darkness gate,
//! region extraction for crops.

use chrono::{DateTime, Utc};
use mirador_core::types::{BoundingBox, CropCandidate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Gray8,
    Rgb8,
}

impl PixelFormat {
    pub fn channels(&self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 => 3,
        }
    }
}

/// One captured camera frame, row-major and tightly packed.
#[derive(Debug, Clone)]
pub struct Frame {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub captured_at: DateTime<Utc>,
    pub sequence: u64,
}

impl Frame {
    /// Mean luma in 0.0–255.0. For RGB frames, the green-weighted
    /// BT.601 approximation.
    pub fn mean_luma(&self) -> f32 {
        if self.pixels.is_empty() {
            return 0.0;
        }
        match self.format {
            PixelFormat::Gray8 => {
                self.pixels.iter().map(|&p| p as f32).sum::<f32>() / self.pixels.len() as f32
            }
            PixelFormat::Rgb8 => {
                let mut sum = 0.0f32;
                let mut n = 0usize;
                for px in self.pixels.chunks_exact(3) {
                    sum += 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
                    n += 1;
                }
                if n > 0 { sum / n as f32 } else { 0.0 }
            }
        }
    }

    /// Covered-lens gate: true when mean luma falls below `threshold`.
    pub fn is_dark(&self, threshold: f32) -> bool {
        self.mean_luma() < threshold
    }

    /// Extract the face region under `bbox`, expanded by `margin` (fraction
    /// of box size per side) and clamped to the frame. Returns `None` when
    /// the clamped region is empty.
    pub fn crop_region(&self, bbox: &BoundingBox, margin: f32, quality: f32) -> Option<CropCandidate> {
        let pad_x = bbox.width * margin;
        let pad_y = bbox.height * margin;
        let x0 = (bbox.x - pad_x).max(0.0) as u32;
        let y0 = (bbox.y - pad_y).max(0.0) as u32;
        let x1 = ((bbox.x + bbox.width + pad_x).ceil() as u32).min(self.width);
        let y1 = ((bbox.y + bbox.height + pad_y).ceil() as u32).min(self.height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        let channels = self.format.channels();
        let (w, h) = ((x1 - x0) as usize, (y1 - y0) as usize);
        let stride = self.width as usize * channels;
        let mut pixels = Vec::with_capacity(w * h * channels);
        for row in y0 as usize..y1 as usize {
            let start = row * stride + x0 as usize * channels;
            pixels.extend_from_slice(&self.pixels[start..start + w * channels]);
        }

        Some(CropCandidate {
            pixels,
            width: w as u32,
            height: h as u32,
            channels: channels as u8,
            quality,
        })
    }
}

/// Extract the Y channel from packed YUYV 4:2:2 ([Y0, U, Y1, V] per two
/// pixels).
pub fn yuyv_to_gray(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: yuyv.len() });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
