//! The fixed seam between the pipeline and the external detection,
//! landmark, and embedding models.

use crate::types::Observation;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("model backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("model backend returned invalid output: {0}")]
    InvalidOutput(String),
}

/// Frame pixels in, face observations out.
///
/// Implementations wrap the external model stack (detection + landmarks +
/// embedding). Must be deterministic for identical model version and input.
/// Errors are never fatal to the pipeline: the caller drops the frame and
/// continues.
pub trait Perception: Send {
    /// Run inference on one frame of raw pixels (`channels` = 1 or 3,
    /// row-major, tightly packed).
    fn infer(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        channels: u8,
    ) -> Result<Vec<Observation>, InferenceError>;
}

/// Drop observations whose quality falls below the configured floor.
/// Applied before the tracker ever sees them.
pub fn apply_quality_floor(observations: Vec<Observation>, floor: f32) -> Vec<Observation> {
    let before = observations.len();
    let kept: Vec<Observation> = observations
        .into_iter()
        .filter(|o| o.quality >= floor)
        .collect();
    if kept.len() < before {
        tracing::debug!(dropped = before - kept.len(), floor, "quality floor filter");
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Embedding};

    fn obs(quality: f32) -> Observation {
        Observation {
            bbox: BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0 },
            embedding: Embedding::new(vec![1.0, 0.0]),
            quality,
        }
    }

    #[test]
    fn quality_floor_drops_low_quality() {
        let kept = apply_quality_floor(vec![obs(0.1), obs(0.5), obs(0.9)], 0.5);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|o| o.quality >= 0.5));
    }

    #[test]
    fn quality_floor_zero_keeps_all() {
        let kept = apply_quality_floor(vec![obs(0.0), obs(0.3)], 0.0);
        assert_eq!(kept.len(), 2);
    }
}
