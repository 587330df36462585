use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box of a detected face, in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Intersection-over-union with another box, in [0, 1].
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Face embedding vector (dimension fixed by the external model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Cosine similarity with another embedding, in [-1, 1].
    /// Higher = more similar. Zero vectors compare as 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// One detected face in one frame. Ephemeral: consumed by the tracker in
/// the same tick it was produced, never persisted.
#[derive(Debug, Clone)]
pub struct Observation {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
    /// Normalized detection quality in [0, 1], used as a tie-break signal.
    pub quality: f32,
}

/// Classification of a committed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Recognized,
    Unknown,
    VisitStart,
    VisitEnd,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Recognized => "recognized",
            EventKind::Unknown => "unknown",
            EventKind::VisitStart => "visit_start",
            EventKind::VisitEnd => "visit_end",
        }
    }

    pub fn parse(s: &str) -> Option<EventKind> {
        match s {
            "recognized" => Some(EventKind::Recognized),
            "unknown" => Some(EventKind::Unknown),
            "visit_start" => Some(EventKind::VisitStart),
            "visit_end" => Some(EventKind::VisitEnd),
            _ => None,
        }
    }
}

/// Who an event is about: a gallery identity, or an unresolved track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    Known { identity_id: String, label: String },
    Unknown { track_id: u64 },
}

impl Subject {
    pub fn identity_id(&self) -> Option<&str> {
        match self {
            Subject::Known { identity_id, .. } => Some(identity_id),
            Subject::Unknown { .. } => None,
        }
    }
}

/// Raw face region held back as crop material for the next emitted event.
/// `channels` is 1 (gray) or 3 (RGB); pixels are row-major, tightly packed.
#[derive(Debug, Clone)]
pub struct CropCandidate {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub quality: f32,
}

/// An event produced by the session engine, not yet assigned an id or
/// persisted. The writer turns drafts into committed records.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub kind: EventKind,
    pub subject: Subject,
    pub confidence: f32,
    pub ts: DateTime<Utc>,
    pub crop: Option<CropCandidate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h }
    }

    #[test]
    fn iou_identical_boxes() {
        let a = bbox(10.0, 10.0, 20.0, 20.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_disjoint_boxes() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(100.0, 100.0, 10.0, 10.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_half_overlap() {
        // b covers the right half of a: inter = 50, union = 150
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(5.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn iou_zero_area() {
        let a = bbox(0.0, 0.0, 0.0, 0.0);
        let b = bbox(0.0, 0.0, 10.0, 10.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn event_kind_round_trips_through_str() {
        for kind in [
            EventKind::Recognized,
            EventKind::Unknown,
            EventKind::VisitStart,
            EventKind::VisitEnd,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("bogus"), None);
    }
}
