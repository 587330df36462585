//! mirador-core — the per-camera recognition pipeline algorithms.
//!
//! Everything here is a pure function of (state, time, input): the tracker,
//! matcher, and session engine take explicit timestamps and never touch the
//! wall clock or an async runtime, so whole camera sessions can be replayed
//! deterministically in tests.

pub mod gallery;
pub mod perception;
pub mod session;
pub mod tracker;
pub mod types;

pub use gallery::{
    CosineMatcher, Gallery, GalleryError, GallerySnapshot, IdentityDescriptor, IdentityMatch,
    Matcher,
};
pub use perception::{apply_quality_floor, InferenceError, Perception};
pub use session::{SessionEngine, SessionKey, SessionParams};
pub use tracker::{FrameUpdate, ResolvedIdentity, Track, TrackState, Tracker, TrackerParams};
pub use types::{BoundingBox, CropCandidate, Embedding, EventDraft, EventKind, Observation, Subject};
