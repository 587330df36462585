//! The gallery of known identities, published as versioned immutable
//! snapshots so matchers never observe a partial update.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("descriptor has empty id")]
    EmptyId,
    #[error("descriptor '{0}' has no embeddings")]
    NoEmbeddings(String),
    #[error("descriptor '{id}' has inconsistent embedding dimensions ({expected} vs {actual})")]
    DimensionMismatch { id: String, expected: usize, actual: usize },
    #[error("descriptor '{0}' contains a non-finite embedding value")]
    NonFinite(String),
}

/// A known identity: one or more reference embeddings plus a display label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityDescriptor {
    pub id: String,
    pub label: String,
    pub embeddings: Vec<Embedding>,
}

impl IdentityDescriptor {
    /// Boundary validation. A descriptor that fails here is rejected
    /// without touching the published snapshot; callers persisting
    /// descriptors elsewhere first can run the same check up front.
    pub fn validate(&self) -> Result<(), GalleryError> {
        if self.id.is_empty() {
            return Err(GalleryError::EmptyId);
        }
        if self.embeddings.is_empty() {
            return Err(GalleryError::NoEmbeddings(self.id.clone()));
        }
        let dim = self.embeddings[0].values.len();
        for e in &self.embeddings {
            if e.values.len() != dim {
                return Err(GalleryError::DimensionMismatch {
                    id: self.id.clone(),
                    expected: dim,
                    actual: e.values.len(),
                });
            }
            if e.values.iter().any(|v| !v.is_finite()) {
                return Err(GalleryError::NonFinite(self.id.clone()));
            }
        }
        Ok(())
    }
}

/// One complete, immutable version of the gallery.
#[derive(Debug)]
pub struct GallerySnapshot {
    pub version: u64,
    pub descriptors: Vec<IdentityDescriptor>,
}

impl GallerySnapshot {
    pub fn empty() -> Self {
        Self { version: 0, descriptors: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Shared handle over the current gallery snapshot.
///
/// Readers take an `Arc` to a complete version and keep it for the whole
/// match; writers build the next version and swap it in atomically.
pub struct Gallery {
    current: RwLock<Arc<GallerySnapshot>>,
}

impl Gallery {
    pub fn new() -> Self {
        Self { current: RwLock::new(Arc::new(GallerySnapshot::empty())) }
    }

    /// Load an initial descriptor set (startup recovery from the store).
    pub fn load(descriptors: Vec<IdentityDescriptor>) -> Result<Self, GalleryError> {
        for d in &descriptors {
            d.validate()?;
        }
        let gallery = Self::new();
        {
            let mut cur = gallery.current.write().unwrap_or_else(|e| e.into_inner());
            *cur = Arc::new(GallerySnapshot { version: 1, descriptors });
        }
        Ok(gallery)
    }

    /// The current snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<GallerySnapshot> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Insert or replace a descriptor, publishing a new snapshot version.
    /// Idempotent keyed by descriptor id.
    pub fn upsert(&self, descriptor: IdentityDescriptor) -> Result<u64, GalleryError> {
        descriptor.validate()?;
        let mut cur = self.current.write().unwrap_or_else(|e| e.into_inner());
        let mut descriptors = cur.descriptors.clone();
        match descriptors.iter_mut().find(|d| d.id == descriptor.id) {
            Some(slot) => *slot = descriptor,
            None => descriptors.push(descriptor),
        }
        let version = cur.version + 1;
        *cur = Arc::new(GallerySnapshot { version, descriptors });
        tracing::info!(version, size = cur.descriptors.len(), "gallery snapshot published");
        Ok(version)
    }

    /// Remove a descriptor by id. Removing an absent id is a no-op that
    /// still returns the current version.
    pub fn remove(&self, id: &str) -> u64 {
        let mut cur = self.current.write().unwrap_or_else(|e| e.into_inner());
        if !cur.descriptors.iter().any(|d| d.id == id) {
            return cur.version;
        }
        let descriptors: Vec<IdentityDescriptor> =
            cur.descriptors.iter().filter(|d| d.id != id).cloned().collect();
        let version = cur.version + 1;
        *cur = Arc::new(GallerySnapshot { version, descriptors });
        tracing::info!(version, identity_id = id, "gallery descriptor removed");
        version
    }
}

impl Default for Gallery {
    fn default() -> Self {
        Self::new()
    }
}

/// Best match of a probe embedding against a gallery snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityMatch {
    pub identity_id: String,
    pub label: String,
    pub similarity: f32,
}

/// Strategy for resolving a probe embedding against a snapshot.
pub trait Matcher {
    /// The highest-similarity identity above `threshold`, or `None` for
    /// an unknown face.
    fn best_match(
        &self,
        probe: &Embedding,
        snapshot: &GallerySnapshot,
        threshold: f32,
    ) -> Option<IdentityMatch>;
}

/// Cosine-similarity matcher. Scans every embedding of every descriptor
/// and keeps the best.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match(
        &self,
        probe: &Embedding,
        snapshot: &GallerySnapshot,
        threshold: f32,
    ) -> Option<IdentityMatch> {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best: Option<&IdentityDescriptor> = None;

        for descriptor in &snapshot.descriptors {
            for reference in &descriptor.embeddings {
                let sim = probe.similarity(reference);
                if sim > best_sim {
                    best_sim = sim;
                    best = Some(descriptor);
                }
            }
        }

        match best {
            Some(d) if best_sim >= threshold => Some(IdentityMatch {
                identity_id: d.id.clone(),
                label: d.label.clone(),
                similarity: best_sim,
            }),
            _ => None,
        }
    }
}
