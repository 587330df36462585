//! Per-camera multi-face tracker: associates per-frame observations into
//! persistent tracks by combined box-overlap + embedding similarity.

use crate::types::{BoundingBox, Embedding, Observation};
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Active,
    Lost,
}

/// Identity resolution pinned to a track. Sticky: set once, never cleared.
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub identity_id: String,
    pub label: String,
    pub similarity: f32,
}

/// A temporally continuous face within one camera.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: u64,
    pub state: TrackState,
    pub bbox: BoundingBox,
    /// Running best-quality observation; its embedding is the track's
    /// representative, avoiding drift from blurred or occluded frames.
    pub best: Observation,
    pub last_update: DateTime<Utc>,
    /// Quality of the most recent observation, as opposed to `best`.
    pub last_quality: f32,
    pub identity: Option<ResolvedIdentity>,
    pub hits: u32,
}

impl Track {
    fn new(id: u64, observation: Observation, now: DateTime<Utc>) -> Self {
        Self {
            id,
            state: TrackState::Active,
            bbox: observation.bbox,
            last_quality: observation.quality,
            best: observation,
            last_update: now,
            identity: None,
            hits: 1,
        }
    }

    fn absorb(&mut self, observation: Observation, now: DateTime<Utc>) {
        self.bbox = observation.bbox;
        self.last_update = now;
        self.last_quality = observation.quality;
        self.hits += 1;
        if observation.quality > self.best.quality {
            self.best = observation;
        }
    }

    pub fn representative(&self) -> &Embedding {
        &self.best.embedding
    }
}

#[derive(Debug, Clone)]
pub struct TrackerParams {
    /// Remove a track after this long without a matching observation.
    pub track_timeout: Duration,
    /// Minimum combined association score to match an observation to a track.
    pub min_association: f32,
    /// Combined score above which a second track claiming the same
    /// observation is merged away.
    pub merge_threshold: f32,
    /// Weight of box IoU vs embedding similarity in the combined score.
    pub iou_weight: f32,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            track_timeout: Duration::from_secs(2),
            min_association: 0.3,
            merge_threshold: 0.6,
            iou_weight: 0.6,
        }
    }
}

/// Result of feeding one frame's observations to the tracker.
#[derive(Debug, Default)]
pub struct FrameUpdate {
    /// Ids of tracks matched or created this frame, in track order.
    pub updated: Vec<u64>,
    /// Tracks that exceeded the inactivity timeout and were removed.
    pub expired: Vec<Track>,
    /// (kept, discarded) id pairs from track merges.
    pub merged: Vec<(u64, u64)>,
}

/// Tracker state for one camera. Track ids are monotonic and never reused,
/// including across connection resets.
pub struct Tracker {
    next_id: u64,
    tracks: Vec<Track>,
}

impl Tracker {
    pub fn new() -> Self {
        Self { next_id: 1, tracks: Vec::new() }
    }

    pub fn active(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter().filter(|t| t.state == TrackState::Active)
    }

    pub fn get(&self, id: u64) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Drop all tracks but keep the id counter, so ids stay unique across
    /// a camera reconnect.
    pub fn reset(&mut self) {
        if !self.tracks.is_empty() {
            tracing::debug!(dropped = self.tracks.len(), "tracker reset");
        }
        self.tracks.clear();
    }

    /// Pin a gallery identity to a track. The first resolution wins; later
    /// calls only refresh the similarity upward.
    pub fn resolve(&mut self, track_id: u64, identity: ResolvedIdentity) {
        let Some(track) = self.tracks.iter_mut().find(|t| t.id == track_id) else {
            return;
        };
        match &mut track.identity {
            None => {
                tracing::debug!(
                    track_id,
                    identity_id = %identity.identity_id,
                    similarity = identity.similarity,
                    "track resolved"
                );
                track.identity = Some(identity);
            }
            Some(existing) if existing.identity_id == identity.identity_id => {
                if identity.similarity > existing.similarity {
                    existing.similarity = identity.similarity;
                }
            }
            Some(_) => {}
        }
    }

    /// Advance one frame: expire stale tracks, associate observations,
    /// merge converged tracks, and start tracks for the leftovers.
    pub fn update(
        &mut self,
        observations: Vec<Observation>,
        now: DateTime<Utc>,
        params: &TrackerParams,
    ) -> FrameUpdate {
        let mut out = FrameUpdate::default();

        // Expiry first, so a long-gone face never captures a new observation.
        let timeout = params.track_timeout;
        let mut kept = Vec::with_capacity(self.tracks.len());
        for mut track in self.tracks.drain(..) {
            let idle = now.signed_duration_since(track.last_update).to_std().ok();
            if idle.map(|d| d > timeout).unwrap_or(false) {
                track.state = TrackState::Lost;
                tracing::debug!(track_id = track.id, "track expired");
                out.expired.push(track);
            } else {
                kept.push(track);
            }
        }
        self.tracks = kept;

        // Score every (track, observation) pair above the association floor.
        struct Candidate {
            score: f32,
            quality: f32,
            track: usize,
            obs: usize,
        }
        let mut candidates = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (oi, obs) in observations.iter().enumerate() {
                let iou = track.bbox.iou(&obs.bbox);
                let sim = track.representative().similarity(&obs.embedding).clamp(0.0, 1.0);
                let score = params.iou_weight * iou + (1.0 - params.iou_weight) * sim;
                if score >= params.min_association {
                    candidates.push(Candidate { score, quality: obs.quality, track: ti, obs: oi });
                }
            }
        }
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.quality.partial_cmp(&a.quality).unwrap_or(std::cmp::Ordering::Equal))
        });

        // Greedy assignment, best score first. A track left unassigned whose
        // score against an already-claimed observation clears the merge
        // threshold has converged onto the same face: merge, older id wins.
        let mut obs_owner: Vec<Option<usize>> = vec![None; observations.len()];
        let mut track_taken: Vec<bool> = vec![false; self.tracks.len()];
        let mut assigned: Vec<(usize, usize)> = Vec::new();
        let mut merges: Vec<(usize, usize)> = Vec::new(); // (into, from) indices
        let mut merged_away: Vec<bool> = vec![false; self.tracks.len()];

        for c in &candidates {
            if track_taken[c.track] || merged_away[c.track] {
                continue;
            }
            match obs_owner[c.obs] {
                None => {
                    obs_owner[c.obs] = Some(c.track);
                    track_taken[c.track] = true;
                    assigned.push((c.track, c.obs));
                }
                Some(owner) if c.score >= params.merge_threshold => {
                    let (keep, drop) = if self.tracks[owner].id <= self.tracks[c.track].id {
                        (owner, c.track)
                    } else {
                        (c.track, owner)
                    };
                    merged_away[drop] = true;
                    merges.push((keep, drop));
                }
                Some(_) => {}
            }
        }

        for (ti, oi) in &assigned {
            self.tracks[*ti].absorb(observations[*oi].clone(), now);
            out.updated.push(self.tracks[*ti].id);
        }

        // Apply merges. The kept track inherits the better representative
        // observation and any resolved identity the discarded one carried.
        for (keep, drop) in merges {
            let dropped = self.tracks[drop].clone();
            let kept_track = &mut self.tracks[keep];
            out.merged.push((kept_track.id.min(dropped.id), kept_track.id.max(dropped.id)));
            if dropped.best.quality > kept_track.best.quality {
                kept_track.best = dropped.best;
            }
            if kept_track.identity.is_none() {
                kept_track.identity = dropped.identity;
            }
            kept_track.hits += dropped.hits;
            // The older id survives even if the greedy winner was the newer
            // track: reassign the kept slot's id before discarding.
            if dropped.id < kept_track.id {
                kept_track.id = dropped.id;
            }
            kept_track.last_update = now;
            tracing::debug!(kept = kept_track.id, "tracks merged");
        }
        let mut drop_iter = merged_away.iter();
        self.tracks.retain(|_| !*drop_iter.next().unwrap_or(&false));

        // Downstream consumers must only ever see the surviving id.
        for (keep, drop) in &out.merged {
            for id in out.updated.iter_mut() {
                if id == drop {
                    *id = *keep;
                }
            }
        }
        let mut seen = std::collections::HashSet::new();
        out.updated.retain(|id| seen.insert(*id));

        // Unclaimed observations start new tracks.
        for (oi, obs) in observations.into_iter().enumerate() {
            if obs_owner[oi].is_none() {
                let id = self.next_id;
                self.next_id += 1;
                tracing::debug!(track_id = id, quality = obs.quality, "track started");
                self.tracks.push(Track::new(id, obs, now));
                out.updated.push(id);
            }
        }

        out
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}
