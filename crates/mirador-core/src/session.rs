//! Visit sessions and event deduplication for one camera.
//!
//! A pure state machine advanced by event time: every update and sweep
//! takes an explicit timestamp, so the dwell window and dedup interval are
//! testable without wall-clock waits.

use crate::types::{CropCandidate, EventDraft, EventKind, Subject};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// Session key: a resolved gallery identity, or an unresolved track.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    Identity(String),
    Track(u64),
}

#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Maximum gap between matches before the visit is considered ended.
    pub dwell_window: Duration,
    /// Minimum spacing between emitted events for the same key.
    pub event_min_interval: Duration,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            dwell_window: Duration::from_secs(10),
            event_min_interval: Duration::from_secs(30),
        }
    }
}

/// An OPEN visit. Removal from the engine is the CLOSED state.
#[derive(Debug)]
struct VisitSession {
    started_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    last_event_at: DateTime<Utc>,
    /// Display label for identity keys.
    label: Option<String>,
    best_similarity: f32,
    /// Best-quality crop material gathered since the last emitted event.
    pending_crop: Option<CropCandidate>,
}

impl VisitSession {
    fn stash_crop(&mut self, crop: Option<CropCandidate>) {
        if let Some(c) = crop {
            let better = self
                .pending_crop
                .as_ref()
                .map(|cur| c.quality > cur.quality)
                .unwrap_or(true);
            if better {
                self.pending_crop = Some(c);
            }
        }
    }
}

fn subject_for(key: &SessionKey, label: &Option<String>) -> Subject {
    match key {
        SessionKey::Identity(id) => Subject::Known {
            identity_id: id.clone(),
            label: label.clone().unwrap_or_default(),
        },
        SessionKey::Track(track_id) => Subject::Unknown { track_id: *track_id },
    }
}

fn detection_kind(key: &SessionKey) -> EventKind {
    match key {
        SessionKey::Identity(_) => EventKind::Recognized,
        SessionKey::Track(_) => EventKind::Unknown,
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(since).to_std().unwrap_or(Duration::ZERO)
}

/// Per-camera visit session engine. At most one OPEN session per key.
pub struct SessionEngine {
    sessions: HashMap<SessionKey, VisitSession>,
}

impl SessionEngine {
    pub fn new() -> Self {
        Self { sessions: HashMap::new() }
    }

    pub fn open_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_open(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    /// Feed one qualifying match for `key` at `now`.
    ///
    /// Emits VISIT_START plus the detection event on a fresh session,
    /// and at most one detection event per `event_min_interval` while the
    /// session stays open.
    pub fn observe(
        &mut self,
        key: SessionKey,
        label: Option<String>,
        similarity: f32,
        crop: Option<CropCandidate>,
        now: DateTime<Utc>,
        params: &SessionParams,
    ) -> Vec<EventDraft> {
        let mut events = Vec::new();

        // A match arriving after the dwell window lapsed (before any sweep
        // ran) ends the stale visit first.
        let stale = self
            .sessions
            .get(&key)
            .map(|s| elapsed(s.last_seen, now) > params.dwell_window)
            .unwrap_or(false);
        if stale {
            if let Some(session) = self.sessions.remove(&key) {
                events.push(EventDraft {
                    kind: EventKind::VisitEnd,
                    subject: subject_for(&key, &session.label),
                    confidence: session.best_similarity,
                    ts: now,
                    crop: None,
                });
            }
        }

        match self.sessions.get_mut(&key) {
            None => {
                let subject = subject_for(&key, &label);
                tracing::info!(?key, similarity, "visit started");
                events.push(EventDraft {
                    kind: EventKind::VisitStart,
                    subject: subject.clone(),
                    confidence: similarity,
                    ts: now,
                    crop: None,
                });
                events.push(EventDraft {
                    kind: detection_kind(&key),
                    subject,
                    confidence: similarity,
                    ts: now,
                    crop,
                });
                self.sessions.insert(
                    key,
                    VisitSession {
                        started_at: now,
                        last_seen: now,
                        last_event_at: now,
                        label,
                        best_similarity: similarity,
                        pending_crop: None,
                    },
                );
            }
            Some(session) => {
                session.last_seen = now;
                if similarity > session.best_similarity {
                    session.best_similarity = similarity;
                }
                if label.is_some() {
                    session.label = label;
                }
                session.stash_crop(crop);

                if elapsed(session.last_event_at, now) >= params.event_min_interval {
                    session.last_event_at = now;
                    let subject = subject_for(&key, &session.label);
                    events.push(EventDraft {
                        kind: detection_kind(&key),
                        subject,
                        confidence: similarity,
                        ts: now,
                        crop: session.pending_crop.take(),
                    });
                }
            }
        }

        events
    }

    /// Transfer an unknown track's open session to its resolved identity,
    /// without emitting a spurious VISIT_END/VISIT_START pair.
    ///
    /// If the identity already has an open session (the same person under
    /// two tracks), the sessions fold together keeping the earlier start.
    pub fn resolve(
        &mut self,
        track_id: u64,
        identity_id: &str,
        label: &str,
        similarity: f32,
        now: DateTime<Utc>,
    ) {
        let Some(mut session) = self.sessions.remove(&SessionKey::Track(track_id)) else {
            return;
        };
        session.label = Some(label.to_string());
        if similarity > session.best_similarity {
            session.best_similarity = similarity;
        }
        session.last_seen = now;
        tracing::info!(track_id, identity_id, "session transferred to identity");
        self.adopt(SessionKey::Identity(identity_id.to_string()), session);
    }

    /// Fold a merged-away track's open session into the surviving track's
    /// key, so the discarded key never dangles until dwell expiry and
    /// emits a spurious VISIT_END on its own.
    pub fn merge(&mut self, from_track: u64, into: SessionKey) {
        if into == SessionKey::Track(from_track) {
            return;
        }
        let Some(session) = self.sessions.remove(&SessionKey::Track(from_track)) else {
            return;
        };
        tracing::debug!(track_id = from_track, ?into, "merged track's session folded");
        self.adopt(into, session);
    }

    /// Move `session` under `key`, folding into an already-open session
    /// for that key instead of duplicating it.
    fn adopt(&mut self, key: SessionKey, session: VisitSession) {
        match self.sessions.get_mut(&key) {
            None => {
                self.sessions.insert(key, session);
            }
            Some(existing) => {
                existing.started_at = existing.started_at.min(session.started_at);
                existing.last_seen = existing.last_seen.max(session.last_seen);
                // Keep the later dedup mark so the fold never causes an
                // early re-emission.
                existing.last_event_at = existing.last_event_at.max(session.last_event_at);
                if session.best_similarity > existing.best_similarity {
                    existing.best_similarity = session.best_similarity;
                }
                existing.stash_crop(session.pending_crop);
                tracing::debug!(?key, "sessions folded");
            }
        }
    }

    /// Close sessions whose dwell window has lapsed by `now`.
    pub fn sweep(&mut self, now: DateTime<Utc>, params: &SessionParams) -> Vec<EventDraft> {
        let expired: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| elapsed(s.last_seen, now) > params.dwell_window)
            .map(|(k, _)| k.clone())
            .collect();

        let mut events = Vec::new();
        for key in expired {
            if let Some(session) = self.sessions.remove(&key) {
                let dwell = elapsed(session.started_at, now);
                tracing::info!(?key, dwell_secs = dwell.as_secs(), "visit ended");
                events.push(EventDraft {
                    kind: EventKind::VisitEnd,
                    subject: subject_for(&key, &session.label),
                    confidence: session.best_similarity,
                    ts: now,
                    crop: None,
                });
            }
        }
        events
    }

    /// Close every open session (pipeline shutdown).
    pub fn close_all(&mut self, now: DateTime<Utc>) -> Vec<EventDraft> {
        let keys: Vec<SessionKey> = self.sessions.keys().cloned().collect();
        let mut events = Vec::new();
        for key in keys {
            if let Some(session) = self.sessions.remove(&key) {
                events.push(EventDraft {
                    kind: EventKind::VisitEnd,
                    subject: subject_for(&key, &session.label),
                    confidence: session.best_similarity,
                    ts: now,
                    crop: None,
                });
            }
        }
        events
    }
}

impl Default for SessionEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn params(dwell_secs: u64, min_interval_secs: u64) -> SessionParams {
        SessionParams {
            dwell_window: Duration::from_secs(dwell_secs),
            event_min_interval: Duration::from_secs(min_interval_secs),
        }
    }

    fn alice() -> SessionKey {
        SessionKey::Identity("alice".into())
    }

    fn observe_alice(engine: &mut SessionEngine, at: i64, p: &SessionParams) -> Vec<EventDraft> {
        engine.observe(alice(), Some("Alice".into()), 0.8, None, ts(at), p)
    }

    #[test]
    fn first_match_opens_visit_with_two_events() {
        let p = params(5, 10);
        let mut engine = SessionEngine::new();
        let events = observe_alice(&mut engine, 0, &p);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::VisitStart);
        assert_eq!(events[1].kind, EventKind::Recognized);
        assert_eq!(
            events[1].subject,
            Subject::Known { identity_id: "alice".into(), label: "Alice".into() }
        );
        assert!(engine.is_open(&alice()));
    }

    #[test]
    fn dedup_suppresses_event_within_min_interval() {
        // Scenario A: matches at t=0 and t=2s, dwell=5s, min_interval=10s.
        let p = params(5, 10);
        let mut engine = SessionEngine::new();
        let first = observe_alice(&mut engine, 0, &p);
        assert_eq!(first.len(), 2);
        let second = observe_alice(&mut engine, 2, &p);
        assert!(second.is_empty(), "no event expected at t=2s");
        assert_eq!(engine.open_count(), 1);
    }

    #[test]
    fn event_emitted_after_min_interval_elapses() {
        let p = params(60, 10);
        let mut engine = SessionEngine::new();
        observe_alice(&mut engine, 0, &p);
        assert!(observe_alice(&mut engine, 5, &p).is_empty());
        let events = observe_alice(&mut engine, 10, &p);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Recognized);
        // And the dedup clock restarts from the emission.
        assert!(observe_alice(&mut engine, 15, &p).is_empty());
    }

    #[test]
    fn sweep_closes_idle_visit() {
        // Scenario B: one match at t=0, dwell=5s, VISIT_END at or after t=5s.
        let p = params(5, 10);
        let mut engine = SessionEngine::new();
        observe_alice(&mut engine, 0, &p);

        assert!(engine.sweep(ts(4), &p).is_empty());
        let events = engine.sweep(ts(6), &p);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::VisitEnd);
        assert_eq!(events[0].ts, ts(6));
        assert_eq!(engine.open_count(), 0);
    }

    #[test]
    fn match_after_lapsed_window_closes_then_reopens() {
        let p = params(5, 10);
        let mut engine = SessionEngine::new();
        observe_alice(&mut engine, 0, &p);

        // No sweep ran; the next match arrives well past the window.
        let events = observe_alice(&mut engine, 20, &p);
        assert_eq!(
            events.iter().map(|e| e.kind).collect::<Vec<_>>(),
            vec![EventKind::VisitEnd, EventKind::VisitStart, EventKind::Recognized]
        );
        assert_eq!(engine.open_count(), 1);
    }

    #[test]
    fn unknown_track_session_uses_track_subject() {
        let p = params(5, 10);
        let mut engine = SessionEngine::new();
        let events = engine.observe(SessionKey::Track(7), None, 0.0, None, ts(0), &p);
        assert_eq!(events[0].kind, EventKind::VisitStart);
        assert_eq!(events[1].kind, EventKind::Unknown);
        assert_eq!(events[1].subject, Subject::Unknown { track_id: 7 });
    }

    #[test]
    fn resolution_transfers_session_without_spurious_events() {
        // Scenario C: an unknown track resolves mid-visit.
        let p = params(5, 10);
        let mut engine = SessionEngine::new();
        engine.observe(SessionKey::Track(7), None, 0.0, None, ts(0), &p);

        engine.resolve(7, "alice", "Alice", 0.8, ts(2));
        assert!(!engine.is_open(&SessionKey::Track(7)));
        assert!(engine.is_open(&alice()));
        assert_eq!(engine.open_count(), 1);

        // The transferred session keeps its dedup clock: a match right after
        // resolution emits nothing.
        let events = observe_alice(&mut engine, 3, &p);
        assert!(events.is_empty());

        // And the visit closes once, under the identity subject.
        let ends = engine.sweep(ts(20), &p);
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].kind, EventKind::VisitEnd);
        assert_eq!(
            ends[0].subject,
            Subject::Known { identity_id: "alice".into(), label: "Alice".into() }
        );
    }

    #[test]
    fn resolution_folds_into_existing_identity_session() {
        let p = params(5, 10);
        let mut engine = SessionEngine::new();
        observe_alice(&mut engine, 0, &p);
        engine.observe(SessionKey::Track(9), None, 0.0, None, ts(1), &p);
        assert_eq!(engine.open_count(), 2);

        engine.resolve(9, "alice", "Alice", 0.9, ts(2));
        // One OPEN session per (camera, identity): folded, not duplicated.
        assert_eq!(engine.open_count(), 1);
        assert!(engine.is_open(&alice()));
    }

    #[test]
    fn track_merge_folds_session_into_survivor() {
        let p = params(5, 10);
        let mut engine = SessionEngine::new();
        engine.observe(SessionKey::Track(1), None, 0.0, None, ts(0), &p);
        engine.observe(SessionKey::Track(2), None, 0.0, None, ts(1), &p);
        assert_eq!(engine.open_count(), 2);

        engine.merge(2, SessionKey::Track(1));
        assert_eq!(engine.open_count(), 1);
        assert!(engine.is_open(&SessionKey::Track(1)));
        assert!(!engine.is_open(&SessionKey::Track(2)));

        // Exactly one VISIT_END, under the surviving track.
        let ends = engine.sweep(ts(20), &p);
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].subject, Subject::Unknown { track_id: 1 });
    }

    #[test]
    fn track_merge_moves_session_when_survivor_has_none() {
        let p = params(5, 10);
        let mut engine = SessionEngine::new();
        engine.observe(SessionKey::Track(3), None, 0.0, None, ts(0), &p);

        engine.merge(3, SessionKey::Identity("alice".into()));
        assert_eq!(engine.open_count(), 1);
        assert!(engine.is_open(&SessionKey::Identity("alice".into())));

        // Merging an absent track is a no-op.
        engine.merge(4, SessionKey::Track(1));
        assert_eq!(engine.open_count(), 1);
    }

    #[test]
    fn at_most_one_open_session_per_key() {
        let p = params(5, 1);
        let mut engine = SessionEngine::new();
        let mut starts = 0;
        let mut ends = 0;
        for t in 0..30 {
            for e in observe_alice(&mut engine, t, &p) {
                match e.kind {
                    EventKind::VisitStart => starts += 1,
                    EventKind::VisitEnd => ends += 1,
                    _ => {}
                }
                // No double VISIT_START without an intervening VISIT_END.
                assert!(starts - ends <= 1);
            }
            assert!(engine.open_count() <= 1);
        }
        assert_eq!(starts, 1);
    }

    #[test]
    fn best_pending_crop_attached_to_next_emission() {
        let p = params(60, 10);
        let mut engine = SessionEngine::new();
        let crop = |q: f32| CropCandidate { pixels: vec![0], width: 1, height: 1, channels: 1, quality: q };

        let opened = engine.observe(alice(), Some("Alice".into()), 0.8, Some(crop(0.5)), ts(0), &p);
        assert_eq!(opened[1].crop.as_ref().unwrap().quality, 0.5);

        engine.observe(alice(), Some("Alice".into()), 0.8, Some(crop(0.9)), ts(2), &p);
        engine.observe(alice(), Some("Alice".into()), 0.8, Some(crop(0.3)), ts(4), &p);
        let events = engine.observe(alice(), Some("Alice".into()), 0.8, Some(crop(0.4)), ts(10), &p);
        assert_eq!(events.len(), 1);
        // Best quality since the last emission wins.
        assert_eq!(events[0].crop.as_ref().unwrap().quality, 0.9);

        // The pending crop was consumed.
        let later = engine.observe(alice(), Some("Alice".into()), 0.8, None, ts(20), &p);
        assert!(later[0].crop.is_none());
    }

    #[test]
    fn close_all_ends_every_open_visit() {
        let p = params(5, 10);
        let mut engine = SessionEngine::new();
        observe_alice(&mut engine, 0, &p);
        engine.observe(SessionKey::Track(3), None, 0.0, None, ts(0), &p);

        let events = engine.close_all(ts(1));
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == EventKind::VisitEnd));
        assert_eq!(engine.open_count(), 0);
    }
}
