//! Per-camera pipeline: frames in, committed events out.
//!
//! One task per camera owns that camera's tracker and session engine and
//! drives the stages in order: darkness gate, inference, quality floor,
//! tracking, gallery matching, session bookkeeping, commit. State advances
//! on frame capture time; only the dwell sweep runs on the wall clock.

use crate::config::SharedTunables;
use crate::perception::PerceptionHandle;
use crate::store::Store;
use crate::writer::{WriterError, WriterHandle};
use chrono::Utc;
use mirador_core::{
    CosineMatcher, Gallery, Matcher, ResolvedIdentity, SessionEngine, SessionKey, Tracker,
    apply_quality_floor,
};
use mirador_video::source::{self, ConnectorRegistry, SourceEvent, SourceStatus};
use mirador_video::Frame;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Mean-luma floor below which a frame is treated as a covered lens.
const DARK_LUMA_THRESHOLD: f32 = 10.0;
/// Padding around the face box when extracting crops.
const CROP_MARGIN: f32 = 0.2;
const SWEEP_PERIOD: Duration = Duration::from_secs(1);
const TOUCH_PERIOD: Duration = Duration::from_secs(5);

/// Everything a pipeline needs besides its camera. Cheap to clone; one
/// copy per spawned pipeline.
#[derive(Clone)]
pub struct PipelineDeps {
    pub gallery: Arc<Gallery>,
    pub tunables: SharedTunables,
    pub writer: WriterHandle,
    pub store: Store,
    pub perception: PerceptionHandle,
    pub registry: Arc<ConnectorRegistry>,
    pub connect_timeout: Duration,
    pub stop_grace: Duration,
}

pub struct PipelineHandle {
    pub camera_id: String,
    pub status: watch::Receiver<SourceStatus>,
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl PipelineHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.join.await {
            tracing::warn!(camera = %self.camera_id, error = %e, "pipeline task failed");
        }
    }
}

pub fn spawn_pipeline(camera_id: String, descriptor: String, deps: PipelineDeps) -> PipelineHandle {
    let (status_tx, status_rx) = watch::channel(SourceStatus::Connecting);
    let (stop_tx, stop_rx) = watch::channel(false);
    let join = tokio::spawn(run_pipeline(
        camera_id.clone(),
        descriptor,
        deps,
        status_tx,
        stop_rx,
    ));
    PipelineHandle { camera_id, status: status_rx, stop_tx, join }
}

async fn run_pipeline(
    camera_id: String,
    descriptor: String,
    deps: PipelineDeps,
    status: watch::Sender<SourceStatus>,
    mut stop: watch::Receiver<bool>,
) {
    let mut source = source::spawn(
        camera_id.clone(),
        descriptor,
        Arc::clone(&deps.registry),
        deps.connect_timeout,
    );
    let mut source_status = source.status.clone();

    let mut tracker = Tracker::new();
    let mut sessions = SessionEngine::new();
    let matcher = CosineMatcher;

    let mut sweep = tokio::time::interval(SWEEP_PERIOD);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut touch = tokio::time::interval(TOUCH_PERIOD);
    touch.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut halted = false;
    loop {
        tokio::select! {
            event = source.events.recv() => match event {
                Some(SourceEvent::Reconnected) => {
                    // Per-connection state does not survive the link.
                    tracker.reset();
                }
                Some(SourceEvent::Frame(frame)) => {
                    let drafts = process_frame(
                        &camera_id, frame, &mut tracker, &mut sessions, &matcher, &deps,
                    ).await;
                    if commit_all(&camera_id, drafts, &deps.writer).await.is_err() {
                        halted = true;
                        break;
                    }
                }
                None => break,
            },
            _ = sweep.tick() => {
                let t = deps.tunables.get();
                let drafts = sessions.sweep(Utc::now(), &t.session_params());
                if commit_all(&camera_id, drafts, &deps.writer).await.is_err() {
                    halted = true;
                    break;
                }
            }
            _ = touch.tick() => {
                if let Err(e) = deps.store.touch_camera(camera_id.clone(), Utc::now()).await {
                    tracing::warn!(camera = %camera_id, error = %e, "camera heartbeat failed");
                }
            }
            changed = source_status.changed() => {
                if changed.is_ok() {
                    let _ = status.send(source_status.borrow().clone());
                }
            }
            _ = stop.changed() => break,
        }
    }

    // Open visits end on shutdown; commits are best-effort at this point.
    let drafts = sessions.close_all(Utc::now());
    if !halted {
        let _ = commit_all(&camera_id, drafts, &deps.writer).await;
    }
    source.stop(deps.stop_grace).await;
    if halted {
        let _ = status.send(SourceStatus::Degraded("event store unavailable".into()));
    } else {
        let _ = status.send(SourceStatus::Stopped);
    }
    tracing::info!(camera = %camera_id, "pipeline stopped");
}

async fn commit_all(
    camera_id: &str,
    drafts: Vec<mirador_core::types::EventDraft>,
    writer: &WriterHandle,
) -> Result<(), WriterError> {
    for draft in drafts {
        if let Err(e) = writer.commit(camera_id.to_string(), draft).await {
            tracing::error!(camera = %camera_id, error = %e, "event commit failed, halting pipeline");
            return Err(e);
        }
    }
    Ok(())
}

/// Run one frame through the stages; returns the event drafts it produced.
async fn process_frame(
    camera_id: &str,
    frame: Frame,
    tracker: &mut Tracker,
    sessions: &mut SessionEngine,
    matcher: &CosineMatcher,
    deps: &PipelineDeps,
) -> Vec<mirador_core::types::EventDraft> {
    let t = deps.tunables.get();

    if frame.is_dark(DARK_LUMA_THRESHOLD) {
        tracing::debug!(camera = %camera_id, sequence = frame.sequence, "dark frame skipped");
        return Vec::new();
    }

    let observations = match deps
        .perception
        .infer(
            frame.pixels.clone(),
            frame.width,
            frame.height,
            frame.format.channels() as u8,
        )
        .await
    {
        Ok(observations) => observations,
        Err(e) => {
            // Inference failures drop the frame, never the pipeline.
            tracing::warn!(camera = %camera_id, error = %e, "inference failed, frame dropped");
            return Vec::new();
        }
    };

    let observations = apply_quality_floor(observations, t.quality_floor);
    let now = frame.captured_at;
    let update = tracker.update(observations, now, &t.tracker_params());

    // A merged-away track's open visit follows the survivor instead of
    // dangling until dwell expiry.
    for (keep, drop) in &update.merged {
        let into = tracker
            .get(*keep)
            .and_then(|t| t.identity.as_ref())
            .map(|r| SessionKey::Identity(r.identity_id.clone()))
            .unwrap_or(SessionKey::Track(*keep));
        sessions.merge(*drop, into);
    }

    let snapshot = deps.gallery.snapshot();
    let mut drafts = Vec::new();
    for track_id in update.updated {
        let Some(track) = tracker.get(track_id) else { continue };
        let was_unknown = track.identity.is_none();
        let bbox = track.bbox;
        let last_quality = track.last_quality;
        let matched =
            matcher.best_match(track.representative(), &snapshot, t.similarity_threshold);

        if let Some(m) = &matched {
            tracker.resolve(
                track_id,
                ResolvedIdentity {
                    identity_id: m.identity_id.clone(),
                    label: m.label.clone(),
                    similarity: m.similarity,
                },
            );
        }
        // Identity resolution is sticky, so re-read what actually stuck.
        let identity = tracker.get(track_id).and_then(|t| t.identity.clone());

        if was_unknown {
            if let Some(resolved) = &identity {
                sessions.resolve(
                    track_id,
                    &resolved.identity_id,
                    &resolved.label,
                    resolved.similarity,
                    now,
                );
            }
        }

        let crop = frame.crop_region(&bbox, CROP_MARGIN, last_quality);
        let (key, label, similarity) = match (&identity, &matched) {
            (Some(resolved), Some(m)) if m.identity_id == resolved.identity_id => (
                SessionKey::Identity(resolved.identity_id.clone()),
                Some(resolved.label.clone()),
                m.similarity,
            ),
            (Some(resolved), _) => (
                SessionKey::Identity(resolved.identity_id.clone()),
                Some(resolved.label.clone()),
                resolved.similarity,
            ),
            (None, _) => (SessionKey::Track(track_id), None, 0.0),
        };
        drafts.extend(sessions.observe(key, label, similarity, crop, now, &t.session_params()));
    }
    drafts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Broadcaster;
    use crate::config::Tunables;
    use crate::crops::CropStore;
    use crate::perception::spawn_perception;
    use crate::writer::spawn_writer;
    use async_trait::async_trait;
    use mirador_core::types::{BoundingBox, EventKind, Observation};
    use mirador_core::{Embedding, IdentityDescriptor, InferenceError, Perception};
    use mirador_video::frame::PixelFormat;
    use mirador_video::source::{CameraConnector, FrameStream, SourceError};
    use uuid::Uuid;

    struct ScriptedStream {
        frames: Vec<Frame>,
    }

    #[async_trait]
    impl FrameStream for ScriptedStream {
        async fn next_frame(&mut self) -> Result<Frame, SourceError> {
            match self.frames.pop() {
                Some(frame) => Ok(frame),
                // Hold the connection open without more frames.
                None => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(SourceError::Closed)
                }
            }
        }
    }

    struct ScriptedConnector {
        frames: std::sync::Mutex<Vec<Frame>>,
    }

    #[async_trait]
    impl CameraConnector for ScriptedConnector {
        async fn connect(&self, _target: &str) -> Result<Box<dyn FrameStream>, SourceError> {
            let frames = std::mem::take(&mut *self.frames.lock().unwrap());
            Ok(Box::new(ScriptedStream { frames }))
        }
    }

    struct OneFace;

    impl Perception for OneFace {
        fn infer(
            &mut self,
            _pixels: &[u8],
            _width: u32,
            _height: u32,
            _channels: u8,
        ) -> Result<Vec<Observation>, InferenceError> {
            Ok(vec![Observation {
                bbox: BoundingBox { x: 1.0, y: 1.0, width: 4.0, height: 4.0 },
                embedding: Embedding::new(vec![1.0, 0.0]),
                quality: 0.9,
            }])
        }
    }

    fn bright_frame(sequence: u64) -> Frame {
        Frame {
            pixels: vec![200u8; 64],
            width: 8,
            height: 8,
            format: PixelFormat::Gray8,
            captured_at: Utc::now(),
            sequence,
        }
    }

    async fn deps_with(
        connector: ScriptedConnector,
        perception: Box<dyn Perception>,
    ) -> (PipelineDeps, Store) {
        let store = Store::open_in_memory().await.unwrap();
        let crops =
            CropStore::new(std::env::temp_dir().join(format!("mirador-pipe-{}", Uuid::new_v4())));
        crops.ensure_dirs().unwrap();
        let tunables = SharedTunables::new(Tunables::default());
        let broadcaster = Broadcaster::new(store.clone(), 16, 0, tunables.clone());
        let (writer, _join) = spawn_writer(store.clone(), crops, broadcaster);

        let gallery = Gallery::load(vec![IdentityDescriptor {
            id: "alice".into(),
            label: "Alice".into(),
            embeddings: vec![Embedding::new(vec![1.0, 0.0])],
        }])
        .unwrap();

        let mut registry = ConnectorRegistry::new();
        registry.register("mock", Arc::new(connector));

        let deps = PipelineDeps {
            gallery: Arc::new(gallery),
            tunables,
            writer,
            store: store.clone(),
            perception: spawn_perception(perception),
            registry: Arc::new(registry),
            connect_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(2),
        };
        (deps, store)
    }

    async fn wait_for_events(store: &Store, at_least: usize) -> Vec<crate::store::EventRecord> {
        for _ in 0..100 {
            let mut events = store.query(Default::default()).await.unwrap();
            if events.len() >= at_least {
                events.reverse(); // chronological
                return events;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected at least {at_least} events");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recognized_visit_flows_end_to_end() {
        let connector = ScriptedConnector {
            frames: std::sync::Mutex::new(vec![bright_frame(2), bright_frame(1)]),
        };
        let (deps, store) = deps_with(connector, Box::new(OneFace)).await;
        let pipeline = spawn_pipeline("cam1".into(), "mock:x".into(), deps);

        // The first frame opens the visit: VISIT_START then RECOGNIZED.
        let events = wait_for_events(&store, 2).await;
        assert_eq!(events[0].kind, EventKind::VisitStart);
        assert_eq!(events[1].kind, EventKind::Recognized);
        assert_eq!(events[1].identity_id.as_deref(), Some("alice"));
        assert_eq!(events[1].label.as_deref(), Some("Alice"));
        assert!(events[1].confidence > 0.9);
        // The detection event carries the face crop.
        assert!(events[1].crop_ref.is_some());
        assert!(events[0].crop_ref.is_none());

        // Shutdown closes the open visit.
        pipeline.stop().await;
        let events = wait_for_events(&store, 3).await;
        assert_eq!(events.last().unwrap().kind, EventKind::VisitEnd);
        assert_eq!(events.last().unwrap().identity_id.as_deref(), Some("alice"));
        // The second frame fell inside the dedup interval: exactly 3 events.
        assert_eq!(events.len(), 3);
    }

    /// Two faces then one: the tracker merges the converged tracks.
    struct TwoFacesThenOne {
        calls: u32,
    }

    impl Perception for TwoFacesThenOne {
        fn infer(
            &mut self,
            _pixels: &[u8],
            _width: u32,
            _height: u32,
            _channels: u8,
        ) -> Result<Vec<Observation>, InferenceError> {
            self.calls += 1;
            // Orthogonal to the gallery, so the tracks stay unknown.
            let face = |x: f32| Observation {
                bbox: BoundingBox { x, y: 1.0, width: 4.0, height: 4.0 },
                embedding: Embedding::new(vec![0.0, 1.0]),
                quality: 0.9,
            };
            if self.calls == 1 {
                Ok(vec![face(1.0), face(3.0)])
            } else {
                Ok(vec![face(2.0)])
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn merged_track_folds_its_open_visit() {
        let connector = ScriptedConnector { frames: std::sync::Mutex::new(Vec::new()) };
        let (deps, _store) = deps_with(connector, Box::new(TwoFacesThenOne { calls: 0 })).await;

        let mut tracker = Tracker::new();
        let mut sessions = SessionEngine::new();
        let matcher = CosineMatcher;

        let drafts =
            process_frame("cam1", bright_frame(1), &mut tracker, &mut sessions, &matcher, &deps)
                .await;
        // Two unknown faces open two visits.
        assert_eq!(sessions.open_count(), 2);
        assert_eq!(drafts.len(), 4);

        let drafts =
            process_frame("cam1", bright_frame(2), &mut tracker, &mut sessions, &matcher, &deps)
                .await;
        // The tracks converged onto one face: the discarded track's visit
        // folds into the survivor instead of dangling until dwell expiry.
        assert_eq!(sessions.open_count(), 1);
        assert!(sessions.is_open(&SessionKey::Track(1)));
        assert!(drafts.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dark_frames_produce_nothing() {
        let dark = Frame {
            pixels: vec![2u8; 64],
            width: 8,
            height: 8,
            format: PixelFormat::Gray8,
            captured_at: Utc::now(),
            sequence: 1,
        };
        let connector = ScriptedConnector { frames: std::sync::Mutex::new(vec![dark]) };
        let (deps, store) = deps_with(connector, Box::new(OneFace)).await;
        let pipeline = spawn_pipeline("cam1".into(), "mock:x".into(), deps);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.query(Default::default()).await.unwrap().is_empty());
        pipeline.stop().await;
    }
}
