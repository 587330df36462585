//! D-Bus surface of the Mirador daemon.
//!
//! Bus name: org.mirador.Mirador1
//! Object path: /org/mirador/Mirador1
//!
//! Structured payloads travel as JSON strings; the `RecognitionEvent`
//! signal carries one serialized event record per emission.

use crate::broadcast::Broadcaster;
use crate::config::{SharedTunables, Tunables};
use crate::crops::CropStore;
use crate::store::{CameraConfig, EventFilter, Store};
use crate::supervisor::Supervisor;
use chrono::{DateTime, Utc};
use mirador_core::{Embedding, Gallery, IdentityDescriptor};
use std::sync::Arc;
use uuid::Uuid;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.mirador.Mirador1";
pub const OBJECT_PATH: &str = "/org/mirador/Mirador1";

pub struct MiradorService {
    pub gallery: Arc<Gallery>,
    pub store: Store,
    pub supervisor: Arc<Supervisor>,
    pub crops: CropStore,
    pub broadcaster: Broadcaster,
    pub tunables: SharedTunables,
    pub started_at: DateTime<Utc>,
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

/// Overlay a partial JSON settings object onto the current values, so a
/// caller updating one knob leaves the rest untouched.
pub fn merge_settings(current: &Tunables, patch: &str) -> Result<Tunables, serde_json::Error> {
    let mut base = serde_json::to_value(current)?;
    let patch: serde_json::Value = serde_json::from_str(patch)?;
    if let (Some(base), Some(patch)) = (base.as_object_mut(), patch.as_object()) {
        for (key, value) in patch {
            base.insert(key.clone(), value.clone());
        }
    }
    serde_json::from_value(base)
}

#[interface(name = "org.mirador.Mirador1")]
impl MiradorService {
    /// Daemon status snapshot as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let cameras = self.supervisor.statuses().await.map_err(failed)?;
        let last_event_id = self.store.last_event_id().await.map_err(failed)?;
        let snapshot = self.gallery.snapshot();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": (Utc::now() - self.started_at).num_seconds(),
            "cameras": cameras,
            "gallery_size": snapshot.len(),
            "gallery_version": snapshot.version,
            "last_event_id": last_event_id,
            "subscribers": self.broadcaster.subscriber_count(),
            "settings": self.tunables.get(),
        })
        .to_string())
    }

    /// Query committed events. `filter` is a JSON [`EventFilter`]; an empty
    /// string means no filter. Returns a JSON array, newest first.
    async fn query_events(&self, filter: &str) -> zbus::fdo::Result<String> {
        let filter: EventFilter = if filter.trim().is_empty() {
            EventFilter::default()
        } else {
            serde_json::from_str(filter)
                .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?
        };
        let events = self.store.query(filter).await.map_err(failed)?;
        serde_json::to_string(&events).map_err(failed)
    }

    /// Add or reconfigure a camera. An empty `id` gets a generated one.
    /// Returns the camera id.
    async fn set_camera(&self, id: &str, source: &str, active: bool) -> zbus::fdo::Result<String> {
        if source.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("source must not be empty".into()));
        }
        let id = if id.is_empty() { Uuid::new_v4().to_string() } else { id.to_string() };
        tracing::info!(camera = %id, source, active, "set_camera requested");
        self.supervisor
            .set_camera(CameraConfig { id: id.clone(), source: source.to_string(), active })
            .await
            .map_err(failed)?;
        Ok(id)
    }

    /// Stop and remove a camera. Returns false when it did not exist.
    async fn remove_camera(&self, id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(camera = %id, "remove_camera requested");
        self.supervisor.remove_camera(id).await.map_err(failed)
    }

    /// Camera registry with live pipeline state, as a JSON array.
    async fn list_cameras(&self) -> zbus::fdo::Result<String> {
        let cameras = self.supervisor.statuses().await.map_err(failed)?;
        serde_json::to_string(&cameras).map_err(failed)
    }

    /// Insert or replace a gallery identity. `embeddings` is a JSON array
    /// of float arrays. Returns the new gallery version.
    async fn update_identity(
        &self,
        id: &str,
        label: &str,
        embeddings: &str,
    ) -> zbus::fdo::Result<u64> {
        let vectors: Vec<Vec<f32>> = serde_json::from_str(embeddings)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
        let descriptor = IdentityDescriptor {
            id: id.to_string(),
            label: label.to_string(),
            embeddings: vectors.into_iter().map(Embedding::new).collect(),
        };

        descriptor
            .validate()
            .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
        // Persist first: a store failure must not leave the published
        // gallery holding a descriptor that vanishes on restart.
        self.store.upsert_identity(descriptor.clone()).await.map_err(failed)?;
        let version = self
            .gallery
            .upsert(descriptor)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
        tracing::info!(identity = %id, version, "identity updated");
        Ok(version)
    }

    /// Remove a gallery identity. Returns false when it did not exist.
    async fn remove_identity(&self, id: &str) -> zbus::fdo::Result<bool> {
        self.gallery.remove(id);
        let removed = self.store.remove_identity(id.to_string()).await.map_err(failed)?;
        tracing::info!(identity = %id, removed, "remove_identity requested");
        Ok(removed)
    }

    /// Gallery contents (ids, labels, embedding counts) as a JSON array.
    /// Embedding vectors themselves are never exported.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.gallery.snapshot();
        let listed: Vec<serde_json::Value> = snapshot
            .descriptors
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id,
                    "label": d.label,
                    "embedding_count": d.embeddings.len(),
                })
            })
            .collect();
        serde_json::to_string(&listed).map_err(failed)
    }

    /// Absolute filesystem path of the crop stored for an event.
    async fn crop_path(&self, event_id: i64) -> zbus::fdo::Result<String> {
        let event = self
            .store
            .fetch(event_id)
            .await
            .map_err(|e| zbus::fdo::Error::FileNotFound(e.to_string()))?;
        match event.crop_ref {
            Some(rel) => Ok(self.crops.crop_path(&rel).display().to_string()),
            None => Err(zbus::fdo::Error::FileNotFound(format!(
                "event {event_id} has no stored crop"
            ))),
        }
    }

    /// Patch runtime settings from a partial JSON object; unspecified
    /// fields keep their current values. Returns the effective settings.
    async fn update_settings(&self, patch: &str) -> zbus::fdo::Result<String> {
        let merged = merge_settings(&self.tunables.get(), patch)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
        self.tunables.set(merged.clone());
        serde_json::to_string(&merged).map_err(failed)
    }

    /// Emitted for every committed event, payload = JSON event record.
    #[zbus(signal)]
    pub async fn recognition_event(
        emitter: &SignalEmitter<'_>,
        payload: String,
    ) -> zbus::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::spawn_perception;
    use crate::pipeline::PipelineDeps;
    use crate::writer::spawn_writer;
    use mirador_core::types::Observation;
    use mirador_core::{InferenceError, Perception};
    use mirador_video::source::ConnectorRegistry;
    use std::time::Duration;

    struct NoFaces;

    impl Perception for NoFaces {
        fn infer(
            &mut self,
            _pixels: &[u8],
            _width: u32,
            _height: u32,
            _channels: u8,
        ) -> Result<Vec<Observation>, InferenceError> {
            Ok(Vec::new())
        }
    }

    async fn service() -> MiradorService {
        let store = Store::open_in_memory().await.unwrap();
        let crops =
            CropStore::new(std::env::temp_dir().join(format!("mirador-dbus-{}", Uuid::new_v4())));
        crops.ensure_dirs().unwrap();
        let tunables = SharedTunables::new(Tunables::default());
        let broadcaster = Broadcaster::new(store.clone(), 16, 0, tunables.clone());
        let (writer, _join) = spawn_writer(store.clone(), crops.clone(), broadcaster.clone());
        let gallery = Arc::new(Gallery::new());
        let supervisor = Arc::new(Supervisor::new(PipelineDeps {
            gallery: Arc::clone(&gallery),
            tunables: tunables.clone(),
            writer,
            store: store.clone(),
            perception: spawn_perception(Box::new(NoFaces)),
            registry: Arc::new(ConnectorRegistry::new()),
            connect_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(1),
        }));
        MiradorService {
            gallery,
            store,
            supervisor,
            crops,
            broadcaster,
            tunables,
            started_at: Utc::now(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn update_identity_persists_and_publishes() {
        let service = service().await;
        let version = service.update_identity("alice", "Alice", "[[1.0, 0.0]]").await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(service.gallery.snapshot().len(), 1);

        let stored = service.store.list_identities().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, "alice");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejected_identity_touches_neither_store_nor_gallery() {
        let service = service().await;
        // Inconsistent embedding dimensions fail validation up front.
        let result = service.update_identity("bob", "Bob", "[[1.0, 0.0], [1.0]]").await;
        assert!(result.is_err());
        assert!(service.gallery.snapshot().is_empty());
        assert!(service.store.list_identities().await.unwrap().is_empty());
    }

    #[test]
    fn settings_patch_merges_partially() {
        let current = Tunables::default();
        let merged = merge_settings(&current, r#"{"similarity_threshold": 0.6}"#).unwrap();
        assert_eq!(merged.similarity_threshold, 0.6);
        // Everything else unchanged.
        assert_eq!(merged.dwell_window_secs, current.dwell_window_secs);
        assert_eq!(merged.max_subscriber_lag, current.max_subscriber_lag);
    }

    #[test]
    fn settings_patch_rejects_malformed_json() {
        assert!(merge_settings(&Tunables::default(), "not json").is_err());
        assert!(merge_settings(&Tunables::default(), r#"{"quality_floor": "high"}"#).is_err());
    }
}
