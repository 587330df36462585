//! Camera supervisor: reconciles the persisted camera registry with the
//! set of running pipelines.

use crate::pipeline::{spawn_pipeline, PipelineDeps, PipelineHandle};
use crate::store::{CameraConfig, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// One camera's registry row plus its live pipeline state.
#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    pub id: String,
    pub source: String,
    pub active: bool,
    /// `connecting`, `live`, `degraded`, `stopped`, or `inactive` when no
    /// pipeline is running.
    pub state: String,
    pub last_seen: Option<DateTime<Utc>>,
}

pub struct Supervisor {
    deps: PipelineDeps,
    pipelines: Mutex<HashMap<String, PipelineHandle>>,
}

impl Supervisor {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps, pipelines: Mutex::new(HashMap::new()) }
    }

    /// Start pipelines for every camera marked active (daemon startup).
    pub async fn start_active(&self) -> Result<(), StoreError> {
        let cameras = self.deps.store.list_cameras().await?;
        let mut pipelines = self.pipelines.lock().await;
        for row in cameras.into_iter().filter(|c| c.config.active) {
            let camera = row.config;
            tracing::info!(camera = %camera.id, source = %camera.source, "starting camera");
            let handle = spawn_pipeline(camera.id.clone(), camera.source, self.deps.clone());
            pipelines.insert(camera.id, handle);
        }
        Ok(())
    }

    /// Add or reconfigure a camera and reconcile its pipeline. A running
    /// pipeline always restarts on reconfiguration, since the source
    /// descriptor may have changed.
    pub async fn set_camera(&self, camera: CameraConfig) -> Result<(), StoreError> {
        self.deps.store.upsert_camera(camera.clone()).await?;

        let mut pipelines = self.pipelines.lock().await;
        if let Some(existing) = pipelines.remove(&camera.id) {
            existing.stop().await;
        }
        if camera.active {
            tracing::info!(camera = %camera.id, source = %camera.source, "starting camera");
            let handle = spawn_pipeline(camera.id.clone(), camera.source, self.deps.clone());
            pipelines.insert(camera.id, handle);
        } else {
            tracing::info!(camera = %camera.id, "camera deactivated");
        }
        Ok(())
    }

    /// Stop and forget a camera. Its committed events remain.
    pub async fn remove_camera(&self, id: &str) -> Result<bool, StoreError> {
        if let Some(existing) = self.pipelines.lock().await.remove(id) {
            existing.stop().await;
        }
        self.deps.store.remove_camera(id.to_string()).await
    }

    pub async fn statuses(&self) -> Result<Vec<CameraStatus>, StoreError> {
        let cameras = self.deps.store.list_cameras().await?;
        let pipelines = self.pipelines.lock().await;
        Ok(cameras
            .into_iter()
            .map(|row| {
                let state = pipelines
                    .get(&row.config.id)
                    .map(|p| p.status.borrow().as_str().to_string())
                    .unwrap_or_else(|| "inactive".to_string());
                CameraStatus {
                    id: row.config.id,
                    source: row.config.source,
                    active: row.config.active,
                    state,
                    last_seen: row.last_seen,
                }
            })
            .collect())
    }

    pub async fn running_count(&self) -> usize {
        self.pipelines.lock().await.len()
    }

    /// Stop every pipeline (daemon shutdown).
    pub async fn shutdown(&self) {
        let mut pipelines = self.pipelines.lock().await;
        for (id, handle) in pipelines.drain() {
            tracing::info!(camera = %id, "stopping camera");
            handle.stop().await;
        }
    }
}
