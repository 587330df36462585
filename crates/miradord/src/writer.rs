//! The event writer: a single task that turns event drafts into committed
//! rows. Every camera pipeline funnels through it, which is what makes
//! event ids a single total order. Commit means: crop staged, row
//! inserted, crop renamed into place under the assigned id, transaction
//! committed, broadcaster notified.

use crate::broadcast::Broadcaster;
use crate::crops::CropStore;
use crate::store::{EventRecord, NewEvent, Store};
use mirador_core::types::{EventDraft, Subject};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const APPEND_RETRIES: u32 = 3;

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("event store unavailable: {0}")]
    Store(String),
    #[error("writer has shut down")]
    Closed,
}

enum WriterRequest {
    Commit {
        camera_id: String,
        draft: EventDraft,
        reply: oneshot::Sender<Result<EventRecord, WriterError>>,
    },
}

/// Clone-able handle; commits resolve once the event is durable.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriterRequest>,
}

impl WriterHandle {
    pub async fn commit(
        &self,
        camera_id: String,
        draft: EventDraft,
    ) -> Result<EventRecord, WriterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriterRequest::Commit { camera_id, draft, reply })
            .await
            .map_err(|_| WriterError::Closed)?;
        rx.await.map_err(|_| WriterError::Closed)?
    }
}

pub fn spawn_writer(
    store: Store,
    crops: CropStore,
    broadcaster: Broadcaster,
) -> (WriterHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(64);
    let join = tokio::spawn(run_writer(store, crops, broadcaster, rx));
    (WriterHandle { tx }, join)
}

async fn run_writer(
    store: Store,
    crops: CropStore,
    broadcaster: Broadcaster,
    mut rx: mpsc::Receiver<WriterRequest>,
) {
    while let Some(WriterRequest::Commit { camera_id, draft, reply }) = rx.recv().await {
        match commit_one(&store, &crops, camera_id, draft).await {
            Ok(record) => {
                broadcaster.publish(record.clone());
                let _ = reply.send(Ok(record));
            }
            Err(e) => {
                // The store is gone; without durable commits the daemon
                // must not keep emitting. Fail the caller and refuse the
                // rest of the queue.
                tracing::error!(error = %e, "event commit failed, halting writer");
                let _ = reply.send(Err(e));
                break;
            }
        }
    }
    rx.close();
    while let Some(WriterRequest::Commit { reply, .. }) = rx.recv().await {
        let _ = reply.send(Err(WriterError::Closed));
    }
}

async fn commit_one(
    store: &Store,
    crops: &CropStore,
    camera_id: String,
    draft: EventDraft,
) -> Result<EventRecord, WriterError> {
    let (identity_id, label, track_id) = match &draft.subject {
        Subject::Known { identity_id, label } => {
            (Some(identity_id.clone()), Some(label.clone()), None)
        }
        Subject::Unknown { track_id } => (None, None, Some(*track_id as i64)),
    };

    // Stage the crop before touching the database. A staging failure
    // degrades the event to crop_missing; the event itself still commits.
    let staged = match &draft.crop {
        Some(crop) => match CropStore::encode_jpeg(crop) {
            Ok(jpeg) => match crops.stage(jpeg).await {
                Ok(path) => Some(path),
                Err(e) => {
                    tracing::warn!(camera = %camera_id, error = %e, "crop staging failed");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(camera = %camera_id, error = %e, "crop encode failed");
                None
            }
        },
        None => None,
    };

    let event = NewEvent {
        kind: draft.kind,
        camera_id,
        identity_id,
        label,
        track_id,
        confidence: draft.confidence,
        crop_missing: draft.crop.is_some() && staged.is_none(),
        ts: draft.ts,
    };

    let mut attempt = 0;
    loop {
        let installer = staged.clone().map(|path| {
            let crops = crops.clone();
            move |id: i64| crops.install_sync(&path, id)
        });
        match store.append(event.clone(), installer).await {
            Ok(record) => {
                tracing::info!(
                    event_id = record.id,
                    kind = record.kind.as_str(),
                    camera = %record.camera_id,
                    identity = record.identity_id.as_deref().unwrap_or("-"),
                    "event committed"
                );
                return Ok(record);
            }
            Err(e) if attempt + 1 < APPEND_RETRIES => {
                attempt += 1;
                tracing::warn!(attempt, error = %e, "event append failed, retrying");
                tokio::time::sleep(Duration::from_millis(100 << attempt)).await;
            }
            Err(e) => {
                if let Some(path) = staged {
                    CropStore::discard(&path);
                }
                return Err(WriterError::Store(e.to_string()));
            }
        }
    }
}
