//! Durable storage: the append-only event log (the single serialization
//! point for event ids), the camera registry, and identity persistence.
//!
//! All access goes through one SQLite connection behind tokio-rusqlite's
//! command loop, so id assignment and the durable append are atomic and
//! totally ordered across camera pipelines.

use chrono::{DateTime, Utc};
use mirador_core::types::EventKind;
use mirador_core::IdentityDescriptor;
use rusqlite::types::Type;
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("event {0} not found")]
    NotFound(i64),
}

/// A committed, immutable event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub kind: EventKind,
    pub camera_id: String,
    pub identity_id: Option<String>,
    pub label: Option<String>,
    pub track_id: Option<i64>,
    pub confidence: f32,
    pub crop_ref: Option<String>,
    pub crop_missing: bool,
    pub ts: DateTime<Utc>,
}

/// Event fields known before id assignment.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub kind: EventKind,
    pub camera_id: String,
    pub identity_id: Option<String>,
    pub label: Option<String>,
    pub track_id: Option<i64>,
    pub confidence: f32,
    pub crop_missing: bool,
    pub ts: DateTime<Utc>,
}

/// Query filter for the paginated listing interface. Pages descend by id;
/// `before_id` is the cursor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventFilter {
    pub camera_id: Option<String>,
    pub kind: Option<EventKind>,
    pub identity_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub before_id: Option<i64>,
    pub limit: Option<u32>,
}

const DEFAULT_QUERY_LIMIT: u32 = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: String,
    pub source: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraRow {
    #[serde(flatten)]
    pub config: CameraConfig,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS events (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        kind TEXT NOT NULL,
                        camera_id TEXT NOT NULL,
                        identity_id TEXT,
                        label TEXT,
                        track_id INTEGER,
                        confidence REAL NOT NULL,
                        crop_ref TEXT,
                        crop_missing INTEGER NOT NULL DEFAULT 0,
                        ts TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_events_camera ON events(camera_id);
                    CREATE INDEX IF NOT EXISTS idx_events_identity ON events(identity_id);
                    CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);

                    CREATE TABLE IF NOT EXISTS cameras (
                        id TEXT PRIMARY KEY,
                        source TEXT NOT NULL,
                        active INTEGER NOT NULL,
                        last_seen TEXT
                    );

                    CREATE TABLE IF NOT EXISTS identities (
                        id TEXT PRIMARY KEY,
                        label TEXT NOT NULL,
                        embeddings TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    );
                    "#,
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Append one event, assigning the next id. When `install_crop` is
    /// present it runs between id assignment and commit, so a committed
    /// event's crop reference never dangles; an install failure degrades
    /// the event to `crop_missing` rather than dropping it.
    pub async fn append<F>(
        &self,
        event: NewEvent,
        install_crop: Option<F>,
    ) -> Result<EventRecord, StoreError>
    where
        F: FnOnce(i64) -> std::io::Result<String> + Send + 'static,
    {
        let record = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO events
                     (kind, camera_id, identity_id, label, track_id, confidence, crop_ref, crop_missing, ts)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8)",
                    rusqlite::params![
                        event.kind.as_str(),
                        event.camera_id,
                        event.identity_id,
                        event.label,
                        event.track_id,
                        event.confidence as f64,
                        event.crop_missing,
                        event.ts.to_rfc3339(),
                    ],
                )?;
                let id = tx.last_insert_rowid();

                let (crop_ref, crop_missing) = match install_crop {
                    Some(install) => match install(id) {
                        Ok(path) => (Some(path), false),
                        Err(e) => {
                            tracing::warn!(event_id = id, error = %e, "crop install failed");
                            (None, true)
                        }
                    },
                    None => (None, event.crop_missing),
                };
                tx.execute(
                    "UPDATE events SET crop_ref = ?1, crop_missing = ?2 WHERE id = ?3",
                    rusqlite::params![crop_ref, crop_missing, id],
                )?;
                tx.commit()?;

                Ok(EventRecord {
                    id,
                    kind: event.kind,
                    camera_id: event.camera_id,
                    identity_id: event.identity_id,
                    label: event.label,
                    track_id: event.track_id,
                    confidence: event.confidence,
                    crop_ref,
                    crop_missing,
                    ts: event.ts,
                })
            })
            .await?;
        Ok(record)
    }

    pub async fn fetch(&self, id: i64) -> Result<EventRecord, StoreError> {
        let found = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, kind, camera_id, identity_id, label, track_id,
                            confidence, crop_ref, crop_missing, ts
                     FROM events WHERE id = ?1",
                )?;
                let mut rows = stmt.query_map([id], row_to_event)?;
                Ok(rows.next().transpose()?)
            })
            .await?;
        found.ok_or(StoreError::NotFound(id))
    }

    /// Filtered, cursor-paginated listing, newest first.
    pub async fn query(&self, filter: EventFilter) -> Result<Vec<EventRecord>, StoreError> {
        let events = self
            .conn
            .call(move |conn| {
                let mut sql = String::from(
                    "SELECT id, kind, camera_id, identity_id, label, track_id,
                            confidence, crop_ref, crop_missing, ts
                     FROM events WHERE 1=1",
                );
                let mut params: Vec<Box<dyn rusqlite::ToSql + Send>> = Vec::new();
                if let Some(camera_id) = filter.camera_id {
                    sql.push_str(&format!(" AND camera_id = ?{}", params.len() + 1));
                    params.push(Box::new(camera_id));
                }
                if let Some(kind) = filter.kind {
                    sql.push_str(&format!(" AND kind = ?{}", params.len() + 1));
                    params.push(Box::new(kind.as_str().to_string()));
                }
                if let Some(identity_id) = filter.identity_id {
                    sql.push_str(&format!(" AND identity_id = ?{}", params.len() + 1));
                    params.push(Box::new(identity_id));
                }
                if let Some(since) = filter.since {
                    sql.push_str(&format!(" AND ts >= ?{}", params.len() + 1));
                    params.push(Box::new(since.to_rfc3339()));
                }
                if let Some(until) = filter.until {
                    sql.push_str(&format!(" AND ts <= ?{}", params.len() + 1));
                    params.push(Box::new(until.to_rfc3339()));
                }
                if let Some(before_id) = filter.before_id {
                    sql.push_str(&format!(" AND id < ?{}", params.len() + 1));
                    params.push(Box::new(before_id));
                }
                let limit = filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
                sql.push_str(&format!(" ORDER BY id DESC LIMIT {limit}"));

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(
                    rusqlite::params_from_iter(params.iter().map(|p| p.as_ref() as &dyn rusqlite::ToSql)),
                    row_to_event,
                )?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(events)
    }

    /// Ascending batch strictly after `after_id`, for broadcaster catch-up.
    pub async fn range(&self, after_id: i64, limit: u32) -> Result<Vec<EventRecord>, StoreError> {
        let events = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, kind, camera_id, identity_id, label, track_id,
                            confidence, crop_ref, crop_missing, ts
                     FROM events WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![after_id, limit], row_to_event)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(events)
    }

    pub async fn last_event_id(&self) -> Result<i64, StoreError> {
        let id = self
            .conn
            .call(|conn| {
                Ok(conn.query_row("SELECT COALESCE(MAX(id), 0) FROM events", [], |row| {
                    row.get::<_, i64>(0)
                })?)
            })
            .await?;
        Ok(id)
    }

    pub async fn upsert_camera(&self, camera: CameraConfig) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO cameras (id, source, active) VALUES (?1, ?2, ?3)
                     ON CONFLICT(id) DO UPDATE SET source = ?2, active = ?3",
                    rusqlite::params![camera.id, camera.source, camera.active],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn list_cameras(&self) -> Result<Vec<CameraRow>, StoreError> {
        let cameras = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT id, source, active, last_seen FROM cameras ORDER BY id")?;
                let rows = stmt.query_map([], |row| {
                    Ok(CameraRow {
                        config: CameraConfig {
                            id: row.get(0)?,
                            source: row.get(1)?,
                            active: row.get(2)?,
                        },
                        last_seen: parse_opt_ts(row, 3)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(cameras)
    }

    pub async fn remove_camera(&self, id: String) -> Result<bool, StoreError> {
        let n = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM cameras WHERE id = ?1", [id])?))
            .await?;
        Ok(n > 0)
    }

    pub async fn touch_camera(&self, id: String, seen: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE cameras SET last_seen = ?1 WHERE id = ?2",
                    rusqlite::params![seen.to_rfc3339(), id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn upsert_identity(&self, descriptor: IdentityDescriptor) -> Result<(), StoreError> {
        let embeddings = serde_json::to_string(&descriptor.embeddings)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO identities (id, label, embeddings, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET label = ?2, embeddings = ?3, updated_at = ?4",
                    rusqlite::params![
                        descriptor.id,
                        descriptor.label,
                        embeddings,
                        Utc::now().to_rfc3339()
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn list_identities(&self) -> Result<Vec<IdentityDescriptor>, StoreError> {
        let raw = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT id, label, embeddings FROM identities ORDER BY id")?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut descriptors = Vec::with_capacity(raw.len());
        for (id, label, embeddings) in raw {
            descriptors.push(IdentityDescriptor {
                id,
                label,
                embeddings: serde_json::from_str(&embeddings)?,
            });
        }
        Ok(descriptors)
    }

    pub async fn remove_identity(&self, id: String) -> Result<bool, StoreError> {
        let n = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM identities WHERE id = ?1", [id])?))
            .await?;
        Ok(n > 0)
    }
}

fn parse_ts(text: String, col: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(col, Type::Text, Box::new(e)))
}

fn parse_opt_ts(row: &Row<'_>, col: usize) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    row.get::<_, Option<String>>(col)?
        .map(|text| parse_ts(text, col))
        .transpose()
}

fn row_to_event(row: &Row<'_>) -> Result<EventRecord, rusqlite::Error> {
    let kind_text: String = row.get(1)?;
    let kind = EventKind::parse(&kind_text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            Type::Text,
            format!("unknown event kind '{kind_text}'").into(),
        )
    })?;
    Ok(EventRecord {
        id: row.get(0)?,
        kind,
        camera_id: row.get(2)?,
        identity_id: row.get(3)?,
        label: row.get(4)?,
        track_id: row.get(5)?,
        confidence: row.get::<_, f64>(6)? as f32,
        crop_ref: row.get(7)?,
        crop_missing: row.get(8)?,
        ts: parse_ts(row.get(9)?, 9)?,
    })
}
