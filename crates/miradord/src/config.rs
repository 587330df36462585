use mirador_core::{SessionParams, TrackerParams};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
}

/// The six runtime options the pipeline reads per frame. Changing them
/// applies to subsequent frames and sessions without a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// Cosine similarity required to accept a gallery match.
    pub similarity_threshold: f32,
    /// Seconds without a match before a visit session closes.
    pub dwell_window_secs: u64,
    /// Minimum seconds between emitted events for the same key.
    pub event_min_interval_secs: u64,
    /// Seconds without an observation before a track expires.
    pub track_timeout_secs: u64,
    /// Observations below this quality never reach the tracker.
    pub quality_floor: f32,
    /// Events a subscriber may fall behind before disconnection.
    pub max_subscriber_lag: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.45,
            dwell_window_secs: 10,
            event_min_interval_secs: 30,
            track_timeout_secs: 2,
            quality_floor: 0.3,
            max_subscriber_lag: 500,
        }
    }
}

impl Tunables {
    pub fn session_params(&self) -> SessionParams {
        SessionParams {
            dwell_window: Duration::from_secs(self.dwell_window_secs),
            event_min_interval: Duration::from_secs(self.event_min_interval_secs),
        }
    }

    pub fn tracker_params(&self) -> TrackerParams {
        TrackerParams {
            track_timeout: Duration::from_secs(self.track_timeout_secs),
            ..TrackerParams::default()
        }
    }
}

/// Shared hot-reloadable settings handle.
#[derive(Clone)]
pub struct SharedTunables {
    inner: Arc<RwLock<Tunables>>,
}

impl SharedTunables {
    pub fn new(tunables: Tunables) -> Self {
        Self { inner: Arc::new(RwLock::new(tunables)) }
    }

    pub fn get(&self) -> Tunables {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set(&self, tunables: Tunables) {
        tracing::info!(?tunables, "runtime settings updated");
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = tunables;
    }
}

/// Daemon configuration: defaults, overlaid by an optional TOML file,
/// overlaid by `MIRADOR_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    /// Unix socket of the external inference sidecar.
    pub perception_socket: PathBuf,
    /// Broadcaster ring buffer size (recent events kept in memory).
    pub ring_capacity: usize,
    /// Bound on a single camera connect attempt.
    pub connect_timeout: Duration,
    /// Grace period for a stopping camera to release its connection.
    pub stop_grace: Duration,
    pub tunables: Tunables,
}

/// Optional settings file shape. Every field overrides a default.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub data_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub perception_socket: Option<PathBuf>,
    pub ring_capacity: Option<usize>,
    pub connect_timeout_secs: Option<u64>,
    pub stop_grace_secs: Option<u64>,
    pub tunables: Option<Tunables>,
}

impl Config {
    fn defaults() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("mirador");

        Self {
            db_path: data_dir.join("mirador.db"),
            perception_socket: data_dir.join("perception.sock"),
            data_dir,
            ring_capacity: 256,
            connect_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
            tunables: Tunables::default(),
        }
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(data_dir) = file.data_dir {
            self.db_path = data_dir.join("mirador.db");
            self.perception_socket = data_dir.join("perception.sock");
            self.data_dir = data_dir;
        }
        if let Some(db_path) = file.db_path {
            self.db_path = db_path;
        }
        if let Some(socket) = file.perception_socket {
            self.perception_socket = socket;
        }
        if let Some(cap) = file.ring_capacity {
            self.ring_capacity = cap;
        }
        if let Some(secs) = file.connect_timeout_secs {
            self.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.stop_grace_secs {
            self.stop_grace = Duration::from_secs(secs);
        }
        if let Some(tunables) = file.tunables {
            self.tunables = tunables;
        }
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("MIRADOR_DATA_DIR") {
            let data_dir = PathBuf::from(v);
            self.db_path = data_dir.join("mirador.db");
            self.perception_socket = data_dir.join("perception.sock");
            self.data_dir = data_dir;
        }
        if let Ok(v) = std::env::var("MIRADOR_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MIRADOR_PERCEPTION_SOCKET") {
            self.perception_socket = PathBuf::from(v);
        }
        self.ring_capacity = env_usize("MIRADOR_RING_CAPACITY", self.ring_capacity);
        self.connect_timeout =
            Duration::from_secs(env_u64("MIRADOR_CONNECT_TIMEOUT_SECS", self.connect_timeout.as_secs()));
        self.stop_grace =
            Duration::from_secs(env_u64("MIRADOR_STOP_GRACE_SECS", self.stop_grace.as_secs()));

        let t = &mut self.tunables;
        t.similarity_threshold = env_f32("MIRADOR_SIMILARITY_THRESHOLD", t.similarity_threshold);
        t.dwell_window_secs = env_u64("MIRADOR_DWELL_WINDOW_SECS", t.dwell_window_secs);
        t.event_min_interval_secs =
            env_u64("MIRADOR_EVENT_MIN_INTERVAL_SECS", t.event_min_interval_secs);
        t.track_timeout_secs = env_u64("MIRADOR_TRACK_TIMEOUT_SECS", t.track_timeout_secs);
        t.quality_floor = env_f32("MIRADOR_QUALITY_FLOOR", t.quality_floor);
        t.max_subscriber_lag = env_u64("MIRADOR_MAX_SUBSCRIBER_LAG", t.max_subscriber_lag);
    }

    /// Load configuration: defaults, then the optional settings file
    /// (`MIRADOR_CONFIG` or `<data_dir>/mirador.toml`), then env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::defaults();

        let file_path = std::env::var("MIRADOR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config.data_dir.join("mirador.toml"));
        if file_path.exists() {
            let text = std::fs::read_to_string(&file_path)
                .map_err(|source| ConfigError::Read { path: file_path.clone(), source })?;
            let file: FileConfig = toml::from_str(&text)
                .map_err(|source| ConfigError::Parse { path: file_path.clone(), source })?;
            tracing::info!(path = %file_path.display(), "loaded settings file");
            config.apply_file(file);
        }

        config.apply_env();
        Ok(config)
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunable_defaults() {
        let t = Tunables::default();
        assert_eq!(t.dwell_window_secs, 10);
        assert_eq!(t.session_params().dwell_window, Duration::from_secs(10));
        assert_eq!(t.tracker_params().track_timeout, Duration::from_secs(2));
    }

    #[test]
    fn file_config_overrides_defaults() {
        let file: FileConfig = toml::from_str(
            r#"
            data_dir = "/srv/mirador"
            ring_capacity = 64

            [tunables]
            similarity_threshold = 0.6
            dwell_window_secs = 20
            "#,
        )
        .unwrap();

        let mut config = Config::defaults();
        config.apply_file(file);
        assert_eq!(config.data_dir, PathBuf::from("/srv/mirador"));
        assert_eq!(config.db_path, PathBuf::from("/srv/mirador/mirador.db"));
        assert_eq!(config.ring_capacity, 64);
        assert_eq!(config.tunables.similarity_threshold, 0.6);
        assert_eq!(config.tunables.dwell_window_secs, 20);
        // Unspecified tunables fall back to their defaults.
        assert_eq!(config.tunables.event_min_interval_secs, 30);
    }

    #[test]
    fn explicit_db_path_wins_over_data_dir() {
        let file: FileConfig = toml::from_str(
            r#"
            data_dir = "/srv/mirador"
            db_path = "/fast-disk/events.db"
            "#,
        )
        .unwrap();
        let mut config = Config::defaults();
        config.apply_file(file);
        assert_eq!(config.db_path, PathBuf::from("/fast-disk/events.db"));
    }

    #[test]
    fn shared_tunables_hot_swap() {
        let shared = SharedTunables::new(Tunables::default());
        let mut next = shared.get();
        next.quality_floor = 0.7;
        shared.set(next);
        assert_eq!(shared.get().quality_floor, 0.7);
    }
}
