use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;

#[derive(Parser)]
#[command(name = "mirador", about = "Mirador face recognition CLI", version)]
struct Cli {
    /// Print raw JSON instead of formatted output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Query committed events
    Events {
        /// Only events from this camera
        #[arg(long)]
        camera: Option<String>,
        /// Only events of this kind (recognized, unknown, visit_start, visit_end)
        #[arg(long)]
        kind: Option<String>,
        /// Only events for this identity
        #[arg(long)]
        identity: Option<String>,
        /// Only events at or after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<String>,
        /// Page size
        #[arg(long, default_value_t = 50)]
        limit: u32,
        /// Page cursor: only events with a smaller id
        #[arg(long)]
        before: Option<i64>,
    },
    /// Stream events live as they are committed
    Follow {
        /// First replay stored events with ids greater than this cursor
        #[arg(long)]
        since_id: Option<i64>,
    },
    /// Manage cameras
    Cameras {
        #[command(subcommand)]
        command: CameraCommands,
    },
    /// Manage the identity gallery
    Identities {
        #[command(subcommand)]
        command: IdentityCommands,
    },
    /// Print the stored crop path for an event
    Crop {
        /// Event id
        event_id: i64,
    },
    /// Patch runtime settings with a partial JSON object
    Settings {
        /// e.g. '{"similarity_threshold": 0.5}'
        patch: String,
    },
}

#[derive(Subcommand)]
enum CameraCommands {
    /// List cameras and their live state
    List,
    /// Add or reconfigure a camera
    Set {
        /// Source descriptor, e.g. v4l:/dev/video0
        source: String,
        /// Camera id (generated when omitted)
        #[arg(long, default_value = "")]
        id: String,
        /// Register without starting the pipeline
        #[arg(long)]
        inactive: bool,
    },
    /// Stop and remove a camera
    Remove {
        id: String,
    },
}

#[derive(Subcommand)]
enum IdentityCommands {
    /// List gallery identities
    List,
    /// Add or replace an identity from an embeddings JSON file
    Add {
        id: String,
        #[arg(long)]
        label: String,
        /// File containing a JSON array of float arrays
        #[arg(long)]
        embeddings: std::path::PathBuf,
    },
    /// Remove an identity
    Remove {
        id: String,
    },
}

#[zbus::proxy(
    interface = "org.mirador.Mirador1",
    default_service = "org.mirador.Mirador1",
    default_path = "/org/mirador/Mirador1"
)]
trait Mirador {
    async fn status(&self) -> zbus::Result<String>;
    async fn query_events(&self, filter: &str) -> zbus::Result<String>;
    async fn set_camera(&self, id: &str, source: &str, active: bool) -> zbus::Result<String>;
    async fn remove_camera(&self, id: &str) -> zbus::Result<bool>;
    async fn list_cameras(&self) -> zbus::Result<String>;
    async fn update_identity(&self, id: &str, label: &str, embeddings: &str) -> zbus::Result<u64>;
    async fn remove_identity(&self, id: &str) -> zbus::Result<bool>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn crop_path(&self, event_id: i64) -> zbus::Result<String>;
    async fn update_settings(&self, patch: &str) -> zbus::Result<String>;

    #[zbus(signal)]
    fn recognition_event(&self, payload: String) -> zbus::Result<()>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let conn = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    let proxy = MiradorProxy::new(&conn)
        .await
        .context("connecting to miradord (is the daemon running?)")?;

    match cli.command {
        Commands::Status => {
            let status = proxy.status().await?;
            if cli.json {
                println!("{status}");
            } else {
                print_status(&status)?;
            }
        }
        Commands::Events { camera, kind, identity, since, limit, before } => {
            if let Some(since) = &since {
                chrono::DateTime::parse_from_rfc3339(since)
                    .context("--since must be an RFC 3339 timestamp")?;
            }
            let mut filter = serde_json::Map::new();
            if let Some(camera) = camera {
                filter.insert("camera_id".into(), camera.into());
            }
            if let Some(kind) = kind {
                filter.insert("kind".into(), kind.into());
            }
            if let Some(identity) = identity {
                filter.insert("identity_id".into(), identity.into());
            }
            if let Some(since) = since {
                filter.insert("since".into(), since.into());
            }
            if let Some(before) = before {
                filter.insert("before_id".into(), before.into());
            }
            filter.insert("limit".into(), limit.into());

            let events = proxy
                .query_events(&serde_json::Value::Object(filter).to_string())
                .await?;
            if cli.json {
                println!("{events}");
            } else {
                for event in serde_json::from_str::<Vec<serde_json::Value>>(&events)? {
                    println!("{}", format_event(&event));
                }
            }
        }
        Commands::Follow { since_id } => {
            // Attach to the live stream before backfilling, so nothing
            // committed in between is lost; overlap is skipped by id.
            let mut stream = proxy.receive_recognition_event().await?;
            let mut seen = since_id;
            if let Some(after) = since_id {
                for event in backfill(&proxy, after).await? {
                    print_event(&event, cli.json);
                    seen = event["id"].as_i64().or(seen);
                }
            }
            while let Some(signal) = stream.next().await {
                let args = signal.args()?;
                let event: serde_json::Value = serde_json::from_str(args.payload())?;
                if let (Some(seen), Some(id)) = (seen, event["id"].as_i64()) {
                    if id <= seen {
                        continue;
                    }
                }
                print_event(&event, cli.json);
                seen = event["id"].as_i64().or(seen);
            }
        }
        Commands::Cameras { command } => match command {
            CameraCommands::List => {
                let cameras = proxy.list_cameras().await?;
                if cli.json {
                    println!("{cameras}");
                } else {
                    for camera in serde_json::from_str::<Vec<serde_json::Value>>(&cameras)? {
                        println!(
                            "{:<24} {:<28} {:<8} last seen {}",
                            camera["id"].as_str().unwrap_or("?"),
                            camera["source"].as_str().unwrap_or("?"),
                            camera["state"].as_str().unwrap_or("?"),
                            camera["last_seen"].as_str().unwrap_or("never"),
                        );
                    }
                }
            }
            CameraCommands::Set { source, id, inactive } => {
                let id = proxy.set_camera(&id, &source, !inactive).await?;
                println!("{id}");
            }
            CameraCommands::Remove { id } => {
                if proxy.remove_camera(&id).await? {
                    println!("removed {id}");
                } else {
                    anyhow::bail!("no such camera: {id}");
                }
            }
        },
        Commands::Identities { command } => match command {
            IdentityCommands::List => {
                let identities = proxy.list_identities().await?;
                if cli.json {
                    println!("{identities}");
                } else {
                    for identity in serde_json::from_str::<Vec<serde_json::Value>>(&identities)? {
                        println!(
                            "{:<24} {:<24} {} embedding(s)",
                            identity["id"].as_str().unwrap_or("?"),
                            identity["label"].as_str().unwrap_or(""),
                            identity["embedding_count"].as_u64().unwrap_or(0),
                        );
                    }
                }
            }
            IdentityCommands::Add { id, label, embeddings } => {
                let raw = std::fs::read_to_string(&embeddings)
                    .with_context(|| format!("reading {}", embeddings.display()))?;
                // Validate locally for a friendlier error than a bus reply.
                serde_json::from_str::<Vec<Vec<f32>>>(&raw)
                    .context("embeddings file must be a JSON array of float arrays")?;
                let version = proxy.update_identity(&id, &label, &raw).await?;
                println!("gallery version {version}");
            }
            IdentityCommands::Remove { id } => {
                if proxy.remove_identity(&id).await? {
                    println!("removed {id}");
                } else {
                    anyhow::bail!("no such identity: {id}");
                }
            }
        },
        Commands::Crop { event_id } => {
            println!("{}", proxy.crop_path(event_id).await?);
        }
        Commands::Settings { patch } => {
            let settings = proxy.update_settings(&patch).await?;
            println!("{settings}");
        }
    }

    Ok(())
}

const BACKFILL_PAGE: u32 = 200;

fn print_event(event: &serde_json::Value, json: bool) {
    if json {
        println!("{event}");
    } else {
        println!("{}", format_event(event));
    }
}

/// Stored events with ids greater than `after`, oldest first, walked in
/// descending pages through the query endpoint.
async fn backfill(proxy: &MiradorProxy<'_>, after: i64) -> Result<Vec<serde_json::Value>> {
    let mut backlog = Vec::new();
    let mut before: Option<i64> = None;
    loop {
        let mut filter = serde_json::Map::new();
        filter.insert("limit".into(), BACKFILL_PAGE.into());
        if let Some(before) = before {
            filter.insert("before_id".into(), before.into());
        }
        let page: Vec<serde_json::Value> = serde_json::from_str(
            &proxy.query_events(&serde_json::Value::Object(filter).to_string()).await?,
        )?;
        let exhausted = page.is_empty();
        let (newer, reached_cursor) = page_after(page, after);
        before = newer.last().and_then(|e| e["id"].as_i64()).or(before);
        backlog.extend(newer);
        if exhausted || reached_cursor {
            break;
        }
    }
    backlog.reverse();
    Ok(backlog)
}

/// Split one descending page at the cursor: the events newer than `after`
/// (still descending) and whether the page reached the cursor.
fn page_after(page: Vec<serde_json::Value>, after: i64) -> (Vec<serde_json::Value>, bool) {
    let mut newer = Vec::new();
    for event in page {
        if event["id"].as_i64().unwrap_or(0) <= after {
            return (newer, true);
        }
        newer.push(event);
    }
    (newer, false)
}

fn print_status(status: &str) -> Result<()> {
    let status: serde_json::Value = serde_json::from_str(status)?;
    println!("miradord {}", status["version"].as_str().unwrap_or("?"));
    println!("  uptime:      {}s", status["uptime_secs"].as_i64().unwrap_or(0));
    println!(
        "  gallery:     {} identities (version {})",
        status["gallery_size"].as_u64().unwrap_or(0),
        status["gallery_version"].as_u64().unwrap_or(0),
    );
    println!("  last event:  #{}", status["last_event_id"].as_i64().unwrap_or(0));
    println!("  subscribers: {}", status["subscribers"].as_u64().unwrap_or(0));
    let cameras = status["cameras"].as_array().cloned().unwrap_or_default();
    println!("  cameras:     {}", cameras.len());
    for camera in cameras {
        println!(
            "    {:<24} {:<28} {}",
            camera["id"].as_str().unwrap_or("?"),
            camera["source"].as_str().unwrap_or("?"),
            camera["state"].as_str().unwrap_or("?"),
        );
    }
    Ok(())
}

fn format_event(event: &serde_json::Value) -> String {
    let subject = event["identity_id"]
        .as_str()
        .map(|id| {
            let label = event["label"].as_str().unwrap_or("");
            if label.is_empty() { id.to_string() } else { format!("{id} ({label})") }
        })
        .unwrap_or_else(|| {
            event["track_id"]
                .as_i64()
                .map(|t| format!("track {t}"))
                .unwrap_or_else(|| "-".to_string())
        });
    let crop = if event["crop_ref"].is_string() { " [crop]" } else { "" };
    format!(
        "#{:<6} {} {:<12} {:<16} {:<32} {:.2}{}",
        event["id"].as_i64().unwrap_or(0),
        event["ts"].as_str().unwrap_or("?"),
        event["kind"].as_str().unwrap_or("?"),
        event["camera_id"].as_str().unwrap_or("?"),
        subject,
        event["confidence"].as_f64().unwrap_or(0.0),
        crop,
    )
}

#[cfg(test)]
mod tests {
    use super::page_after;
    use serde_json::json;

    fn page(ids: &[i64]) -> Vec<serde_json::Value> {
        ids.iter().map(|id| json!({ "id": id })).collect()
    }

    fn ids(events: &[serde_json::Value]) -> Vec<i64> {
        events.iter().map(|e| e["id"].as_i64().unwrap()).collect()
    }

    #[test]
    fn page_after_stops_at_the_cursor() {
        let (newer, reached) = page_after(page(&[5, 4, 3, 2]), 3);
        assert_eq!(ids(&newer), vec![5, 4]);
        assert!(reached);
    }

    #[test]
    fn page_after_passes_a_page_entirely_above_the_cursor() {
        let (newer, reached) = page_after(page(&[9, 8, 7]), 3);
        assert_eq!(ids(&newer), vec![9, 8, 7]);
        assert!(!reached);
    }

    #[test]
    fn page_after_empty_page() {
        let (newer, reached) = page_after(Vec::new(), 3);
        assert!(newer.is_empty());
        assert!(!reached);
    }
}
