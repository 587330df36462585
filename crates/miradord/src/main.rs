use anyhow::{Context, Result};
use chrono::Utc;
use mirador_core::Gallery;
use mirador_video::source::ConnectorRegistry;
use mirador_video::V4lConnector;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod broadcast;
mod config;
mod crops;
mod dbus_interface;
mod perception;
mod pipeline;
mod store;
mod supervisor;
mod writer;

use broadcast::{Broadcaster, Delivery};
use config::{Config, SharedTunables};
use crops::CropStore;
use dbus_interface::MiradorService;
use perception::{spawn_perception, SidecarPerception};
use pipeline::PipelineDeps;
use store::Store;
use supervisor::Supervisor;
use writer::spawn_writer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "miradord starting");

    let config = Config::load().context("loading configuration")?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir.display()))?;

    let store = Store::open(&config.db_path).await.context("opening event store")?;
    let crops = CropStore::new(&config.data_dir);
    crops.ensure_dirs().context("preparing crop directories")?;

    let identities = store.list_identities().await.context("loading identities")?;
    let gallery = Arc::new(Gallery::load(identities).context("building gallery")?);
    tracing::info!(identities = gallery.snapshot().len(), "gallery loaded");

    let tunables = SharedTunables::new(config.tunables.clone());
    let last_event_id = store.last_event_id().await?;
    let broadcaster =
        Broadcaster::new(store.clone(), config.ring_capacity, last_event_id, tunables.clone());
    let (writer, mut writer_task) = spawn_writer(store.clone(), crops.clone(), broadcaster.clone());

    let perception =
        spawn_perception(Box::new(SidecarPerception::new(&config.perception_socket)));

    let mut registry = ConnectorRegistry::new();
    registry.register("v4l", Arc::new(V4lConnector));

    let supervisor = Arc::new(Supervisor::new(PipelineDeps {
        gallery: Arc::clone(&gallery),
        tunables: tunables.clone(),
        writer,
        store: store.clone(),
        perception,
        registry: Arc::new(registry),
        connect_timeout: config.connect_timeout,
        stop_grace: config.stop_grace,
    }));
    supervisor.start_active().await.context("starting cameras")?;

    let service = MiradorService {
        gallery,
        store,
        supervisor: Arc::clone(&supervisor),
        crops,
        broadcaster: broadcaster.clone(),
        tunables,
        started_at: Utc::now(),
    };
    let connection = zbus::connection::Builder::session()?
        .name(dbus_interface::BUS_NAME)?
        .serve_at(dbus_interface::OBJECT_PATH, service)?
        .build()
        .await
        .context("claiming D-Bus name")?;
    tracing::info!(bus = dbus_interface::BUS_NAME, "D-Bus service up");

    spawn_signal_feed(connection.clone(), &broadcaster);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("miradord shutting down");
        }
        // The writer only exits early when the store became unusable.
        _ = &mut writer_task => {
            supervisor.shutdown().await;
            anyhow::bail!("event writer halted: store unavailable");
        }
    }
    supervisor.shutdown().await;
    tracing::info!("miradord stopped");
    Ok(())
}

/// Forward every committed event to the bus as a RecognitionEvent signal.
fn spawn_signal_feed(connection: zbus::Connection, broadcaster: &Broadcaster) {
    let mut subscription = broadcaster.subscribe(None, 64);
    tokio::spawn(async move {
        let iface = match connection
            .object_server()
            .interface::<_, MiradorService>(dbus_interface::OBJECT_PATH)
            .await
        {
            Ok(iface) => iface,
            Err(e) => {
                tracing::error!(error = %e, "signal feed could not resolve interface");
                return;
            }
        };
        while let Some(delivery) = subscription.events.recv().await {
            match delivery {
                Delivery::Event(event) => {
                    let payload = match serde_json::to_string(&event) {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::warn!(error = %e, "event serialization failed");
                            continue;
                        }
                    };
                    if let Err(e) =
                        MiradorService::recognition_event(iface.signal_emitter(), payload).await
                    {
                        tracing::warn!(error = %e, "signal emission failed");
                    }
                }
                Delivery::Disconnected(reason) => {
                    tracing::error!(?reason, "signal feed fell behind and was disconnected");
                    break;
                }
            }
        }
    });
}
