use anyhow::Result;
use std::sync::Arc;
use tiltgate_core::detector::ScrfdLoader;
use tiltgate_core::TiltEvent;
use tiltgate_hw::V4lProvider;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use zbus::object_server::SignalEmitter;

mod config;
mod dbus_interface;
mod engine;
mod pipeline;
#[cfg(test)]
mod testing;

use dbus_interface::{GestureService, BUS_NAME, OBJECT_PATH};
use engine::{PipelineController, TiltCallbacks};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("tiltgated starting");

    let config = config::Config::load()?;
    tracing::info!(
        device = %config.camera_device,
        model_dir = %config.model_dir.display(),
        threshold = config.tilt_threshold_deg,
        cooldown_ms = config.cooldown_ms,
        positive_tilt = ?config.positive_tilt,
        "configuration loaded"
    );

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<TiltEvent>();
    let callbacks = TiltCallbacks::default()
        .on_left({
            let tx = event_tx.clone();
            move |event| {
                let _ = tx.send(*event);
            }
        })
        .on_right(move |event| {
            let _ = event_tx.send(*event);
        });

    let controller = PipelineController::new(
        Arc::new(V4lProvider::new(config.camera_device.clone())),
        Arc::new(ScrfdLoader::new(&config.model_dir)),
        config.pipeline_settings(),
        callbacks,
    );

    let conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, GestureService::new(controller.clone()))?
        .build()
        .await?;
    let emitter = SignalEmitter::new(&conn, OBJECT_PATH)?;

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let Err(e) = dbus_interface::emit_tilt(&emitter, &event).await {
                tracing::warn!(error = %e, "failed to emit Tilt signal");
            }
        }
    });

    let iface = conn
        .object_server()
        .interface::<_, GestureService>(OBJECT_PATH)
        .await?;
    tokio::spawn(dbus_interface::forward_status(iface, controller.clone()));

    if config.enable_on_start {
        if let Err(e) = controller.enable().await {
            tracing::warn!(error = %e, "pipeline did not start; waiting for Enable()");
        }
    }

    tracing::info!(bus_name = BUS_NAME, "tiltgated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("tiltgated shutting down");
    controller.disable().await;

    Ok(())
}
