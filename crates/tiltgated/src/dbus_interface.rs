use crate::engine::PipelineController;
use tiltgate_core::TiltEvent;
use zbus::interface;
use zbus::object_server::{InterfaceRef, SignalEmitter};

pub const BUS_NAME: &str = "io.tiltgate.Gesture1";
pub const OBJECT_PATH: &str = "/io/tiltgate/Gesture1";

/// D-Bus interface for the head-tilt gesture daemon.
///
/// Bus name: io.tiltgate.Gesture1
/// Object path: /io/tiltgate/Gesture1
pub struct GestureService {
    controller: PipelineController,
}

impl GestureService {
    pub fn new(controller: PipelineController) -> Self {
        Self { controller }
    }
}

#[interface(name = "io.tiltgate.Gesture1")]
impl GestureService {
    /// Start the pipeline. Returns immediately; progress shows up in
    /// `Status()` and the `StatusChanged` signal.
    async fn enable(&self) {
        tracing::info!("enable requested");
        let controller = self.controller.clone();
        tokio::spawn(async move {
            // The error is already published in the status.
            let _ = controller.enable().await;
        });
    }

    /// Stop the pipeline and wait until the camera is released.
    async fn disable(&self) {
        tracing::info!("disable requested");
        self.controller.disable().await;
    }

    /// Current status as JSON.
    async fn status(&self) -> String {
        self.controller.status().to_json()
    }

    /// True while a session is starting or running. Changes are announced by
    /// [`forward_status`].
    #[zbus(property)]
    async fn enabled(&self) -> bool {
        self.controller.is_enabled()
    }

    /// Emitted once per recognised gesture; `direction` is "left" or "right".
    #[zbus(signal)]
    pub async fn tilt(
        emitter: &SignalEmitter<'_>,
        direction: &str,
        angle_degrees: i32,
    ) -> zbus::Result<()>;

    /// Emitted whenever the status JSON changes.
    #[zbus(signal)]
    pub async fn status_changed(emitter: &SignalEmitter<'_>, status: &str) -> zbus::Result<()>;
}

/// Broadcast a gesture as a `Tilt` signal.
pub async fn emit_tilt(emitter: &SignalEmitter<'_>, event: &TiltEvent) -> zbus::Result<()> {
    let degrees = tiltgate_core::types::display_degrees(event.angle);
    GestureService::tilt(emitter, event.direction.as_str(), degrees).await
}

/// Relay controller status to the bus for the life of the daemon.
///
/// Every status change becomes a `StatusChanged` signal; a change that also
/// flips `Enabled` additionally emits `PropertiesChanged` for it.
pub async fn forward_status(iface: InterfaceRef<GestureService>, controller: PipelineController) {
    let mut status_rx = controller.subscribe();
    let mut enabled = controller.is_enabled();
    while status_rx.changed().await.is_ok() {
        let json = status_rx.borrow_and_update().to_json();
        let emitter = iface.signal_emitter();
        if let Err(e) = GestureService::status_changed(emitter, &json).await {
            tracing::warn!(error = %e, "failed to emit StatusChanged signal");
        }

        let now = controller.is_enabled();
        if std::mem::replace(&mut enabled, now) != now {
            tracing::debug!(enabled = now, "Enabled property changed");
            if let Err(e) = iface.get().await.enabled_changed(emitter).await {
                tracing::warn!(error = %e, "failed to emit Enabled PropertiesChanged");
            }
        }
    }
}
