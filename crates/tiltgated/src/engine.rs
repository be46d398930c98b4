//! Pipeline controller: owns the enable/disable lifecycle of one session.
//!
//! At most one session holds the camera. Starting a session acquires the
//! camera and loads the detector on the blocking pool; every step re-checks
//! that the session is still the current one, so a `disable()` that lands
//! mid-startup releases whatever was already acquired. A disabled session
//! stays `Stopping` until its resources are gone, and `enable()` waits for
//! that before acquiring again. The frame loop runs as a tokio task and hands
//! the [`Pipeline`] to the blocking pool for each tick.

use crate::pipeline::{Pipeline, PipelineError, PipelineSettings, TickReport};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tiltgate_core::types::display_degrees;
use tiltgate_core::{DetectorError, DetectorLoader, TiltDirection, TiltEvent, TiltStatus};
use tiltgate_hw::{CameraError, SourceProvider};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub type TiltCallback = Arc<dyn Fn(&TiltEvent) + Send + Sync>;

/// Host callbacks, invoked once per emitted gesture.
#[derive(Clone, Default)]
pub struct TiltCallbacks {
    pub on_tilt_left: Option<TiltCallback>,
    pub on_tilt_right: Option<TiltCallback>,
}

impl TiltCallbacks {
    pub fn on_left(mut self, f: impl Fn(&TiltEvent) + Send + Sync + 'static) -> Self {
        self.on_tilt_left = Some(Arc::new(f));
        self
    }

    pub fn on_right(mut self, f: impl Fn(&TiltEvent) + Send + Sync + 'static) -> Self {
        self.on_tilt_right = Some(Arc::new(f));
        self
    }

    fn dispatch(&self, event: &TiltEvent) {
        let callback = match event.direction {
            TiltDirection::Left => self.on_tilt_left.as_ref(),
            TiltDirection::Right => self.on_tilt_right.as_ref(),
            TiltDirection::None => None,
        };
        if let Some(callback) = callback {
            callback(event);
        }
    }
}

/// Closes (never sends) once the holder has released its resources.
type ReleaseBarrier = watch::Receiver<()>;

enum Session {
    Idle,
    Starting {
        id: u64,
        released: ReleaseBarrier,
    },
    Running {
        id: u64,
        stop: oneshot::Sender<()>,
        task: JoinHandle<()>,
        released: ReleaseBarrier,
    },
    /// Disabled, but the camera or detector may still be held.
    Stopping {
        id: u64,
        released: ReleaseBarrier,
    },
}

/// What `disable()` has to wait for after leaving the lock.
enum Teardown {
    Nothing,
    FrameLoop { id: u64, task: JoinHandle<()> },
    Barrier(ReleaseBarrier),
}

struct SessionSlot {
    /// Source of session ids.
    generation: u64,
    state: Session,
}

impl SessionSlot {
    fn is_starting(&self, id: u64) -> bool {
        matches!(self.state, Session::Starting { id: current, .. } if current == id)
    }

    fn is_running(&self, id: u64) -> bool {
        matches!(self.state, Session::Running { id: current, .. } if current == id)
    }

    fn is_stopping(&self, id: u64) -> bool {
        matches!(self.state, Session::Stopping { id: current, .. } if current == id)
    }

    /// Mark a stopping session as fully released.
    fn settle(&mut self, id: u64) {
        if self.is_stopping(id) {
            self.state = Session::Idle;
        }
    }
}

struct Shared {
    sources: Arc<dyn SourceProvider>,
    detectors: Arc<dyn DetectorLoader>,
    settings: PipelineSettings,
    callbacks: TiltCallbacks,
    session: Mutex<SessionSlot>,
    status: watch::Sender<TiltStatus>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionSlot> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clone-safe handle to the gesture pipeline.
#[derive(Clone)]
pub struct PipelineController {
    shared: Arc<Shared>,
}

impl PipelineController {
    pub fn new(
        sources: Arc<dyn SourceProvider>,
        detectors: Arc<dyn DetectorLoader>,
        settings: PipelineSettings,
        callbacks: TiltCallbacks,
    ) -> Self {
        let (status, _) = watch::channel(TiltStatus::default());
        Self {
            shared: Arc::new(Shared {
                sources,
                detectors,
                settings,
                callbacks,
                session: Mutex::new(SessionSlot {
                    generation: 0,
                    state: Session::Idle,
                }),
                status,
            }),
        }
    }

    /// Snapshot of the observable status.
    pub fn status(&self) -> TiltStatus {
        self.shared.status.borrow().clone()
    }

    /// Receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<TiltStatus> {
        self.shared.status.subscribe()
    }

    /// True while a session is starting or running.
    pub fn is_enabled(&self) -> bool {
        matches!(
            self.shared.lock().state,
            Session::Starting { .. } | Session::Running { .. }
        )
    }

    /// Start a session unless one is already starting or running.
    ///
    /// If a disabled session is still releasing the camera, waits for it
    /// first. Resolves once the frame loop is running, the startup failed, or
    /// the startup was cancelled by [`disable`](Self::disable). Failures are
    /// also published through `TiltStatus.error`.
    pub async fn enable(&self) -> Result<(), PipelineError> {
        // Dropped on every exit; closes the barrier of a cancelled startup.
        let (_release_guard, released) = watch::channel(());

        let id = loop {
            let (previous, mut barrier) = {
                let mut slot = self.shared.lock();
                if matches!(slot.state, Session::Idle) {
                    slot.generation += 1;
                    let id = slot.generation;
                    slot.state = Session::Starting { id, released };
                    self.shared.status.send_replace(TiltStatus {
                        loading: true,
                        ..TiltStatus::default()
                    });
                    break id;
                }
                match &slot.state {
                    Session::Stopping { id, released } => (*id, released.clone()),
                    _ => {
                        tracing::debug!("enable ignored; session already active");
                        return Ok(());
                    }
                }
            };
            tracing::debug!(session = previous, "waiting for previous session to release the camera");
            let _ = barrier.changed().await;
            // A holder that went away without settling dropped its resources with it.
            self.shared.lock().settle(previous);
        };
        tracing::info!(session = id, "starting tilt pipeline");

        let sources = Arc::clone(&self.shared.sources);
        let constraints = self.shared.settings.constraints;
        let acquired = tokio::task::spawn_blocking(move || sources.acquire(&constraints))
            .await
            .unwrap_or_else(|e| Err(CameraError::CaptureFailed(format!("camera task failed: {e}"))));
        let mut source = match acquired {
            Ok(source) => source,
            Err(e) => return self.fail_start(id, e.into()),
        };

        if !self.shared.lock().is_starting(id) {
            tracing::info!(session = id, "startup cancelled after camera open");
            let _ = tokio::task::spawn_blocking(move || source.release()).await;
            self.shared.lock().settle(id);
            return Ok(());
        }

        let detectors = Arc::clone(&self.shared.detectors);
        let loaded = tokio::task::spawn_blocking(move || detectors.load())
            .await
            .unwrap_or_else(|e| Err(DetectorError::InferenceFailed(format!("model task failed: {e}"))));
        let detector = match loaded {
            Ok(detector) => detector,
            Err(e) => {
                let _ = tokio::task::spawn_blocking(move || source.release()).await;
                return self.fail_start(id, e.into());
            }
        };

        let pipeline = Pipeline::new(source, detector, &self.shared.settings);
        let cancelled = {
            let mut slot = self.shared.lock();
            if slot.is_starting(id) {
                let (stop, stop_rx) = oneshot::channel();
                let (release_guard, released) = watch::channel(());
                let task = tokio::spawn(run_loop(
                    Arc::clone(&self.shared),
                    id,
                    pipeline,
                    stop_rx,
                    release_guard,
                ));
                slot.state = Session::Running {
                    id,
                    stop,
                    task,
                    released,
                };
                self.shared.status.send_modify(|status| {
                    status.loading = false;
                    status.active = true;
                    status.error = None;
                });
                None
            } else {
                Some(pipeline)
            }
        };

        match cancelled {
            Some(mut pipeline) => {
                tracing::info!(session = id, "startup cancelled after model load");
                let _ = tokio::task::spawn_blocking(move || pipeline.teardown()).await;
                self.shared.lock().settle(id);
            }
            None => tracing::info!(session = id, "tilt pipeline running"),
        }
        Ok(())
    }

    /// Called with every resource of session `id` already released.
    fn fail_start(&self, id: u64, err: PipelineError) -> Result<(), PipelineError> {
        let mut slot = self.shared.lock();
        if !slot.is_starting(id) {
            tracing::debug!(session = id, error = %err, "startup failed after cancellation");
            slot.settle(id);
            return Ok(());
        }
        tracing::error!(session = id, error = %err, "tilt pipeline failed to start");
        slot.state = Session::Idle;
        self.shared.status.send_replace(TiltStatus {
            error: Some(err.to_string()),
            ..TiltStatus::default()
        });
        Err(err)
    }

    /// Stop the current session, if any.
    ///
    /// Waits until the camera and the detector have been released, except for
    /// a session still starting up: that one releases them as soon as its
    /// pending acquisition resolves. Safe to call at any time, repeatedly.
    pub async fn disable(&self) {
        let teardown = {
            let mut slot = self.shared.lock();
            let teardown = match std::mem::replace(&mut slot.state, Session::Idle) {
                Session::Idle => Teardown::Nothing,
                Session::Starting { id, released } => {
                    tracing::info!(session = id, "disable during startup");
                    slot.state = Session::Stopping { id, released };
                    Teardown::Nothing
                }
                Session::Running {
                    id,
                    stop,
                    task,
                    released,
                } => {
                    let _ = stop.send(());
                    slot.state = Session::Stopping { id, released };
                    Teardown::FrameLoop { id, task }
                }
                Session::Stopping { id, released } => {
                    slot.state = Session::Stopping {
                        id,
                        released: released.clone(),
                    };
                    Teardown::Barrier(released)
                }
            };
            self.shared.status.send_replace(TiltStatus::default());
            teardown
        };

        match teardown {
            Teardown::Nothing => {}
            Teardown::FrameLoop { id, task } => {
                if let Err(e) = task.await {
                    tracing::warn!(session = id, error = %e, "frame loop task ended abnormally");
                    self.shared.lock().settle(id);
                }
                tracing::info!(session = id, "tilt pipeline stopped");
            }
            Teardown::Barrier(mut released) => {
                let _ = released.changed().await;
            }
        }
    }
}

async fn run_loop(
    shared: Arc<Shared>,
    id: u64,
    pipeline: Pipeline,
    mut stop: oneshot::Receiver<()>,
    release_guard: watch::Sender<()>,
) {
    let period = shared.settings.frame_interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut current = Some(pipeline);

    let failure = loop {
        tokio::select! {
            biased;
            _ = &mut stop => break None,
            _ = ticker.tick() => {}
        }

        let Some(mut pipeline) = current.take() else {
            break None;
        };
        let now = Instant::now();
        let joined = tokio::task::spawn_blocking(move || {
            let result = pipeline.tick(now);
            (pipeline, result)
        })
        .await;

        // A panicking tick drops (and so tears down) its pipeline.
        let (pipeline, result) = match joined {
            Ok(v) => v,
            Err(e) => break Some(PipelineError::LoopFailed(e.to_string())),
        };
        current = Some(pipeline);

        match result {
            Ok(report) => publish(&shared, id, &report),
            Err(e) => break Some(e),
        }
    };

    if let Some(mut pipeline) = current.take() {
        let _ = tokio::task::spawn_blocking(move || pipeline.teardown()).await;
    }

    {
        let mut slot = shared.lock();
        match failure {
            Some(err) if slot.is_running(id) => {
                tracing::error!(session = id, error = %err, "tilt pipeline stopped on error");
                slot.state = Session::Idle;
                shared.status.send_replace(TiltStatus {
                    error: Some(err.to_string()),
                    ..TiltStatus::default()
                });
            }
            _ => slot.settle(id),
        }
    }
    drop(release_guard);
}

fn publish(shared: &Shared, id: u64, report: &TickReport) {
    tracing::trace!(outcome = ?report.outcome, angle = report.angle, "tick");
    let degrees = display_degrees(report.angle);
    {
        let slot = shared.lock();
        if !slot.is_running(id) {
            return;
        }
        shared.status.send_if_modified(|status| {
            if status.direction == report.direction && status.angle_degrees == degrees {
                return false;
            }
            status.direction = report.direction;
            status.angle_degrees = degrees;
            true
        });
    }
    if let Some(event) = &report.event {
        shared.callbacks.dispatch(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBackend, Step};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn controller(backend: &Arc<MockBackend>, callbacks: TiltCallbacks) -> PipelineController {
        let settings = PipelineSettings {
            frame_interval: Duration::from_millis(2),
            ..PipelineSettings::default()
        };
        PipelineController::new(backend.clone(), backend.clone(), settings, callbacks)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_enable_then_disable_releases_everything() {
        let backend = MockBackend::new(vec![Step::Face(0.0); 5]);
        let counters = backend.counters();
        let c = controller(&backend, TiltCallbacks::default());

        c.enable().await.unwrap();
        assert!(c.is_enabled());
        let status = c.status();
        assert!(status.active && !status.loading);
        assert_eq!(status.error, None);

        wait_until(|| counters.inferences() >= 3).await;
        c.disable().await;

        assert!(!c.is_enabled());
        assert_eq!(c.status(), TiltStatus::default());
        assert_eq!((counters.acquired(), counters.released()), (1, 1));
        assert_eq!((counters.loaded(), counters.closed()), (1, 1));

        // A second disable is a no-op.
        c.disable().await;
        assert_eq!(counters.released(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_enables_acquire_once() {
        let backend = MockBackend::new(vec![]);
        let counters = backend.counters();
        let c = controller(&backend, TiltCallbacks::default());

        let (a, b) = tokio::join!(c.enable(), c.enable());
        assert!(a.is_ok() && b.is_ok());
        c.enable().await.unwrap();
        assert_eq!(counters.acquire_started(), 1);
        assert_eq!(counters.load_started(), 1);

        c.disable().await;
        assert_eq!(counters.released(), 1);
    }

    #[tokio::test]
    async fn test_reenable_waits_for_previous_release() {
        let backend = MockBackend::new(vec![]);
        backend.release_delay_ms.store(300, Ordering::SeqCst);
        let counters = backend.counters();
        let c = controller(&backend, TiltCallbacks::default());

        c.enable().await.unwrap();
        let stopping = tokio::spawn({
            let c = c.clone();
            async move { c.disable().await }
        });
        wait_until(|| !c.is_enabled()).await;
        assert_eq!(counters.released(), 0);

        // Must not open the camera again until the slow release is done.
        c.enable().await.unwrap();
        assert_eq!(counters.released(), 1);
        assert_eq!(counters.acquired(), 2);
        assert_eq!(counters.max_live_sources(), 1);
        assert!(c.status().active);

        stopping.await.unwrap();
        assert!(c.is_enabled());
        assert!(c.status().active);

        c.disable().await;
        assert_eq!(counters.released(), 2);
        assert_eq!(counters.max_live_sources(), 1);
    }

    #[tokio::test]
    async fn test_disable_while_stopping_waits_for_release() {
        let backend = MockBackend::new(vec![]);
        backend.release_delay_ms.store(200, Ordering::SeqCst);
        let counters = backend.counters();
        let c = controller(&backend, TiltCallbacks::default());

        c.enable().await.unwrap();
        let first = tokio::spawn({
            let c = c.clone();
            async move { c.disable().await }
        });
        wait_until(|| !c.is_enabled()).await;

        c.disable().await;
        assert_eq!(counters.released(), 1);
        first.await.unwrap();
    }

    #[tokio::test]
    async fn test_permission_denied_surfaces_and_recovers() {
        let backend = MockBackend::new(vec![]);
        let counters = backend.counters();
        let c = controller(&backend, TiltCallbacks::default());

        backend.camera_denied.store(true, Ordering::SeqCst);
        let err = c.enable().await.unwrap_err();
        assert!(matches!(err, PipelineError::PermissionDenied(_)));

        let status = c.status();
        assert!(!status.active && !status.loading);
        assert!(status.error.unwrap().contains("permission denied"));
        assert!(!c.is_enabled());
        assert_eq!(counters.load_started(), 0);

        backend.camera_denied.store(false, Ordering::SeqCst);
        c.enable().await.unwrap();
        let status = c.status();
        assert!(status.active);
        assert_eq!(status.error, None);
        c.disable().await;
    }

    #[tokio::test]
    async fn test_model_failure_releases_camera() {
        let backend = MockBackend::new(vec![]);
        let counters = backend.counters();
        let c = controller(&backend, TiltCallbacks::default());

        backend.model_missing.store(true, Ordering::SeqCst);
        let err = c.enable().await.unwrap_err();
        assert!(matches!(err, PipelineError::ModelInitFailed(_)));
        assert_eq!((counters.acquired(), counters.released()), (1, 1));
        assert!(c.status().error.is_some());
        assert!(!c.is_enabled());
    }

    #[tokio::test]
    async fn test_disable_during_camera_open() {
        let backend = MockBackend::new(vec![]);
        let counters = backend.counters();
        let c = controller(&backend, TiltCallbacks::default());

        let (gate_tx, gate_rx) = mpsc::channel();
        backend.gate_camera(gate_rx);
        let starting = tokio::spawn({
            let c = c.clone();
            async move { c.enable().await }
        });

        wait_until(|| counters.acquire_started() == 1).await;
        assert!(c.status().loading);
        c.disable().await;
        assert_eq!(c.status(), TiltStatus::default());

        gate_tx.send(()).unwrap();
        starting.await.unwrap().unwrap();

        assert_eq!((counters.acquired(), counters.released()), (1, 1));
        assert_eq!(counters.load_started(), 0);
        assert!(!c.is_enabled());
        assert_eq!(c.status(), TiltStatus::default());

        c.enable().await.unwrap();
        assert!(c.status().active);
        c.disable().await;
        assert_eq!((counters.acquired(), counters.released()), (2, 2));
    }

    #[tokio::test]
    async fn test_disable_during_model_load() {
        let backend = MockBackend::new(vec![]);
        let counters = backend.counters();
        let c = controller(&backend, TiltCallbacks::default());

        let (gate_tx, gate_rx) = mpsc::channel();
        backend.gate_model(gate_rx);
        let starting = tokio::spawn({
            let c = c.clone();
            async move { c.enable().await }
        });

        wait_until(|| counters.load_started() == 1).await;
        c.disable().await;
        gate_tx.send(()).unwrap();
        starting.await.unwrap().unwrap();

        assert_eq!((counters.loaded(), counters.closed()), (1, 1));
        assert_eq!((counters.acquired(), counters.released()), (1, 1));
        assert!(!c.is_enabled());
        assert!(!c.status().active);
    }

    #[tokio::test]
    async fn test_sustained_tilt_fires_one_callback() {
        let lefts = Arc::new(AtomicUsize::new(0));
        let rights = Arc::new(AtomicUsize::new(0));
        let callbacks = TiltCallbacks::default()
            .on_left({
                let lefts = Arc::clone(&lefts);
                move |event| {
                    assert_eq!(event.direction, TiltDirection::Left);
                    lefts.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_right({
                let rights = Arc::clone(&rights);
                move |_| {
                    rights.fetch_add(1, Ordering::SeqCst);
                }
            });

        let backend = MockBackend::new(vec![Step::Face(60.0); 40]);
        let c = controller(&backend, callbacks);
        c.enable().await.unwrap();

        wait_until(|| c.status().angle_degrees == 60).await;
        assert_eq!(lefts.load(Ordering::SeqCst), 1);
        assert_eq!(rights.load(Ordering::SeqCst), 0);
        c.disable().await;
    }

    #[tokio::test]
    async fn test_closed_source_stops_session_with_error() {
        let backend = MockBackend::new(vec![Step::Face(10.0), Step::Face(10.0), Step::Closed]);
        let counters = backend.counters();
        let c = controller(&backend, TiltCallbacks::default());

        c.enable().await.unwrap();
        wait_until(|| !c.is_enabled()).await;

        let status = c.status();
        assert_eq!(status.error.as_deref(), Some("camera stream closed"));
        assert!(!status.active);
        assert_eq!((counters.released(), counters.closed()), (1, 1));

        c.enable().await.unwrap();
        assert_eq!(counters.acquired(), 2);
        c.disable().await;
        assert_eq!(counters.released(), 2);
    }

    #[tokio::test]
    async fn test_status_subscribers_see_startup() {
        let backend = MockBackend::new(vec![]);
        let c = controller(&backend, TiltCallbacks::default());
        let mut rx = c.subscribe();

        c.enable().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().active);

        c.disable().await;
        rx.changed().await.unwrap();
        assert!(!rx.borrow().active);
    }

    #[tokio::test]
    async fn test_enabled_flips_come_with_status_changes() {
        let backend = MockBackend::new(vec![]);
        let counters = backend.counters();
        let c = controller(&backend, TiltCallbacks::default());
        let mut rx = c.subscribe();

        c.enable().await.unwrap();
        assert!(c.is_enabled());
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        c.disable().await;
        assert!(!c.is_enabled());
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        let (gate_tx, gate_rx) = mpsc::channel();
        backend.gate_camera(gate_rx);
        let starting = tokio::spawn({
            let c = c.clone();
            async move { c.enable().await }
        });
        wait_until(|| counters.acquire_started() == 2).await;
        assert!(c.is_enabled());
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        c.disable().await;
        assert!(!c.is_enabled());
        assert!(rx.has_changed().unwrap());

        gate_tx.send(()).unwrap();
        starting.await.unwrap().unwrap();
    }
}
