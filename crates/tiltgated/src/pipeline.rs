//! Per-session pipeline state, advanced one frame per tick.
//!
//! A [`Pipeline`] exclusively owns the frame source and the landmark detector
//! for one enabled session, plus the smoothing and gesture state that must
//! see frames strictly in capture order.

use std::time::{Duration, Instant};
use thiserror::Error;
use tiltgate_core::angle::estimate_roll;
use tiltgate_core::{
    AngleSmoother, DetectorError, GestureConfig, GestureStateMachine, LandmarkDetector,
    TiltDirection, TiltEvent,
};
use tiltgate_hw::{CameraError, CaptureConstraints, FrameSource};

/// Failures surfaced to the host through `TiltStatus.error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("landmark model failed to load: {0}")]
    ModelInitFailed(String),
    #[error("camera stream closed")]
    SourceClosed,
    #[error("frame loop failed: {0}")]
    LoopFailed(String),
}

impl From<CameraError> for PipelineError {
    fn from(e: CameraError) -> Self {
        match e {
            CameraError::PermissionDenied(path) => Self::PermissionDenied(path),
            CameraError::SourceClosed => Self::SourceClosed,
            other => Self::DeviceUnavailable(other.to_string()),
        }
    }
}

impl From<DetectorError> for PipelineError {
    fn from(e: DetectorError) -> Self {
        Self::ModelInitFailed(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub constraints: CaptureConstraints,
    pub gesture: GestureConfig,
    pub smoothing_factor: f32,
    /// Delay between frame loop ticks.
    pub frame_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            constraints: CaptureConstraints::default(),
            gesture: GestureConfig::default(),
            smoothing_factor: AngleSmoother::DEFAULT_ALPHA,
            frame_interval: Duration::from_secs(1) / 30,
        }
    }
}

/// What one tick did with the frame source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// No frame was ready; try again next tick.
    NotReady,
    /// Frame too dark to hold a face; inference skipped.
    Dark,
    NoFace,
    /// Capture or inference failed for this frame only.
    Skipped,
    /// A raw angle was folded into the smoothed angle.
    Updated,
}

#[derive(Debug, Clone, Copy)]
pub struct TickReport {
    pub outcome: FrameOutcome,
    /// Smoothed angle after this tick (degrees).
    pub angle: f32,
    pub direction: TiltDirection,
    pub event: Option<TiltEvent>,
}

pub struct Pipeline {
    source: Option<Box<dyn FrameSource>>,
    detector: Option<Box<dyn LandmarkDetector>>,
    smoother: AngleSmoother,
    gesture: GestureStateMachine,
    epoch: Instant,
    last_timestamp_ms: Option<u64>,
}

impl Pipeline {
    /// Take ownership of freshly acquired resources. Smoothing starts at 0.
    pub fn new(
        source: Box<dyn FrameSource>,
        detector: Box<dyn LandmarkDetector>,
        settings: &PipelineSettings,
    ) -> Self {
        Self {
            source: Some(source),
            detector: Some(detector),
            smoother: AngleSmoother::new(settings.smoothing_factor),
            gesture: GestureStateMachine::new(settings.gesture.clone()),
            epoch: Instant::now(),
            last_timestamp_ms: None,
        }
    }

    pub fn angle(&self) -> f32 {
        self.smoother.value()
    }

    pub fn direction(&self) -> TiltDirection {
        self.gesture.direction()
    }

    /// Process at most one frame.
    ///
    /// Only a closed source is an error; every other per-frame failure is
    /// logged and reported as [`FrameOutcome::Skipped`].
    pub fn tick(&mut self, now: Instant) -> Result<TickReport, PipelineError> {
        let (Some(source), Some(detector)) = (self.source.as_mut(), self.detector.as_mut()) else {
            return Err(PipelineError::SourceClosed);
        };

        self.gesture.expire_indicator(now);

        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(self.report(FrameOutcome::NotReady, None)),
            Err(CameraError::SourceClosed) => return Err(PipelineError::SourceClosed),
            Err(e) => {
                tracing::warn!(error = %e, "frame capture failed; skipping");
                return Ok(self.report(FrameOutcome::Skipped, None));
            }
        };

        if frame.is_dark {
            tracing::trace!(seq = frame.sequence, "dark frame");
            return Ok(self.report(FrameOutcome::Dark, None));
        }

        // The detector requires strictly increasing timestamps.
        let mut timestamp_ms = frame
            .timestamp
            .saturating_duration_since(self.epoch)
            .as_millis() as u64;
        if let Some(prev) = self.last_timestamp_ms {
            timestamp_ms = timestamp_ms.max(prev + 1);
        }
        self.last_timestamp_ms = Some(timestamp_ms);

        let landmarks = match detector.infer(&frame.data, frame.width, frame.height, timestamp_ms) {
            Ok(Some(landmarks)) => landmarks,
            Ok(None) => {
                tracing::trace!(seq = frame.sequence, "no face");
                return Ok(self.report(FrameOutcome::NoFace, None));
            }
            Err(e) => {
                tracing::warn!(seq = frame.sequence, error = %e, "landmark inference failed; skipping frame");
                return Ok(self.report(FrameOutcome::Skipped, None));
            }
        };

        let Some(raw) = estimate_roll(&landmarks) else {
            tracing::debug!(seq = frame.sequence, "face without eye landmarks");
            return Ok(self.report(FrameOutcome::NoFace, None));
        };

        let smoothed = self.smoother.update(raw);
        let event = self.gesture.observe(smoothed, now);
        if let Some(ev) = &event {
            tracing::info!(direction = ev.direction.as_str(), angle = ev.angle, "tilt gesture");
        }
        Ok(self.report(FrameOutcome::Updated, event))
    }

    fn report(&self, outcome: FrameOutcome, event: Option<TiltEvent>) -> TickReport {
        TickReport {
            outcome,
            angle: self.angle(),
            direction: self.direction(),
            event,
        }
    }

    /// Close the detector and release the frame source. Idempotent.
    pub fn teardown(&mut self) {
        if let Some(mut detector) = self.detector.take() {
            detector.close();
        }
        if let Some(mut source) = self.source.take() {
            source.release();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.teardown();
    }
}
