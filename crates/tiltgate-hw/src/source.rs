//! Frame source capability used by the pipeline.

use crate::camera::CameraError;
use crate::frame::Frame;

/// Requested capture geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub width: u32,
    pub height: u32,
}

impl Default for CaptureConstraints {
    /// 320×240 keeps per-frame inference cheap.
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
        }
    }
}

/// A live stream of frames in capture order.
pub trait FrameSource: Send {
    /// Next captured frame without blocking.
    ///
    /// `Ok(None)` means no frame is ready yet. `Err(CameraError::SourceClosed)`
    /// means the stream ended and will not produce more frames.
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError>;

    /// Stop all underlying capture. Idempotent.
    fn release(&mut self);
}

/// Acquires frame sources; the `acquire(constraints)` half of the capability.
pub trait SourceProvider: Send + Sync + 'static {
    fn acquire(&self, constraints: &CaptureConstraints) -> Result<Box<dyn FrameSource>, CameraError>;
}
