//! tiltgate-hw: camera capture for the tilt pipeline.
//!
//! Opens a V4L2 device at a small fixed resolution, converts every supported
//! pixel format to grayscale, and hands frames to the pipeline through a
//! non-blocking [`FrameSource`].

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, CameraStream, PixelFormat, V4lProvider};
pub use frame::Frame;
pub use source::{CaptureConstraints, FrameSource, SourceProvider};
