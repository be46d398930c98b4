//! tiltgate-core: head-tilt gesture engine.
//!
//! Turns facial landmarks into a roll angle, smooths it, and decides when a
//! tilt counts as a left or right gesture. Landmarks come from any
//! [`LandmarkDetector`]; the bundled one runs SCRFD through ONNX Runtime.

pub mod angle;
pub mod detector;
pub mod gesture;
pub mod smoothing;
pub mod types;

pub use detector::{DetectorError, DetectorLoader, LandmarkDetector};
pub use gesture::{GestureConfig, GestureStateMachine, TiltMapping};
pub use smoothing::AngleSmoother;
pub use types::{Landmark, LandmarkSet, Point, TiltDirection, TiltEvent, TiltStatus};

use std::path::PathBuf;

/// Default directory searched for ONNX model files.
///
/// `$XDG_DATA_HOME/tiltgate/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("tiltgate")
        .join("models")
}
