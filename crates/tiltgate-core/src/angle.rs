//! Roll-angle estimation from the two outer eye corners.

use crate::types::{Landmark, LandmarkSet};

/// Raw roll angle in degrees, or `None` when either eye landmark is missing.
///
/// `atan2(left.y - right.y, left.x - right.x)`. A level face gives 0; the
/// sign grows positive as the subject's left eye drops below the right one
/// in image coordinates (y grows downward).
pub fn estimate_roll(landmarks: &LandmarkSet) -> Option<f32> {
    let right = landmarks.get(Landmark::RightEyeOuter)?;
    let left = landmarks.get(Landmark::LeftEyeOuter)?;

    let dy = left.y - right.y;
    let dx = left.x - right.x;
    Some(dy.atan2(dx).to_degrees())
}
