use serde::{Deserialize, Serialize};
use std::time::Instant;

/// A 2D landmark position, normalized to 0–1 of the frame width and height.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Named facial landmarks.
///
/// "Right" and "left" are the subject's own sides, so `RightEyeOuter`
/// appears on the image's left in an unmirrored frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Landmark {
    RightEyeOuter,
    LeftEyeOuter,
    NoseTip,
    MouthRight,
    MouthLeft,
}

/// Landmarks for a single detected face, in detector output order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LandmarkSet {
    points: Vec<(Landmark, Point)>,
}

impl LandmarkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a named point. Lookups return the first point pushed under a name.
    pub fn push(&mut self, name: Landmark, point: Point) {
        self.points.push((name, point));
    }

    pub fn with(mut self, name: Landmark, point: Point) -> Self {
        self.push(name, point);
        self
    }

    pub fn get(&self, name: Landmark) -> Option<Point> {
        self.points
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, p)| *p)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Landmark, Point)> {
        self.points.iter()
    }
}

/// Displayed tilt direction. `None` is both the initial and the settled state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TiltDirection {
    #[default]
    None,
    Left,
    Right,
}

impl TiltDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Left => "left",
            Self::Right => "right",
        }
    }
}

/// A gesture emission: one per cooldown window at most.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TiltEvent {
    /// Always `Left` or `Right`.
    pub direction: TiltDirection,
    /// Smoothed angle (degrees) that crossed the threshold.
    pub angle: f32,
    pub at: Instant,
}

/// Live status exposed read-only to the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TiltStatus {
    pub direction: TiltDirection,
    /// Smoothed roll angle rounded to whole degrees.
    pub angle_degrees: i32,
    pub loading: bool,
    pub error: Option<String>,
    /// True while the frame loop is running.
    pub active: bool,
}

impl TiltStatus {
    pub fn to_json(&self) -> String {
        // Plain struct of primitives; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Round a smoothed angle for display.
pub fn display_degrees(angle: f32) -> i32 {
    angle.round() as i32
}
