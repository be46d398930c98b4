//! Tilt gesture decisions: threshold, cooldown gate, and indicator timeout.
//!
//! Evaluated once per frame on the smoothed angle. An emission arms a
//! cooldown during which nothing changes; the displayed direction falls
//! back to `None` after a shorter indicator hold without re-arming anything.

use crate::types::{TiltDirection, TiltEvent};
use std::time::{Duration, Instant};

const DEFAULT_THRESHOLD_DEG: f32 = 22.0;
const DEFAULT_COOLDOWN: Duration = Duration::from_millis(2000);
const DEFAULT_INDICATOR_HOLD: Duration = Duration::from_millis(800);

/// Which named direction a positive roll angle maps to.
///
/// With a mirrored selfie view a positive angle is the viewer tilting toward
/// their left shoulder, hence the `PositiveIsLeft` default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TiltMapping {
    #[default]
    PositiveIsLeft,
    PositiveIsRight,
}

impl TiltMapping {
    fn positive(self) -> TiltDirection {
        match self {
            Self::PositiveIsLeft => TiltDirection::Left,
            Self::PositiveIsRight => TiltDirection::Right,
        }
    }

    fn negative(self) -> TiltDirection {
        match self {
            Self::PositiveIsLeft => TiltDirection::Right,
            Self::PositiveIsRight => TiltDirection::Left,
        }
    }
}

impl std::str::FromStr for TiltMapping {
    type Err = String;

    /// Parses the direction a positive angle means: `left` or `right`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => Ok(Self::PositiveIsLeft),
            "right" => Ok(Self::PositiveIsRight),
            other => Err(format!("unknown tilt direction {other:?} (expected left or right)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GestureConfig {
    /// Absolute smoothed angle (degrees) that must be exceeded to emit.
    pub threshold_deg: f32,
    /// Minimum time between two emissions.
    pub cooldown: Duration,
    /// How long the direction indicator stays up after an emission.
    pub indicator_hold: Duration,
    pub mapping: TiltMapping,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            threshold_deg: DEFAULT_THRESHOLD_DEG,
            cooldown: DEFAULT_COOLDOWN,
            indicator_hold: DEFAULT_INDICATOR_HOLD,
            mapping: TiltMapping::default(),
        }
    }
}

/// Neutral / signaling-left / signaling-right, gated by a cooldown timer.
#[derive(Debug, Clone)]
pub struct GestureStateMachine {
    config: GestureConfig,
    direction: TiltDirection,
    last_emit: Option<Instant>,
}

impl GestureStateMachine {
    pub fn new(config: GestureConfig) -> Self {
        Self {
            config,
            direction: TiltDirection::None,
            last_emit: None,
        }
    }

    pub fn config(&self) -> &GestureConfig {
        &self.config
    }

    /// Currently displayed direction.
    pub fn direction(&self) -> TiltDirection {
        self.direction
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.last_emit
            .is_some_and(|t| now.saturating_duration_since(t) < self.config.cooldown)
    }

    /// Clear the indicator once its hold has elapsed. Safe to call every tick,
    /// with or without a new angle.
    pub fn expire_indicator(&mut self, now: Instant) {
        if self.direction == TiltDirection::None {
            return;
        }
        if let Some(t) = self.last_emit {
            if now.saturating_duration_since(t) >= self.config.indicator_hold {
                self.direction = TiltDirection::None;
            }
        }
    }

    /// Feed one smoothed angle. Returns the event if this frame emits.
    pub fn observe(&mut self, angle: f32, now: Instant) -> Option<TiltEvent> {
        self.expire_indicator(now);

        // Cooldown outranks the angle: no transition at all while it runs.
        if self.in_cooldown(now) {
            return None;
        }

        let threshold = self.config.threshold_deg;
        let direction = if angle > threshold {
            self.config.mapping.positive()
        } else if angle < -threshold {
            self.config.mapping.negative()
        } else {
            self.direction = TiltDirection::None;
            return None;
        };

        self.direction = direction;
        self.last_emit = Some(now);
        Some(TiltEvent {
            direction,
            angle,
            at: now,
        })
    }

    pub fn reset(&mut self) {
        self.direction = TiltDirection::None;
        self.last_emit = None;
    }
}

impl Default for GestureStateMachine {
    fn default() -> Self {
        Self::new(GestureConfig::default())
    }
}
