//! Normalized playback volume

use std::fmt;

/// Playback volume, always within `0.0..=1.0`
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Volume(f32);

impl Volume {
    pub const MUTE: Volume = Volume(0.0);
    pub const FULL: Volume = Volume(1.0);

    /// Clamp into range. NaN has no meaningful clamp and is rejected.
    pub fn new(value: f32) -> Option<Self> {
        if value.is_nan() {
            return None;
        }
        Some(Self(value.clamp(0.0, 1.0)))
    }

    pub fn get(self) -> f32 {
        self.0
    }

    /// Player scale (0-100)
    pub fn percent(self) -> f64 {
        (f64::from(self.0) * 100.0).round()
    }

    pub fn is_muted(self) -> bool {
        self.0 == 0.0
    }
}

impl Default for Volume {
    fn default() -> Self {
        Self::FULL
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.percent())
    }
}
