//! Fade curve implementations for crossfading
//!
//! Both curves offered here are *complementary*: for every progress value
//! `t`, `fade_in(t) + fade_out(t) == 1.0`. A crossfade that ramps the
//! outgoing unit with `fade_out` and the incoming unit with `fade_in`, both
//! scaled by the same master volume, therefore keeps the summed gain flat
//! through the whole transition.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::str::FromStr;

/// Fade curve types for crossfading
///
/// - Linear: Constant rate of change (precise, predictable)
/// - SCurve: Smooth acceleration and deceleration (gentle, musical)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FadeCurve {
    /// Linear: v(t) = t
    #[default]
    Linear,

    /// S-Curve: v(t) = 0.5 × (1 - cos(π × t))
    #[serde(alias = "cosine", alias = "scurve")]
    SCurve,
}

impl FadeCurve {
    /// Calculate fade-in multiplier at given position
    ///
    /// # Arguments
    /// * `position` - Normalized position through fade (0.0 to 1.0)
    ///
    /// # Returns
    /// Volume multiplier (0.0 = silence, 1.0 = full volume)
    pub fn fade_in(&self, position: f64) -> f64 {
        let t = position.clamp(0.0, 1.0);

        match self {
            FadeCurve::Linear => t,
            FadeCurve::SCurve => 0.5 * (1.0 - (PI * t).cos()),
        }
    }

    /// Calculate fade-out multiplier at given position
    ///
    /// Always the complement of [`FadeCurve::fade_in`].
    pub fn fade_out(&self, position: f64) -> f64 {
        1.0 - self.fade_in(position)
    }

    /// Gain between `from` and `to` at normalized `position`.
    ///
    /// Two ramps that share a start instant, a duration and a curve move in
    /// lockstep: `interpolate(a, 0, t) + interpolate(0, b, t)` is a straight
    /// blend from `a` to `b`, which is what keeps a crossfade level.
    pub fn interpolate(&self, from: f64, to: f64, position: f64) -> f64 {
        from + (to - from) * self.fade_in(position)
    }

    /// Quantize a position to the lower edge of `steps` equal steps.
    ///
    /// Used by backends that can only write discrete volume values.
    pub fn quantize(position: f64, steps: u32) -> f64 {
        if steps == 0 {
            return position.clamp(0.0, 1.0);
        }
        let steps = steps as f64;
        ((position.clamp(0.0, 1.0) * steps).floor() / steps).min(1.0)
    }

    /// Get human-readable display name
    pub fn display_name(&self) -> &'static str {
        match self {
            FadeCurve::Linear => "Linear",
            FadeCurve::SCurve => "S-Curve",
        }
    }

    /// Get all available fade curve variants
    pub fn all_variants() -> &'static [FadeCurve] {
        &[FadeCurve::Linear, FadeCurve::SCurve]
    }
}

impl FromStr for FadeCurve {
    type Err = Error;

    /// Parse curve name, case-insensitive.
    ///
    /// Accepts `linear`, `s_curve` and the aliases `scurve`, `s-curve`, `cosine`.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(FadeCurve::Linear),
            "cosine" | "scurve" | "s-curve" | "s_curve" => Ok(FadeCurve::SCurve),
            other => Err(Error::InvalidInput(format!("unknown fade curve '{}'", other))),
        }
    }
}

impl std::fmt::Display for FadeCurve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
