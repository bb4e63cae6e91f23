//! Alert suppression gate.
//!
//! Hazard events may only leave the device under nominal driving
//! conditions. The gate is the single source of truth for that decision:
//! the uploader's filtering and any display layer call the same evaluation
//! with the same inputs, so the two can never diverge.

use crate::{ContextSnapshot, WeatherSample};

pub const DEFAULT_MAX_SPEED_MPS: f64 = 11.2; // ~25 mph
pub const DEFAULT_MIN_VISIBILITY_M: f64 = 500.0;
pub const DEFAULT_MAX_PRECIP_MM: f64 = 2.5;

const DEFAULT_VISIBILITY_M: f64 = 9000.0;

/// Configured gate thresholds.
#[derive(Clone, Copy, Debug)]
pub struct AlertThresholds {
    /// Alerts are suppressed above this speed.
    pub max_speed_mps: f64,
    /// Alerts are suppressed below this visibility.
    pub min_visibility_m: f64,
    /// Alerts are suppressed above this precipitation rate.
    pub max_precipitation_mm: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_speed_mps: DEFAULT_MAX_SPEED_MPS,
            min_visibility_m: DEFAULT_MIN_VISIBILITY_M,
            max_precipitation_mm: DEFAULT_MAX_PRECIP_MM,
        }
    }
}

/// Per-condition outcome of one gate evaluation.
#[derive(Clone, Debug, PartialEq)]
pub struct GateStatus {
    pub speed_ok: bool,
    pub visibility_ok: bool,
    pub precipitation_ok: bool,
    pub suppressed: bool,
    /// Human-readable suppression reasons, fixed order:
    /// speed, visibility, precipitation.
    pub reasons: Vec<String>,
}

/// Pure threshold evaluator over current speed, visibility, precipitation.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlertGate {
    thresholds: AlertThresholds,
}

impl AlertGate {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self { thresholds }
    }

    pub fn evaluate(&self, speed_mps: f64, visibility_m: f64, precipitation_mm: f64) -> GateStatus {
        let speed_ok = speed_mps <= self.thresholds.max_speed_mps;
        let visibility_ok = visibility_m >= self.thresholds.min_visibility_m;
        let precipitation_ok = precipitation_mm <= self.thresholds.max_precipitation_mm;

        let mut reasons = Vec::new();
        if !speed_ok {
            reasons.push("Speed above alert threshold".to_string());
        }
        if !visibility_ok {
            reasons.push("Visibility too low".to_string());
        }
        if !precipitation_ok {
            reasons.push("Heavy precipitation".to_string());
        }

        GateStatus {
            speed_ok,
            visibility_ok,
            precipitation_ok,
            suppressed: !(speed_ok && visibility_ok && precipitation_ok),
            reasons,
        }
    }

    /// Evaluate against a context snapshot, filling absent weather fields
    /// with the nominal defaults.
    pub fn evaluate_snapshot(&self, ctx: &ContextSnapshot) -> GateStatus {
        let (visibility, precipitation) = weather_or_defaults(&ctx.weather);
        self.evaluate(ctx.speed_mps, visibility, precipitation)
    }
}

fn weather_or_defaults(weather: &WeatherSample) -> (f64, f64) {
    (
        weather.visibility_m.unwrap_or(DEFAULT_VISIBILITY_M),
        weather.precipitation_mm.unwrap_or(0.0),
    )
}
