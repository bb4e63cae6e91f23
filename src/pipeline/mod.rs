mod engine;
mod risk;

pub use engine::{EngineOutput, EngineState, PipelineEngine};
pub use risk::{risk_score, RiskInput};

use serde::Serialize;

/// Lifecycle status reported alongside every result fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    #[default]
    Idle,
    Warming,
    Running,
    Error,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Idle => "idle",
            PipelineStatus::Warming => "warming",
            PipelineStatus::Running => "running",
            PipelineStatus::Error => "error",
        }
    }
}

/// One fused inference result for a single frame.
#[derive(Clone, Debug)]
pub struct HazardDetection {
    pub id: String,
    /// Bounding box in source-frame pixel space.
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    /// Estimated depth in meters, clamped >= 0.1.
    pub depth_m: f64,
    /// Fused risk score in [0, 1].
    pub risk: f64,
    pub class_label: String,
    /// Signed lateral offset from lane center.
    pub lane_offset: f64,
    /// Time to collision in seconds (depth / speed, speed floored at 0.1).
    pub ttc_s: f64,
}

/// Rolling pipeline health summary.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSummary {
    pub status: PipelineStatus,
    /// Smoothed frames-per-second (exponential moving average).
    pub fps: f64,
    /// Unix milliseconds of the last update, if any yet.
    pub last_updated_ms: Option<u64>,
}

impl PipelineSummary {
    pub fn idle() -> Self {
        Self {
            status: PipelineStatus::Idle,
            fps: 0.0,
            last_updated_ms: None,
        }
    }
}
