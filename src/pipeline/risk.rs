//! Hazard risk fusion.
//!
//! Deterministic weighted blend of the three stage signals, no learned
//! parameters. Detection confidence dominates (0.4); proximity is
//! second-most predictive (0.3, inverse depth saturating at 0.5 m so
//! closer hazards score higher); lateral lane intrusion and approach rate
//! are secondary (0.2, 0.1).

/// Inputs to one risk evaluation.
#[derive(Clone, Copy, Debug)]
pub struct RiskInput {
    /// Detector confidence for the selected candidate.
    pub score: f64,
    /// Estimated depth in meters.
    pub depth_m: f64,
    /// Signed lateral offset from lane center.
    pub lane_offset: f64,
    /// Depth rate of change, meters per second.
    pub depth_delta: f64,
}

/// Map stage signals to a bounded hazard score in [0, 1].
pub fn risk_score(input: RiskInput) -> f64 {
    let inverse_depth = 1.0 / input.depth_m.max(0.5);
    let normalized_depth = (inverse_depth / 2.0).min(1.0); // 1/0.5 = 2
    let blended = 0.4 * input.score
        + 0.3 * normalized_depth
        + 0.2 * input.lane_offset.abs().min(1.0)
        + 0.1 * input.depth_delta.abs().min(1.0);
    blended.clamp(0.0, 1.0)
}
