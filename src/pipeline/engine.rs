//! Pipeline engine.
//!
//! Owns the three model sessions and runs them in strict sequence on one
//! frame: detection, segmentation, depth, then risk fusion. Stage failures
//! are ordinary `Result` values; any failure drops the engine to demo
//! fallback instead of propagating. Frame loss is acceptable, pipeline
//! corruption is not.
//!
//! Not reentrant: `process_frame` mutates smoothing state (previous depth,
//! fps EMA), so the caller serializes access. The scheduler does exactly
//! that.

use anyhow::{anyhow, Result};

use super::risk::{risk_score, RiskInput};
use super::{HazardDetection, PipelineStatus, PipelineSummary};
use crate::frame::Frame;
use crate::model::{
    DetectionCandidate, DetectorSession, DepthSession, ModelKey, ModelProvider, PlanarTensor,
    SegmenterSession,
};
use crate::ContextSnapshot;

/// Floor applied to both box dimensions, source-frame pixels.
const MIN_BOX_DIM_PX: f64 = 4.0;
/// Depth estimates are clamped to at least this many meters.
pub const MIN_DEPTH_M: f64 = 0.1;
/// Speed floor for time-to-collision, m/s.
const MIN_SPEED_MPS: f64 = 0.1;
/// Smoothing factor for the fps moving average.
const FPS_EMA_ALPHA: f64 = 0.2;
/// Previous-depth seed before the first real estimate.
const INITIAL_DEPTH_M: f64 = 4.0;

/// Engine lifecycle. Transitions are monotonic except for `dispose`,
/// which forces `Disposed` from any state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Ready,
    DemoFallback,
    Disposed,
}

struct StageSessions {
    detector: Box<dyn DetectorSession>,
    segmenter: Box<dyn SegmenterSession>,
    depth: Box<dyn DepthSession>,
}

struct StageOutputs {
    candidate: DetectionCandidate,
    lane_offset: f64,
    depth_m_raw: f64,
}

/// Result of one successfully processed frame.
pub struct EngineOutput {
    pub detection: HazardDetection,
    pub summary: PipelineSummary,
}

pub struct PipelineEngine {
    state: EngineState,
    sessions: Option<StageSessions>,
    class_labels: Vec<String>,
    last_depth_m: f64,
    last_depth_ts_ms: u64,
    last_frame_ts_ms: Option<u64>,
    fps_ema: f64,
}

impl PipelineEngine {
    pub fn new(class_labels: Vec<String>) -> Self {
        Self {
            state: EngineState::Uninitialized,
            sessions: None,
            class_labels,
            last_depth_m: INITIAL_DEPTH_M,
            last_depth_ts_ms: 0,
            last_frame_ts_ms: None,
            fps_ema: 0.0,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == EngineState::Ready
    }

    /// Resolve the three model handles and create sessions. Idempotent:
    /// a `Ready` engine returns true without re-allocating; a `Disposed`
    /// engine stays disposed. Any missing path or session-creation error
    /// leaves the engine in demo fallback and returns false.
    pub fn initialize(&mut self, provider: &dyn ModelProvider) -> bool {
        match self.state {
            EngineState::Ready => return true,
            EngineState::Disposed | EngineState::Initializing => return false,
            EngineState::Uninitialized | EngineState::DemoFallback => {}
        }
        self.state = EngineState::Initializing;
        match Self::create_sessions(provider) {
            Ok(sessions) => {
                self.sessions = Some(sessions);
                self.state = EngineState::Ready;
                log::info!("pipeline engine ready: all three model sessions loaded");
                true
            }
            Err(e) => {
                self.sessions = None;
                self.state = EngineState::DemoFallback;
                log::warn!("model initialization failed, staying in demo fallback: {e:#}");
                false
            }
        }
    }

    fn create_sessions(provider: &dyn ModelProvider) -> Result<StageSessions> {
        let detector_path = provider
            .resolve_path(ModelKey::Detector)
            .ok_or_else(|| anyhow!("detector model path missing"))?;
        let segmenter_path = provider
            .resolve_path(ModelKey::Segmenter)
            .ok_or_else(|| anyhow!("segmenter model path missing"))?;
        let depth_path = provider
            .resolve_path(ModelKey::Depth)
            .ok_or_else(|| anyhow!("depth model path missing"))?;

        Ok(StageSessions {
            detector: provider.create_detector(&detector_path)?,
            segmenter: provider.create_segmenter(&segmenter_path)?,
            depth: provider.create_depth(&depth_path)?,
        })
    }

    /// Run one frame through all three stages and fuse the result.
    ///
    /// Returns `None` when the engine is not `Ready`, when the frame fails
    /// tensor conversion (dropped, no retry), or when a stage errors (the
    /// engine then drops to demo fallback).
    pub fn process_frame(&mut self, frame: &Frame, ctx: &ContextSnapshot) -> Option<EngineOutput> {
        if self.state != EngineState::Ready {
            return None;
        }
        let sessions = self.sessions.as_mut()?;

        let staged = match Self::run_stages(sessions, frame) {
            Ok(Some(staged)) => staged,
            Ok(None) => {
                log::debug!(
                    "dropping unconvertible frame ({}x{}, {} bytes)",
                    frame.width,
                    frame.height,
                    frame.data.len()
                );
                return None;
            }
            Err(e) => {
                log::warn!("inference stage failed, falling back to demo output: {e:#}");
                self.sessions = None;
                self.state = EngineState::DemoFallback;
                return None;
            }
        };

        let now = frame.ts_ms;

        let depth_m = staged.depth_m_raw.max(MIN_DEPTH_M);
        let dt_s = (now.saturating_sub(self.last_depth_ts_ms) as f64 / 1000.0).max(1.0);
        let depth_slope = (depth_m - self.last_depth_m) / dt_s;
        self.last_depth_m = depth_m;
        self.last_depth_ts_ms = now;

        let score = staged.candidate.score.clamp(0.0, 1.0);
        let risk = risk_score(RiskInput {
            score,
            depth_m,
            lane_offset: staged.lane_offset,
            depth_delta: depth_slope,
        });

        let speed = ctx.speed_mps.max(MIN_SPEED_MPS);
        let ttc_s = depth_m / speed;

        if let Some(last) = self.last_frame_ts_ms {
            let interval_s = now.saturating_sub(last).max(1) as f64 / 1000.0;
            let inst_fps = 1.0 / interval_s;
            self.fps_ema = if self.fps_ema > 0.0 {
                self.fps_ema * (1.0 - FPS_EMA_ALPHA) + inst_fps * FPS_EMA_ALPHA
            } else {
                inst_fps
            };
        }
        self.last_frame_ts_ms = Some(now);

        let class_label = self
            .class_labels
            .get(staged.candidate.class_index % self.class_labels.len().max(1))
            .cloned()
            .unwrap_or_else(|| "hazard".to_string());

        let [bx, by, bw, bh] = staged.candidate.bbox_norm;
        let detection = HazardDetection {
            id: format!("{class_label}-{now}"),
            x: bx * frame.width as f64,
            y: by * frame.height as f64,
            width: (bw * frame.width as f64).max(MIN_BOX_DIM_PX),
            height: (bh * frame.height as f64).max(MIN_BOX_DIM_PX),
            depth_m,
            risk,
            class_label,
            lane_offset: staged.lane_offset,
            ttc_s,
        };

        let summary = PipelineSummary {
            status: PipelineStatus::Running,
            fps: (self.fps_ema * 10.0).round() / 10.0,
            last_updated_ms: Some(now),
        };

        Some(EngineOutput { detection, summary })
    }

    fn run_stages(sessions: &mut StageSessions, frame: &Frame) -> Result<Option<StageOutputs>> {
        let (dw, dh) = sessions.detector.input_size();
        let Some(detector_input) = PlanarTensor::from_rgba_frame(frame, dw, dh) else {
            return Ok(None);
        };
        let candidate = sessions.detector.detect(&detector_input)?;

        let (sw, sh) = sessions.segmenter.input_size();
        let Some(segmenter_input) = PlanarTensor::from_rgba_frame(frame, sw, sh) else {
            return Ok(None);
        };
        let lane_offset = sessions.segmenter.lane_offset(&segmenter_input)?;

        let (zw, zh) = sessions.depth.input_size();
        let Some(depth_input) = PlanarTensor::from_rgba_frame(frame, zw, zh) else {
            return Ok(None);
        };
        let depth_m_raw = sessions.depth.estimate_depth(&depth_input)?;

        Ok(Some(StageOutputs {
            candidate,
            lane_offset,
            depth_m_raw,
        }))
    }

    /// Release all session handles. Safe to call multiple times.
    pub fn dispose(&mut self) {
        self.sessions = None;
        self.state = EngineState::Disposed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StubModelProvider;
    use crate::{GeoPoint, WeatherSample};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ctx(speed_mps: f64) -> ContextSnapshot {
        ContextSnapshot {
            geo: GeoPoint { lat: 0.0, lon: 0.0 },
            speed_mps,
            weather: WeatherSample::default(),
        }
    }

    fn rgba_frame(width: u32, height: u32, ts_ms: u64) -> Frame {
        Frame::new(vec![100u8; (width * height * 4) as usize], width, height, ts_ms)
    }

    fn classes() -> Vec<String> {
        vec!["pothole".into(), "debris".into(), "cone".into()]
    }

    /// Provider with scriptable outputs and an inference call counter.
    struct FixedProvider {
        score: f64,
        bbox_norm: [f64; 4],
        depth_m: f64,
        fail_detect: bool,
        calls: Arc<AtomicUsize>,
    }

    impl FixedProvider {
        fn new() -> Self {
            Self {
                score: 0.7,
                bbox_norm: [0.1, 0.2, 0.3, 0.4],
                depth_m: 4.3,
                fail_detect: false,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    struct FixedDetector {
        score: f64,
        bbox_norm: [f64; 4],
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    impl DetectorSession for FixedDetector {
        fn input_size(&self) -> (u32, u32) {
            (16, 16)
        }
        fn detect(&mut self, _input: &PlanarTensor) -> Result<DetectionCandidate> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("synthetic detector failure"));
            }
            Ok(DetectionCandidate {
                score: self.score,
                bbox_norm: self.bbox_norm,
                class_index: 0,
            })
        }
    }

    struct FixedSegmenter;

    impl SegmenterSession for FixedSegmenter {
        fn input_size(&self) -> (u32, u32) {
            (16, 16)
        }
        fn lane_offset(&mut self, _input: &PlanarTensor) -> Result<f64> {
            Ok(0.2)
        }
    }

    struct FixedDepth {
        depth_m: f64,
    }

    impl DepthSession for FixedDepth {
        fn input_size(&self) -> (u32, u32) {
            (16, 16)
        }
        fn estimate_depth(&mut self, _input: &PlanarTensor) -> Result<f64> {
            Ok(self.depth_m)
        }
    }

    impl ModelProvider for FixedProvider {
        fn resolve_path(&self, key: ModelKey) -> Option<PathBuf> {
            Some(PathBuf::from(format!("fixed://{}", key.as_str())))
        }
        fn create_detector(&self, _path: &Path) -> Result<Box<dyn DetectorSession>> {
            Ok(Box::new(FixedDetector {
                score: self.score,
                bbox_norm: self.bbox_norm,
                fail: self.fail_detect,
                calls: self.calls.clone(),
            }))
        }
        fn create_segmenter(&self, _path: &Path) -> Result<Box<dyn SegmenterSession>> {
            Ok(Box::new(FixedSegmenter))
        }
        fn create_depth(&self, _path: &Path) -> Result<Box<dyn DepthSession>> {
            Ok(Box::new(FixedDepth {
                depth_m: self.depth_m,
            }))
        }
    }

    /// Provider whose paths never resolve.
    struct MissingProvider;

    impl ModelProvider for MissingProvider {
        fn resolve_path(&self, _key: ModelKey) -> Option<PathBuf> {
            None
        }
        fn create_detector(&self, _path: &Path) -> Result<Box<dyn DetectorSession>> {
            Err(anyhow!("unreachable"))
        }
        fn create_segmenter(&self, _path: &Path) -> Result<Box<dyn SegmenterSession>> {
            Err(anyhow!("unreachable"))
        }
        fn create_depth(&self, _path: &Path) -> Result<Box<dyn DepthSession>> {
            Err(anyhow!("unreachable"))
        }
    }

    #[test]
    fn uninitialized_engine_processes_nothing() {
        let mut engine = PipelineEngine::new(classes());
        assert!(engine
            .process_frame(&rgba_frame(16, 16, 1_000), &ctx(5.0))
            .is_none());
        assert_eq!(engine.state(), EngineState::Uninitialized);
    }

    #[test]
    fn missing_model_paths_fall_back_to_demo() {
        let mut engine = PipelineEngine::new(classes());
        assert!(!engine.initialize(&MissingProvider));
        assert_eq!(engine.state(), EngineState::DemoFallback);
    }

    #[test]
    fn initialize_is_idempotent_once_ready() {
        let mut engine = PipelineEngine::new(classes());
        assert!(engine.initialize(&StubModelProvider::new(3)));
        assert!(engine.is_ready());
        assert!(engine.initialize(&StubModelProvider::new(3)));
    }

    #[test]
    fn fallback_engine_can_reinitialize() {
        let mut engine = PipelineEngine::new(classes());
        assert!(!engine.initialize(&MissingProvider));
        assert!(engine.initialize(&StubModelProvider::new(3)));
        assert!(engine.is_ready());
    }

    #[test]
    fn process_frame_produces_fused_detection() {
        let provider = FixedProvider::new();
        let mut engine = PipelineEngine::new(classes());
        assert!(engine.initialize(&provider));

        let output = engine
            .process_frame(&rgba_frame(640, 480, 10_000), &ctx(5.0))
            .expect("engine output");

        let d = &output.detection;
        assert_eq!(d.class_label, "pothole");
        assert!((d.x - 0.1 * 640.0).abs() < 1e-9);
        assert!((d.width - 0.3 * 640.0).abs() < 1e-9);
        assert!((d.depth_m - 4.3).abs() < 1e-9);
        assert!((d.ttc_s - 4.3 / 5.0).abs() < 1e-9);
        assert!(d.risk > 0.0 && d.risk <= 1.0);
        assert_eq!(output.summary.status, PipelineStatus::Running);
        assert_eq!(output.summary.last_updated_ms, Some(10_000));
    }

    #[test]
    fn box_dimensions_are_floored_at_four_pixels() {
        let mut provider = FixedProvider::new();
        provider.bbox_norm = [0.5, 0.5, 0.01, 0.01];
        let mut engine = PipelineEngine::new(classes());
        assert!(engine.initialize(&provider));

        let output = engine
            .process_frame(&rgba_frame(64, 64, 1_000), &ctx(5.0))
            .expect("engine output");
        assert_eq!(output.detection.width, 4.0);
        assert_eq!(output.detection.height, 4.0);
    }

    #[test]
    fn depth_is_clamped_and_floors_ttc_speed() {
        let mut provider = FixedProvider::new();
        provider.depth_m = -3.0;
        let mut engine = PipelineEngine::new(classes());
        assert!(engine.initialize(&provider));

        let output = engine
            .process_frame(&rgba_frame(64, 64, 1_000), &ctx(0.0))
            .expect("engine output");
        assert!((output.detection.depth_m - MIN_DEPTH_M).abs() < 1e-9);
        // Stationary device: ttc uses the 0.1 m/s floor.
        assert!((output.detection.ttc_s - MIN_DEPTH_M / 0.1).abs() < 1e-9);
    }

    #[test]
    fn stage_error_degrades_to_demo_fallback() {
        let mut provider = FixedProvider::new();
        provider.fail_detect = true;
        let mut engine = PipelineEngine::new(classes());
        assert!(engine.initialize(&provider));

        assert!(engine
            .process_frame(&rgba_frame(64, 64, 1_000), &ctx(5.0))
            .is_none());
        assert_eq!(engine.state(), EngineState::DemoFallback);

        // Recovery path: a working provider restores Ready.
        let healthy = FixedProvider::new();
        assert!(engine.initialize(&healthy));
        assert!(engine.is_ready());
    }

    #[test]
    fn malformed_frame_is_dropped_without_state_change() {
        let provider = FixedProvider::new();
        let mut engine = PipelineEngine::new(classes());
        assert!(engine.initialize(&provider));

        // Declared 64x64 but only 10 bytes of pixel data.
        let bad = Frame::new(vec![0u8; 10], 64, 64, 1_000);
        assert!(engine.process_frame(&bad, &ctx(5.0)).is_none());
        assert!(engine.is_ready());
    }

    #[test]
    fn disposed_engine_runs_no_inference() {
        let provider = FixedProvider::new();
        let calls = provider.calls.clone();
        let mut engine = PipelineEngine::new(classes());
        assert!(engine.initialize(&provider));
        engine.dispose();
        engine.dispose(); // idempotent

        assert_eq!(engine.state(), EngineState::Disposed);
        assert!(engine
            .process_frame(&rgba_frame(64, 64, 1_000), &ctx(5.0))
            .is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // Disposed is terminal even for initialize.
        assert!(!engine.initialize(&FixedProvider::new()));
        assert_eq!(engine.state(), EngineState::Disposed);
    }

    #[test]
    fn fps_ema_smooths_across_frames() {
        let provider = FixedProvider::new();
        let mut engine = PipelineEngine::new(classes());
        assert!(engine.initialize(&provider));

        // 100 ms cadence -> ~10 fps once seeded.
        let mut last = None;
        for i in 0..5u64 {
            last = engine.process_frame(&rgba_frame(64, 64, 1_000 + i * 100), &ctx(5.0));
        }
        let summary = last.expect("output").summary;
        assert!((summary.fps - 10.0).abs() < 0.5, "fps was {}", summary.fps);
    }
}
