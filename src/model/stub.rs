//! Stub model provider and sessions.
//!
//! Deterministic content-derived outputs with no model files on disk.
//! Used by tests and anywhere the real ONNX backend is not compiled in.

use std::path::{Path, PathBuf};

use anyhow::Result;

use super::{
    DetectionCandidate, DetectorSession, DepthSession, ModelKey, ModelProvider, PlanarTensor,
    SegmenterSession, DEPTH_INPUT, DETECTOR_INPUT, SEGMENTER_INPUT,
};

/// Placeholder lane offset until segmentation decoding is implemented.
const STUB_LANE_OFFSET: f64 = 0.2;

/// Provider whose paths always resolve and whose sessions synthesize
/// outputs from frame content.
pub struct StubModelProvider {
    class_count: usize,
}

impl StubModelProvider {
    pub fn new(class_count: usize) -> Self {
        Self {
            class_count: class_count.max(1),
        }
    }
}

impl Default for StubModelProvider {
    fn default() -> Self {
        Self::new(3)
    }
}

impl ModelProvider for StubModelProvider {
    fn resolve_path(&self, key: ModelKey) -> Option<PathBuf> {
        Some(PathBuf::from(format!("stub://{}", key.as_str())))
    }

    fn create_detector(&self, _path: &Path) -> Result<Box<dyn DetectorSession>> {
        Ok(Box::new(StubDetectorSession {
            class_count: self.class_count,
            calls: 0,
        }))
    }

    fn create_segmenter(&self, _path: &Path) -> Result<Box<dyn SegmenterSession>> {
        Ok(Box::new(StubSegmenterSession))
    }

    fn create_depth(&self, _path: &Path) -> Result<Box<dyn DepthSession>> {
        Ok(Box::new(StubDepthSession))
    }
}

struct StubDetectorSession {
    class_count: usize,
    calls: u64,
}

impl DetectorSession for StubDetectorSession {
    fn input_size(&self) -> (u32, u32) {
        (DETECTOR_INPUT, DETECTOR_INPUT)
    }

    fn detect(&mut self, input: &PlanarTensor) -> Result<DetectionCandidate> {
        self.calls += 1;
        let mean = input.mean() as f64;
        Ok(DetectionCandidate {
            score: (0.55 + 0.4 * mean).min(1.0),
            bbox_norm: [0.25, 0.35, 0.2, 0.2],
            class_index: (self.calls as usize - 1) % self.class_count,
        })
    }
}

struct StubSegmenterSession;

impl SegmenterSession for StubSegmenterSession {
    fn input_size(&self) -> (u32, u32) {
        (SEGMENTER_INPUT, SEGMENTER_INPUT)
    }

    fn lane_offset(&mut self, _input: &PlanarTensor) -> Result<f64> {
        Ok(STUB_LANE_OFFSET)
    }
}

struct StubDepthSession;

impl DepthSession for StubDepthSession {
    fn input_size(&self) -> (u32, u32) {
        (DEPTH_INPUT, DEPTH_INPUT)
    }

    fn estimate_depth(&mut self, input: &PlanarTensor) -> Result<f64> {
        // Brighter scenes read as closer; keeps depth content-dependent
        // without pretending to be a real estimate.
        Ok(2.0 + 6.0 * (1.0 - input.mean() as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn tensor() -> PlanarTensor {
        let frame = Frame::new(vec![128u8; 4 * 4 * 4], 4, 4, 0);
        PlanarTensor::from_rgba_frame(&frame, 4, 4).expect("tensor")
    }

    #[test]
    fn detector_cycles_class_indices() {
        let provider = StubModelProvider::new(3);
        let mut session = provider
            .create_detector(Path::new("stub://detector"))
            .expect("session");
        let input = tensor();
        let indices: Vec<usize> = (0..4)
            .map(|_| session.detect(&input).expect("detect").class_index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 0]);
    }

    #[test]
    fn detector_score_stays_bounded() {
        let provider = StubModelProvider::default();
        let mut session = provider
            .create_detector(Path::new("stub://detector"))
            .expect("session");
        let candidate = session.detect(&tensor()).expect("detect");
        assert!(candidate.score > 0.0 && candidate.score <= 1.0);
    }

    #[test]
    fn all_paths_resolve() {
        let provider = StubModelProvider::default();
        for key in ModelKey::ALL {
            assert!(provider.resolve_path(key).is_some());
        }
    }
}
