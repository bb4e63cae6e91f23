//! Model provider and per-stage inference sessions.
//!
//! The engine treats each model as an opaque function with a fixed
//! input/output tensor contract; this module owns that boundary. A
//! [`ModelProvider`] resolves on-device model paths and creates the three
//! stage sessions. The real ONNX sessions live behind the `backend-tract`
//! feature; the stub provider is always available and is what tests and
//! the demo path use.

mod stub;
mod tensor;
#[cfg(feature = "backend-tract")]
mod tract;

pub use stub::StubModelProvider;
pub use tensor::PlanarTensor;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
#[cfg(not(feature = "backend-tract"))]
use anyhow::anyhow;

/// Fixed detector input resolution (square).
pub const DETECTOR_INPUT: u32 = 768;
/// Fixed segmenter input resolution (square).
pub const SEGMENTER_INPUT: u32 = 512;
/// Fixed depth-model input resolution (square).
pub const DEPTH_INPUT: u32 = 256;

/// The three models the pipeline orchestrates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModelKey {
    Detector,
    Segmenter,
    Depth,
}

impl ModelKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKey::Detector => "detector",
            ModelKey::Segmenter => "segmenter",
            ModelKey::Depth => "depth",
        }
    }

    pub const ALL: [ModelKey; 3] = [ModelKey::Detector, ModelKey::Segmenter, ModelKey::Depth];
}

/// Best detector candidate across all classes/prompts.
#[derive(Clone, Copy, Debug)]
pub struct DetectionCandidate {
    /// Confidence, already limited to <= 1.0 by the session.
    pub score: f64,
    /// Normalized [x, y, w, h] in 0..1 of the source frame.
    pub bbox_norm: [f64; 4],
    /// Index into the configured hazard class list.
    pub class_index: usize,
}

/// Object detection stage.
pub trait DetectorSession: Send {
    fn input_size(&self) -> (u32, u32);
    fn detect(&mut self, input: &PlanarTensor) -> Result<DetectionCandidate>;
}

/// Scene segmentation stage.
///
/// Deriving a lane offset from the segmentation output is an explicit
/// extension point: implementations must run the model and return *a*
/// lane-offset value, but the decoding algorithm is theirs to choose.
pub trait SegmenterSession: Send {
    fn input_size(&self) -> (u32, u32);
    fn lane_offset(&mut self, input: &PlanarTensor) -> Result<f64>;
}

/// Monocular depth estimation stage.
pub trait DepthSession: Send {
    fn input_size(&self) -> (u32, u32);
    /// Scalar depth estimate in meters, unclamped; the engine applies the
    /// 0.1 m floor.
    fn estimate_depth(&mut self, input: &PlanarTensor) -> Result<f64>;
}

/// Model-path resolution and session creation, consumed by the engine.
///
/// A missing path for any key is an initialization failure; the engine
/// reacts by staying in (or dropping to) demo fallback rather than
/// erroring out.
pub trait ModelProvider: Send {
    fn resolve_path(&self, key: ModelKey) -> Option<PathBuf>;
    fn create_detector(&self, path: &Path) -> Result<Box<dyn DetectorSession>>;
    fn create_segmenter(&self, path: &Path) -> Result<Box<dyn SegmenterSession>>;
    fn create_depth(&self, path: &Path) -> Result<Box<dyn DepthSession>>;
}

/// Provider backed by ONNX files on local disk.
///
/// Paths resolve to `<model_dir>/<key>.onnx` unless overridden per key.
/// Session creation requires the `backend-tract` feature; without it the
/// provider still resolves paths (useful for dry runs) but refuses to
/// build sessions.
pub struct DiskModelProvider {
    model_dir: PathBuf,
    overrides: HashMap<ModelKey, PathBuf>,
    class_count: usize,
}

impl DiskModelProvider {
    pub fn new(model_dir: impl Into<PathBuf>, class_count: usize) -> Self {
        Self {
            model_dir: model_dir.into(),
            overrides: HashMap::new(),
            class_count: class_count.max(1),
        }
    }

    pub fn with_override(mut self, key: ModelKey, path: impl Into<PathBuf>) -> Self {
        self.overrides.insert(key, path.into());
        self
    }

    fn candidate_path(&self, key: ModelKey) -> PathBuf {
        self.overrides
            .get(&key)
            .cloned()
            .unwrap_or_else(|| self.model_dir.join(format!("{}.onnx", key.as_str())))
    }
}

impl ModelProvider for DiskModelProvider {
    fn resolve_path(&self, key: ModelKey) -> Option<PathBuf> {
        let path = self.candidate_path(key);
        if path.is_file() {
            Some(path)
        } else {
            log::warn!("model path missing for {}: {}", key.as_str(), path.display());
            None
        }
    }

    #[cfg(feature = "backend-tract")]
    fn create_detector(&self, path: &Path) -> Result<Box<dyn DetectorSession>> {
        Ok(Box::new(tract::TractDetectorSession::load(
            path,
            DETECTOR_INPUT,
            self.class_count,
        )?))
    }

    #[cfg(feature = "backend-tract")]
    fn create_segmenter(&self, path: &Path) -> Result<Box<dyn SegmenterSession>> {
        Ok(Box::new(tract::TractSegmenterSession::load(
            path,
            SEGMENTER_INPUT,
        )?))
    }

    #[cfg(feature = "backend-tract")]
    fn create_depth(&self, path: &Path) -> Result<Box<dyn DepthSession>> {
        Ok(Box::new(tract::TractDepthSession::load(path, DEPTH_INPUT)?))
    }

    #[cfg(not(feature = "backend-tract"))]
    fn create_detector(&self, _path: &Path) -> Result<Box<dyn DetectorSession>> {
        Err(anyhow!("model sessions require the backend-tract feature"))
    }

    #[cfg(not(feature = "backend-tract"))]
    fn create_segmenter(&self, _path: &Path) -> Result<Box<dyn SegmenterSession>> {
        Err(anyhow!("model sessions require the backend-tract feature"))
    }

    #[cfg(not(feature = "backend-tract"))]
    fn create_depth(&self, _path: &Path) -> Result<Box<dyn DepthSession>> {
        Err(anyhow!("model sessions require the backend-tract feature"))
    }
}
