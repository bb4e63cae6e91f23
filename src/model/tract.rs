#![cfg(feature = "backend-tract")]

//! Tract-based ONNX sessions for the three pipeline stages.
//!
//! Each session loads a local model file and runs inference on planar RGB
//! tensors. No network I/O, no disk writes beyond model loading.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use super::{
    DetectionCandidate, DetectorSession, DepthSession, PlanarTensor, SegmenterSession,
};

type RunnableOnnx = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

fn load_plan(path: &Path, input: u32) -> Result<RunnableOnnx> {
    tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("failed to load ONNX model from {}", path.display()))?
        .with_input_fact(
            0,
            InferenceFact::dt_shape(
                f32::datum_type(),
                tvec!(1, 3, input as usize, input as usize),
            ),
        )
        .context("failed to set input fact")?
        .into_optimized()
        .context("failed to optimize ONNX model")?
        .into_runnable()
        .context("failed to build runnable ONNX model")
}

fn to_input_tensor(input: &PlanarTensor) -> Result<Tensor> {
    let width = input.width as usize;
    let height = input.height as usize;
    if input.data.len() != width * height * 3 {
        return Err(anyhow!(
            "tensor length {} does not match {}x{}x3",
            input.data.len(),
            width,
            height
        ));
    }
    let array = tract_ndarray::Array4::from_shape_fn((1, 3, height, width), |(_, c, y, x)| {
        input.data[c * width * height + y * width + x]
    });
    Ok(array.into_tensor())
}

pub struct TractDetectorSession {
    plan: RunnableOnnx,
    input: u32,
    class_count: usize,
}

impl TractDetectorSession {
    pub fn load(path: &Path, input: u32, class_count: usize) -> Result<Self> {
        Ok(Self {
            plan: load_plan(path, input)?,
            input,
            class_count: class_count.max(1),
        })
    }
}

impl DetectorSession for TractDetectorSession {
    fn input_size(&self) -> (u32, u32) {
        (self.input, self.input)
    }

    fn detect(&mut self, input: &PlanarTensor) -> Result<DetectionCandidate> {
        let outputs = self
            .plan
            .run(tvec!(to_input_tensor(input)?.into()))
            .context("detector inference failed")?;
        let logits = outputs
            .first()
            .ok_or_else(|| anyhow!("detector produced no outputs"))?
            .to_array_view::<f32>()
            .context("detector logits were not f32")?;
        let boxes = outputs
            .get(1)
            .ok_or_else(|| anyhow!("detector produced no box output"))?
            .to_array_view::<f32>()
            .context("detector boxes were not f32")?;

        // Highest scoring candidate across all queries and prompts.
        let mut best_score = 0f32;
        let mut best_index = 0usize;
        for (i, value) in logits.iter().enumerate() {
            if *value > best_score {
                best_score = *value;
                best_index = i;
            }
        }

        let boxes_flat: Vec<f32> = boxes.iter().copied().collect();
        let base = best_index * 4;
        if base + 3 >= boxes_flat.len() {
            return Err(anyhow!(
                "box output too short: candidate {} of {} values",
                best_index,
                boxes_flat.len()
            ));
        }

        Ok(DetectionCandidate {
            score: f64::from(best_score).min(1.0),
            bbox_norm: [
                f64::from(boxes_flat[base]),
                f64::from(boxes_flat[base + 1]),
                f64::from(boxes_flat[base + 2]),
                f64::from(boxes_flat[base + 3]),
            ],
            class_index: best_index % self.class_count,
        })
    }
}

pub struct TractSegmenterSession {
    plan: RunnableOnnx,
    input: u32,
}

impl TractSegmenterSession {
    pub fn load(path: &Path, input: u32) -> Result<Self> {
        Ok(Self {
            plan: load_plan(path, input)?,
            input,
        })
    }
}

impl SegmenterSession for TractSegmenterSession {
    fn input_size(&self) -> (u32, u32) {
        (self.input, self.input)
    }

    fn lane_offset(&mut self, input: &PlanarTensor) -> Result<f64> {
        self.plan
            .run(tvec!(to_input_tensor(input)?.into()))
            .context("segmenter inference failed")?;
        // Lane-offset decoding from the class map is an extension point;
        // until it lands, the segmentation result gates only on success.
        Ok(0.2)
    }
}

pub struct TractDepthSession {
    plan: RunnableOnnx,
    input: u32,
}

impl TractDepthSession {
    pub fn load(path: &Path, input: u32) -> Result<Self> {
        Ok(Self {
            plan: load_plan(path, input)?,
            input,
        })
    }
}

impl DepthSession for TractDepthSession {
    fn input_size(&self) -> (u32, u32) {
        (self.input, self.input)
    }

    fn estimate_depth(&mut self, input: &PlanarTensor) -> Result<f64> {
        let outputs = self
            .plan
            .run(tvec!(to_input_tensor(input)?.into()))
            .context("depth inference failed")?;
        let depth_map = outputs
            .first()
            .ok_or_else(|| anyhow!("depth model produced no outputs"))?
            .to_array_view::<f32>()
            .context("depth output was not f32")?;
        let first = depth_map
            .iter()
            .next()
            .copied()
            .ok_or_else(|| anyhow!("depth output was empty"))?;
        Ok(f64::from(first))
    }
}
