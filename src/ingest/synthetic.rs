//! Synthetic frame source for tests and model-free bring-up.

use anyhow::Result;

use super::{FrameSource, SourceStats};
use crate::frame::Frame;
use crate::now_ms;

/// Configuration for the synthetic source.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            target_fps: 10,
        }
    }
}

/// Generates a drifting gradient scene with an occasional state change,
/// enough to exercise tensor conversion and content-derived stubs.
pub struct SyntheticSource {
    config: SyntheticConfig,
    frame_count: u64,
    scene_state: u8,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            scene_state: 0,
        }
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.config.width * self.config.height) as usize;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let mut pixels = Vec::with_capacity(pixel_count * 4);
        for i in 0..pixel_count {
            let v = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
            pixels.extend_from_slice(&[v, v.wrapping_add(40), v.wrapping_add(80), 255]);
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        log::info!(
            "SyntheticSource: {}x{} @ {} fps",
            self.config.width,
            self.config.height,
            self.config.target_fps
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Ok(Frame::new(
            pixels,
            self.config.width,
            self.config.height,
            now_ms()?,
        ))
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: "synthetic".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_well_formed_rgba() {
        let mut source = SyntheticSource::new(SyntheticConfig {
            width: 8,
            height: 8,
            target_fps: 10,
        });
        source.connect().expect("connect");

        let frame = source.next_frame().expect("frame");
        assert_eq!(frame.data.len(), frame.expected_len());
        // Alpha channel is opaque throughout.
        assert!(frame.data.chunks_exact(4).all(|px| px[3] == 255));
    }

    #[test]
    fn consecutive_frames_differ() {
        let mut source = SyntheticSource::new(SyntheticConfig::default());
        let a = source.next_frame().expect("frame a");
        let b = source.next_frame().expect("frame b");
        assert_ne!(a.data, b.data);
    }
}
