//! Raw-frame replay source.
//!
//! Replays `.rgba` files (raw RGBA pixel dumps) from a local directory in
//! sorted order, wrapping around at the end. Used to drive the pipeline
//! from field captures on a desk.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};

use super::{FrameSource, SourceStats};
use crate::frame::Frame;
use crate::now_ms;

/// Configuration for a replay source.
#[derive(Clone, Debug)]
pub struct ReplayConfig {
    /// Directory containing `.rgba` frame dumps.
    pub dir: PathBuf,
    /// Declared frame dimensions; files shorter than `width*height*4`
    /// bytes are rejected per frame.
    pub width: u32,
    pub height: u32,
    /// Target playback rate (frames per second).
    pub target_fps: u32,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("demo-frames"),
            width: 1280,
            height: 720,
            target_fps: 12,
        }
    }
}

pub struct ReplaySource {
    config: ReplayConfig,
    frames: Vec<PathBuf>,
    index: usize,
    frames_captured: u64,
}

impl ReplaySource {
    /// Scan the replay directory. Fails when the directory is missing or
    /// holds no `.rgba` files, so the caller can fall back to another
    /// driving mode.
    pub fn new(config: ReplayConfig) -> Result<Self> {
        let entries = std::fs::read_dir(&config.dir)
            .with_context(|| format!("replay directory {} unreadable", config.dir.display()))?;
        let mut frames: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file() && path.extension().map(|ext| ext == "rgba").unwrap_or(false)
            })
            .collect();
        frames.sort();

        if frames.is_empty() {
            return Err(anyhow!(
                "replay directory {} holds no .rgba frames",
                config.dir.display()
            ));
        }

        Ok(Self {
            config,
            frames,
            index: 0,
            frames_captured: 0,
        })
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn target_fps(&self) -> u32 {
        self.config.target_fps
    }
}

impl FrameSource for ReplaySource {
    fn connect(&mut self) -> Result<()> {
        log::info!(
            "ReplaySource: {} frames from {}",
            self.frames.len(),
            self.config.dir.display()
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let path = &self.frames[self.index];
        self.index = (self.index + 1) % self.frames.len();

        let data = std::fs::read(path)
            .with_context(|| format!("failed to read replay frame {}", path.display()))?;
        let expected = self.config.width as usize * self.config.height as usize * 4;
        if data.len() < expected {
            return Err(anyhow!(
                "replay frame {} truncated: {} of {} bytes",
                path.display(),
                data.len(),
                expected
            ));
        }

        self.frames_captured += 1;
        Ok(Frame::new(
            data,
            self.config.width,
            self.config.height,
            now_ms()?,
        ))
    }

    fn is_healthy(&self) -> bool {
        !self.frames.is_empty()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frames_captured,
            source: self.config.dir.display().to_string(),
        }
    }
}
