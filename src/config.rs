//! hazardd configuration.
//!
//! Sources, in override order: JSON config file (path from the CLI or the
//! `HAZARD_CONFIG` env var), then `HAZARD_*` environment variables, then
//! validation. Missing pieces fall back to the defaults below.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::gate::AlertThresholds;
use crate::scheduler::DEMO_INTERVAL_MS;
use crate::transport::{EVENT_RISK_THRESHOLD, FRAME_TELEMETRY_INTERVAL_MS};
use crate::{validate_device_id, GeoPoint, WeatherSample};

const DEFAULT_DEVICE_ID: &str = "dev-unit";
const DEFAULT_MODEL_DIR: &str = "models";
const DEFAULT_REPLAY_WIDTH: u32 = 1280;
const DEFAULT_REPLAY_HEIGHT: u32 = 720;
const DEFAULT_REPLAY_FPS: u32 = 12;
const DEFAULT_GEO_LAT: f64 = 43.6532;
const DEFAULT_GEO_LON: f64 = -79.3832;
const DEFAULT_SPEED_MPS: f64 = 5.0;
const DEFAULT_VISIBILITY_M: f64 = 9000.0;

fn default_hazard_classes() -> Vec<String> {
    ["pothole", "debris", "cone", "lane_block", "flood", "ice"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Default)]
struct HazarddConfigFile {
    device_id: Option<String>,
    api: Option<ApiConfigFile>,
    models: Option<ModelConfigFile>,
    replay: Option<ReplayConfigFile>,
    alerts: Option<AlertConfigFile>,
    uploader: Option<UploaderConfigFile>,
    defaults: Option<DefaultsConfigFile>,
    demo_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    base_url: Option<String>,
    device_secret: Option<String>,
    device_secret_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    dir: Option<PathBuf>,
    detector: Option<PathBuf>,
    segmenter: Option<PathBuf>,
    depth: Option<PathBuf>,
    classes: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct ReplayConfigFile {
    dir: Option<PathBuf>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertConfigFile {
    max_speed_mps: Option<f64>,
    min_visibility_m: Option<f64>,
    max_precipitation_mm: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct UploaderConfigFile {
    event_risk_threshold: Option<f64>,
    frame_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DefaultsConfigFile {
    lat: Option<f64>,
    lon: Option<f64>,
    speed_mps: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub dir: PathBuf,
    pub detector: Option<PathBuf>,
    pub segmenter: Option<PathBuf>,
    pub depth: Option<PathBuf>,
    pub classes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReplaySettings {
    pub dir: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Debug, Clone)]
pub struct HazarddConfig {
    pub device_id: String,
    pub api_base_url: Option<String>,
    pub device_secret: Option<String>,
    pub device_secret_path: Option<PathBuf>,
    pub models: ModelSettings,
    pub replay: ReplaySettings,
    pub alerts: AlertThresholds,
    pub event_risk_threshold: f64,
    pub frame_interval_ms: u64,
    pub demo_interval_ms: u64,
    pub default_geo: GeoPoint,
    pub default_speed_mps: f64,
    pub default_weather: WeatherSample,
}

impl HazarddConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load with an explicit config file path (CLI override); falls back
    /// to `HAZARD_CONFIG`, then to pure defaults.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("HAZARD_CONFIG").ok();
        let file_cfg = match path {
            Some(p) => Some(read_config_file(p)?),
            None => match env_path.as_deref() {
                Some(p) => Some(read_config_file(Path::new(p))?),
                None => None,
            },
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: HazarddConfigFile) -> Self {
        let device_id = file
            .device_id
            .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string());
        let api = file.api.unwrap_or_default();
        let models_file = file.models.unwrap_or_default();
        let replay_file = file.replay.unwrap_or_default();
        let alerts_file = file.alerts.unwrap_or_default();
        let uploader_file = file.uploader.unwrap_or_default();
        let defaults_file = file.defaults.unwrap_or_default();

        let models = ModelSettings {
            dir: models_file
                .dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_DIR)),
            detector: models_file.detector,
            segmenter: models_file.segmenter,
            depth: models_file.depth,
            classes: models_file.classes.unwrap_or_else(default_hazard_classes),
        };
        let replay = ReplaySettings {
            dir: replay_file.dir,
            width: replay_file.width.unwrap_or(DEFAULT_REPLAY_WIDTH),
            height: replay_file.height.unwrap_or(DEFAULT_REPLAY_HEIGHT),
            fps: replay_file.fps.unwrap_or(DEFAULT_REPLAY_FPS),
        };
        let alerts = AlertThresholds {
            max_speed_mps: alerts_file
                .max_speed_mps
                .unwrap_or(AlertThresholds::default().max_speed_mps),
            min_visibility_m: alerts_file
                .min_visibility_m
                .unwrap_or(AlertThresholds::default().min_visibility_m),
            max_precipitation_mm: alerts_file
                .max_precipitation_mm
                .unwrap_or(AlertThresholds::default().max_precipitation_mm),
        };

        Self {
            device_id,
            api_base_url: api.base_url.filter(|url| !url.trim().is_empty()),
            device_secret: api.device_secret.filter(|s| !s.trim().is_empty()),
            device_secret_path: api.device_secret_path,
            models,
            replay,
            alerts,
            event_risk_threshold: uploader_file
                .event_risk_threshold
                .unwrap_or(EVENT_RISK_THRESHOLD),
            frame_interval_ms: uploader_file
                .frame_interval_ms
                .unwrap_or(FRAME_TELEMETRY_INTERVAL_MS),
            demo_interval_ms: file.demo_interval_ms.unwrap_or(DEMO_INTERVAL_MS),
            default_geo: GeoPoint {
                lat: defaults_file.lat.unwrap_or(DEFAULT_GEO_LAT),
                lon: defaults_file.lon.unwrap_or(DEFAULT_GEO_LON),
            },
            default_speed_mps: defaults_file.speed_mps.unwrap_or(DEFAULT_SPEED_MPS),
            default_weather: WeatherSample {
                visibility_m: Some(DEFAULT_VISIBILITY_M),
                precipitation_mm: Some(0.0),
                condition: Some("Clear".to_string()),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(base_url) = std::env::var("HAZARD_API_BASE_URL") {
            if !base_url.trim().is_empty() {
                self.api_base_url = Some(base_url);
            }
        }
        if let Ok(device_id) = std::env::var("HAZARD_DEVICE_ID") {
            if !device_id.trim().is_empty() {
                self.device_id = device_id;
            }
        }
        if let Ok(secret) = std::env::var("HAZARD_DEVICE_SECRET") {
            if !secret.trim().is_empty() {
                self.device_secret = Some(secret);
            }
        }
        if let Ok(path) = std::env::var("HAZARD_DEVICE_SECRET_PATH") {
            if !path.trim().is_empty() {
                self.device_secret_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(dir) = std::env::var("HAZARD_MODEL_DIR") {
            if !dir.trim().is_empty() {
                self.models.dir = PathBuf::from(dir);
            }
        }
        if let Ok(dir) = std::env::var("HAZARD_REPLAY_DIR") {
            if !dir.trim().is_empty() {
                self.replay.dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(threshold) = std::env::var("HAZARD_EVENT_RISK_THRESHOLD") {
            self.event_risk_threshold = threshold
                .parse()
                .map_err(|_| anyhow!("HAZARD_EVENT_RISK_THRESHOLD must be a number"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        validate_device_id(&self.device_id)?;
        if !(0.0..=1.0).contains(&self.event_risk_threshold) {
            return Err(anyhow!("event_risk_threshold must be within [0, 1]"));
        }
        if self.frame_interval_ms == 0 {
            return Err(anyhow!("frame_interval_ms must be greater than zero"));
        }
        if self.demo_interval_ms == 0 {
            return Err(anyhow!("demo_interval_ms must be greater than zero"));
        }
        if self.models.classes.is_empty() {
            return Err(anyhow!("at least one hazard class is required"));
        }
        if self.replay.width == 0 || self.replay.height == 0 || self.replay.fps == 0 {
            return Err(anyhow!("replay dimensions and fps must be non-zero"));
        }
        if self.alerts.min_visibility_m < 0.0 || self.alerts.max_precipitation_mm < 0.0 {
            return Err(anyhow!("alert thresholds must be non-negative"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<HazarddConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
