//! Hazard perception kernel.
//!
//! This crate implements the on-device core of a road-hazard perception
//! system: camera frames flow through a three-stage inference pipeline
//! (detection, segmentation, depth), get fused into a per-frame risk score,
//! and leave the device as signed, retried telemetry.
//!
//! # Architecture
//!
//! - `frame`: frame container and the bounded drop-oldest ingest queue
//! - `ingest`: frame sources (raw-RGBA replay, synthetic)
//! - `model`: model provider, per-stage session traits, tensor conversion
//! - `pipeline`: the engine that orchestrates the three stages + risk fusion
//! - `scheduler`: drives the engine (or the synthetic demo loop) and fans
//!   results out to subscribers
//! - `gate`: alert suppression thresholds, single source of truth
//! - `transport`: payload types, device auth, uploader with backoff
//!
//! The capture context and the processing context are independent; the
//! ingest queue is the only structure shared between them, and it never
//! blocks the producer.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod frame;
pub mod gate;
pub mod ingest;
pub mod model;
pub mod pipeline;
pub mod scheduler;
pub mod transport;

pub use frame::{Frame, FrameIngestQueue, FRAME_QUEUE_CAPACITY};
pub use gate::{AlertGate, AlertThresholds, GateStatus};
pub use model::{ModelKey, ModelProvider, StubModelProvider};
pub use pipeline::{
    EngineState, HazardDetection, PipelineEngine, PipelineStatus, PipelineSummary,
};
pub use scheduler::{FrameScheduler, SubscriptionId};
pub use transport::{Uploader, UploaderSettings};

// -------------------- Shared Telemetry Context --------------------

/// Device position in WGS84 degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Most recent weather observation. Fields are optional because the
/// upstream provider may omit any of them; consumers fall back to the
/// configured defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherSample {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility_m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precipitation_mm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Read-only view of the shared context at one instant.
#[derive(Clone, Debug)]
pub struct ContextSnapshot {
    pub geo: GeoPoint,
    pub speed_mps: f64,
    pub weather: WeatherSample,
}

/// Mutable device state (geo, speed, weather) shared across risk
/// computation, gating, and the uploader.
///
/// Single-writer: exactly one component (the daemon's sensor feed) calls
/// the setters; everyone else takes `snapshot()` and works on the copy.
#[derive(Clone)]
pub struct SharedContext {
    inner: Arc<Mutex<ContextSnapshot>>,
}

impl SharedContext {
    pub fn new(geo: GeoPoint, speed_mps: f64, weather: WeatherSample) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ContextSnapshot {
                geo,
                speed_mps,
                weather,
            })),
        }
    }

    pub fn set_geo(&self, geo: GeoPoint) {
        if let Ok(mut state) = self.inner.lock() {
            state.geo = geo;
        }
    }

    pub fn set_speed(&self, speed_mps: f64) {
        if let Ok(mut state) = self.inner.lock() {
            state.speed_mps = speed_mps;
        }
    }

    pub fn set_weather(&self, weather: WeatherSample) {
        if let Ok(mut state) = self.inner.lock() {
            state.weather = weather;
        }
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        match self.inner.lock() {
            Ok(state) => state.clone(),
            // A poisoned lock must not take down the processing loop.
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

// -------------------- Device ID Discipline --------------------

/// A conforming device_id is a short local identifier, not free-form text.
/// It ends up verbatim inside the auth header and event payloads, so we
/// enforce a positive allowlist.
///
/// Allowed: "ios-demo", "unit_042", "curb.cam.3"
pub fn validate_device_id(device_id: &str) -> Result<()> {
    static DEVICE_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re =
        DEVICE_ID_RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9][a-z0-9._-]{0,63}$").unwrap());

    if !re.is_match(device_id) {
        return Err(anyhow!("device_id must match ^[a-z0-9][a-z0-9._-]{{0,63}}$"));
    }
    Ok(())
}

// -------------------- Correlation IDs --------------------

/// Locally-generated correlation id attached to every outgoing payload.
pub fn new_frame_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("frame-{}", hex::encode(bytes))
}

// -------------------- Clock Helpers --------------------

pub(crate) fn now_ms() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as u64)
}

pub(crate) fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}
