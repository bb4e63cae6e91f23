//! Telemetry transport layer.
//!
//! Wire payloads for the ingest endpoints, the HMAC device-auth header,
//! device-secret resolution, the retrying uploader, and a thin read-side
//! client for the hazard/route query endpoints.

pub mod auth;
pub mod credentials;
pub mod routes;
mod uploader;

pub use auth::{build_device_auth_header, device_auth_header_now, DeviceSignature};
pub use credentials::CredentialStore;
pub use routes::{HazardScore, RouteCandidate, RoutesClient, SafeRouteSummary};
pub use uploader::{
    retry_delay_ms, HttpTransport, TelemetryTransport, Uploader, UploaderSettings,
    BASE_RETRY_DELAY_MS, EVENT_RISK_THRESHOLD, FLUSH_INTERVAL_MS, FRAME_TELEMETRY_INTERVAL_MS,
    MAX_RETRY_DELAY_MS,
};

use serde::Serialize;

use crate::{GeoPoint, WeatherSample};

pub const FRAME_INGEST_PATH: &str = "/v1/ingest/frame";
pub const EVENT_INGEST_PATH: &str = "/v1/ingest/event";

/// Periodic frame-summary payload for `POST /v1/ingest/frame`.
#[derive(Clone, Debug, Serialize)]
pub struct FramePayload {
    pub frame_id: String,
    /// ISO-8601 / RFC 3339 timestamp.
    pub ts: String,
    pub geo: GeoPoint,
    pub speed_mps: f64,
    pub weather: WeatherSample,
    pub meta: FrameMeta,
}

#[derive(Clone, Debug, Serialize)]
pub struct FrameMeta {
    pub fps: f64,
    pub status: String,
}

/// Per-detection hazard payload for `POST /v1/ingest/event`.
#[derive(Clone, Debug, Serialize)]
pub struct EventPayload {
    pub ts: String,
    pub device_id: String,
    pub geo: GeoPoint,
    pub class_: String,
    pub score: f64,
    /// [x1, y1, x2, y2] in source-frame pixels.
    pub bbox_xyxy: [f64; 4],
    pub depth_m: f64,
    pub lane_offset_m: f64,
    pub ttc_s: f64,
    pub risk: f64,
    pub frame_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_payload_serializes_wire_field_names() {
        let payload = EventPayload {
            ts: "2026-08-05T12:00:00Z".to_string(),
            device_id: "ios-demo".to_string(),
            geo: GeoPoint {
                lat: 43.6532,
                lon: -79.3832,
            },
            class_: "pothole".to_string(),
            score: 0.9,
            bbox_xyxy: [10.0, 20.0, 110.0, 120.0],
            depth_m: 4.3,
            lane_offset_m: 0.2,
            ttc_s: 0.86,
            risk: 0.7,
            frame_id: "frame-0011223344556677".to_string(),
        };
        let json = serde_json::to_string(&payload).expect("serialize");
        assert!(json.contains("\"class_\":\"pothole\""));
        assert!(json.contains("\"bbox_xyxy\":[10.0,20.0,110.0,120.0]"));
        assert!(json.contains("\"device_id\":\"ios-demo\""));
    }

    #[test]
    fn frame_payload_omits_absent_weather_fields() {
        let payload = FramePayload {
            frame_id: "frame-aa".to_string(),
            ts: "2026-08-05T12:00:00Z".to_string(),
            geo: GeoPoint { lat: 0.0, lon: 0.0 },
            speed_mps: 5.0,
            weather: WeatherSample {
                visibility_m: Some(9000.0),
                precipitation_mm: None,
                condition: None,
            },
            meta: FrameMeta {
                fps: 11.5,
                status: "running".to_string(),
            },
        };
        let json = serde_json::to_string(&payload).expect("serialize");
        assert!(json.contains("\"visibility_m\":9000.0"));
        assert!(!json.contains("precipitation_mm"));
        assert!(json.contains("\"status\":\"running\""));
    }
}
