//! Read-side backend client.
//!
//! Thin typed wrappers over the hazard-cluster and safe-route query
//! endpoints. Route scoring itself happens on the backend; this client
//! only fetches and decodes.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::GeoPoint;

const DEFAULT_CLUSTER_RADIUS_M: u32 = 800;
const DEFAULT_CLUSTER_SINCE_MIN: u32 = 1440;
const DEFAULT_CLUSTER_LIMIT: u32 = 50;

/// Options for `GET /v1/hazards/clustered`.
#[derive(Clone, Debug)]
pub struct ClusterQuery {
    pub radius_m: u32,
    pub since_minutes: u32,
    pub limit: u32,
    pub classes: Vec<String>,
}

impl Default for ClusterQuery {
    fn default() -> Self {
        Self {
            radius_m: DEFAULT_CLUSTER_RADIUS_M,
            since_minutes: DEFAULT_CLUSTER_SINCE_MIN,
            limit: DEFAULT_CLUSTER_LIMIT,
            classes: Vec::new(),
        }
    }
}

/// GeoJSON FeatureCollection, decoded only as deep as consumers need.
#[derive(Clone, Debug, Deserialize)]
pub struct ClusterCollection {
    #[serde(default)]
    pub features: Vec<ClusterFeature>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ClusterFeature {
    #[serde(default)]
    pub properties: serde_json::Value,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct HazardScore {
    #[serde(default)]
    pub cluster_count: u64,
    #[serde(default)]
    pub cluster_weight: f64,
}

#[derive(Clone, Debug, Deserialize)]
struct RouteLeg {
    distance: f64,
    duration: f64,
    hazard_score: Option<HazardScore>,
}

#[derive(Clone, Debug, Deserialize)]
struct SafeRouteResponse {
    best: Option<RouteLeg>,
    #[serde(default)]
    alternatives: Vec<RouteLeg>,
}

/// One scored route candidate.
#[derive(Clone, Debug)]
pub struct RouteCandidate {
    pub distance_m: f64,
    pub duration_s: f64,
    pub hazard: HazardScore,
}

#[derive(Clone, Debug)]
pub struct SafeRouteSummary {
    pub best: RouteCandidate,
    pub alternatives: Vec<RouteCandidate>,
}

pub struct RoutesClient {
    base_url: String,
    timeout: Duration,
}

impl RoutesClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Fetch nearby hazard clusters around `origin`.
    pub fn hazard_clusters(
        &self,
        origin: GeoPoint,
        query: &ClusterQuery,
    ) -> Result<ClusterCollection> {
        let mut request = ureq::get(&format!("{}/v1/hazards/clustered", self.base_url))
            .timeout(self.timeout)
            .query("lat", &origin.lat.to_string())
            .query("lon", &origin.lon.to_string())
            .query("r", &query.radius_m.max(1).to_string())
            .query("since_min", &query.since_minutes.max(1).to_string())
            .query("limit", &query.limit.max(1).to_string());
        if !query.classes.is_empty() {
            request = request.query("classes", &query.classes.join(","));
        }

        let body = request
            .call()
            .context("hazard cluster request failed")?
            .into_string()
            .context("hazard cluster response unreadable")?;
        serde_json::from_str(&body).context("hazard cluster response was not GeoJSON")
    }

    /// Fetch the backend's safest route between two points. Returns `None`
    /// when the backend has no scored candidate.
    pub fn safe_route(
        &self,
        origin: GeoPoint,
        destination: GeoPoint,
    ) -> Result<Option<SafeRouteSummary>> {
        let body = ureq::get(&format!("{}/v1/routes/safe", self.base_url))
            .timeout(self.timeout)
            .query("lat1", &origin.lat.to_string())
            .query("lon1", &origin.lon.to_string())
            .query("lat2", &destination.lat.to_string())
            .query("lon2", &destination.lon.to_string())
            .call()
            .context("safe route request failed")?
            .into_string()
            .context("safe route response unreadable")?;
        let response: SafeRouteResponse =
            serde_json::from_str(&body).context("safe route response malformed")?;

        let Some(best) = response.best else {
            return Ok(None);
        };
        let best = to_candidate(best);
        let alternatives = response
            .alternatives
            .into_iter()
            .map(to_candidate)
            .filter(|candidate| !same_candidate(candidate, &best))
            .collect();

        Ok(Some(SafeRouteSummary { best, alternatives }))
    }
}

fn to_candidate(leg: RouteLeg) -> RouteCandidate {
    RouteCandidate {
        distance_m: leg.distance,
        duration_s: leg.duration,
        hazard: leg.hazard_score.unwrap_or_default(),
    }
}

fn same_candidate(a: &RouteCandidate, b: &RouteCandidate) -> bool {
    (a.distance_m - b.distance_m).abs() < 1.0
        && (a.duration_s - b.duration_s).abs() < 1.0
        && (a.hazard.cluster_weight - b.hazard.cluster_weight).abs() < 1e-3
}
