//! Telemetry uploader.
//!
//! Two FIFO queues (periodic frame summaries, per-detection hazard
//! events), signed delivery, and exponential-backoff retry. The flush
//! worker wakes at a fixed interval, sends at most one item from each
//! queue per tick, and stops itself once both queues drain; the next
//! enqueue restarts it. A failed delivery goes back to the FRONT of its
//! originating queue so newer items never overtake a failed one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};

use super::auth::device_auth_header_now;
use super::credentials::CredentialStore;
use super::{EventPayload, FrameMeta, FramePayload, EVENT_INGEST_PATH, FRAME_INGEST_PATH};
use crate::gate::AlertGate;
use crate::pipeline::{HazardDetection, PipelineSummary};
use crate::{new_frame_id, SharedContext};

/// Flush worker cadence.
pub const FLUSH_INTERVAL_MS: u64 = 500;
/// First retry delay after a failure.
pub const BASE_RETRY_DELAY_MS: u64 = 500;
/// Backoff ceiling.
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;
/// Minimum spacing between accepted frame-telemetry items.
pub const FRAME_TELEMETRY_INTERVAL_MS: u64 = 1_000;
/// Hazard events below this fused risk never leave the device.
pub const EVENT_RISK_THRESHOLD: f64 = 0.6;

/// Delay before the retry following `consecutive_failures` prior failures:
/// 500, 1000, 2000, 4000, ... capped at 30000 ms.
pub fn retry_delay_ms(consecutive_failures: u32) -> u64 {
    let shift = consecutive_failures.min(16);
    BASE_RETRY_DELAY_MS
        .saturating_mul(1u64 << shift)
        .min(MAX_RETRY_DELAY_MS)
}

/// Delivery seam. The production implementation speaks HTTPS via `ureq`;
/// tests substitute a recording transport.
pub trait TelemetryTransport: Send + Sync {
    fn post(&self, url: &str, body: &str, auth_header: &str) -> Result<()>;
}

/// Blocking HTTP delivery.
pub struct HttpTransport {
    timeout: Duration,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryTransport for HttpTransport {
    fn post(&self, url: &str, body: &str, auth_header: &str) -> Result<()> {
        // Non-2xx statuses surface as errors and take the retry path.
        ureq::post(url)
            .timeout(self.timeout)
            .set("Content-Type", "application/json")
            .set("Authorization", auth_header)
            .send_string(body)
            .with_context(|| format!("POST {url} failed"))?;
        Ok(())
    }
}

/// Uploader tunables; defaults match the deployed backend contract.
#[derive(Clone, Debug)]
pub struct UploaderSettings {
    /// Base URL of the ingest backend. `None` disables uploads entirely.
    pub api_base_url: Option<String>,
    pub device_id: String,
    pub frame_interval_ms: u64,
    pub event_risk_threshold: f64,
    pub flush_interval_ms: u64,
}

impl UploaderSettings {
    pub fn new(api_base_url: Option<String>, device_id: String) -> Self {
        Self {
            api_base_url: api_base_url.filter(|url| !url.is_empty()),
            device_id,
            frame_interval_ms: FRAME_TELEMETRY_INTERVAL_MS,
            event_risk_threshold: EVENT_RISK_THRESHOLD,
            flush_interval_ms: FLUSH_INTERVAL_MS,
        }
    }
}

struct UploaderState {
    frame_queue: VecDeque<FramePayload>,
    event_queue: VecDeque<EventPayload>,
    last_frame_accepted: Option<Instant>,
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
    worker_running: bool,
    credentials: CredentialStore,
}

struct Shared {
    settings: UploaderSettings,
    state: Mutex<UploaderState>,
    transport: Box<dyn TelemetryTransport>,
    shutdown: AtomicBool,
}

pub struct Uploader {
    shared: Arc<Shared>,
    gate: AlertGate,
    context: SharedContext,
}

impl Uploader {
    pub fn new(
        settings: UploaderSettings,
        gate: AlertGate,
        context: SharedContext,
        credentials: CredentialStore,
    ) -> Self {
        Self::with_transport(settings, gate, context, credentials, Box::new(HttpTransport::new()))
    }

    pub fn with_transport(
        settings: UploaderSettings,
        gate: AlertGate,
        context: SharedContext,
        credentials: CredentialStore,
        transport: Box<dyn TelemetryTransport>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                state: Mutex::new(UploaderState {
                    frame_queue: VecDeque::new(),
                    event_queue: VecDeque::new(),
                    last_frame_accepted: None,
                    consecutive_failures: 0,
                    backoff_until: None,
                    worker_running: false,
                    credentials,
                }),
                transport,
                shutdown: AtomicBool::new(false),
            }),
            gate,
            context,
        }
    }

    /// Queue a periodic frame summary. Silently refused when uploads are
    /// disabled or when the last accepted item is too recent.
    pub fn enqueue_frame_telemetry(&self, summary: &PipelineSummary) {
        if self.shared.settings.api_base_url.is_none() {
            return;
        }
        let snapshot = self.context.snapshot();
        let payload = FramePayload {
            frame_id: new_frame_id(),
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            geo: snapshot.geo,
            speed_mps: snapshot.speed_mps,
            weather: snapshot.weather,
            meta: FrameMeta {
                fps: summary.fps,
                status: summary.status.as_str().to_string(),
            },
        };

        {
            let mut state = self.lock_state();
            let interval = Duration::from_millis(self.shared.settings.frame_interval_ms);
            if let Some(last) = state.last_frame_accepted {
                if last.elapsed() < interval {
                    return;
                }
            }
            state.last_frame_accepted = Some(Instant::now());
            state.frame_queue.push_back(payload);
        }
        self.ensure_worker();
    }

    /// Queue a hazard event. Refused below the risk threshold or while the
    /// alert gate reports suppression.
    pub fn enqueue_hazard_event(&self, detection: &HazardDetection) {
        if self.shared.settings.api_base_url.is_none() {
            return;
        }
        if detection.risk < self.shared.settings.event_risk_threshold {
            return;
        }
        let snapshot = self.context.snapshot();
        let gate = self.gate.evaluate_snapshot(&snapshot);
        if gate.suppressed {
            log::debug!("hazard event gated: {}", gate.reasons.join("; "));
            return;
        }

        let payload = EventPayload {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            device_id: self.shared.settings.device_id.clone(),
            geo: snapshot.geo,
            class_: detection.class_label.clone(),
            score: (detection.risk + 0.2).clamp(0.0, 1.0),
            bbox_xyxy: [
                detection.x,
                detection.y,
                detection.x + detection.width,
                detection.y + detection.height,
            ],
            depth_m: detection.depth_m,
            lane_offset_m: detection.lane_offset,
            ttc_s: detection.ttc_s,
            risk: detection.risk,
            frame_id: new_frame_id(),
        };

        self.lock_state().event_queue.push_back(payload);
        self.ensure_worker();
    }

    /// (frame queue depth, event queue depth); diagnostics and tests.
    pub fn queue_depths(&self) -> (usize, usize) {
        let state = self.lock_state();
        (state.frame_queue.len(), state.event_queue.len())
    }

    /// Stop the flush worker at its next wakeup. Queued payloads stay in
    /// memory; they are not durable across process exit by design.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, UploaderState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_worker(&self) {
        {
            let mut state = self.lock_state();
            if state.worker_running {
                return;
            }
            state.worker_running = true;
        }
        self.shared.shutdown.store(false, Ordering::SeqCst);

        let shared = self.shared.clone();
        thread::spawn(move || {
            let interval = Duration::from_millis(shared.settings.flush_interval_ms.max(1));
            loop {
                thread::sleep(interval);
                if shared.shutdown.load(Ordering::SeqCst) {
                    shared
                        .state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .worker_running = false;
                    break;
                }
                if !flush_tick(&shared) {
                    break;
                }
            }
        });
    }
}

/// One flush pass. Returns false when the worker should stop (queues
/// drained, or uploads disabled for lack of a secret).
fn flush_tick(shared: &Shared) -> bool {
    let Some(base_url) = shared.settings.api_base_url.as_deref() else {
        let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.worker_running = false;
        return false;
    };

    let (frame, event, header) = {
        let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.frame_queue.is_empty() && state.event_queue.is_empty() {
            state.worker_running = false;
            return false;
        }
        if let Some(until) = state.backoff_until {
            if Instant::now() < until {
                return true;
            }
            state.backoff_until = None;
        }
        let Some(secret) = state.credentials.resolve().map(str::to_owned) else {
            log::warn!("device secret missing; uploads disabled until next enqueue");
            state.worker_running = false;
            return false;
        };
        let header = match device_auth_header_now(&shared.settings.device_id, &secret) {
            Ok(signature) => signature.header,
            Err(e) => {
                log::warn!("device auth header unavailable: {e:#}");
                return true;
            }
        };
        (
            state.frame_queue.pop_front(),
            state.event_queue.pop_front(),
            header,
        )
    };

    if let Some(payload) = frame {
        match serde_json::to_string(&payload) {
            Ok(body) => {
                let url = format!("{base_url}{FRAME_INGEST_PATH}");
                let delivered = shared.transport.post(&url, &body, &header);
                record_outcome(shared, delivered, || {
                    shared
                        .state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .frame_queue
                        .push_front(payload);
                });
            }
            Err(e) => log::error!("frame payload serialization failed, dropping: {}", e),
        }
    }

    if let Some(payload) = event {
        match serde_json::to_string(&payload) {
            Ok(body) => {
                let url = format!("{base_url}{EVENT_INGEST_PATH}");
                let delivered = shared.transport.post(&url, &body, &header);
                record_outcome(shared, delivered, || {
                    shared
                        .state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .event_queue
                        .push_front(payload);
                });
            }
            Err(e) => log::error!("event payload serialization failed, dropping: {}", e),
        }
    }

    true
}

fn record_outcome(shared: &Shared, delivered: Result<()>, requeue_front: impl FnOnce()) {
    match delivered {
        Ok(()) => {
            shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .consecutive_failures = 0;
        }
        Err(e) => {
            requeue_front();
            let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            let delay = retry_delay_ms(state.consecutive_failures);
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.backoff_until = Some(Instant::now() + Duration::from_millis(delay));
            log::warn!("telemetry delivery failed (retry in {} ms): {e:#}", delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineStatus;
    use crate::{GeoPoint, WeatherSample};
    use std::sync::atomic::AtomicUsize;

    struct MockTransport {
        fail_remaining: AtomicUsize,
        calls: Mutex<Vec<(String, String, String)>>,
    }

    impl MockTransport {
        fn new(fail_times: usize) -> Arc<Self> {
            Arc::new(Self {
                fail_remaining: AtomicUsize::new(fail_times),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    struct MockHandle(Arc<MockTransport>);

    impl TelemetryTransport for MockHandle {
        fn post(&self, url: &str, body: &str, auth_header: &str) -> Result<()> {
            self.0
                .calls
                .lock()
                .unwrap()
                .push((url.to_string(), body.to_string(), auth_header.to_string()));
            let remaining = self.0.fail_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.0.fail_remaining.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("synthetic transport failure");
            }
            Ok(())
        }
    }

    fn context(speed_mps: f64) -> SharedContext {
        SharedContext::new(
            GeoPoint {
                lat: 43.6532,
                lon: -79.3832,
            },
            speed_mps,
            WeatherSample {
                visibility_m: Some(9000.0),
                precipitation_mm: Some(0.0),
                condition: Some("Clear".to_string()),
            },
        )
    }

    fn uploader_with(transport: Arc<MockTransport>, speed_mps: f64) -> Uploader {
        Uploader::with_transport(
            UploaderSettings::new(
                Some("http://backend.test".to_string()),
                "test-device".to_string(),
            ),
            AlertGate::default(),
            context(speed_mps),
            CredentialStore::new(None, Some("unit-secret".to_string())),
            Box::new(MockHandle(transport)),
        )
    }

    fn detection(risk: f64) -> HazardDetection {
        HazardDetection {
            id: "pothole-1".to_string(),
            x: 10.0,
            y: 20.0,
            width: 100.0,
            height: 80.0,
            depth_m: 4.3,
            risk,
            class_label: "pothole".to_string(),
            lane_offset: 0.2,
            ttc_s: 0.86,
        }
    }

    fn summary() -> PipelineSummary {
        PipelineSummary {
            status: PipelineStatus::Running,
            fps: 11.5,
            last_updated_ms: Some(1_000),
        }
    }

    #[test]
    fn backoff_sequence_matches_contract() {
        assert_eq!(retry_delay_ms(0), 500);
        assert_eq!(retry_delay_ms(1), 1_000);
        assert_eq!(retry_delay_ms(2), 2_000);
        assert_eq!(retry_delay_ms(3), 4_000);
        assert_eq!(retry_delay_ms(7), 30_000);
        assert_eq!(retry_delay_ms(60), 30_000);
    }

    #[test]
    fn risk_below_threshold_is_never_enqueued() {
        let transport = MockTransport::new(0);
        let uploader = uploader_with(transport, 5.0);
        uploader.enqueue_hazard_event(&detection(0.59));
        assert_eq!(uploader.queue_depths(), (0, 0));

        uploader.enqueue_hazard_event(&detection(0.6));
        assert_eq!(uploader.queue_depths().1, 1);
        uploader.shutdown();
    }

    #[test]
    fn suppressed_gate_blocks_events() {
        let transport = MockTransport::new(0);
        // 20 m/s is over the speed gate.
        let uploader = uploader_with(transport, 20.0);
        uploader.enqueue_hazard_event(&detection(0.9));
        assert_eq!(uploader.queue_depths(), (0, 0));
    }

    #[test]
    fn frame_telemetry_is_rate_limited() {
        let transport = MockTransport::new(0);
        let uploader = uploader_with(transport, 5.0);
        uploader.enqueue_frame_telemetry(&summary());
        uploader.enqueue_frame_telemetry(&summary());
        assert_eq!(uploader.queue_depths().0, 1);
        uploader.shutdown();
    }

    #[test]
    fn flush_delivers_one_item_per_queue_with_auth() {
        let transport = MockTransport::new(0);
        let uploader = uploader_with(transport.clone(), 5.0);
        uploader.enqueue_frame_telemetry(&summary());
        uploader.enqueue_hazard_event(&detection(0.9));
        uploader.shutdown(); // keep the background worker out of the way

        assert!(flush_tick(&uploader.shared));
        assert_eq!(uploader.queue_depths(), (0, 0));

        let calls = transport.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "http://backend.test/v1/ingest/frame");
        assert_eq!(calls[1].0, "http://backend.test/v1/ingest/event");
        for (_, body, header) in calls.iter() {
            assert!(header.starts_with("Device device_id=test-device,ts="));
            assert!(body.starts_with('{'));
        }

        // Both queues drained: the next tick reports stop.
        drop(calls);
        assert!(!flush_tick(&uploader.shared));
    }

    #[test]
    fn failed_delivery_requeues_at_front_and_backs_off() {
        let transport = MockTransport::new(1);
        let uploader = uploader_with(transport.clone(), 5.0);
        uploader.enqueue_hazard_event(&detection(0.9));
        uploader.enqueue_hazard_event(&detection(0.7));
        uploader.shutdown();

        // Work around the 1 s frame rate limit: only events queued here.
        assert_eq!(uploader.queue_depths().1, 2);

        assert!(flush_tick(&uploader.shared));
        // Failure: the first event is back at the front, nothing lost.
        assert_eq!(uploader.queue_depths().1, 2);
        {
            let state = uploader.lock_state();
            assert_eq!(state.consecutive_failures, 1);
            assert!(state.backoff_until.is_some());
            let front_risk = state.event_queue.front().map(|p| p.risk);
            assert_eq!(front_risk, Some(0.9));
        }

        // Still inside the backoff window: tick is a no-op.
        let before = transport.call_count();
        assert!(flush_tick(&uploader.shared));
        assert_eq!(transport.call_count(), before);

        // Force the window shut and retry: success resets the counter.
        uploader.lock_state().backoff_until = None;
        assert!(flush_tick(&uploader.shared));
        assert_eq!(uploader.queue_depths().1, 1);
        assert_eq!(uploader.lock_state().consecutive_failures, 0);
    }

    #[test]
    fn missing_secret_disables_uploads_without_losing_payloads() {
        let transport = MockTransport::new(0);
        let uploader = Uploader::with_transport(
            UploaderSettings::new(
                Some("http://backend.test".to_string()),
                "test-device".to_string(),
            ),
            AlertGate::default(),
            context(5.0),
            CredentialStore::new(None, None),
            Box::new(MockHandle(transport.clone())),
        );
        uploader.enqueue_hazard_event(&detection(0.9));
        uploader.shutdown();

        assert!(!flush_tick(&uploader.shared));
        assert_eq!(transport.call_count(), 0);
        // Payload preserved for when credentials appear.
        assert_eq!(uploader.queue_depths().1, 1);
        assert!(!uploader.lock_state().worker_running);
    }

    #[test]
    fn disabled_base_url_refuses_everything() {
        let transport = MockTransport::new(0);
        let uploader = Uploader::with_transport(
            UploaderSettings::new(None, "test-device".to_string()),
            AlertGate::default(),
            context(5.0),
            CredentialStore::new(None, Some("secret".to_string())),
            Box::new(MockHandle(transport)),
        );
        uploader.enqueue_frame_telemetry(&summary());
        uploader.enqueue_hazard_event(&detection(0.9));
        assert_eq!(uploader.queue_depths(), (0, 0));
    }

    #[test]
    fn event_score_is_risk_plus_margin_clamped() {
        let transport = MockTransport::new(0);
        let uploader = uploader_with(transport, 5.0);
        uploader.enqueue_hazard_event(&detection(0.95));
        uploader.shutdown();
        let state = uploader.lock_state();
        let payload = state.event_queue.front().expect("queued event");
        assert!((payload.score - 1.0).abs() < 1e-9);
        assert!((payload.risk - 0.95).abs() < 1e-9);
        assert_eq!(
            payload.bbox_xyxy,
            [10.0, 20.0, 110.0, 100.0]
        );
    }
}
