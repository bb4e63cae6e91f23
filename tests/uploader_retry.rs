//! Uploader delivery semantics against a scripted transport: flush worker
//! lifecycle, retry with backoff, and payload preservation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use hazard_kernel::transport::{
    CredentialStore, TelemetryTransport, Uploader, UploaderSettings,
};
use hazard_kernel::{
    AlertGate, GeoPoint, HazardDetection, PipelineStatus, PipelineSummary, SharedContext,
    WeatherSample,
};

struct ScriptedTransport {
    fail_remaining: AtomicUsize,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedTransport {
    fn new(fail_times: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_remaining: AtomicUsize::new(fail_times),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

struct Handle(Arc<ScriptedTransport>);

impl TelemetryTransport for Handle {
    fn post(&self, url: &str, _body: &str, auth_header: &str) -> Result<()> {
        self.0
            .calls
            .lock()
            .unwrap()
            .push((url.to_string(), auth_header.to_string()));
        if self
            .0
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("scripted failure");
        }
        Ok(())
    }
}

fn context() -> SharedContext {
    SharedContext::new(
        GeoPoint {
            lat: 43.6532,
            lon: -79.3832,
        },
        5.0,
        WeatherSample {
            visibility_m: Some(9000.0),
            precipitation_mm: Some(0.0),
            condition: Some("Clear".to_string()),
        },
    )
}

fn uploader(transport: Arc<ScriptedTransport>) -> Uploader {
    let mut settings = UploaderSettings::new(
        Some("http://backend.test".to_string()),
        "it-device".to_string(),
    );
    settings.flush_interval_ms = 20;
    Uploader::with_transport(
        settings,
        AlertGate::default(),
        context(),
        CredentialStore::new(None, Some("it-secret".to_string())),
        Box::new(Handle(transport)),
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

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn happy_path_drains_and_stops_worker() {
    let transport = ScriptedTransport::new(0);
    let up = uploader(transport.clone());

    up.enqueue_frame_telemetry(&PipelineSummary {
        status: PipelineStatus::Running,
        fps: 11.5,
        last_updated_ms: Some(1_000),
    });
    up.enqueue_hazard_event(&detection(0.9));

    assert!(wait_until(Duration::from_secs(2), || up.queue_depths() == (0, 0)));

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0, "http://backend.test/v1/ingest/frame");
    assert_eq!(calls[1].0, "http://backend.test/v1/ingest/event");
    for (_, header) in &calls {
        assert!(header.starts_with("Device device_id=it-device,ts="));
        assert!(header.contains(",sig="));
    }
    up.shutdown();
}

#[test]
fn failed_delivery_retries_after_backoff_and_preserves_payload() {
    let transport = ScriptedTransport::new(1);
    let up = uploader(transport.clone());

    up.enqueue_hazard_event(&detection(0.9));

    // First attempt fails fast; the retry must wait out the 500 ms base
    // backoff before the event finally lands.
    let started = Instant::now();
    assert!(wait_until(Duration::from_secs(3), || up.queue_depths() == (0, 0)));
    let elapsed = started.elapsed();

    let calls = transport.calls();
    assert_eq!(calls.len(), 2, "one failure plus one successful retry");
    assert!(
        elapsed >= Duration::from_millis(450),
        "retry arrived before the backoff window ({elapsed:?})"
    );
    up.shutdown();
}

#[test]
fn worker_restarts_after_draining() {
    let transport = ScriptedTransport::new(0);
    let up = uploader(transport.clone());

    up.enqueue_hazard_event(&detection(0.9));
    assert!(wait_until(Duration::from_secs(2), || up.queue_depths() == (0, 0)));

    // Queue drained, worker stopped; a later enqueue must revive it.
    up.enqueue_hazard_event(&detection(0.8));
    assert!(wait_until(Duration::from_secs(2), || {
        transport.calls().len() == 2
    }));
    up.shutdown();
}
