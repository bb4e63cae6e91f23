//! hazardd - hazard perception daemon
//!
//! This daemon:
//! 1. Ingests frames from a replay source (or synthesizes demo output)
//! 2. Buffers frames in the bounded drop-oldest ingest queue
//! 3. Drives the three-stage pipeline engine and risk fusion
//! 4. Fans results out to the telemetry uploader and the local HUD log
//! 5. Delivers signed telemetry with exponential-backoff retry

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use clap::Parser;

use hazard_kernel::config::HazarddConfig;
use hazard_kernel::ingest::{FrameSource, ReplayConfig, ReplaySource};
use hazard_kernel::model::DiskModelProvider;
use hazard_kernel::transport::routes::{ClusterQuery, RoutesClient};
use hazard_kernel::transport::CredentialStore;
use hazard_kernel::{
    AlertGate, FrameIngestQueue, FrameScheduler, HazardDetection, ModelKey, PipelineEngine,
    PipelineStatus, SharedContext, Uploader, UploaderSettings,
};

/// Minimum spacing between submitted hazard events.
const EVENT_PACING_MS: u64 = 5_000;
/// Processing loop cadence for draining the ingest queue.
const DRAIN_TICK_MS: u64 = 33;
/// Telemetry heartbeat log cadence.
const HEARTBEAT_MS: u64 = 5_000;
/// Hazard-cluster probe cadence.
const CLUSTER_PROBE_MS: u64 = 60_000;

#[derive(Parser)]
#[command(name = "hazardd", about = "On-device hazard perception daemon")]
struct Cli {
    /// JSON config file (falls back to the HAZARD_CONFIG env var).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Replay directory override.
    #[arg(long)]
    replay_dir: Option<PathBuf>,

    /// Skip model initialization and run the synthetic demo loop.
    #[arg(long)]
    demo: bool,
}

#[derive(Default)]
struct HudState {
    fps: f64,
    status: PipelineStatus,
    top: Option<HazardDetection>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut cfg = HazarddConfig::load_from(cli.config.as_deref())?;
    if let Some(dir) = cli.replay_dir {
        cfg.replay.dir = Some(dir);
    }

    let context = SharedContext::new(
        cfg.default_geo,
        cfg.default_speed_mps,
        cfg.default_weather.clone(),
    );
    let gate = AlertGate::new(cfg.alerts);

    let engine = Arc::new(Mutex::new(PipelineEngine::new(cfg.models.classes.clone())));
    let engine_ready = if cli.demo {
        false
    } else {
        let mut provider =
            DiskModelProvider::new(cfg.models.dir.clone(), cfg.models.classes.len());
        if let Some(path) = &cfg.models.detector {
            provider = provider.with_override(ModelKey::Detector, path.clone());
        }
        if let Some(path) = &cfg.models.segmenter {
            provider = provider.with_override(ModelKey::Segmenter, path.clone());
        }
        if let Some(path) = &cfg.models.depth {
            provider = provider.with_override(ModelKey::Depth, path.clone());
        }
        engine
            .lock()
            .map_err(|_| anyhow!("engine lock poisoned"))?
            .initialize(&provider)
    };

    let scheduler = Arc::new(FrameScheduler::new(engine.clone(), context.clone()));

    let mut settings = UploaderSettings::new(cfg.api_base_url.clone(), cfg.device_id.clone());
    settings.frame_interval_ms = cfg.frame_interval_ms;
    settings.event_risk_threshold = cfg.event_risk_threshold;
    let credentials =
        CredentialStore::new(cfg.device_secret_path.clone(), cfg.device_secret.clone());
    let uploader = Arc::new(Uploader::new(settings, gate, context.clone(), credentials));

    // Telemetry consumer: every notification becomes frame telemetry; the
    // top detection becomes a hazard event at most once per pacing window.
    let uploader_sub = uploader.clone();
    let last_event: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
    scheduler.subscribe(move |detections, summary| {
        if summary.last_updated_ms.is_none() {
            return;
        }
        uploader_sub.enqueue_frame_telemetry(summary);
        let Some(top) = detections.first() else {
            return;
        };
        let mut last = last_event.lock().unwrap_or_else(PoisonError::into_inner);
        let due = last
            .map(|at| at.elapsed() >= Duration::from_millis(EVENT_PACING_MS))
            .unwrap_or(true);
        if due {
            uploader_sub.enqueue_hazard_event(top);
            if top.risk > 0.0 {
                *last = Some(Instant::now());
            }
        }
    });

    // HUD stand-in: remember the latest fan-out for the heartbeat log.
    let hud: Arc<Mutex<HudState>> = Arc::new(Mutex::new(HudState::default()));
    let hud_sub = hud.clone();
    scheduler.subscribe(move |detections, summary| {
        let mut state = hud_sub.lock().unwrap_or_else(PoisonError::into_inner);
        state.fps = summary.fps;
        state.status = summary.status;
        state.top = detections.first().cloned();
    });

    let shutdown = Arc::new(AtomicBool::new(false));
    let ctrlc_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        ctrlc_flag.store(true, Ordering::SeqCst);
    })?;

    if let Some(base_url) = cfg.api_base_url.clone() {
        spawn_cluster_probe(base_url, context.clone(), shutdown.clone());
    }

    log::info!(
        "hazardd running. device_id={} engine_ready={} uploads={}",
        cfg.device_id,
        engine_ready,
        cfg.api_base_url.as_deref().unwrap_or("disabled")
    );

    let replay_source = if engine_ready {
        build_replay_source(&cfg)
    } else {
        None
    };

    let heartbeat = Heartbeat {
        hud: hud.clone(),
        gate,
        context: context.clone(),
        last: Instant::now(),
    };

    match replay_source {
        Some(source) => run_replay(source, &scheduler, &shutdown, heartbeat)?,
        None => run_demo(cfg.demo_interval_ms, &scheduler, &shutdown, heartbeat),
    }

    scheduler.stop();
    engine
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .dispose();
    uploader.shutdown();
    log::info!("hazardd stopped");
    Ok(())
}

fn build_replay_source(cfg: &HazarddConfig) -> Option<ReplaySource> {
    let dir = cfg.replay.dir.clone()?;
    match ReplaySource::new(ReplayConfig {
        dir,
        width: cfg.replay.width,
        height: cfg.replay.height,
        target_fps: cfg.replay.fps,
    }) {
        Ok(source) => Some(source),
        Err(e) => {
            log::warn!("replay unavailable, using demo loop: {e:#}");
            None
        }
    }
}

/// Live driving mode: a capture thread feeds the queue at the source rate
/// while this thread drains it and runs the engine, one frame at a time.
fn run_replay(
    mut source: ReplaySource,
    scheduler: &Arc<FrameScheduler>,
    shutdown: &Arc<AtomicBool>,
    mut heartbeat: Heartbeat,
) -> Result<()> {
    source.connect()?;
    let interval = Duration::from_millis(1_000 / u64::from(source.target_fps().max(1)));
    log::info!(
        "replay driving mode: {} frames at {} fps",
        source.frame_count(),
        source.target_fps()
    );

    let queue = Arc::new(FrameIngestQueue::new());
    let capture_queue = queue.clone();
    let capture_shutdown = shutdown.clone();
    let capture = thread::spawn(move || loop {
        if capture_shutdown.load(Ordering::SeqCst) {
            break;
        }
        match source.next_frame() {
            Ok(frame) => capture_queue.enqueue_frame(frame),
            Err(e) => log::warn!("replay frame skipped: {e:#}"),
        }
        thread::sleep(interval);
    });

    while !shutdown.load(Ordering::SeqCst) {
        for entry in queue.drain_all() {
            scheduler.process_frame(&entry.frame);
        }
        heartbeat.maybe_log();
        thread::sleep(Duration::from_millis(DRAIN_TICK_MS));
    }

    capture
        .join()
        .map_err(|_| anyhow!("capture thread panicked"))?;
    Ok(())
}

/// Fallback driving mode: the scheduler's synthetic demo loop keeps all
/// consumers alive while real inference is unavailable.
fn run_demo(
    interval_ms: u64,
    scheduler: &Arc<FrameScheduler>,
    shutdown: &Arc<AtomicBool>,
    mut heartbeat: Heartbeat,
) {
    scheduler.start_demo_loop(interval_ms);
    while !shutdown.load(Ordering::SeqCst) {
        heartbeat.maybe_log();
        thread::sleep(Duration::from_millis(200));
    }
}

struct Heartbeat {
    hud: Arc<Mutex<HudState>>,
    gate: AlertGate,
    context: SharedContext,
    last: Instant,
}

impl Heartbeat {
    fn maybe_log(&mut self) {
        if self.last.elapsed() < Duration::from_millis(HEARTBEAT_MS) {
            return;
        }
        self.last = Instant::now();

        let (fps, status, hazard_text) = {
            let state = self.hud.lock().unwrap_or_else(PoisonError::into_inner);
            let hazard_text = match &state.top {
                Some(h) => format!(
                    "{} risk={:.0}% depth={:.1}m",
                    h.class_label,
                    h.risk * 100.0,
                    h.depth_m
                ),
                None => "none".to_string(),
            };
            (state.fps, state.status, hazard_text)
        };
        let gate_status = self.gate.evaluate_snapshot(&self.context.snapshot());
        let gate_text = if gate_status.suppressed {
            format!("suppressed ({})", gate_status.reasons.join("; "))
        } else {
            "armed".to_string()
        };
        log::info!(
            "telemetry status={} fps={:.1} hazard={} gate={}",
            status.as_str(),
            fps,
            hazard_text,
            gate_text
        );
    }
}

/// Periodically log how many hazard clusters the backend reports nearby.
/// Runs on its own thread so a slow backend never stalls frame processing.
fn spawn_cluster_probe(base_url: String, context: SharedContext, shutdown: Arc<AtomicBool>) {
    thread::spawn(move || {
        let client = RoutesClient::new(base_url);
        let query = ClusterQuery::default();
        let mut next_probe = Instant::now();
        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            if Instant::now() >= next_probe {
                next_probe = Instant::now() + Duration::from_millis(CLUSTER_PROBE_MS);
                let geo = context.snapshot().geo;
                match client.hazard_clusters(geo, &query) {
                    Ok(clusters) => log::info!(
                        "{} hazard clusters within {} m",
                        clusters.features.len(),
                        query.radius_m
                    ),
                    Err(e) => log::debug!("hazard cluster probe failed: {e:#}"),
                }
            }
            thread::sleep(Duration::from_secs(1));
        }
    });
}
