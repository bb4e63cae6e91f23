//! Frame scheduler.
//!
//! Pulls frames from the live/replay path, drives the engine, and fans
//! results out to subscribers through an explicit observer registry.
//! When real inference is unavailable the scheduler keeps consumers alive
//! with a synthetic demo loop instead.
//!
//! Exactly one driving mode is active at a time, live frame processing or
//! the demo loop; switching between them is the caller's responsibility.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crate::frame::Frame;
use crate::pipeline::{
    risk_score, HazardDetection, PipelineEngine, PipelineStatus, PipelineSummary, RiskInput,
};
use crate::{now_ms, SharedContext};

/// Default demo loop cadence.
pub const DEMO_INTERVAL_MS: u64 = 500;

const DEMO_CLASSES: [&str; 3] = ["pothole", "debris", "cone"];
const DEMO_SCORE: f64 = 0.7;
const DEMO_DEPTH_M: f64 = 4.3;
const DEMO_LANE_OFFSET: f64 = 0.2;
const DEMO_DEPTH_DELTA: f64 = 0.1;
const DEMO_FPS: f64 = 12.0;
const MIN_SPEED_MPS: f64 = 0.1;

pub type SubscriptionId = u64;

type Listener = Box<dyn Fn(&[HazardDetection], &PipelineSummary) + Send + 'static>;

struct Registry {
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_id: AtomicU64,
    last_updated_ms: Mutex<Option<u64>>,
    engine: Arc<Mutex<PipelineEngine>>,
    context: SharedContext,
}

impl Registry {
    fn emit(&self, detections: &[HazardDetection], summary: &PipelineSummary) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, listener) in listeners.iter() {
            listener(detections, summary);
        }
    }

    fn engine_ready(&self) -> bool {
        self.engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_ready()
    }

    fn set_last_updated(&self, ts_ms: u64) {
        *self
            .last_updated_ms
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(ts_ms);
    }

    fn last_updated(&self) -> Option<u64> {
        *self
            .last_updated_ms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

struct DemoLoop {
    cancel: Arc<AtomicBool>,
    join: thread::JoinHandle<()>,
}

pub struct FrameScheduler {
    registry: Arc<Registry>,
    demo: Mutex<Option<DemoLoop>>,
}

impl FrameScheduler {
    pub fn new(engine: Arc<Mutex<PipelineEngine>>, context: SharedContext) -> Self {
        Self {
            registry: Arc::new(Registry {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                last_updated_ms: Mutex::new(None),
                engine,
                context,
            }),
            demo: Mutex::new(None),
        }
    }

    /// Register a listener. Listeners are invoked synchronously on the
    /// processing thread, in registration order.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&[HazardDetection], &PipelineSummary) + Send + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Box::new(listener)));
        id
    }

    /// Remove a listener. Idempotent.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(existing, _)| *existing != id);
    }

    /// Feed one frame through the engine and notify subscribers on a
    /// result. A `None` result means the frame was silently dropped
    /// (engine not ready, conversion failure, or stage degradation);
    /// subscribers are not notified in that case.
    pub fn process_frame(&self, frame: &Frame) {
        let ctx = self.registry.context.snapshot();
        let output = {
            let mut engine = self
                .registry
                .engine
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            engine.process_frame(frame, &ctx)
        };
        let Some(output) = output else {
            return;
        };
        if let Some(ts) = output.summary.last_updated_ms {
            self.registry.set_last_updated(ts);
        }
        self.registry
            .emit(std::slice::from_ref(&output.detection), &output.summary);
    }

    /// Start the synthetic demo loop. No-op when already running.
    pub fn start_demo_loop(&self, interval_ms: u64) {
        let mut demo = self.demo.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(active) = demo.as_ref() {
            if !active.cancel.load(Ordering::SeqCst) {
                return;
            }
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let registry = self.registry.clone();
        let loop_cancel = cancel.clone();
        let interval = Duration::from_millis(interval_ms.max(1));

        let join = thread::spawn(move || {
            let mut tick = 0u64;
            loop {
                thread::sleep(interval);
                // Re-checked every iteration; a stop during the sleep
                // discards this tick's output.
                if loop_cancel.load(Ordering::SeqCst) {
                    break;
                }
                let detection = synth_demo_hazard(&registry, tick);
                let summary = PipelineSummary {
                    status: if registry.engine_ready() {
                        PipelineStatus::Running
                    } else {
                        PipelineStatus::Warming
                    },
                    fps: DEMO_FPS,
                    last_updated_ms: Some(now_ms().unwrap_or(0)),
                };
                if let Some(ts) = summary.last_updated_ms {
                    registry.set_last_updated(ts);
                }
                if loop_cancel.load(Ordering::SeqCst) {
                    break;
                }
                registry.emit(std::slice::from_ref(&detection), &summary);
                tick = tick.wrapping_add(1);
            }
        });

        *demo = Some(DemoLoop { cancel, join });
        log::info!("demo loop started at {} ms interval", interval_ms);
    }

    /// Cancel the demo loop (if running) and notify subscribers that the
    /// scheduler went quiet: empty detections, fps 0, status `Running`
    /// when the engine is still ready, `Idle` otherwise.
    pub fn stop(&self) {
        let handle = {
            let mut demo = self.demo.lock().unwrap_or_else(PoisonError::into_inner);
            demo.take()
        };
        if let Some(handle) = handle {
            handle.cancel.store(true, Ordering::SeqCst);
            let _ = handle.join.join();
        }

        let summary = PipelineSummary {
            status: if self.registry.engine_ready() {
                PipelineStatus::Running
            } else {
                PipelineStatus::Idle
            },
            fps: 0.0,
            last_updated_ms: self.registry.last_updated(),
        };
        self.registry.emit(&[], &summary);
    }

    pub fn is_demo_running(&self) -> bool {
        self.demo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|d| !d.cancel.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        if let Ok(mut demo) = self.demo.lock() {
            if let Some(handle) = demo.take() {
                handle.cancel.store(true, Ordering::SeqCst);
                let _ = handle.join.join();
            }
        }
    }
}

fn synth_demo_hazard(registry: &Registry, tick: u64) -> HazardDetection {
    let class_label = DEMO_CLASSES[(tick % DEMO_CLASSES.len() as u64) as usize];
    let speed = registry.context.snapshot().speed_mps.max(MIN_SPEED_MPS);
    let risk = risk_score(RiskInput {
        score: DEMO_SCORE,
        depth_m: DEMO_DEPTH_M,
        lane_offset: DEMO_LANE_OFFSET,
        depth_delta: DEMO_DEPTH_DELTA,
    });
    HazardDetection {
        id: format!("demo-{tick}"),
        x: 180.0,
        y: 280.0,
        width: 220.0,
        height: 160.0,
        depth_m: DEMO_DEPTH_M,
        risk,
        class_label: class_label.to_string(),
        lane_offset: DEMO_LANE_OFFSET,
        ttc_s: DEMO_DEPTH_M / speed,
    }
}
