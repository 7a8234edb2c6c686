mod types;

pub use types::{AnalysisMetrics, MetricsSnapshot, SystemMetrics};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;

const MAX_RECENT_ANALYSES: usize = 20;

pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
    frames_captured: Arc<AtomicU64>,
}

struct MetricsState {
    recent_analyses: Vec<AnalysisMetrics>,
    analysis_count: u64,
    target_missed_count: u64,
    frames_dropped: u64,
    system: System,
    pid: Pid,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());

        // CPU usage is a delta between refreshes
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        Self {
            inner: Arc::new(Mutex::new(MetricsState {
                recent_analyses: Vec::with_capacity(MAX_RECENT_ANALYSES),
                analysis_count: 0,
                target_missed_count: 0,
                frames_dropped: 0,
                system,
                pid,
            })),
            frames_captured: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Called from the acquisition thread for every published frame.
    pub fn record_frame_captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn sample_system_metrics(&self) -> (f32, f64) {
        let mut state = self.inner.lock().await;
        let pid = state.pid;
        state.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        if let Some(process) = state.system.process(pid) {
            (process.cpu_usage(), process.memory() as f64 / 1024.0 / 1024.0)
        } else {
            (0.0, 0.0)
        }
    }

    pub async fn record_analysis(&self, metrics: AnalysisMetrics) {
        let mut state = self.inner.lock().await;

        state.analysis_count += 1;
        state.frames_dropped += metrics.frames_skipped;
        if !metrics.target_found {
            state.target_missed_count += 1;
        }

        state.recent_analyses.push(metrics);
        if state.recent_analyses.len() > MAX_RECENT_ANALYSES {
            state.recent_analyses.remove(0);
        }
    }

    pub async fn get_snapshot(&self) -> MetricsSnapshot {
        let mut state = self.inner.lock().await;
        let pid = state.pid;
        state.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        let system = state
            .system
            .process(pid)
            .map(|process| SystemMetrics {
                cpu_percent: process.cpu_usage(),
                memory_mb: process.memory() as f64 / 1024.0 / 1024.0,
            })
            .unwrap_or_default();

        MetricsSnapshot {
            system,
            recent_analyses: state.recent_analyses.clone(),
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            analysis_count: state.analysis_count,
            target_missed_count: state.target_missed_count,
            frames_dropped: state.frames_dropped,
        }
    }

    pub async fn reset(&self) {
        let mut state = self.inner.lock().await;
        let pid = state.pid;
        state.recent_analyses.clear();
        state.analysis_count = 0;
        state.target_missed_count = 0;
        state.frames_dropped = 0;
        self.frames_captured.store(0, Ordering::Relaxed);
        state.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MetricsCollector {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            frames_captured: Arc::clone(&self.frames_captured),
        }
    }
}
