use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cost of one analyzed frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisMetrics {
    pub timestamp: DateTime<Utc>,
    /// Loop that consumed the frame (`analysis`, `pid`, `elasticity`).
    pub consumer: String,
    pub frame_seq: u64,
    /// Frames published since the previous one this consumer analyzed.
    pub frames_skipped: u64,
    pub preprocess_ms: f64,
    pub locate_ms: f64,
    pub measure_ms: f64,
    pub total_ms: f64,
    pub target_found: bool,
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub system: SystemMetrics,
    pub recent_analyses: Vec<AnalysisMetrics>,
    pub frames_captured: u64,
    pub analysis_count: u64,
    pub target_missed_count: u64,
    pub frames_dropped: u64,
}
