use chrono::{DateTime, Utc};
use serde::Serialize;

use super::state::ControlState;
use crate::control::Phase;
use crate::series::ExportSummary;
use crate::vision::Centroid;

/// Latest observable state of the droplet and the generator.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DropletTelemetry {
    pub state: ControlState,
    pub phase: Phase,
    pub frame_seq: Option<u64>,
    pub centroid: Option<Centroid>,
    pub aspect_ratio: Option<f64>,
    pub height_above_node_um: Option<f64>,
    pub frequency_hz: Option<f64>,
    pub amplitude_vpp: Option<f64>,
    pub pid_output: Option<f64>,
    pub setpoint_reached: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlEvent {
    StateChanged { state: ControlState },
    TargetNotFound { frame_seq: u64 },
    FrameRejected { frame_seq: u64, reason: String },
    RunExported { summary: ExportSummary },
    ExportFailed { reason: String },
    SweepFinished { cancelled: bool },
    LoopSuspended { loop_name: String, reason: String },
}
