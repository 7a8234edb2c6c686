//! Persisted measurement runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::control::Phase;
use crate::vision::AxisMeasurement;

/// A group of runs exported together: a single sweep, or every run of an
/// elasticity study.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunSessionRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub max_runs: u32,
    pub runs_completed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeriesRecord {
    pub id: i64,
    pub session_id: String,
    pub run_number: u32,
    pub label: String,
    pub phase: Phase,
    pub exported_at: DateTime<Utc>,
    pub measurement_count: u64,
}

#[derive(Debug, Clone)]
pub struct SeriesExport {
    pub label: String,
    pub phase: Phase,
    pub rows: Vec<AxisMeasurement>,
}

/// Everything written by one export, stored in a single transaction.
#[derive(Debug, Clone)]
pub struct RunExport {
    pub session_id: String,
    pub run_number: u32,
    pub exported_at: DateTime<Utc>,
    pub series: Vec<SeriesExport>,
}
