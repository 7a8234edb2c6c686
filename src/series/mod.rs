//! In-memory measurement series and their export to the run database.

mod export;

pub use export::{export_measurements, ExportSummary, RunRecorder, RunSession};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::control::Phase;
use crate::vision::AxisMeasurement;

/// Ordered, append-only rows recorded during one phase.
#[derive(Debug, Clone, Serialize)]
pub struct MeasurementSeries {
    pub phase: Phase,
    rows: Vec<AxisMeasurement>,
}

impl MeasurementSeries {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            rows: Vec::new(),
        }
    }

    pub fn rows(&self) -> &[AxisMeasurement] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_rows(self) -> Vec<AxisMeasurement> {
        self.rows
    }
}

/// Both series plus the run-start baseline they are measured against.
#[derive(Debug, Clone)]
pub struct SeriesStore {
    compression: MeasurementSeries,
    relaxation: MeasurementSeries,
    baseline: Option<f64>,
    first_measured_at: Option<DateTime<Utc>>,
    /// Set between `take_pending` and the export's outcome.
    in_flight: Option<InFlight>,
}

/// First row recorded while an export is being written.
#[derive(Debug, Clone, Default)]
struct InFlight {
    first_phase: Option<Phase>,
    first_at: Option<DateTime<Utc>>,
}

impl Default for SeriesStore {
    fn default() -> Self {
        Self {
            compression: MeasurementSeries::new(Phase::Compressing),
            relaxation: MeasurementSeries::new(Phase::Relaxing),
            baseline: None,
            first_measured_at: None,
            in_flight: None,
        }
    }
}

/// Series detached from the store for export. Handed back with
/// [`SeriesStore::restore`] if the export fails.
#[derive(Debug, Clone)]
pub struct PendingExport {
    pub compression: MeasurementSeries,
    pub relaxation: MeasurementSeries,
    pub baseline: Option<f64>,
    pub first_measured_at: Option<DateTime<Utc>>,
}

impl PendingExport {
    pub fn is_empty(&self) -> bool {
        self.compression.is_empty() && self.relaxation.is_empty()
    }
}

impl SeriesStore {
    pub fn append(&mut self, phase: Phase, measurement: AxisMeasurement) {
        let now = Utc::now();
        if self.first_measured_at.is_none() {
            self.first_measured_at = Some(now);
        }
        if let Some(in_flight) = self.in_flight.as_mut() {
            if in_flight.first_phase.is_none() {
                in_flight.first_phase = Some(phase);
                in_flight.first_at = Some(now);
            }
        }
        match phase {
            Phase::Compressing => self.compression.rows.push(measurement),
            Phase::Relaxing => self.relaxation.rows.push(measurement),
        }
    }

    pub fn series(&self, phase: Phase) -> &MeasurementSeries {
        match phase {
            Phase::Compressing => &self.compression,
            Phase::Relaxing => &self.relaxation,
        }
    }

    pub fn baseline(&self) -> Option<f64> {
        self.baseline
    }

    pub fn set_baseline(&mut self, height_um: f64) {
        self.baseline = Some(height_um);
    }

    pub fn first_measured_at(&self) -> Option<DateTime<Utc>> {
        self.first_measured_at
    }

    pub fn is_empty(&self) -> bool {
        self.compression.is_empty() && self.relaxation.is_empty()
    }

    pub fn len(&self) -> usize {
        self.compression.len() + self.relaxation.len()
    }

    /// Detaches both series for export. The baseline and run start stay in
    /// place until [`complete_export`](Self::complete_export) confirms the
    /// rows were stored, so anything measured meanwhile stays comparable.
    pub fn take_pending(&mut self) -> PendingExport {
        self.in_flight = Some(InFlight::default());
        PendingExport {
            compression: std::mem::replace(
                &mut self.compression,
                MeasurementSeries::new(Phase::Compressing),
            ),
            relaxation: std::mem::replace(
                &mut self.relaxation,
                MeasurementSeries::new(Phase::Relaxing),
            ),
            baseline: self.baseline,
            first_measured_at: self.first_measured_at,
        }
    }

    /// Starts the next run after a stored export. Rows recorded while the
    /// export was written become the start of that run: the first of them
    /// is the new baseline and all of them are rebased onto it.
    pub fn complete_export(&mut self) {
        let in_flight = self.in_flight.take().unwrap_or_default();
        let Some(first_phase) = in_flight.first_phase else {
            self.baseline = None;
            self.first_measured_at = None;
            return;
        };
        let Some(baseline) = self
            .series(first_phase)
            .rows()
            .first()
            .map(|row| row.height_above_reference)
        else {
            self.baseline = None;
            self.first_measured_at = None;
            return;
        };

        for row in self
            .compression
            .rows
            .iter_mut()
            .chain(self.relaxation.rows.iter_mut())
        {
            row.height_relative_to_run_start = row.height_above_reference - baseline;
        }
        self.baseline = Some(baseline);
        self.first_measured_at = in_flight.first_at;
    }

    /// Puts a failed export back in front of anything recorded since. The
    /// run keeps its baseline, so rows from both sides share one reference.
    pub fn restore(&mut self, pending: PendingExport) {
        let PendingExport {
            mut compression,
            mut relaxation,
            baseline,
            first_measured_at,
        } = pending;
        self.in_flight = None;
        compression.rows.append(&mut self.compression.rows);
        relaxation.rows.append(&mut self.relaxation.rows);
        self.compression = compression;
        self.relaxation = relaxation;
        if self.baseline.is_none() {
            self.baseline = baseline;
        }
        if first_measured_at.is_some() {
            self.first_measured_at = first_measured_at;
        }
    }
}
