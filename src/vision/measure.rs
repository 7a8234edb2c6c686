use serde::{Deserialize, Serialize};

use crate::{
    control::Phase,
    error::{TensiometerError, TensiometerResult},
    series::SeriesStore,
    settings::VisionSettings,
};

use super::frame::BoundingBox;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

/// One row of a measurement series. Column order matches the export table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AxisMeasurement {
    pub semi_major: f64,
    pub semi_minor: f64,
    /// `semi_minor / semi_major`; `None` when the major axis is zero.
    pub aspect_ratio: Option<f64>,
    /// Microns above the configured reference.
    pub height_above_reference: f64,
    /// Pixels above the bottom edge of the frame.
    pub height_relative_to_frame: f64,
    /// Microns relative to the first measurement since the last export.
    pub height_relative_to_run_start: f64,
}

impl AxisMeasurement {
    pub fn checked_aspect_ratio(&self) -> TensiometerResult<f64> {
        self.aspect_ratio
            .ok_or(TensiometerError::DivisionByZero("aspect ratio"))
    }
}

pub fn aspect_ratio(semi_minor: f64, semi_major: f64) -> TensiometerResult<f64> {
    if semi_major == 0.0 {
        return Err(TensiometerError::DivisionByZero("aspect ratio"));
    }
    Ok(semi_minor / semi_major)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub x: f64,
    pub y: f64,
}

/// Whether a measurement lands in the run's series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recording {
    /// Appended to the series of the current phase.
    Append,
    /// Drives the controller only; the store and its baseline stay as they are.
    FeedbackOnly,
}

/// Converts bounding boxes into physical axis measurements and appends them
/// to the series selected by the phase at measurement time.
#[derive(Debug, Clone)]
pub struct ShapeMeasurer {
    calibration_constant: f64,
    reference_offset_um: f64,
    centroid: Option<Centroid>,
    aspect_ratio: Option<f64>,
}

impl ShapeMeasurer {
    pub fn new(settings: &VisionSettings) -> TensiometerResult<Self> {
        if settings.calibration_constant == 0.0 || !settings.calibration_constant.is_finite() {
            return Err(TensiometerError::DivisionByZero("pixel calibration"));
        }
        Ok(Self {
            calibration_constant: settings.calibration_constant,
            reference_offset_um: settings.reference_offset_um,
            centroid: None,
            aspect_ratio: None,
        })
    }

    pub fn centroid(&self) -> Option<Centroid> {
        self.centroid
    }

    pub fn aspect_ratio(&self) -> Option<f64> {
        self.aspect_ratio
    }

    /// Measures one located droplet. A missing box is reported and leaves
    /// the series, the run-start baseline and the centroid untouched.
    pub fn measure(
        &mut self,
        bounding_box: Option<BoundingBox>,
        frame_height: u32,
        phase: Phase,
        recording: Recording,
        store: &mut SeriesStore,
    ) -> Option<AxisMeasurement> {
        let Some(bbox) = bounding_box else {
            log_warn!("target not found");
            return None;
        };

        let semi_major = bbox.height as f64 / 2.0;
        let semi_minor = bbox.width as f64 / 2.0;
        let ratio = aspect_ratio(semi_minor, semi_major).ok();
        if ratio.is_none() {
            log_warn!("zero-height droplet box at ({}, {}); aspect ratio flagged", bbox.x, bbox.y);
        }

        let height_relative_to_frame = frame_height as f64 - bbox.center_y();
        let height_above_reference =
            height_relative_to_frame / self.calibration_constant + self.reference_offset_um;

        let height_relative_to_run_start = match (store.baseline(), recording) {
            (Some(baseline), _) => height_above_reference - baseline,
            (None, Recording::Append) => {
                store.set_baseline(height_above_reference);
                0.0
            }
            (None, Recording::FeedbackOnly) => 0.0,
        };

        let measurement = AxisMeasurement {
            semi_major,
            semi_minor,
            aspect_ratio: ratio,
            height_above_reference,
            height_relative_to_frame,
            height_relative_to_run_start,
        };

        self.centroid = Some(Centroid {
            x: bbox.center_x(),
            y: height_relative_to_frame,
        });
        self.aspect_ratio = ratio;

        log_debug!(
            "droplet a={:.1}px b={:.1}px ratio={:?} height={:.1}um ({:?})",
            semi_major,
            semi_minor,
            ratio,
            height_above_reference,
            phase
        );

        if recording == Recording::Append {
            store.append(phase, measurement);
        }
        Some(measurement)
    }
}
