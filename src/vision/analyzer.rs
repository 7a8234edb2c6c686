use image::{DynamicImage, Rgb};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use super::{
    blob::locate_droplet,
    frame::{BoundingBox, Frame},
    measure::{AxisMeasurement, Centroid, Recording, ShapeMeasurer},
    preprocess::prep_frame,
};
use crate::{
    control::Phase,
    error::{TensiometerError, TensiometerResult},
    series::SeriesStore,
    settings::VisionSettings,
};

pub type SharedAnalyzer = Arc<Mutex<DropletAnalyzer>>;

pub fn lock_analyzer(analyzer: &SharedAnalyzer) -> MutexGuard<'_, DropletAnalyzer> {
    analyzer
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

const OVERLAY_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisTimings {
    pub preprocess_ms: f64,
    pub locate_ms: f64,
    pub measure_ms: f64,
}

impl AnalysisTimings {
    pub fn total_ms(&self) -> f64 {
        self.preprocess_ms + self.locate_ms + self.measure_ms
    }
}

#[derive(Debug, Clone)]
pub struct FrameAnalysis {
    pub frame_seq: u64,
    pub phase: Phase,
    pub bounding_box: Option<BoundingBox>,
    pub measurement: Option<AxisMeasurement>,
    pub centroid: Option<Centroid>,
    pub timings: AnalysisTimings,
}

impl FrameAnalysis {
    /// Aspect ratio suitable as controller feedback.
    pub fn feedback_ratio(&self) -> TensiometerResult<f64> {
        self.measurement
            .as_ref()
            .ok_or(TensiometerError::BlobNotFound)?
            .checked_aspect_ratio()
    }
}

/// Frame-to-measurement pipeline: edge enhancement, largest-blob search,
/// measurement into the owned series store.
#[derive(Debug)]
pub struct DropletAnalyzer {
    threshold: u8,
    node_location_um: f64,
    measurer: ShapeMeasurer,
    store: SeriesStore,
}

impl DropletAnalyzer {
    pub fn new(settings: &VisionSettings) -> TensiometerResult<Self> {
        Ok(Self {
            threshold: settings.threshold,
            node_location_um: settings.node_location_um,
            measurer: ShapeMeasurer::new(settings)?,
            store: SeriesStore::default(),
        })
    }

    pub fn shared(self) -> SharedAnalyzer {
        Arc::new(Mutex::new(self))
    }

    pub fn analyze_frame(
        &mut self,
        frame: &Frame,
        phase: Phase,
        recording: Recording,
    ) -> TensiometerResult<FrameAnalysis> {
        let started = Instant::now();
        let gray = frame.to_gray()?;
        let mask = prep_frame(&gray, self.threshold)?;
        let preprocessed = Instant::now();

        let bounding_box = locate_droplet(&mask);
        let located = Instant::now();

        let measurement = self.measurer.measure(
            bounding_box,
            frame.height(),
            phase,
            recording,
            &mut self.store,
        );
        let measured = Instant::now();

        Ok(FrameAnalysis {
            frame_seq: frame.seq,
            phase,
            bounding_box,
            centroid: measurement.and(self.measurer.centroid()),
            measurement,
            timings: AnalysisTimings {
                preprocess_ms: millis(preprocessed - started),
                locate_ms: millis(located - preprocessed),
                measure_ms: millis(measured - located),
            },
        })
    }

    /// Aspect ratio of `frame` for the controller. Nothing is recorded.
    pub fn measure_for_feedback(&mut self, frame: &Frame, phase: Phase) -> TensiometerResult<f64> {
        self.analyze_frame(frame, phase, Recording::FeedbackOnly)?
            .feedback_ratio()
    }

    pub fn centroid(&self) -> Option<Centroid> {
        self.measurer.centroid()
    }

    pub fn aspect_ratio(&self) -> Option<f64> {
        self.measurer.aspect_ratio()
    }

    /// Signed distance between a measured height and the acoustic node.
    pub fn height_above_node(&self, measurement: &AxisMeasurement) -> f64 {
        measurement.height_above_reference - self.node_location_um
    }

    pub fn store(&self) -> &SeriesStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SeriesStore {
        &mut self.store
    }
}

fn millis(duration: std::time::Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Copy of `frame` with the droplet box outlined.
pub fn annotate(frame: &Frame, bounding_box: &BoundingBox) -> Frame {
    let mut canvas = frame.image.to_rgb8();
    if bounding_box.width > 0 && bounding_box.height > 0 {
        let rect = Rect::at(bounding_box.x as i32, bounding_box.y as i32)
            .of_size(bounding_box.width, bounding_box.height);
        draw_hollow_rect_mut(&mut canvas, rect, OVERLAY_COLOR);
    }
    Frame {
        seq: frame.seq,
        captured_at: frame.captured_at,
        image: DynamicImage::ImageRgb8(canvas),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use imageproc::drawing::draw_filled_ellipse_mut;

    fn droplet_frame(width_radius: i32, height_radius: i32) -> Frame {
        let mut image = GrayImage::new(200, 200);
        draw_filled_ellipse_mut(&mut image, (100, 100), width_radius, height_radius, Luma([220u8]));
        Frame::new(1, DynamicImage::ImageLuma8(image))
    }

    fn analyzer() -> DropletAnalyzer {
        DropletAnalyzer::new(&VisionSettings::default()).unwrap()
    }

    #[test]
    fn synthetic_droplet_is_measured() {
        let mut analyzer = analyzer();
        let analysis = analyzer
            .analyze_frame(&droplet_frame(30, 40), Phase::Compressing, Recording::Append)
            .unwrap();

        let bbox = analysis.bounding_box.unwrap();
        assert!((bbox.center_x() - 100.5).abs() <= 2.0);
        assert!((bbox.center_y() - 100.5).abs() <= 2.0);

        let ratio = analysis.feedback_ratio().unwrap();
        assert!((ratio - 0.75).abs() < 0.05, "ratio {ratio}");
        assert_eq!(analyzer.store().series(Phase::Compressing).len(), 1);
        assert!(analysis.centroid.is_some());
    }

    #[test]
    fn feedback_frames_leave_the_series_alone() {
        let mut analyzer = analyzer();
        let ratio = analyzer
            .measure_for_feedback(&droplet_frame(30, 40), Phase::Relaxing)
            .unwrap();

        assert!((ratio - 0.75).abs() < 0.05, "ratio {ratio}");
        assert!(analyzer.store().is_empty());
        assert_eq!(analyzer.store().baseline(), None);
        assert!(analyzer.centroid().is_some());
    }

    #[test]
    fn blank_frame_reports_missing_droplet() {
        let mut analyzer = analyzer();
        let frame = Frame::new(3, DynamicImage::ImageLuma8(GrayImage::new(64, 64)));

        let result = analyzer.measure_for_feedback(&frame, Phase::Relaxing);

        assert_eq!(result, Err(TensiometerError::BlobNotFound));
        assert!(analyzer.store().is_empty());
    }

    #[test]
    fn empty_frame_is_an_error() {
        let mut analyzer = analyzer();
        let frame = Frame::new(4, DynamicImage::ImageLuma8(GrayImage::new(0, 0)));
        assert!(matches!(
            analyzer.analyze_frame(&frame, Phase::Relaxing, Recording::Append),
            Err(TensiometerError::InvalidFrame(_))
        ));
    }

    #[test]
    fn overlay_outlines_the_box() {
        let frame = droplet_frame(10, 10);
        let overlay = annotate(&frame, &BoundingBox::new(5, 6, 20, 10));
        let rgb = overlay.image.to_rgb8();

        assert_eq!(*rgb.get_pixel(5, 6), OVERLAY_COLOR);
        assert_eq!(*rgb.get_pixel(24, 15), OVERLAY_COLOR);
        assert_ne!(*rgb.get_pixel(0, 0), OVERLAY_COLOR);
        assert_eq!(overlay.seq, frame.seq);
    }
}
