pub mod analyzer;
pub mod blob;
pub mod frame;
pub mod measure;
pub mod preprocess;

pub use analyzer::{
    annotate, lock_analyzer, AnalysisTimings, DropletAnalyzer, FrameAnalysis, SharedAnalyzer,
};
pub use frame::{BoundingBox, Frame};
pub use measure::{aspect_ratio, AxisMeasurement, Centroid, Recording, ShapeMeasurer};
