pub mod run;

pub use run::{RunExport, RunSessionRecord, SeriesExport, SeriesRecord};
