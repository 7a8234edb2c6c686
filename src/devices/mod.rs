//! Hardware seams: camera, preview display and the function generator.

pub mod camera;
pub mod instrument;
pub mod simulated;

pub use camera::{Camera, Display};
pub use instrument::{parse_numeric_response, FunctionGenerator, Instrument};
pub use simulated::{
    BenchState, DropletModel, RenderedFrame, SharedBench, SimulatedCamera, SimulatedDisplay,
    SimulatedInstrument,
};
