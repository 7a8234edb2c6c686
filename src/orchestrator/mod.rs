//! Concurrent acquisition, analysis, sweep and tracking loops coordinated
//! through a single control authority.

pub mod controller;
pub mod events;
pub mod frame_slot;
pub mod loop_worker;
pub mod state;

pub use controller::{ControlOrchestrator, SweepMode};
pub use events::{ControlEvent, DropletTelemetry};
pub use frame_slot::FrameSlot;
pub use state::{ControlAuthority, ControlState};
