pub mod phase;
pub mod pid;
pub mod sweep;

pub use phase::{Phase, PhaseCell};
pub use pid::{PidController, PidGains, PidState};
pub use sweep::{ramp_to, RampOutcome, SweepDirection, SweepDriver, SweepState};
