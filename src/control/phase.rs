use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Which half of an actuation cycle is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Compressing,
    #[default]
    Relaxing,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Compressing => "Compressing",
            Phase::Relaxing => "Relaxing",
        }
    }
}

/// The system-wide phase flag. Written only by the sweep driver, read by the
/// measurement path at the instant a measurement is taken.
#[derive(Debug, Default)]
pub struct PhaseCell {
    compressing: AtomicBool,
}

impl PhaseCell {
    pub fn new(phase: Phase) -> Self {
        Self {
            compressing: AtomicBool::new(phase == Phase::Compressing),
        }
    }

    pub fn load(&self) -> Phase {
        if self.compressing.load(Ordering::Acquire) {
            Phase::Compressing
        } else {
            Phase::Relaxing
        }
    }

    pub fn store(&self, phase: Phase) {
        self.compressing
            .store(phase == Phase::Compressing, Ordering::Release);
    }
}
