//! Amplitude ramps for the compress/relax cycle.
//!
//! A ramp walks the amplitude in fixed steps between two bounds. Steps are
//! counted as integers so accumulated floating error can neither skip the
//! final value nor push past it.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::phase::{Phase, PhaseCell};
use crate::error::TensiometerResult;
use crate::settings::SweepSettings;
use std::sync::Arc;

pub const DEFAULT_RAMP_STEP_VPP: f64 = 1e-5;
const STEP_COUNT_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SweepDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepState {
    pub current_amplitude: f64,
    pub direction: SweepDirection,
    pub step_size: f64,
    pub min_amplitude: f64,
    pub max_amplitude: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RampOutcome {
    pub commanded: Vec<f64>,
    pub cancelled: bool,
}

/// Values visited by a ramp from `start` to `end`, or from `end` back to
/// `start` when `reverse` is set. The first value is the starting bound and
/// the final value equals the target bound.
pub fn ramp_values(start: f64, end: f64, step: f64, reverse: bool) -> Vec<f64> {
    let span = end - start;
    if step <= 0.0 || span <= 0.0 || !span.is_finite() {
        return Vec::new();
    }
    let steps = (span / step - STEP_COUNT_EPSILON).ceil().max(1.0) as u64;
    (0..=steps)
        .map(|i| {
            if i == steps {
                if reverse {
                    start
                } else {
                    end
                }
            } else if reverse {
                end - i as f64 * step
            } else {
                start + i as f64 * step
            }
        })
        .collect()
}

/// Issues one amplitude command per step, checking `cancel` before each.
/// Stops at the first command error.
pub fn ramp_to<F>(
    start: f64,
    end: f64,
    reverse: bool,
    step: f64,
    cancel: &CancellationToken,
    mut command: F,
) -> TensiometerResult<RampOutcome>
where
    F: FnMut(f64) -> TensiometerResult<()>,
{
    let mut outcome = RampOutcome::default();
    for value in ramp_values(start, end, step, reverse) {
        if cancel.is_cancelled() {
            outcome.cancelled = true;
            break;
        }
        command(value)?;
        outcome.commanded.push(value);
    }
    Ok(outcome)
}

/// Owns the sweep state and the phase flag it publishes.
#[derive(Debug)]
pub struct SweepDriver {
    state: SweepState,
    phase: Arc<PhaseCell>,
}

impl SweepDriver {
    pub fn new(settings: &SweepSettings, phase: Arc<PhaseCell>) -> Self {
        Self {
            state: SweepState {
                current_amplitude: settings.min_amplitude_vpp,
                direction: SweepDirection::Up,
                step_size: settings.step_vpp,
                min_amplitude: settings.min_amplitude_vpp,
                max_amplitude: settings.max_amplitude_vpp,
            },
            phase,
        }
    }

    pub fn state(&self) -> &SweepState {
        &self.state
    }

    /// Ramps up (Compressing) or back down (Relaxing) between the bounds.
    pub fn ramp<F>(
        &mut self,
        start: f64,
        end: f64,
        reverse: bool,
        cancel: &CancellationToken,
        mut command: F,
    ) -> TensiometerResult<RampOutcome>
    where
        F: FnMut(f64) -> TensiometerResult<()>,
    {
        let (phase, direction) = if reverse {
            (Phase::Relaxing, SweepDirection::Down)
        } else {
            (Phase::Compressing, SweepDirection::Up)
        };
        self.phase.store(phase);
        self.state.direction = direction;

        let current = &mut self.state.current_amplitude;
        ramp_to(start, end, reverse, self.state.step_size, cancel, |value| {
            command(value)?;
            *current = value;
            Ok(())
        })
    }

    /// One compress/relax cycle between the configured bounds.
    pub fn full_cycle<F>(
        &mut self,
        cancel: &CancellationToken,
        mut command: F,
    ) -> TensiometerResult<RampOutcome>
    where
        F: FnMut(f64) -> TensiometerResult<()>,
    {
        let (min, max) = (self.state.min_amplitude, self.state.max_amplitude);
        let mut outcome = self.ramp(min, max, false, cancel, &mut command)?;
        if outcome.cancelled {
            return Ok(outcome);
        }
        let down = self.ramp(min, max, true, cancel, &mut command)?;
        outcome.commanded.extend(down.commanded);
        outcome.cancelled = down.cancelled;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TensiometerError;
    use approx::assert_relative_eq;

    fn settings() -> SweepSettings {
        SweepSettings {
            min_amplitude_vpp: 0.400,
            max_amplitude_vpp: 0.401,
            step_vpp: 1e-4,
            ..SweepSettings::default()
        }
    }

    #[test]
    fn forward_ramp_is_increasing_and_ends_on_target() {
        let values = ramp_values(0.400, 0.475, 1e-5, false);
        assert!(values.windows(2).all(|w| w[1] > w[0]));
        assert!(values.iter().all(|v| *v >= 0.400 && *v <= 0.475));
        assert_eq!(values.first().copied(), Some(0.400));
        assert_eq!(values.last().copied(), Some(0.475));
        assert_eq!(values.len(), 7501);
    }

    #[test]
    fn reverse_ramp_is_decreasing_and_ends_on_start() {
        let values = ramp_values(0.400, 0.475, 1e-5, true);
        assert!(values.windows(2).all(|w| w[1] < w[0]));
        assert!(values.iter().all(|v| *v >= 0.400 && *v <= 0.475));
        assert_eq!(values.first().copied(), Some(0.475));
        assert_eq!(values.last().copied(), Some(0.400));
    }

    #[test]
    fn partial_final_step_is_clamped() {
        let values = ramp_values(0.0, 1.0, 0.3, false);
        assert_eq!(values.len(), 5);
        assert_eq!(values[0], 0.0);
        assert_relative_eq!(values[3], 0.9, epsilon = 1e-12);
        assert_eq!(values[4], 1.0);
    }

    #[test]
    fn empty_or_inverted_ranges_issue_nothing() {
        assert!(ramp_values(0.5, 0.5, 1e-3, false).is_empty());
        assert!(ramp_values(0.6, 0.5, 1e-3, false).is_empty());
        assert!(ramp_values(0.4, 0.5, 0.0, false).is_empty());
    }

    #[test]
    fn cancelled_ramp_stops_before_next_command() {
        let cancel = CancellationToken::new();
        let mut seen = Vec::new();
        let outcome = ramp_to(0.0, 1.0, false, 0.1, &cancel, |v| {
            seen.push(v);
            if seen.len() == 3 {
                cancel.cancel();
            }
            Ok(())
        })
        .unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.commanded.len(), 3);
    }

    #[test]
    fn command_errors_abort_the_ramp() {
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let result = ramp_to(0.0, 1.0, false, 0.1, &cancel, |_| {
            calls += 1;
            if calls == 2 {
                Err(TensiometerError::DeviceUnavailable("link lost".into()))
            } else {
                Ok(())
            }
        });
        assert!(matches!(result, Err(TensiometerError::DeviceUnavailable(_))));
        assert_eq!(calls, 2);
    }

    #[test]
    fn full_cycle_sets_phase_for_each_half() {
        let phase = Arc::new(PhaseCell::new(Phase::Relaxing));
        let mut driver = SweepDriver::new(&settings(), Arc::clone(&phase));
        let cancel = CancellationToken::new();
        let mut phases = Vec::new();

        let outcome = driver
            .full_cycle(&cancel, |_| {
                phases.push(phase.load());
                Ok(())
            })
            .unwrap();

        assert!(!outcome.cancelled);
        assert_eq!(phases.first(), Some(&Phase::Compressing));
        assert_eq!(phases.last(), Some(&Phase::Relaxing));
        assert_eq!(driver.state().current_amplitude, 0.400);
        assert_eq!(driver.state().direction, SweepDirection::Down);
    }
}
