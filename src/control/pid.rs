//! Single-setpoint PID controller on the droplet aspect ratio.
//!
//! Time is measured in seconds. Inside the deadband the controller returns
//! exactly zero and leaves `integral`/`previous_error` alone so a droplet that
//! sits on the setpoint cannot wind the integral up. The deadband (1%) and the
//! `setpoint_reached` tolerance (10%) are kept as the apparatus defines them.

use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::settings::PidSettings;

const DEADBAND_RELATIVE_ERROR: f64 = 0.01;
const SETPOINT_REACHED_FRACTION: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PidState {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub integral: f64,
    pub previous_error: f64,
    pub setpoint: f64,
    /// Error of the most recent evaluation, deadband or not.
    pub last_error: f64,
    #[serde(skip)]
    pub last_sample: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct PidController {
    state: PidState,
}

impl PidController {
    pub fn new(gains: PidGains, setpoint: f64) -> Self {
        Self {
            state: PidState {
                kp: gains.kp,
                ki: gains.ki,
                kd: gains.kd,
                integral: 0.0,
                previous_error: 0.0,
                setpoint,
                last_error: 0.0,
                last_sample: None,
            },
        }
    }

    pub fn from_settings(settings: &PidSettings) -> Self {
        Self::new(
            PidGains {
                kp: settings.kp,
                ki: settings.ki,
                kd: settings.kd,
            },
            settings.setpoint,
        )
    }

    pub fn state(&self) -> &PidState {
        &self.state
    }

    pub fn gains(&self) -> PidGains {
        PidGains {
            kp: self.state.kp,
            ki: self.state.ki,
            kd: self.state.kd,
        }
    }

    /// Swaps gains between evaluations; accumulated state is kept.
    pub fn set_gains(&mut self, gains: PidGains) {
        self.state.kp = gains.kp;
        self.state.ki = gains.ki;
        self.state.kd = gains.kd;
    }

    pub fn setpoint(&self) -> f64 {
        self.state.setpoint
    }

    pub fn set_setpoint(&mut self, setpoint: f64) {
        self.state.setpoint = setpoint;
    }

    /// Restarts the sample timer at the beginning of a measurement cycle.
    pub fn start_sample(&mut self, now: Instant) {
        self.state.last_sample = Some(now);
    }

    /// Evaluates against the wall clock: elapsed time runs from the last
    /// sample timestamp, which is then moved to now.
    pub fn evaluate(&mut self, measured: f64) -> f64 {
        let now = Instant::now();
        let elapsed = self
            .state
            .last_sample
            .map(|start| now.duration_since(start).as_secs_f64())
            .unwrap_or(0.0);
        self.state.last_sample = Some(now);
        self.evaluate_elapsed(measured, elapsed)
    }

    pub fn evaluate_elapsed(&mut self, measured: f64, elapsed_secs: f64) -> f64 {
        let error = self.state.setpoint - measured;
        self.state.last_error = error;

        if let Some(relative) = self.relative_error(error) {
            if relative < DEADBAND_RELATIVE_ERROR {
                return 0.0;
            }
        }

        self.state.integral += error * elapsed_secs;
        let derivative = if elapsed_secs > 0.0 {
            (error - self.state.previous_error) / elapsed_secs
        } else {
            0.0
        };
        self.state.previous_error = error;

        self.state.kp * error + self.state.ki * self.state.integral + self.state.kd * derivative
    }

    /// `(setpoint - |error|) / setpoint < 0.1`, evaluated on the last error.
    pub fn setpoint_reached(&self) -> bool {
        if self.state.setpoint == 0.0 {
            return false;
        }
        (self.state.setpoint - self.state.last_error.abs()) / self.state.setpoint
            < SETPOINT_REACHED_FRACTION
    }

    /// `None` for a zero setpoint, where a relative error has no meaning.
    fn relative_error(&self, error: f64) -> Option<f64> {
        if self.state.setpoint == 0.0 {
            None
        } else {
            Some(error.abs() / self.state.setpoint.abs())
        }
    }
}
