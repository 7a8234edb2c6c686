use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use crate::control::{Phase, PhaseCell};
use crate::devices::FunctionGenerator;
use crate::error::{TensiometerError, TensiometerResult};

/// Who owns the actuator. Only `Sweeping` and `ClosedLoopTracking` may
/// command it, and never both.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ControlState {
    #[default]
    Idle,
    Sweeping,
    ClosedLoopTracking,
}

impl ControlState {
    fn can_transition_to(self, next: ControlState) -> bool {
        use ControlState::*;
        matches!(
            (self, next),
            (Idle, Sweeping) | (Sweeping, Idle) | (Idle, ClosedLoopTracking) | (ClosedLoopTracking, Idle)
        )
    }
}

/// Single arbiter for the control state and the function generator.
///
/// Actuator commands are issued while holding the state lock, so a command
/// can never be sent by a loop that has just lost ownership.
pub struct ControlAuthority {
    state: Mutex<ControlState>,
    notify: watch::Sender<ControlState>,
    generator: Mutex<FunctionGenerator>,
    phase: Arc<PhaseCell>,
}

impl ControlAuthority {
    pub fn new(generator: FunctionGenerator) -> Self {
        let (notify, _) = watch::channel(ControlState::Idle);
        Self {
            state: Mutex::new(ControlState::Idle),
            notify,
            generator: Mutex::new(generator),
            phase: Arc::new(PhaseCell::default()),
        }
    }

    pub fn state(&self) -> ControlState {
        *self.lock_state()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControlState> {
        self.notify.subscribe()
    }

    pub fn is_sweeping(&self) -> bool {
        self.state() == ControlState::Sweeping
    }

    pub fn phase(&self) -> Phase {
        self.phase.load()
    }

    pub fn phase_cell(&self) -> Arc<PhaseCell> {
        Arc::clone(&self.phase)
    }

    /// Compare-and-set: succeeds only if the current state is `from`.
    pub fn transition(&self, from: ControlState, to: ControlState) -> TensiometerResult<()> {
        let mut state = self.lock_state();
        if *state != from || !from.can_transition_to(to) {
            return Err(TensiometerError::IllegalTransition { from: *state, to });
        }
        *state = to;
        self.notify.send_replace(to);
        Ok(())
    }

    /// Runs an actuator command on behalf of `requester`, which must be the
    /// current owner.
    pub fn command<T, F>(&self, requester: ControlState, command: F) -> TensiometerResult<T>
    where
        F: FnOnce(&mut FunctionGenerator) -> TensiometerResult<T>,
    {
        let state = self.lock_state();
        if *state != requester || requester == ControlState::Idle {
            return Err(TensiometerError::ActuatorNotOwned {
                owner: *state,
                requester,
            });
        }
        let mut generator = self.lock_generator();
        let result = command(&mut generator);
        drop(generator);
        drop(state);
        result
    }

    /// Read-only access (frequency/amplitude queries, beep). No ownership
    /// needed.
    pub fn query<T, F>(&self, query: F) -> TensiometerResult<T>
    where
        F: FnOnce(&mut FunctionGenerator) -> TensiometerResult<T>,
    {
        query(&mut self.lock_generator())
    }

    fn lock_state(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_generator(&self) -> MutexGuard<'_, FunctionGenerator> {
        self.generator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{BenchState, DropletModel, SimulatedInstrument};

    fn authority() -> ControlAuthority {
        let bench = BenchState::new(&DropletModel::default()).shared();
        ControlAuthority::new(FunctionGenerator::new(Box::new(SimulatedInstrument::new(bench))))
    }

    #[test]
    fn legal_transitions_round_trip() {
        let authority = authority();
        let mut rx = authority.subscribe();

        authority
            .transition(ControlState::Idle, ControlState::Sweeping)
            .unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ControlState::Sweeping);

        authority
            .transition(ControlState::Sweeping, ControlState::Idle)
            .unwrap();
        authority
            .transition(ControlState::Idle, ControlState::ClosedLoopTracking)
            .unwrap();
        assert_eq!(authority.state(), ControlState::ClosedLoopTracking);
    }

    #[test]
    fn engaging_tracking_during_a_sweep_is_refused() {
        let authority = authority();
        authority
            .transition(ControlState::Idle, ControlState::Sweeping)
            .unwrap();

        let result = authority.transition(ControlState::Idle, ControlState::ClosedLoopTracking);

        assert_eq!(
            result,
            Err(TensiometerError::IllegalTransition {
                from: ControlState::Sweeping,
                to: ControlState::ClosedLoopTracking,
            })
        );
        assert_eq!(authority.state(), ControlState::Sweeping);
    }

    #[test]
    fn direct_sweep_to_tracking_is_illegal() {
        let authority = authority();
        authority
            .transition(ControlState::Idle, ControlState::Sweeping)
            .unwrap();
        assert!(authority
            .transition(ControlState::Sweeping, ControlState::ClosedLoopTracking)
            .is_err());
    }

    #[test]
    fn only_the_owner_may_command() {
        let authority = authority();
        authority
            .transition(ControlState::Idle, ControlState::ClosedLoopTracking)
            .unwrap();

        let denied = authority.command(ControlState::Sweeping, |fg| fg.set_amplitude(0.45));
        assert_eq!(
            denied,
            Err(TensiometerError::ActuatorNotOwned {
                owner: ControlState::ClosedLoopTracking,
                requester: ControlState::Sweeping,
            })
        );

        authority
            .command(ControlState::ClosedLoopTracking, |fg| fg.set_frequency(40_001.0))
            .unwrap();
        let frequency = authority.query(|fg| fg.frequency()).unwrap();
        assert_eq!(frequency, 40_001.0);
    }

    #[test]
    fn idle_owns_nothing() {
        let authority = authority();
        assert!(authority
            .command(ControlState::Idle, |fg| fg.beep())
            .is_err());
    }
}
