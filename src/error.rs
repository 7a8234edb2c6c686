use thiserror::Error;

use crate::orchestrator::ControlState;

/// Conditions raised by the vision pipeline, the controller and the
/// device layer. Orchestration code wraps these in `anyhow::Error`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TensiometerError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("droplet not found in frame")]
    BlobNotFound,

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("malformed response to '{command}': {response:?}")]
    MalformedResponse { command: String, response: String },

    #[error("division by zero while computing {0}")]
    DivisionByZero(&'static str),

    #[error("illegal control transition from {from:?} to {to:?}")]
    IllegalTransition { from: ControlState, to: ControlState },

    #[error("actuator is held by {owner:?}; {requester:?} may not command it")]
    ActuatorNotOwned {
        owner: ControlState,
        requester: ControlState,
    },
}

pub type TensiometerResult<T> = std::result::Result<T, TensiometerError>;
