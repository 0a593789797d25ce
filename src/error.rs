use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the simulation core.
///
/// Configuration errors stop the loop from starting. Sensor errors are
/// absorbed into the reading status. Actuation and power failures abort the
/// current tick and force a stop on the next one.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum SimError {
    #[error("invalid timestep {0}s: dt must be positive and finite")]
    InvalidTimestep(f64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("sensor '{0}' timed out")]
    SensorTimeout(String),

    #[error("sensor '{0}' returned an invalid reading")]
    SensorInvalid(String),

    #[error("actuation failure: {0}")]
    ActuationFailure(String),

    #[error("power system failure: {0}")]
    PowerFailure(String),

    #[error("emergency stop reset rejected: {0}")]
    ResetRejected(String),

    #[error("replay diverged at tick {tick}: {detail}")]
    ReplayMismatch { tick: u64, detail: String },
}

impl SimError {
    /// Whether the error aborts the tick in which it occurred.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SimError::ActuationFailure(_) | SimError::PowerFailure(_)
        )
    }

    pub(crate) fn config(field: &str, reason: &str) -> Self {
        SimError::InvalidConfig(format!("{field} {reason}"))
    }
}

pub type SimResult<T> = Result<T, SimError>;
