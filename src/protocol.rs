use serde::{Deserialize, Serialize};

use crate::safety::SafetyStatus;
use crate::subsystems::{PowerState, SensorReading, WheelchairState};

/// A velocity request as issued by a controller.
///
/// `sequence` increases monotonically per producer; `timestamp` is the time
/// the operator issued it and is what the deadman check measures against.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DriveCommand {
    pub linear: f64,
    pub angular: f64,
    pub sequence: u64,
    pub timestamp: f64,
    pub emergency_stop: bool,
}

impl DriveCommand {
    pub fn new(linear: f64, angular: f64, sequence: u64, timestamp: f64) -> Self {
        Self {
            linear,
            angular,
            sequence,
            timestamp,
            emergency_stop: false,
        }
    }

    pub fn with_emergency_stop(mut self, emergency_stop: bool) -> Self {
        self.emergency_stop = emergency_stop;
        self
    }

    /// Same identity, zero velocity.
    pub fn halted(&self) -> Self {
        Self {
            linear: 0.0,
            angular: 0.0,
            ..*self
        }
    }

    pub fn is_stop(&self) -> bool {
        self.linear == 0.0 && self.angular == 0.0
    }
}

/// The atomic per-tick record handed to telemetry and recording consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tick: u64,
    pub time: f64,
    pub state: WheelchairState,
    /// What the controller asked for this tick.
    pub requested: DriveCommand,
    /// What the safety monitor let through to the drive.
    pub forwarded: DriveCommand,
    pub sensors: SensorReading,
    pub power: PowerState,
    pub safety: SafetyStatus,
}

impl Snapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
