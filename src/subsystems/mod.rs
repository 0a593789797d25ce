pub mod controller;
pub mod drive;
pub mod obstacles;
pub mod power;
pub mod sensors;

pub use controller::{
    command_slot, CommandSender, Controller, HeldController, ScriptStep, ScriptedController,
    SlotController,
};
pub use drive::{DifferentialDrive, Drive, WheelchairState};
pub use obstacles::{DiscObstacle, DistanceField, NoObstacles, ObstacleField, PointField};
pub use power::{EmulatedPowerSystem, PowerState, PowerSystem};
pub use sensors::{
    EmulatedSensorSuite, InertialReading, ProximityReading, ReadingStatus, SensorLabel,
    SensorReading, SensorSuite,
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubsystemId {
    Drive,
    Sensors,
    Power,
    Controller,
    Safety,
}

impl core::fmt::Display for SubsystemId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            SubsystemId::Drive => "drive",
            SubsystemId::Sensors => "sensors",
            SubsystemId::Power => "power",
            SubsystemId::Controller => "controller",
            SubsystemId::Safety => "safety",
        };
        f.write_str(name)
    }
}
