//! # Wheelchair Control Simulator
//!
//! A hardware-abstracted control and safety loop for a differential-drive
//! wheelchair. Drive, sensing, power, operator input and the safety monitor
//! are traits, so emulated backends can be swapped for physical ones without
//! touching the loop or the safety logic.
//!
//! ## Features
//!
//! - **Bounded motion**: velocity and acceleration caps on every tick
//! - **Safety interlocks**: deadman timeout, obstacle stop, critical battery
//!   and a latching emergency stop
//! - **Deterministic**: one seeded generator, owned by the loop
//! - **Fail-safe**: actuation and power failures force a stop on the next tick
//! - **Record and replay**: JSON-lines recordings that replay bit for bit
//!
//! ## Quick Start
//!
//! ```rust
//! use wheelsim::{EmulatorConfig, HeldController, PointField, SimulationLoop};
//!
//! let config = EmulatorConfig::default();
//! let dt = config.simulation.timestep();
//! let mut sim = SimulationLoop::emulated(config, PointField::default()).unwrap();
//! sim.set_controller(HeldController::new(0.5, 0.0));
//!
//! for _ in 0..50 {
//!     sim.tick(dt).unwrap();
//! }
//! assert!(sim.state().x > 0.0);
//! ```
//!
//! ## Architecture
//!
//! - [`simulation`] - The fixed-rate loop and its substitution boundary
//! - [`subsystems`] - Drive, sensor, power and controller capabilities
//! - [`safety`] - Command arbitration and the emergency-stop latch
//! - [`scheduler`] - Wall-clock pacing and stop handling
//! - [`telemetry`] - Snapshot sinks
//! - [`replay`] - Recording and bit-exact replay
//! - [`fault_injection`] - Planned failures for exercising the fail-safe path

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::float_cmp)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod fault;
pub mod fault_injection;
pub mod protocol;
pub mod replay;
pub mod safety;
pub mod scheduler;
pub mod simulation;
pub mod subsystems;
pub mod telemetry;

pub use config::{
    DriveConfig, DriveLimits, EmulatorConfig, PowerConfig, ProximitySensorConfig, SafetyConfig,
    SensorConfig, SimulationConfig,
};
pub use error::{SimError, SimResult};
pub use protocol::{DriveCommand, Snapshot};
pub use replay::{verify_replay, Recording};
pub use safety::{EstopCause, LimitReason, SafetyManager, SafetyMonitor, SafetyStatus};
pub use scheduler::{run_headless, RunSummary, StopHandle, StopReason, TickScheduler};
pub use simulation::{LoopStats, SimulationLoop, Subsystems};
pub use subsystems::{
    command_slot, CommandSender, Controller, DifferentialDrive, DiscObstacle, Drive,
    EmulatedPowerSystem, EmulatedSensorSuite, HeldController, NoObstacles, ObstacleField,
    PointField, PowerState, PowerSystem, ScriptStep, ScriptedController, SensorReading,
    SensorSuite, WheelchairState,
};
pub use telemetry::{BroadcastSink, RecordingSink, SnapshotSink, TracingSink};
