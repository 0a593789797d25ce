//! The fixed-rate control loop.
//!
//! One tick polls the controller, lets the safety monitor arbitrate, steps
//! the drive, samples the sensors, updates power and publishes a snapshot.
//! The loop owns all mutable state and the random generator; subsystems only
//! ever see references.

use crate::config::{EmulatorConfig, SafetyConfig};
use crate::error::{SimError, SimResult};
use crate::fault::{FaultManager, FaultRecord};
use crate::protocol::{DriveCommand, Snapshot};
use crate::safety::{EstopCause, LimitReason, SafetyManager, SafetyMonitor, SafetyStatus};
use crate::subsystems::{
    Controller, DifferentialDrive, Drive, EmulatedPowerSystem, EmulatedSensorSuite, ObstacleField,
    PowerState, PowerSystem, ScriptedController, SensorReading, SensorSuite, SubsystemId,
    WheelchairState,
};
use crate::telemetry::SnapshotSink;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

/// The swappable capabilities the loop drives. Any of them can be a physical
/// backend.
pub struct Subsystems {
    pub drive: Box<dyn Drive + Send>,
    pub sensors: Box<dyn SensorSuite + Send>,
    pub power: Box<dyn PowerSystem + Send>,
    pub controller: Box<dyn Controller + Send>,
    pub safety: Box<dyn SafetyMonitor + Send>,
}

impl Subsystems {
    /// Emulated backends for every capability, with an idle scripted
    /// controller.
    pub fn emulated(config: &EmulatorConfig) -> SimResult<Self> {
        Ok(Self {
            drive: Box::new(DifferentialDrive::from_config(config)?),
            sensors: Box::new(EmulatedSensorSuite::new(config.sensors.clone())?),
            power: Box::new(EmulatedPowerSystem::new(config.power.clone())?),
            controller: Box::new(ScriptedController::new(Vec::new())),
            safety: Box::new(SafetyManager::new(config.safety.clone())?),
        })
    }

    pub fn with_drive(mut self, drive: impl Drive + Send + 'static) -> Self {
        self.drive = Box::new(drive);
        self
    }

    pub fn with_sensors(mut self, sensors: impl SensorSuite + Send + 'static) -> Self {
        self.sensors = Box::new(sensors);
        self
    }

    pub fn with_power(mut self, power: impl PowerSystem + Send + 'static) -> Self {
        self.power = Box::new(power);
        self
    }

    pub fn with_controller(mut self, controller: impl Controller + Send + 'static) -> Self {
        self.controller = Box::new(controller);
        self
    }

    pub fn with_safety(mut self, safety: impl SafetyMonitor + Send + 'static) -> Self {
        self.safety = Box::new(safety);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LoopStats {
    /// Ticks attempted with a valid timestep, failed ones included.
    pub steps: u64,
    pub sim_time: f64,
    pub failed_ticks: u64,
    pub fail_safe_ticks: u64,
    pub published: u64,
    pub stale_commands: u64,
    pub rejected_resets: u64,
}

/// Derives tick times from the last change of timestep, so a steady rate
/// does not accumulate rounding error in the simulation clock.
#[derive(Debug, Clone, Copy)]
struct TickClock {
    base_time: f64,
    base_tick: u64,
    dt: f64,
}

impl TickClock {
    fn new(base_time: f64) -> Self {
        Self {
            base_time,
            base_tick: 0,
            dt: 0.0,
        }
    }

    /// Time at `tick`. A timestep different from the previous one rebases
    /// the clock on the last committed tick.
    fn time_at(&mut self, tick: u64, dt: f64, last_tick: u64, last_time: f64) -> f64 {
        if dt != self.dt {
            self.base_time = last_time;
            self.base_tick = last_tick;
            self.dt = dt;
        }
        self.base_time + (tick - self.base_tick) as f64 * dt
    }
}

pub struct SimulationLoop {
    config: EmulatorConfig,
    subsystems: Subsystems,
    obstacles: Box<dyn ObstacleField + Send>,
    sinks: Vec<Box<dyn SnapshotSink + Send>>,
    rng: StdRng,

    initial_state: WheelchairState,
    state: WheelchairState,
    reading: SensorReading,
    power: PowerState,
    status: SafetyStatus,
    last_command: DriveCommand,
    last_forwarded: DriveCommand,
    last_snapshot: Option<Snapshot>,

    tick_count: u64,
    time: f64,
    clock: TickClock,
    fail_safe_pending: bool,
    stop_requested: bool,
    faults: FaultManager,
    stats: LoopStats,
}

impl SimulationLoop {
    pub fn new(
        config: EmulatorConfig,
        subsystems: Subsystems,
        obstacles: Box<dyn ObstacleField + Send>,
        initial_state: WheelchairState,
    ) -> SimResult<Self> {
        config.validate()?;

        let mut subsystems = subsystems;
        let mut rng = StdRng::seed_from_u64(config.simulation.seed);
        let reading = subsystems
            .sensors
            .sample(&initial_state, obstacles.as_ref(), &mut rng);
        let power = subsystems.power.state();

        info!(
            seed = config.simulation.seed,
            update_rate = config.simulation.update_rate,
            "simulation loop initialised"
        );

        Ok(Self {
            config,
            subsystems,
            obstacles,
            sinks: Vec::new(),
            rng,
            initial_state,
            state: initial_state,
            reading,
            power,
            status: SafetyStatus::default(),
            last_command: DriveCommand::default(),
            last_forwarded: DriveCommand::default(),
            last_snapshot: None,
            tick_count: 0,
            time: initial_state.timestamp,
            clock: TickClock::new(initial_state.timestamp),
            fail_safe_pending: false,
            stop_requested: false,
            faults: FaultManager::new(),
            stats: LoopStats::default(),
        })
    }

    /// Fully emulated loop starting at the origin.
    pub fn emulated(
        config: EmulatorConfig,
        obstacles: impl ObstacleField + Send + 'static,
    ) -> SimResult<Self> {
        let subsystems = Subsystems::emulated(&config)?;
        Self::new(config, subsystems, Box::new(obstacles), WheelchairState::default())
    }

    pub fn add_sink(&mut self, sink: impl SnapshotSink + Send + 'static) {
        self.sinks.push(Box::new(sink));
    }

    /// Replaces the controller. The held command keeps driving, and ageing
    /// against the deadman, until the new controller sends its first one.
    pub fn set_controller(&mut self, controller: impl Controller + Send + 'static) {
        self.subsystems.controller = Box::new(controller);
        // Sequence numbers are per controller.
        self.last_command.sequence = 0;
        debug!(tick = self.tick_count, "controller replaced");
    }

    /// Applies new safety limits to the monitor and to the drive's effective
    /// limits. Nothing changes if the combined configuration is invalid. The
    /// e-stop latch is kept.
    pub fn reconfigure_safety(&mut self, safety: SafetyConfig) -> SimResult<()> {
        let mut config = self.config.clone();
        config.safety = safety;
        config.validate()?;

        self.subsystems.safety.reconfigure(config.safety.clone())?;
        let limits = config.drive_limits();
        self.subsystems.drive.set_limits(limits);
        self.config = config;

        info!(
            tick = self.tick_count,
            max_linear_velocity = limits.max_linear_velocity,
            max_angular_velocity = limits.max_angular_velocity,
            "safety limits reconfigured"
        );
        Ok(())
    }

    pub fn set_obstacles(&mut self, obstacles: impl ObstacleField + Send + 'static) {
        self.obstacles = Box::new(obstacles);
    }

    /// Advances the simulation by `dt` seconds.
    ///
    /// Actuation and power failures abort the tick without publishing. The
    /// fault is recorded and the next tick is forced to a stop.
    pub fn tick(&mut self, dt: f64) -> SimResult<WheelchairState> {
        if !(dt.is_finite() && dt > 0.0) {
            return Err(SimError::InvalidTimestep(dt));
        }

        let tick = self.tick_count + 1;
        let now = self.clock.time_at(tick, dt, self.tick_count, self.time);

        let requested = self.poll_controller(now);

        let (mut forwarded, mut status) = self.subsystems.safety.arbitrate(
            &requested,
            &self.reading,
            &self.power,
            now,
        );
        if self.fail_safe_pending {
            forwarded = forwarded.halted();
            status.fail_safe_active = true;
            status.raise(LimitReason::FailSafe);
            self.stats.fail_safe_ticks += 1;
        }

        let next = match self.subsystems.drive.update(&self.state, &forwarded, dt) {
            Ok(next) => next,
            Err(e) => return self.fail_tick(SubsystemId::Drive, e, tick, now, status),
        };
        self.classify_drive_limit(&forwarded, &next, &mut status);
        self.state = next;

        self.reading = self
            .subsystems
            .sensors
            .sample(&self.state, self.obstacles.as_ref(), &mut self.rng);

        self.power = match self
            .subsystems
            .power
            .update(forwarded.linear, forwarded.angular, dt)
        {
            Ok(power) => power,
            Err(e) => return self.fail_tick(SubsystemId::Power, e, tick, now, status),
        };

        self.commit(tick, now, status);
        if self.fail_safe_pending {
            self.fail_safe_pending = false;
            let resolved = self.faults.resolve_all(now);
            info!(tick, resolved, "fail-safe stop completed, resuming arbitration");
        }
        self.last_forwarded = forwarded;

        let snapshot = Snapshot {
            tick,
            time: now,
            state: self.state,
            requested,
            forwarded,
            sensors: self.reading.clone(),
            power: self.power,
            safety: status,
        };
        trace!(tick, linear = forwarded.linear, angular = forwarded.angular, "tick");
        self.publish(snapshot);

        Ok(self.state)
    }

    fn poll_controller(&mut self, now: f64) -> DriveCommand {
        match self.subsystems.controller.poll(now) {
            Some(command) if command.sequence > self.last_command.sequence => {
                self.last_command = command;
            }
            Some(command) => {
                self.stats.stale_commands += 1;
                debug!(
                    sequence = command.sequence,
                    last = self.last_command.sequence,
                    "ignoring stale command"
                );
            }
            None => {}
        }
        self.last_command
    }

    fn classify_drive_limit(
        &self,
        forwarded: &DriveCommand,
        next: &WheelchairState,
        status: &mut SafetyStatus,
    ) {
        let limits = self.subsystems.drive.limits();
        if forwarded.linear.abs() > limits.max_linear_velocity
            || forwarded.angular.abs() > limits.max_angular_velocity
        {
            status.speed_limited = true;
            status.raise(LimitReason::Speed);
        } else if next.linear_velocity != forwarded.linear
            || next.angular_velocity != forwarded.angular
        {
            status.raise(LimitReason::Acceleration);
        }
    }

    fn commit(&mut self, tick: u64, now: f64, status: SafetyStatus) {
        self.tick_count = tick;
        self.time = now;
        self.status = status;
        self.stats.steps += 1;
        self.stats.sim_time = now;
    }

    fn fail_tick(
        &mut self,
        subsystem: SubsystemId,
        error: SimError,
        tick: u64,
        now: f64,
        mut status: SafetyStatus,
    ) -> SimResult<WheelchairState> {
        status.fail_safe_active = true;
        status.raise(LimitReason::FailSafe);
        self.commit(tick, now, status);
        self.stats.failed_ticks += 1;

        let id = self.faults.record_fault(subsystem, error.clone(), tick, now);
        if !self.fail_safe_pending {
            error!(%subsystem, tick, fault = id, %error, "tick failed, entering fail-safe stop");
        } else {
            warn!(%subsystem, tick, fault = id, %error, "tick failed again during fail-safe");
        }
        self.fail_safe_pending = true;

        Err(error)
    }

    fn publish(&mut self, snapshot: Snapshot) {
        for sink in self.sinks.iter_mut() {
            sink.publish(&snapshot);
        }
        self.stats.published += 1;
        self.last_snapshot = Some(snapshot);
    }

    /// Asks the loop to stop at the next tick boundary.
    pub fn stop(&mut self) {
        if !self.stop_requested {
            info!(tick = self.tick_count, "stop requested");
        }
        self.stop_requested = true;
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    /// Latches an immediate stop and publishes a final snapshot whose
    /// forwarded command is zero.
    pub fn force_stop(&mut self) -> Snapshot {
        warn!(tick = self.tick_count, "forced stop");
        self.subsystems
            .safety
            .trigger_emergency_stop(EstopCause::ForcedShutdown, self.time);
        self.stop_requested = true;

        let requested = self.last_command;
        let (forwarded, status) = self.subsystems.safety.arbitrate(
            &requested,
            &self.reading,
            &self.power,
            self.time,
        );
        debug_assert!(forwarded.is_stop(), "latched monitor forwarded motion");

        self.status = status;
        self.last_forwarded = forwarded;
        let snapshot = Snapshot {
            tick: self.tick_count,
            time: self.time,
            state: self.state,
            requested,
            forwarded,
            sensors: self.reading.clone(),
            power: self.power,
            safety: status,
        };
        self.publish(snapshot.clone());
        snapshot
    }

    pub fn trigger_emergency_stop(&mut self, cause: EstopCause) {
        self.subsystems.safety.trigger_emergency_stop(cause, self.time);
    }

    /// Clears the e-stop latch if the monitor allows it.
    pub fn reset_emergency_stop(&mut self) -> SimResult<()> {
        let result = self
            .subsystems
            .safety
            .reset_emergency_stop(&self.reading, &self.last_command);
        if result.is_err() {
            self.stats.rejected_resets += 1;
        }
        result
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.subsystems.safety.latch().is_some()
    }

    /// Restores the initial state, charge and random stream. The e-stop latch
    /// is left as it is.
    pub fn reset(&mut self) {
        info!(tick = self.tick_count, "simulation reset");
        self.rng = StdRng::seed_from_u64(self.config.simulation.seed);
        self.subsystems.sensors.reset();
        self.subsystems.power.reset();
        self.subsystems.controller.reset();

        self.state = self.initial_state;
        self.time = self.initial_state.timestamp;
        self.clock = TickClock::new(self.time);
        self.tick_count = 0;
        self.reading = self
            .subsystems
            .sensors
            .sample(&self.state, self.obstacles.as_ref(), &mut self.rng);
        self.power = self.subsystems.power.state();
        self.status = SafetyStatus::default();
        self.last_command = DriveCommand::default();
        self.last_forwarded = DriveCommand::default();
        self.last_snapshot = None;
        self.fail_safe_pending = false;
        self.stop_requested = false;
        self.faults.clear();
        self.stats = LoopStats::default();
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    pub fn timestep(&self) -> f64 {
        self.config.simulation.timestep()
    }

    pub fn state(&self) -> &WheelchairState {
        &self.state
    }

    pub fn status(&self) -> &SafetyStatus {
        &self.status
    }

    pub fn power(&self) -> &PowerState {
        &self.power
    }

    pub fn reading(&self) -> &SensorReading {
        &self.reading
    }

    pub fn last_command(&self) -> &DriveCommand {
        &self.last_command
    }

    pub fn last_forwarded(&self) -> &DriveCommand {
        &self.last_forwarded
    }

    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.last_snapshot.as_ref()
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn fault_history(&self) -> &[FaultRecord] {
        self.faults.get_fault_history()
    }

    pub fn fail_safe_pending(&self) -> bool {
        self.fail_safe_pending
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn time(&self) -> f64 {
        self.time
    }
}
