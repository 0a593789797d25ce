use std::collections::VecDeque;
use wheelsim::fault_injection::{
    sensor_timeout, FaultInjectingDrive, FaultInjectingPower, FaultInjectingSensors, FaultPlan,
    InjectedFault,
};
use wheelsim::subsystems::{ReadingStatus, SubsystemId};
use wheelsim::telemetry::RecordingHandle;
use wheelsim::*;

const DT: f64 = 0.02;

fn noiseless_config() -> EmulatorConfig {
    EmulatorConfig {
        sensors: SensorConfig::noiseless(),
        ..EmulatorConfig::default()
    }
}

fn recorded(sim: &mut SimulationLoop) -> RecordingHandle {
    let sink = RecordingSink::new();
    let handle = sink.handle();
    sim.add_sink(sink);
    handle
}

fn held_loop(config: EmulatorConfig, linear: f64, angular: f64) -> SimulationLoop {
    let mut sim = SimulationLoop::emulated(config, NoObstacles).unwrap();
    sim.set_controller(HeldController::new(linear, angular));
    sim
}

fn run(sim: &mut SimulationLoop, ticks: usize) {
    for _ in 0..ticks {
        sim.tick(DT).unwrap();
    }
}

#[test]
fn test_acceleration_ramp_to_full_speed() {
    let mut sim = held_loop(noiseless_config(), 1.0, 0.0);
    let handle = recorded(&mut sim);

    for tick in 1..=50u64 {
        let state = sim.tick(DT).unwrap();
        if tick < 50 {
            assert!(state.linear_velocity < 1.0);
            assert_eq!(sim.status().active_limit_reason, LimitReason::Acceleration);
        }
    }

    assert_eq!(sim.state().linear_velocity, 1.0);
    assert!(sim.status().is_normal());

    let snapshots = handle.snapshots();
    assert_eq!(snapshots.len(), 50);
    assert!(snapshots.iter().all(|s| s.forwarded.linear == 1.0));
    for pair in snapshots.windows(2) {
        let dv = pair[1].state.linear_velocity - pair[0].state.linear_velocity;
        assert!(dv.abs() <= 1.0 * DT + 1e-9);
    }
}

#[test]
fn test_request_above_safety_limit_is_reported_as_speed() {
    let mut sim = held_loop(noiseless_config(), 3.0, 0.0);
    sim.tick(DT).unwrap();

    let snapshot = sim.last_snapshot().unwrap();
    assert_eq!(snapshot.requested.linear, 3.0);
    assert_eq!(snapshot.forwarded.linear, 1.0);
    assert!(snapshot.safety.speed_limited);
    assert_eq!(snapshot.safety.active_limit_reason, LimitReason::Speed);
}

#[test]
fn test_deadman_stops_a_silent_controller() {
    let mut sim = SimulationLoop::emulated(noiseless_config(), NoObstacles).unwrap();
    sim.set_controller(ScriptedController::new(vec![ScriptStep::new(0.0, 0.5, 0.0)]));
    let handle = recorded(&mut sim);

    run(&mut sim, 60);
    let snapshots = handle.snapshots();

    // The one command was issued at t = 0 and the timeout is 0.5 s, which
    // tick 25 reaches exactly.
    assert_eq!(snapshots[24].time, 0.5);
    for snapshot in &snapshots[..25] {
        assert!(!snapshot.safety.deadman_expired, "tick {}", snapshot.tick);
        assert_eq!(snapshot.forwarded.linear, 0.5);
    }
    for snapshot in &snapshots[25..] {
        assert!(snapshot.safety.deadman_expired, "tick {}", snapshot.tick);
        assert!(snapshot.forwarded.is_stop());
        assert_eq!(snapshot.safety.active_limit_reason, LimitReason::Deadman);
        assert_eq!(snapshot.requested.sequence, 1);
    }
    assert_eq!(sim.state().linear_velocity, 0.0);
}

#[test]
fn test_obstacle_ahead_blocks_forward_but_not_reverse() {
    let mut sim = SimulationLoop::emulated(
        noiseless_config(),
        PointField::new(vec![DiscObstacle::new(0.8, 0.0, 0.1)]),
    )
    .unwrap();
    sim.set_controller(HeldController::new(0.5, 0.0));

    run(&mut sim, 20);
    assert_eq!(sim.state().x, 0.0);
    assert_eq!(sim.last_forwarded().linear, 0.0);
    assert!(sim.status().obstacle_detected);
    assert_eq!(sim.status().active_limit_reason, LimitReason::Obstacle);

    let front = sim.reading().reading("front").unwrap();
    assert!((front.distance.unwrap() - 0.3).abs() < 1e-9);

    sim.set_controller(HeldController::new(-0.3, 0.0));
    run(&mut sim, 20);
    assert!(sim.state().x < 0.0);
    assert!(!sim.status().obstacle_detected);
}

#[test]
fn test_emergency_stop_latch_and_reset() {
    let mut sim = SimulationLoop::emulated(noiseless_config(), NoObstacles).unwrap();
    let (sender, controller) = command_slot();
    sim.set_controller(controller);

    sender.submit(0.5, 0.0, sim.time(), false);
    run(&mut sim, 10);
    assert!(sim.state().linear_velocity > 0.0);

    sender.submit(0.5, 0.0, sim.time(), true);
    sim.tick(DT).unwrap();
    assert!(sim.is_emergency_stopped());
    assert!(sim.status().emergency_stop_active);
    assert!(sim.last_forwarded().is_stop());

    // Still held down.
    assert!(matches!(
        sim.reset_emergency_stop(),
        Err(SimError::ResetRejected(_))
    ));
    assert_eq!(sim.stats().rejected_resets, 1);

    // Released, but the latch holds until an explicit reset.
    sender.submit(0.5, 0.0, sim.time(), false);
    run(&mut sim, 5);
    assert!(sim.is_emergency_stopped());
    assert!(sim.last_forwarded().is_stop());

    sim.reset_emergency_stop().unwrap();
    assert!(!sim.is_emergency_stopped());

    sender.submit(0.5, 0.0, sim.time(), false);
    sim.tick(DT).unwrap();
    assert_eq!(sim.last_forwarded().linear, 0.5);
    assert_eq!(sim.status().active_limit_reason, LimitReason::Acceleration);
}

#[test]
fn test_replacing_the_controller_accepts_its_commands() {
    let mut sim = held_loop(noiseless_config(), 0.5, 0.0);
    let handle = recorded(&mut sim);
    run(&mut sim, 20);
    assert_eq!(sim.last_command().sequence, 20);

    sim.set_controller(HeldController::new(-0.3, 0.0));
    run(&mut sim, 40);

    assert_eq!(sim.stats().stale_commands, 0);
    assert_eq!(sim.last_command().linear, -0.3);
    assert_eq!(sim.last_command().sequence, 40);
    assert_eq!(sim.state().linear_velocity, -0.3);

    let snapshots = handle.snapshots();
    assert_eq!(snapshots[20].requested.linear, -0.3);
    assert_eq!(snapshots[20].requested.sequence, 1);
}

#[test]
fn test_held_command_ages_after_controller_goes_quiet() {
    let mut sim = held_loop(noiseless_config(), 0.5, 0.0);
    run(&mut sim, 10);

    sim.set_controller(ScriptedController::new(Vec::new()));
    run(&mut sim, 24);
    assert!(!sim.status().deadman_expired);
    assert_eq!(sim.last_command().sequence, 0);
    assert_eq!(sim.last_forwarded().linear, 0.5);

    run(&mut sim, 2);
    assert!(sim.status().deadman_expired);
    assert!(sim.last_forwarded().is_stop());
}

#[test]
fn test_clock_does_not_drift_over_long_runs() {
    let mut sim = held_loop(noiseless_config(), 0.0, 0.0);
    run(&mut sim, 10_000);
    assert_eq!(sim.tick_count(), 10_000);
    assert_eq!(sim.time(), 200.0);
    assert_eq!(sim.last_snapshot().unwrap().time, 200.0);
}

#[test]
fn test_clock_follows_a_timestep_change() {
    let mut sim = held_loop(noiseless_config(), 0.0, 0.0);
    run(&mut sim, 10);
    let before = sim.time();

    for tick in 1..=10 {
        sim.tick(0.05).unwrap();
        assert_eq!(sim.time(), before + tick as f64 * 0.05);
    }
    assert!((sim.time() - 0.7).abs() < 1e-12);

    sim.reset();
    run(&mut sim, 5);
    assert_eq!(sim.time(), 5.0 * DT);
}

#[test]
fn test_reconfigured_safety_limits_reach_the_drive() {
    let mut sim = held_loop(noiseless_config(), 1.5, 0.0);
    run(&mut sim, 60);
    assert_eq!(sim.state().linear_velocity, 1.0);
    assert_eq!(sim.status().active_limit_reason, LimitReason::Speed);

    let faster = SafetyConfig {
        max_linear_velocity: 1.5,
        ..SafetyConfig::default()
    };
    sim.reconfigure_safety(faster).unwrap();
    assert_eq!(sim.config().safety.max_linear_velocity, 1.5);
    assert_eq!(sim.config().drive_limits().max_linear_velocity, 1.5);

    run(&mut sim, 30);
    assert_eq!(sim.state().linear_velocity, 1.5);
    assert!(sim.status().is_normal());

    let slower = SafetyConfig {
        max_linear_velocity: 0.4,
        ..SafetyConfig::default()
    };
    sim.reconfigure_safety(slower).unwrap();
    sim.tick(DT).unwrap();
    assert_eq!(sim.last_forwarded().linear, 0.4);
    assert!(sim.status().speed_limited);
    run(&mut sim, 60);
    assert_eq!(sim.state().linear_velocity, 0.4);
}

#[test]
fn test_invalid_safety_reconfiguration_changes_nothing() {
    let mut sim = held_loop(noiseless_config(), 0.5, 0.0);
    run(&mut sim, 3);
    sim.trigger_emergency_stop(EstopCause::External);

    let invalid = SafetyConfig {
        max_linear_velocity: 0.2,
        obstacle_slow_distance: 0.1,
        ..SafetyConfig::default()
    };
    assert!(matches!(
        sim.reconfigure_safety(invalid),
        Err(SimError::InvalidConfig(_))
    ));
    assert_eq!(sim.config().safety, SafetyConfig::default());
    assert_eq!(sim.config().drive_limits().max_linear_velocity, 1.0);

    sim.reconfigure_safety(SafetyConfig {
        max_linear_velocity: 0.2,
        ..SafetyConfig::default()
    })
    .unwrap();
    assert!(sim.is_emergency_stopped());
}

#[test]
fn test_slow_zone_limits_approach_speed() {
    let mut sim = SimulationLoop::emulated(
        noiseless_config(),
        PointField::new(vec![DiscObstacle::new(1.5, 0.0, 0.1)]),
    )
    .unwrap();
    sim.set_controller(HeldController::new(1.0, 0.0));
    let handle = recorded(&mut sim);

    run(&mut sim, 150);
    assert_eq!(sim.stats().failed_ticks, 0);

    // The front sensor sits 0.4 m ahead of the origin.
    let stop_x = 1.4 - 0.4 - 0.5;
    assert!(sim.state().x <= stop_x + 1e-9);
    assert!(sim.state().x > stop_x - 0.1);

    let snapshots = handle.snapshots();
    assert!(snapshots.iter().any(|s| s.safety.obstacle_slowdown));
    for snapshot in &snapshots {
        if let Some(distance) = snapshot.sensors.reading("front").and_then(|r| r.distance) {
            assert!(distance >= 0.5 - 1e-9, "tick {}", snapshot.tick);
        }
    }
}

#[test]
fn test_external_emergency_stop_reset_blocked_by_obstacle() {
    let mut sim = SimulationLoop::emulated(
        noiseless_config(),
        PointField::new(vec![DiscObstacle::new(0.8, 0.0, 0.1)]),
    )
    .unwrap();
    sim.set_controller(HeldController::new(0.0, 0.0));
    run(&mut sim, 2);

    sim.trigger_emergency_stop(EstopCause::External);
    assert!(sim.reset_emergency_stop().is_err());

    sim.set_obstacles(NoObstacles);
    sim.tick(DT).unwrap();
    sim.reset_emergency_stop().unwrap();
    assert!(!sim.is_emergency_stopped());
}

fn trace(sim: &mut SimulationLoop, ticks: usize) -> Vec<(WheelchairState, SensorReading, PowerState)> {
    (0..ticks)
        .map(|_| {
            let state = sim.tick(DT).unwrap();
            (state, sim.reading().clone(), *sim.power())
        })
        .collect()
}

fn noisy_loop(seed: u64) -> SimulationLoop {
    let mut config = EmulatorConfig::default();
    config.simulation.seed = seed;
    let obstacles = PointField::from_points(&[(3.0, 0.5), (1.0, 2.0), (-1.5, -1.0)], 0.2);
    let mut sim = SimulationLoop::emulated(config, obstacles).unwrap();
    sim.set_controller(HeldController::new(0.6, 0.3));
    sim
}

#[test]
fn test_same_seed_gives_identical_runs() {
    let mut a = noisy_loop(7);
    let mut b = noisy_loop(7);
    assert_eq!(trace(&mut a, 200), trace(&mut b, 200));
}

#[test]
fn test_different_seed_gives_different_sensor_noise() {
    let mut a = noisy_loop(7);
    let mut b = noisy_loop(8);
    let ta = trace(&mut a, 20);
    let tb = trace(&mut b, 20);
    assert_ne!(ta, tb);
    // Noise never reaches the pose.
    assert_eq!(ta.last().unwrap().0, tb.last().unwrap().0);
}

#[test]
fn test_reset_replays_the_same_run() {
    let mut sim = noisy_loop(11);
    let first = trace(&mut sim, 100);

    sim.reset();
    assert_eq!(sim.tick_count(), 0);
    assert_eq!(sim.time(), 0.0);
    assert_eq!(sim.power().state_of_charge, 1.0);
    assert!(sim.last_snapshot().is_none());

    let second = trace(&mut sim, 100);
    assert_eq!(first, second);
}

#[test]
fn test_reset_keeps_the_emergency_stop_latch() {
    let mut sim = held_loop(noiseless_config(), 0.5, 0.0);
    run(&mut sim, 3);
    sim.trigger_emergency_stop(EstopCause::External);

    sim.reset();
    assert!(sim.is_emergency_stopped());
    sim.tick(DT).unwrap();
    assert!(sim.last_forwarded().is_stop());
}

#[test]
fn test_actuation_failure_enters_fail_safe_for_one_tick() {
    let config = noiseless_config();
    let drive = FaultInjectingDrive::new(
        DifferentialDrive::from_config(&config).unwrap(),
        FaultPlan::new().with(10..11, InjectedFault::Actuation),
    );
    let subsystems = Subsystems::emulated(&config)
        .unwrap()
        .with_drive(drive)
        .with_controller(HeldController::new(0.5, 0.0));
    let mut sim = SimulationLoop::new(
        config,
        subsystems,
        Box::new(NoObstacles),
        WheelchairState::default(),
    )
    .unwrap();
    let handle = recorded(&mut sim);

    run(&mut sim, 9);
    let before = sim.state().linear_velocity;

    let result = sim.tick(DT);
    assert!(matches!(result, Err(SimError::ActuationFailure(_))));
    assert_eq!(sim.tick_count(), 10);
    assert!(sim.fail_safe_pending());
    assert_eq!(sim.stats().failed_ticks, 1);
    assert_eq!(handle.len(), 9);
    assert_eq!(sim.state().linear_velocity, before);

    let faults = sim.fault_history();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].subsystem, SubsystemId::Drive);
    assert_eq!(faults[0].tick, 10);
    assert!(!faults[0].resolved);

    sim.tick(DT).unwrap();
    let snapshot = handle.last().unwrap();
    assert_eq!(snapshot.tick, 11);
    assert!(snapshot.forwarded.is_stop());
    assert!(snapshot.safety.fail_safe_active);
    assert_eq!(snapshot.safety.active_limit_reason, LimitReason::FailSafe);
    assert!(snapshot.state.linear_velocity < before);
    assert!(!sim.fail_safe_pending());
    assert!(sim.fault_history()[0].resolved);
    assert_eq!(sim.stats().fail_safe_ticks, 1);

    sim.tick(DT).unwrap();
    let snapshot = handle.last().unwrap();
    assert!(!snapshot.safety.fail_safe_active);
    assert_eq!(snapshot.forwarded.linear, 0.5);
}

#[test]
fn test_power_failure_is_recorded_against_power() {
    let config = noiseless_config();
    let power = FaultInjectingPower::new(
        EmulatedPowerSystem::new(config.power.clone()).unwrap(),
        FaultPlan::new().with(3..4, InjectedFault::PowerFailure),
    );
    let subsystems = Subsystems::emulated(&config)
        .unwrap()
        .with_power(power)
        .with_controller(HeldController::new(0.5, 0.0));
    let mut sim = SimulationLoop::new(
        config,
        subsystems,
        Box::new(NoObstacles),
        WheelchairState::default(),
    )
    .unwrap();

    run(&mut sim, 2);
    assert!(matches!(sim.tick(DT), Err(SimError::PowerFailure(_))));
    assert_eq!(sim.fault_history()[0].subsystem, SubsystemId::Power);

    sim.tick(DT).unwrap();
    assert!(sim.status().fail_safe_active);
    assert_eq!(sim.stats().published, 3);
}

#[test]
fn test_sensor_faults_degrade_readings_without_failing_ticks() {
    let config = noiseless_config();
    let sensors = FaultInjectingSensors::new(
        EmulatedSensorSuite::new(config.sensors.clone()).unwrap(),
        FaultPlan::new().with(5..8, sensor_timeout("front")),
    );
    let subsystems = Subsystems::emulated(&config)
        .unwrap()
        .with_sensors(sensors)
        .with_controller(HeldController::new(0.0, 0.0));
    let obstacles = PointField::new(vec![DiscObstacle::new(2.0, 0.0, 0.1)]);
    let mut sim = SimulationLoop::new(
        config,
        subsystems,
        Box::new(obstacles),
        WheelchairState::default(),
    )
    .unwrap();
    let handle = recorded(&mut sim);

    run(&mut sim, 10);
    assert_eq!(sim.stats().failed_ticks, 0);

    for snapshot in handle.snapshots() {
        let front = snapshot.sensors.reading("front").unwrap();
        let expected = if (5..8).contains(&snapshot.tick) {
            ReadingStatus::Timeout
        } else {
            ReadingStatus::Valid
        };
        assert_eq!(front.status, expected, "tick {}", snapshot.tick);
    }
}

#[test]
fn test_force_stop_publishes_a_final_zero_snapshot() {
    let mut sim = held_loop(noiseless_config(), 0.5, 0.0);
    let handle = recorded(&mut sim);
    run(&mut sim, 10);

    let snapshot = sim.force_stop();
    assert_eq!(snapshot.tick, 10);
    assert!(snapshot.forwarded.is_stop());
    assert!(snapshot.safety.emergency_stop_active);
    assert!(sim.stop_requested());
    assert!(sim.is_emergency_stopped());
    assert_eq!(handle.len(), 11);
    assert_eq!(handle.last(), Some(snapshot));

    run(&mut sim, 5);
    assert!(sim.last_forwarded().is_stop());
}

struct QueuedController {
    commands: VecDeque<DriveCommand>,
}

impl Controller for QueuedController {
    fn poll(&mut self, _now: f64) -> Option<DriveCommand> {
        self.commands.pop_front()
    }
}

#[test]
fn test_out_of_order_commands_are_ignored() {
    let mut sim = SimulationLoop::emulated(noiseless_config(), NoObstacles).unwrap();
    sim.set_controller(QueuedController {
        commands: VecDeque::from(vec![
            DriveCommand::new(0.2, 0.0, 5, 0.0),
            DriveCommand::new(0.9, 0.0, 3, 0.02),
            DriveCommand::new(0.4, 0.0, 6, 0.04),
        ]),
    });

    sim.tick(DT).unwrap();
    sim.tick(DT).unwrap();
    assert_eq!(sim.last_command().sequence, 5);
    assert_eq!(sim.last_forwarded().linear, 0.2);
    assert_eq!(sim.stats().stale_commands, 1);

    sim.tick(DT).unwrap();
    assert_eq!(sim.last_command().sequence, 6);
    assert_eq!(sim.last_forwarded().linear, 0.4);
}

#[test]
fn test_invalid_timestep_leaves_the_loop_untouched() {
    let mut sim = held_loop(noiseless_config(), 0.5, 0.0);
    run(&mut sim, 3);
    let state = *sim.state();

    for dt in [0.0, -DT, f64::NAN] {
        assert!(matches!(sim.tick(dt), Err(SimError::InvalidTimestep(_))));
    }
    assert_eq!(sim.tick_count(), 3);
    assert_eq!(*sim.state(), state);
    assert_eq!(sim.stats().failed_ticks, 0);
}

#[test]
fn test_invalid_config_is_rejected_at_construction() {
    let mut config = EmulatorConfig::default();
    config.simulation.update_rate = 0.0;
    assert!(matches!(
        SimulationLoop::emulated(config, NoObstacles),
        Err(SimError::InvalidConfig(_))
    ));
}

#[test]
fn test_critical_battery_holds_the_chair() {
    let config = noiseless_config();
    let mut power = EmulatedPowerSystem::new(config.power.clone()).unwrap();
    power.set_state_of_charge(0.04);
    let subsystems = Subsystems::emulated(&config)
        .unwrap()
        .with_power(power)
        .with_controller(HeldController::new(0.5, 0.0));
    let mut sim = SimulationLoop::new(
        config,
        subsystems,
        Box::new(NoObstacles),
        WheelchairState::default(),
    )
    .unwrap();

    run(&mut sim, 10);
    assert_eq!(sim.state().linear_velocity, 0.0);
    assert!(sim.status().battery_critical);
    assert_eq!(sim.status().active_limit_reason, LimitReason::LowBattery);
}

#[test]
fn test_stats_track_steps_and_time() {
    let mut sim = held_loop(noiseless_config(), 0.2, 0.1);
    run(&mut sim, 25);

    let stats = sim.stats();
    assert_eq!(stats.steps, 25);
    assert_eq!(stats.published, 25);
    assert!((stats.sim_time - 0.5).abs() < 1e-9);
    assert!((sim.timestep() - DT).abs() < 1e-12);
}
