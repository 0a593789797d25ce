use std::time::Duration;
use wheelsim::*;

/// 50 Hz sped up 100x: a 0.2 ms wall-clock period.
fn fast_config() -> EmulatorConfig {
    let mut config = EmulatorConfig::default();
    config.sensors = SensorConfig::noiseless();
    config.simulation.realtime_factor = 100.0;
    config
}

fn held_loop(linear: f64) -> SimulationLoop {
    let mut sim = SimulationLoop::emulated(fast_config(), NoObstacles).unwrap();
    sim.set_controller(HeldController::new(linear, 0.0));
    sim
}

#[tokio::test]
async fn test_runs_until_tick_budget() {
    let mut sim = held_loop(0.5);
    let scheduler = TickScheduler::new(&sim.config().simulation)
        .unwrap()
        .with_max_ticks(25);

    let summary = scheduler.run(&mut sim).await;
    assert_eq!(summary.ticks, 25);
    assert_eq!(summary.failed_ticks, 0);
    assert_eq!(summary.reason, StopReason::Completed);
    assert_eq!(sim.tick_count(), 25);
    assert!((summary.sim_time - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_period_scales_with_realtime_factor() {
    let scheduler = TickScheduler::new(&fast_config().simulation).unwrap();
    assert!((scheduler.period().as_secs_f64() - 0.0002).abs() < 1e-9);

    let scheduler = TickScheduler::new(&SimulationConfig::default()).unwrap();
    assert!((scheduler.period().as_secs_f64() - 0.02).abs() < 1e-9);
}

#[tokio::test]
async fn test_stop_from_another_task() {
    let mut sim = held_loop(0.5);
    let scheduler = TickScheduler::new(&sim.config().simulation).unwrap();
    let handle = scheduler.handle();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop();
    });

    let summary = scheduler.run(&mut sim).await;
    assert_eq!(summary.reason, StopReason::Requested);
    assert!(summary.ticks > 0);
    assert!(!sim.is_emergency_stopped());
}

#[tokio::test]
async fn test_force_stop_latches_and_publishes() {
    let mut sim = held_loop(0.5);
    let sink = RecordingSink::new();
    let recording = sink.handle();
    sim.add_sink(sink);

    let scheduler = TickScheduler::new(&sim.config().simulation).unwrap();
    scheduler.handle().force_stop();

    let summary = scheduler.run(&mut sim).await;
    assert_eq!(summary.reason, StopReason::Forced);
    assert_eq!(summary.ticks, 0);
    assert!(sim.is_emergency_stopped());

    let last = recording.last().unwrap();
    assert_eq!(last.tick, 0);
    assert!(last.forwarded.is_stop());
}

#[tokio::test]
async fn test_paused_scheduler_does_not_advance() {
    let mut sim = held_loop(0.5);
    let scheduler = TickScheduler::new(&sim.config().simulation).unwrap();
    let handle = scheduler.handle();
    handle.pause();
    assert!(handle.is_paused());

    let stopper = handle.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        stopper.stop();
    });

    let summary = scheduler.run(&mut sim).await;
    assert_eq!(summary.ticks, 0);
    assert_eq!(sim.tick_count(), 0);

    handle.resume();
    assert!(!handle.is_paused());
}

#[tokio::test]
async fn test_estop_reset_request_is_applied_after_a_tick() {
    let mut sim = held_loop(0.5);
    sim.trigger_emergency_stop(EstopCause::External);

    let scheduler = TickScheduler::new(&sim.config().simulation)
        .unwrap()
        .with_max_ticks(10);
    scheduler.handle().request_estop_reset();

    scheduler.run(&mut sim).await;
    assert!(!sim.is_emergency_stopped());
    assert!(sim.state().linear_velocity > 0.0);
}

#[tokio::test]
async fn test_failed_ticks_are_counted_not_fatal() {
    use wheelsim::fault_injection::{FaultInjectingDrive, FaultPlan, InjectedFault};

    let config = fast_config();
    let drive = FaultInjectingDrive::new(
        DifferentialDrive::from_config(&config).unwrap(),
        FaultPlan::new().with(3..5, InjectedFault::Actuation),
    );
    let subsystems = Subsystems::emulated(&config)
        .unwrap()
        .with_drive(drive)
        .with_controller(HeldController::new(0.5, 0.0));
    let mut sim = SimulationLoop::new(
        config.clone(),
        subsystems,
        Box::new(NoObstacles),
        WheelchairState::default(),
    )
    .unwrap();

    let scheduler = TickScheduler::new(&config.simulation)
        .unwrap()
        .with_max_ticks(10);
    let summary = scheduler.run(&mut sim).await;
    assert_eq!(summary.ticks, 10);
    assert_eq!(summary.failed_ticks, 2);
    assert_eq!(sim.stats().failed_ticks, 2);
}

#[test]
fn test_headless_run() {
    let mut sim = held_loop(0.5);
    let summary = run_headless(&mut sim, 100);
    assert_eq!(summary.ticks, 100);
    assert_eq!(summary.reason, StopReason::Completed);
    assert_eq!(summary.overruns, 0);
    assert!((summary.sim_time - 2.0).abs() < 1e-9);
    assert_eq!(sim.state().linear_velocity, 0.5);
}

#[test]
fn test_headless_run_honours_stop() {
    let mut sim = held_loop(0.5);
    run_headless(&mut sim, 5);
    sim.stop();

    let summary = run_headless(&mut sim, 100);
    assert_eq!(summary.ticks, 0);
    assert_eq!(summary.reason, StopReason::Requested);
    assert_eq!(sim.tick_count(), 5);
}

#[test]
fn test_invalid_realtime_factor_is_rejected() {
    let config = SimulationConfig {
        realtime_factor: 0.0,
        ..SimulationConfig::default()
    };
    assert!(matches!(
        TickScheduler::new(&config),
        Err(SimError::InvalidConfig(_))
    ));
}

#[test]
fn test_realtime_factor_without_a_usable_period_is_rejected() {
    for realtime_factor in [1e12, 1e-300] {
        let config = SimulationConfig {
            realtime_factor,
            ..SimulationConfig::default()
        };
        assert!(
            matches!(TickScheduler::new(&config), Err(SimError::InvalidConfig(_))),
            "realtime factor {realtime_factor}"
        );
    }

    let config = SimulationConfig {
        realtime_factor: 1e6,
        ..SimulationConfig::default()
    };
    let scheduler = TickScheduler::new(&config).unwrap();
    assert!(scheduler.period() > Duration::ZERO);
    assert!(scheduler.period() < Duration::from_micros(1));
}
