use crate::config::SimulationConfig;
use crate::error::{SimError, SimResult};
use crate::simulation::SimulationLoop;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Debug, Default)]
struct StopFlags {
    stop: AtomicBool,
    force: AtomicBool,
    paused: AtomicBool,
    reset_estop: AtomicBool,
}

/// Cloneable remote control for a running scheduler. Requests take effect
/// at the next tick boundary.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flags: Arc<StopFlags>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cooperative stop: the current tick finishes, nothing is latched.
    pub fn stop(&self) {
        self.flags.stop.store(true, Ordering::SeqCst);
    }

    /// Immediate stop through the e-stop latch.
    pub fn force_stop(&self) {
        self.flags.force.store(true, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.flags.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.flags.paused.store(false, Ordering::SeqCst);
    }

    /// Asks the scheduler to try an e-stop reset once the next tick is done.
    pub fn request_estop_reset(&self) {
        self.flags.reset_estop.store(true, Ordering::SeqCst);
    }

    fn take_estop_reset(&self) -> bool {
        self.flags.reset_estop.swap(false, Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.flags.paused.load(Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.flags.stop.load(Ordering::SeqCst)
    }

    pub fn force_requested(&self) -> bool {
        self.flags.force.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The tick budget ran out.
    Completed,
    Requested,
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub ticks: u64,
    pub failed_ticks: u64,
    /// Ticks that took longer than their wall-clock period.
    pub overruns: u64,
    pub sim_time: f64,
    pub reason: StopReason,
}

impl RunSummary {
    fn new() -> Self {
        Self {
            ticks: 0,
            failed_ticks: 0,
            overruns: 0,
            sim_time: 0.0,
            reason: StopReason::Completed,
        }
    }
}

/// Drives a loop in wall-clock time at the configured rate, scaled by the
/// real-time factor.
#[derive(Debug, Clone)]
pub struct TickScheduler {
    dt: f64,
    period: Duration,
    max_ticks: Option<u64>,
    handle: StopHandle,
}

impl TickScheduler {
    pub fn new(config: &SimulationConfig) -> SimResult<Self> {
        config.validate()?;
        let dt = config.timestep();
        let period = Duration::try_from_secs_f64(dt / config.realtime_factor)
            .ok()
            .filter(|period| !period.is_zero())
            .ok_or_else(|| {
                SimError::config(
                    "simulation.realtime_factor",
                    &format!(
                        "gives no usable wall-clock period for a {dt} s timestep (got {})",
                        config.realtime_factor
                    ),
                )
            })?;
        Ok(Self {
            dt,
            period,
            max_ticks: None,
            handle: StopHandle::new(),
        })
    }

    pub fn with_max_ticks(mut self, max_ticks: u64) -> Self {
        self.max_ticks = Some(max_ticks);
        self
    }

    pub fn handle(&self) -> StopHandle {
        self.handle.clone()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub async fn run(&self, sim: &mut SimulationLoop) -> RunSummary {
        let mut interval = time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut summary = RunSummary::new();

        info!(period_ms = self.period.as_secs_f64() * 1000.0, dt = self.dt, "scheduler started");

        loop {
            interval.tick().await;

            if self.handle.force_requested() {
                sim.force_stop();
                summary.reason = StopReason::Forced;
                break;
            }
            if self.handle.stop_requested() || sim.stop_requested() {
                summary.reason = StopReason::Requested;
                break;
            }
            if self.max_ticks.map_or(false, |max| summary.ticks >= max) {
                break;
            }
            if !self.handle.is_paused() {
                self.step(sim, &mut summary);
            }
            // After the tick, so a just-released e-stop button has been polled.
            if self.handle.take_estop_reset() {
                match sim.reset_emergency_stop() {
                    Ok(()) => info!(tick = sim.tick_count(), "emergency stop cleared"),
                    Err(e) => warn!(tick = sim.tick_count(), "{}", e),
                }
            }
        }

        summary.sim_time = sim.time();
        info!(ticks = summary.ticks, reason = ?summary.reason, "scheduler stopped");
        summary
    }

    fn step(&self, sim: &mut SimulationLoop, summary: &mut RunSummary) {
        let started = Instant::now();
        if let Err(e) = sim.tick(self.dt) {
            summary.failed_ticks += 1;
            error!(tick = sim.tick_count(), "tick failed: {}", e);
        }
        summary.ticks += 1;

        let elapsed = started.elapsed();
        if elapsed > self.period {
            summary.overruns += 1;
            warn!(
                tick = sim.tick_count(),
                elapsed_us = elapsed.as_micros() as u64,
                "tick overran its period"
            );
        }
    }
}

/// Runs `ticks` ticks back to back without wall-clock pacing. Failed ticks
/// are logged and counted; a stop request ends the run early.
pub fn run_headless(sim: &mut SimulationLoop, ticks: u64) -> RunSummary {
    let dt = sim.timestep();
    let mut summary = RunSummary::new();

    for _ in 0..ticks {
        if sim.stop_requested() {
            summary.reason = StopReason::Requested;
            break;
        }
        if let Err(e) = sim.tick(dt) {
            summary.failed_ticks += 1;
            error!(tick = sim.tick_count(), "tick failed: {}", e);
        }
        summary.ticks += 1;
    }

    summary.sim_time = sim.time();
    summary
}
