//! Deterministic fault injection.
//!
//! Wrappers around the drive, sensor and power capabilities that fail on
//! planned invocations, so the loop's failure handling can be exercised
//! without hardware. Windows are counted in invocations of the wrapped
//! component, which for the drive and power system is the loop tick number.

use crate::config::DriveLimits;
use crate::error::{SimError, SimResult};
use crate::protocol::DriveCommand;
use crate::subsystems::sensors::{sensor_label, SensorLabel};
use crate::subsystems::{
    Drive, ObstacleField, PowerState, PowerSystem, SensorReading, SensorSuite, WheelchairState,
};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum InjectedFault {
    Actuation,
    PowerFailure,
    /// Times out one sensor, or every sensor when no label is given.
    SensorTimeout(Option<SensorLabel>),
    SensorSaturated(Option<SensorLabel>),
}

impl InjectedFault {
    fn targets_sensors(&self) -> bool {
        matches!(self, InjectedFault::SensorTimeout(_) | InjectedFault::SensorSaturated(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultWindow {
    /// Invocations covered, half-open.
    pub invocations: Range<u64>,
    pub fault: InjectedFault,
}

/// Rates for generating a random plan. Rates are per invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultInjectionConfig {
    pub actuation_rate: f64,
    pub sensor_rate: f64,
    pub power_rate: f64,
    pub min_duration: u64,
    pub max_duration: u64,
}

impl Default for FaultInjectionConfig {
    fn default() -> Self {
        Self {
            actuation_rate: 0.002,
            sensor_rate: 0.01,
            power_rate: 0.001,
            min_duration: 1,
            max_duration: 25,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaultPlan {
    windows: Vec<FaultWindow>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, invocations: Range<u64>, fault: InjectedFault) -> Self {
        self.add(invocations, fault);
        self
    }

    pub fn add(&mut self, invocations: Range<u64>, fault: InjectedFault) {
        if !invocations.is_empty() {
            self.windows.push(FaultWindow { invocations, fault });
        }
    }

    /// Draws a plan covering `invocations` calls. The same generator state
    /// always yields the same plan.
    pub fn generate(config: &FaultInjectionConfig, invocations: u64, rng: &mut dyn RngCore) -> Self {
        let mut plan = Self::new();
        let min = config.min_duration.max(1);
        let max = config.max_duration.max(min);

        for call in 0..invocations {
            for (rate, fault) in [
                (config.actuation_rate, InjectedFault::Actuation),
                (config.sensor_rate, InjectedFault::SensorTimeout(None)),
                (config.power_rate, InjectedFault::PowerFailure),
            ] {
                if rng.gen::<f64>() < rate {
                    let duration = rng.gen_range(min..=max);
                    plan.add(call..call + duration, fault);
                }
            }
        }
        plan
    }

    pub fn windows(&self) -> &[FaultWindow] {
        &self.windows
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    fn active(&self, invocation: u64) -> impl Iterator<Item = &InjectedFault> {
        self.windows
            .iter()
            .filter(move |w| w.invocations.contains(&invocation))
            .map(|w| &w.fault)
    }

    fn has(&self, invocation: u64, fault: InjectedFault) -> bool {
        self.active(invocation).any(|f| *f == fault)
    }
}

/// Drive wrapper that reports `ActuationFailure` on planned ticks. The first
/// update is invocation 1.
pub struct FaultInjectingDrive<D> {
    inner: D,
    plan: FaultPlan,
    invocations: u64,
    injected: u32,
}

impl<D: Drive> FaultInjectingDrive<D> {
    pub fn new(inner: D, plan: FaultPlan) -> Self {
        Self {
            inner,
            plan,
            invocations: 0,
            injected: 0,
        }
    }

    pub fn injected(&self) -> u32 {
        self.injected
    }

    pub fn into_inner(self) -> D {
        self.inner
    }
}

impl<D: Drive> Drive for FaultInjectingDrive<D> {
    fn update(
        &mut self,
        state: &WheelchairState,
        command: &DriveCommand,
        dt: f64,
    ) -> SimResult<WheelchairState> {
        self.invocations += 1;
        if self.plan.has(self.invocations, InjectedFault::Actuation) {
            self.injected += 1;
            return Err(SimError::ActuationFailure(format!(
                "injected motor controller fault on update {}",
                self.invocations
            )));
        }
        self.inner.update(state, command, dt)
    }

    fn limits(&self) -> DriveLimits {
        self.inner.limits()
    }

    fn set_limits(&mut self, limits: DriveLimits) {
        self.inner.set_limits(limits);
    }
}

/// Sensor wrapper that degrades planned readings to Timeout or Saturated.
/// The loop samples once at construction, so that sample is invocation 0 and
/// tick N is invocation N.
pub struct FaultInjectingSensors<S> {
    inner: S,
    plan: FaultPlan,
    invocations: Option<u64>,
    injected: u32,
}

impl<S: SensorSuite> FaultInjectingSensors<S> {
    pub fn new(inner: S, plan: FaultPlan) -> Self {
        Self {
            inner,
            plan,
            invocations: None,
            injected: 0,
        }
    }

    pub fn injected(&self) -> u32 {
        self.injected
    }

    fn degrade(&mut self, reading: &mut SensorReading, invocation: u64) {
        let faults: Vec<InjectedFault> = self
            .plan
            .active(invocation)
            .filter(|f| f.targets_sensors())
            .copied()
            .collect();

        for fault in faults {
            let (target, timeout) = match fault {
                InjectedFault::SensorTimeout(target) => (target, true),
                InjectedFault::SensorSaturated(target) => (target, false),
                _ => continue,
            };
            for proximity in reading.proximity.iter_mut() {
                if target.map_or(true, |label| label == proximity.label) {
                    let label = proximity.label.to_string();
                    let error = if timeout {
                        SimError::SensorTimeout(label)
                    } else {
                        SimError::SensorInvalid(label)
                    };
                    proximity.fail(&error);
                    self.injected += 1;
                }
            }
        }
    }
}

impl<S: SensorSuite> SensorSuite for FaultInjectingSensors<S> {
    fn sample(
        &mut self,
        state: &WheelchairState,
        obstacles: &dyn ObstacleField,
        rng: &mut dyn RngCore,
    ) -> SensorReading {
        let invocation = self.invocations.map_or(0, |n| n + 1);
        self.invocations = Some(invocation);

        let mut reading = self.inner.sample(state, obstacles, rng);
        self.degrade(&mut reading, invocation);
        reading
    }

    fn reset(&mut self) {
        self.invocations = None;
        self.inner.reset();
    }
}

/// Power wrapper that reports `PowerFailure` on planned ticks.
pub struct FaultInjectingPower<P> {
    inner: P,
    plan: FaultPlan,
    invocations: u64,
    injected: u32,
}

impl<P: PowerSystem> FaultInjectingPower<P> {
    pub fn new(inner: P, plan: FaultPlan) -> Self {
        Self {
            inner,
            plan,
            invocations: 0,
            injected: 0,
        }
    }

    pub fn injected(&self) -> u32 {
        self.injected
    }
}

impl<P: PowerSystem> PowerSystem for FaultInjectingPower<P> {
    fn update(
        &mut self,
        linear_velocity: f64,
        angular_velocity: f64,
        dt: f64,
    ) -> SimResult<PowerState> {
        self.invocations += 1;
        if self.plan.has(self.invocations, InjectedFault::PowerFailure) {
            self.injected += 1;
            return Err(SimError::PowerFailure(format!(
                "injected battery monitor fault on update {}",
                self.invocations
            )));
        }
        self.inner.update(linear_velocity, angular_velocity, dt)
    }

    fn state(&self) -> PowerState {
        self.inner.state()
    }

    fn reset(&mut self) {
        self.invocations = 0;
        self.inner.reset();
    }
}

/// Shorthand for a sensor fault aimed at one labelled sensor.
pub fn sensor_timeout(label: &str) -> InjectedFault {
    InjectedFault::SensorTimeout(Some(sensor_label(label)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_empty_windows_are_dropped() {
        let plan = FaultPlan::new().with(5..5, InjectedFault::Actuation);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_window_is_half_open() {
        let plan = FaultPlan::new().with(3..5, InjectedFault::Actuation);
        assert!(!plan.has(2, InjectedFault::Actuation));
        assert!(plan.has(3, InjectedFault::Actuation));
        assert!(plan.has(4, InjectedFault::Actuation));
        assert!(!plan.has(5, InjectedFault::Actuation));
        assert!(!plan.has(3, InjectedFault::PowerFailure));
    }

    #[test]
    fn test_generated_plan_is_reproducible() {
        let config = FaultInjectionConfig {
            actuation_rate: 0.05,
            sensor_rate: 0.05,
            power_rate: 0.05,
            ..FaultInjectionConfig::default()
        };
        let a = FaultPlan::generate(&config, 500, &mut StdRng::seed_from_u64(9));
        let b = FaultPlan::generate(&config, 500, &mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
        assert!(!a.is_empty());
        assert!(a
            .windows()
            .iter()
            .all(|w| w.invocations.end - w.invocations.start <= config.max_duration));
    }

    #[test]
    fn test_zero_rates_generate_nothing() {
        let config = FaultInjectionConfig {
            actuation_rate: 0.0,
            sensor_rate: 0.0,
            power_rate: 0.0,
            ..FaultInjectionConfig::default()
        };
        let plan = FaultPlan::generate(&config, 1000, &mut StdRng::seed_from_u64(1));
        assert!(plan.is_empty());
    }
}
