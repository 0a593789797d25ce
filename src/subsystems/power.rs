use crate::config::PowerConfig;
use crate::error::{SimError, SimResult};
use serde::{Deserialize, Serialize};

const SECONDS_PER_HOUR: f64 = 3600.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerState {
    /// Remaining capacity as a fraction in [0, 1].
    pub state_of_charge: f64,
    pub current_draw_a: f64,
    pub voltage: f64,
    pub power_draw_w: f64,
    pub depleted: bool,
}

impl PowerState {
    pub fn full(voltage: f64) -> Self {
        Self {
            state_of_charge: 1.0,
            current_draw_a: 0.0,
            voltage,
            power_draw_w: 0.0,
            depleted: false,
        }
    }
}

/// Power capability. Reports charge but never stops the drive itself.
pub trait PowerSystem {
    fn update(&mut self, linear_velocity: f64, angular_velocity: f64, dt: f64)
        -> SimResult<PowerState>;

    fn state(&self) -> PowerState;

    /// Restores the initial charge.
    fn reset(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct EmulatedPowerSystem {
    config: PowerConfig,
    state: PowerState,
    consumed_ah: f64,
}

impl EmulatedPowerSystem {
    pub fn new(config: PowerConfig) -> SimResult<Self> {
        config.validate()?;
        let mut power = Self {
            state: PowerState::full(config.max_voltage),
            consumed_ah: 0.0,
            config,
        };
        power.set_state_of_charge(power.config.initial_state_of_charge);
        Ok(power)
    }

    /// Estimated draw (W) for a body velocity.
    pub fn power_draw(&self, linear_velocity: f64, angular_velocity: f64) -> f64 {
        let linear = if linear_velocity.is_finite() { linear_velocity.abs() } else { 0.0 };
        let angular = if angular_velocity.is_finite() { angular_velocity.abs() } else { 0.0 };
        self.config.idle_power
            + self.config.linear_power_coefficient * linear
            + self.config.angular_power_coefficient * angular
    }

    pub fn consumed_ah(&self) -> f64 {
        self.consumed_ah
    }

    /// Forces the charge level, clamped to [0, 1]. Intended for scenarios.
    pub fn set_state_of_charge(&mut self, fraction: f64) {
        let soc = if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { 0.0 };
        self.state.state_of_charge = soc;
        self.state.depleted = soc <= 0.0;
        self.consumed_ah = self.config.battery_capacity * (1.0 - soc);
        self.state.voltage = self.voltage_for(soc);
    }

    fn voltage_for(&self, soc: f64) -> f64 {
        let span = self.config.max_voltage - self.config.min_voltage;
        (self.config.min_voltage + soc * span).clamp(self.config.min_voltage, self.config.max_voltage)
    }
}

impl PowerSystem for EmulatedPowerSystem {
    fn update(
        &mut self,
        linear_velocity: f64,
        angular_velocity: f64,
        dt: f64,
    ) -> SimResult<PowerState> {
        if !(dt.is_finite() && dt > 0.0) {
            return Err(SimError::InvalidTimestep(dt));
        }

        let draw_w = self.power_draw(linear_velocity, angular_velocity);
        let current_a = draw_w / self.state.voltage;
        let used_ah = current_a * dt / SECONDS_PER_HOUR;

        self.consumed_ah += used_ah;
        let soc = (self.state.state_of_charge - used_ah / self.config.battery_capacity).max(0.0);

        debug_assert!(
            soc <= self.state.state_of_charge,
            "state of charge rose from {} to {}",
            self.state.state_of_charge,
            soc
        );

        self.state = PowerState {
            state_of_charge: soc,
            current_draw_a: current_a,
            voltage: self.voltage_for(soc),
            power_draw_w: draw_w,
            depleted: soc <= 0.0,
        };

        Ok(self.state)
    }

    fn state(&self) -> PowerState {
        self.state
    }

    fn reset(&mut self) {
        self.state = PowerState::full(self.config.max_voltage);
        self.consumed_ah = 0.0;
        self.set_state_of_charge(self.config.initial_state_of_charge);
    }
}
