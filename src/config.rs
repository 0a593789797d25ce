use crate::error::{SimError, SimResult};
use crate::subsystems::sensors::{sensor_label, SensorLabel, MAX_PROXIMITY_SENSORS};
use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_2;
use std::f64::consts::PI;

const DEFAULT_UPDATE_RATE_HZ: f64 = 50.0;

fn positive(field: &str, value: f64) -> SimResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(SimError::config(field, &format!("must be positive and finite (got {value})")))
    }
}

fn non_negative(field: &str, value: f64) -> SimResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(SimError::config(field, &format!("must be non-negative and finite (got {value})")))
    }
}

fn fraction(field: &str, value: f64) -> SimResult<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(SimError::config(field, &format!("must lie in [0, 1] (got {value})")))
    }
}

/// Physical limits of the drive hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    pub wheelbase: f64,
    pub wheel_radius: f64,
    pub max_linear_velocity: f64,
    pub max_angular_velocity: f64,
    pub max_linear_acceleration: f64,
    pub max_angular_acceleration: f64,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            wheelbase: 0.6,
            wheel_radius: 0.15,
            max_linear_velocity: 2.0,
            max_angular_velocity: 1.5,
            max_linear_acceleration: 1.0,
            max_angular_acceleration: 3.0,
        }
    }
}

impl DriveConfig {
    pub fn validate(&self) -> SimResult<()> {
        positive("drive.wheelbase", self.wheelbase)?;
        positive("drive.wheel_radius", self.wheel_radius)?;
        positive("drive.max_linear_velocity", self.max_linear_velocity)?;
        positive("drive.max_angular_velocity", self.max_angular_velocity)?;
        positive("drive.max_linear_acceleration", self.max_linear_acceleration)?;
        positive("drive.max_angular_acceleration", self.max_angular_acceleration)?;
        Ok(())
    }
}

/// Mount pose of one virtual proximity sensor in the body frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximitySensorConfig {
    pub label: SensorLabel,
    /// Forward offset from the drive axle centre (m).
    pub mount_x: f64,
    /// Leftward offset from the drive axle centre (m).
    pub mount_y: f64,
    /// Beam direction relative to the heading (rad).
    pub bearing: f64,
}

impl ProximitySensorConfig {
    pub fn new(label: &str, mount_x: f64, mount_y: f64, bearing: f64) -> Self {
        Self {
            label: sensor_label(label),
            mount_x,
            mount_y,
            bearing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub imu_noise_stddev: f64,
    pub proximity_range: f64,
    pub proximity_noise_stddev: f64,
    pub proximity_sensors: Vec<ProximitySensorConfig>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            imu_noise_stddev: 0.01,
            proximity_range: 5.0,
            proximity_noise_stddev: 0.05,
            proximity_sensors: vec![
                ProximitySensorConfig::new("front", 0.4, 0.0, 0.0),
                ProximitySensorConfig::new("rear", -0.4, 0.0, PI),
                ProximitySensorConfig::new("left", 0.0, 0.3, FRAC_PI_2),
                ProximitySensorConfig::new("right", 0.0, -0.3, -FRAC_PI_2),
            ],
        }
    }
}

impl SensorConfig {
    /// Same layout as the default, with every noise source switched off.
    pub fn noiseless() -> Self {
        Self {
            imu_noise_stddev: 0.0,
            proximity_noise_stddev: 0.0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> SimResult<()> {
        non_negative("sensors.imu_noise_stddev", self.imu_noise_stddev)?;
        positive("sensors.proximity_range", self.proximity_range)?;
        non_negative("sensors.proximity_noise_stddev", self.proximity_noise_stddev)?;

        if self.proximity_sensors.len() > MAX_PROXIMITY_SENSORS {
            return Err(SimError::config(
                "sensors.proximity_sensors",
                &format!("supports at most {MAX_PROXIMITY_SENSORS} sensors"),
            ));
        }

        for sensor in &self.proximity_sensors {
            if sensor.label.is_empty() {
                return Err(SimError::config("sensors.proximity_sensors.label", "must not be empty"));
            }
            if !(sensor.mount_x.is_finite() && sensor.mount_y.is_finite() && sensor.bearing.is_finite()) {
                return Err(SimError::config(
                    "sensors.proximity_sensors",
                    &format!("mount pose of '{}' must be finite", sensor.label),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Pack capacity (Ah).
    pub battery_capacity: f64,
    pub nominal_voltage: f64,
    pub min_voltage: f64,
    pub max_voltage: f64,
    /// Draw at standstill (W).
    pub idle_power: f64,
    /// Additional draw per m/s of linear speed (W).
    pub linear_power_coefficient: f64,
    /// Additional draw per rad/s of turn rate (W).
    pub angular_power_coefficient: f64,
    pub initial_state_of_charge: f64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            battery_capacity: 50.0,
            nominal_voltage: 24.0,
            min_voltage: 20.0,
            max_voltage: 29.4,
            idle_power: 10.0,
            linear_power_coefficient: 50.0,
            angular_power_coefficient: 20.0,
            initial_state_of_charge: 1.0,
        }
    }
}

impl PowerConfig {
    pub fn validate(&self) -> SimResult<()> {
        positive("power.battery_capacity", self.battery_capacity)?;
        positive("power.nominal_voltage", self.nominal_voltage)?;
        positive("power.min_voltage", self.min_voltage)?;
        positive("power.max_voltage", self.max_voltage)?;
        if self.min_voltage >= self.max_voltage {
            return Err(SimError::config("power.min_voltage", "must be below power.max_voltage"));
        }
        non_negative("power.idle_power", self.idle_power)?;
        non_negative("power.linear_power_coefficient", self.linear_power_coefficient)?;
        non_negative("power.angular_power_coefficient", self.angular_power_coefficient)?;
        fraction("power.initial_state_of_charge", self.initial_state_of_charge)?;
        Ok(())
    }
}

/// Limits enforced by the safety monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub max_linear_velocity: f64,
    pub max_angular_velocity: f64,
    pub max_linear_acceleration: f64,
    pub max_angular_acceleration: f64,
    /// Seconds without a fresh command before motion is refused.
    pub deadman_timeout: f64,
    pub obstacle_stop_distance: f64,
    /// Closing speed is scaled down linearly from this distance to zero at
    /// the stop distance. Equal to the stop distance disables the ramp.
    pub obstacle_slow_distance: f64,
    pub critical_state_of_charge: f64,
    pub stop_on_critical_battery: bool,
    /// Lets an e-stop reset succeed while its hazard is still present.
    pub allow_estop_override: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_linear_velocity: 1.0,
            max_angular_velocity: 1.5,
            max_linear_acceleration: 1.0,
            max_angular_acceleration: 2.0,
            deadman_timeout: 0.5,
            obstacle_stop_distance: 0.5,
            obstacle_slow_distance: 1.5,
            critical_state_of_charge: 0.05,
            stop_on_critical_battery: true,
            allow_estop_override: false,
        }
    }
}

impl SafetyConfig {
    pub fn validate(&self) -> SimResult<()> {
        positive("safety.max_linear_velocity", self.max_linear_velocity)?;
        positive("safety.max_angular_velocity", self.max_angular_velocity)?;
        positive("safety.max_linear_acceleration", self.max_linear_acceleration)?;
        positive("safety.max_angular_acceleration", self.max_angular_acceleration)?;
        positive("safety.deadman_timeout", self.deadman_timeout)?;
        non_negative("safety.obstacle_stop_distance", self.obstacle_stop_distance)?;
        non_negative("safety.obstacle_slow_distance", self.obstacle_slow_distance)?;
        if self.obstacle_slow_distance < self.obstacle_stop_distance {
            return Err(SimError::config(
                "safety.obstacle_slow_distance",
                &format!(
                    "must not be below obstacle_stop_distance ({} < {})",
                    self.obstacle_slow_distance, self.obstacle_stop_distance
                ),
            ));
        }
        fraction("safety.critical_state_of_charge", self.critical_state_of_charge)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub update_rate: f64,
    /// Wall-clock speed multiplier for the real-time scheduler.
    pub realtime_factor: f64,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            update_rate: DEFAULT_UPDATE_RATE_HZ,
            realtime_factor: 1.0,
            seed: 0,
        }
    }
}

impl SimulationConfig {
    pub fn timestep(&self) -> f64 {
        1.0 / self.update_rate
    }

    pub fn validate(&self) -> SimResult<()> {
        positive("simulation.update_rate", self.update_rate)?;
        positive("simulation.realtime_factor", self.realtime_factor)?;
        Ok(())
    }
}

/// Limits actually applied by the drive: the tighter of hardware and safety.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriveLimits {
    pub max_linear_velocity: f64,
    pub max_angular_velocity: f64,
    pub max_linear_acceleration: f64,
    pub max_angular_acceleration: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub drive: DriveConfig,
    pub sensors: SensorConfig,
    pub power: PowerConfig,
    pub safety: SafetyConfig,
    pub simulation: SimulationConfig,
}

impl EmulatorConfig {
    pub fn validate(&self) -> SimResult<()> {
        self.drive.validate()?;
        self.sensors.validate()?;
        self.power.validate()?;
        self.safety.validate()?;
        self.simulation.validate()?;
        Ok(())
    }

    pub fn drive_limits(&self) -> DriveLimits {
        DriveLimits {
            max_linear_velocity: self.drive.max_linear_velocity.min(self.safety.max_linear_velocity),
            max_angular_velocity: self.drive.max_angular_velocity.min(self.safety.max_angular_velocity),
            max_linear_acceleration: self
                .drive
                .max_linear_acceleration
                .min(self.safety.max_linear_acceleration),
            max_angular_acceleration: self
                .drive
                .max_angular_acceleration
                .min(self.safety.max_angular_acceleration),
        }
    }

    pub fn from_json(text: &str) -> SimResult<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| SimError::InvalidConfig(format!("malformed JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}
