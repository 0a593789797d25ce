use crate::config::{ProximitySensorConfig, SensorConfig};
use crate::error::{SimError, SimResult};
use crate::subsystems::drive::WheelchairState;
use crate::subsystems::obstacles::ObstacleField;
use arrayvec::ArrayString;
use heapless::Vec;
use rand::RngCore;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

pub const MAX_PROXIMITY_SENSORS: usize = 8;
pub const SENSOR_LABEL_CAPACITY: usize = 16;
const GRAVITY: f64 = 9.81;
const NOISE_CLAMP_SIGMAS: f64 = 3.0;

const_assert!(MAX_PROXIMITY_SENSORS > 0);
const_assert!(SENSOR_LABEL_CAPACITY >= 8);

pub type SensorLabel = ArrayString<SENSOR_LABEL_CAPACITY>;

/// Builds a label, truncating anything past the fixed capacity.
pub fn sensor_label(name: &str) -> SensorLabel {
    let mut label = SensorLabel::new();
    for c in name.chars() {
        if label.try_push(c).is_err() {
            break;
        }
    }
    label
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadingStatus {
    Valid,
    /// Nothing within range.
    OutOfRange,
    /// Ranging did not complete in time.
    Timeout,
    /// The transducer saturated.
    Saturated,
}

impl ReadingStatus {
    /// Maps a per-sensor backend error onto the status it leaves behind.
    pub fn from_error(error: &SimError) -> Self {
        match error {
            SimError::SensorTimeout(_) => ReadingStatus::Timeout,
            _ => ReadingStatus::Saturated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProximityReading {
    pub label: SensorLabel,
    pub mount_x: f64,
    pub mount_y: f64,
    pub bearing: f64,
    /// Present only when `status` is `Valid`.
    pub distance: Option<f64>,
    pub status: ReadingStatus,
}

impl ProximityReading {
    pub fn valid(sensor: &ProximitySensorConfig, distance: f64) -> Self {
        Self {
            label: sensor.label,
            mount_x: sensor.mount_x,
            mount_y: sensor.mount_y,
            bearing: sensor.bearing,
            distance: Some(distance),
            status: ReadingStatus::Valid,
        }
    }

    pub fn invalid(sensor: &ProximitySensorConfig, status: ReadingStatus) -> Self {
        Self {
            label: sensor.label,
            mount_x: sensor.mount_x,
            mount_y: sensor.mount_y,
            bearing: sensor.bearing,
            distance: None,
            status,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == ReadingStatus::Valid
    }

    pub fn valid_distance(&self) -> Option<f64> {
        if self.is_valid() {
            self.distance
        } else {
            None
        }
    }

    /// Marks the reading failed, as a physical backend would on error.
    pub fn fail(&mut self, error: &SimError) {
        self.distance = None;
        self.status = ReadingStatus::from_error(error);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct InertialReading {
    /// Body-frame specific force (m/s^2): forward, left, up.
    pub acceleration: [f64; 3],
    /// Body-frame angular rate (rad/s): roll, pitch, yaw.
    pub angular_rate: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SensorReading {
    pub timestamp: f64,
    pub inertial: InertialReading,
    pub proximity: Vec<ProximityReading, MAX_PROXIMITY_SENSORS>,
}

impl SensorReading {
    pub fn valid_proximity(&self) -> impl Iterator<Item = &ProximityReading> {
        self.proximity.iter().filter(|r| r.is_valid())
    }

    pub fn nearest_valid(&self) -> Option<&ProximityReading> {
        self.valid_proximity().min_by(|a, b| {
            a.distance
                .unwrap_or(f64::INFINITY)
                .total_cmp(&b.distance.unwrap_or(f64::INFINITY))
        })
    }

    pub fn invalid_count(&self) -> usize {
        self.proximity.iter().filter(|r| !r.is_valid()).count()
    }

    pub fn reading(&self, label: &str) -> Option<&ProximityReading> {
        self.proximity.iter().find(|r| r.label.as_str() == label)
    }
}

/// Sensing capability. The generator is always supplied by the caller.
pub trait SensorSuite {
    fn sample(
        &mut self,
        state: &WheelchairState,
        obstacles: &dyn ObstacleField,
        rng: &mut dyn RngCore,
    ) -> SensorReading;

    /// Drops any memory of earlier samples.
    fn reset(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct EmulatedSensorSuite {
    config: SensorConfig,
    imu_noise: Normal<f64>,
    proximity_noise: Normal<f64>,
    previous: Option<WheelchairState>,
}

impl EmulatedSensorSuite {
    pub fn new(config: SensorConfig) -> SimResult<Self> {
        config.validate()?;
        let imu_noise = Normal::new(0.0, config.imu_noise_stddev)
            .map_err(|e| SimError::config("sensors.imu_noise_stddev", &e.to_string()))?;
        let proximity_noise = Normal::new(0.0, config.proximity_noise_stddev)
            .map_err(|e| SimError::config("sensors.proximity_noise_stddev", &e.to_string()))?;

        Ok(Self {
            config,
            imu_noise,
            proximity_noise,
            previous: None,
        })
    }

    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    fn imu_sample(&self, value: f64, rng: &mut dyn RngCore) -> f64 {
        value + self.imu_noise.sample(rng)
    }

    fn inertial(&self, state: &WheelchairState, rng: &mut dyn RngCore) -> InertialReading {
        let forward = match self.previous {
            Some(prev) if state.timestamp > prev.timestamp => {
                (state.linear_velocity - prev.linear_velocity) / (state.timestamp - prev.timestamp)
            }
            _ => 0.0,
        };
        let lateral = state.linear_velocity * state.angular_velocity;

        InertialReading {
            acceleration: [
                self.imu_sample(forward, rng),
                self.imu_sample(lateral, rng),
                self.imu_sample(GRAVITY, rng),
            ],
            angular_rate: [
                self.imu_sample(0.0, rng),
                self.imu_sample(0.0, rng),
                self.imu_sample(state.angular_velocity, rng),
            ],
        }
    }

    fn range(
        &self,
        sensor: &ProximitySensorConfig,
        state: &WheelchairState,
        obstacles: &dyn ObstacleField,
        rng: &mut dyn RngCore,
    ) -> ProximityReading {
        let (sin, cos) = state.theta.sin_cos();
        let origin = (
            state.x + sensor.mount_x * cos - sensor.mount_y * sin,
            state.y + sensor.mount_x * sin + sensor.mount_y * cos,
        );
        let range = self.config.proximity_range;

        // Always draw, so the noise stream does not depend on what was hit.
        let limit = NOISE_CLAMP_SIGMAS * self.config.proximity_noise_stddev;
        let noise = self.proximity_noise.sample(rng).clamp(-limit, limit);

        match obstacles.cast_ray(origin, state.theta + sensor.bearing, range) {
            Some(distance) => {
                let measured = (distance + noise).max(0.0);
                if measured > range {
                    ProximityReading::invalid(sensor, ReadingStatus::OutOfRange)
                } else {
                    ProximityReading::valid(sensor, measured)
                }
            }
            None => ProximityReading::invalid(sensor, ReadingStatus::OutOfRange),
        }
    }
}

impl SensorSuite for EmulatedSensorSuite {
    fn sample(
        &mut self,
        state: &WheelchairState,
        obstacles: &dyn ObstacleField,
        rng: &mut dyn RngCore,
    ) -> SensorReading {
        let inertial = self.inertial(state, rng);

        let mut proximity = Vec::new();
        for sensor in &self.config.proximity_sensors {
            let reading = self.range(sensor, state, obstacles, rng);
            // Capacity is checked by SensorConfig::validate.
            let _ = proximity.push(reading);
        }

        self.previous = Some(*state);

        SensorReading {
            timestamp: state.timestamp,
            inertial,
            proximity,
        }
    }

    /// Forgets the previous sample so the next inertial delta starts fresh.
    fn reset(&mut self) {
        self.previous = None;
    }
}
