use crate::config::{DriveConfig, DriveLimits, EmulatorConfig};
use crate::error::{SimError, SimResult};
use crate::protocol::DriveCommand;
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};

/// Slack allowed when snapping a ramp onto its target, so that float
/// accumulation cannot add a spurious extra tick to a ramp.
pub const RAMP_TOLERANCE: f64 = 1e-9;

/// Pose and kinematics of the platform.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WheelchairState {
    pub x: f64,
    pub y: f64,
    /// Heading in (-pi, pi].
    pub theta: f64,
    pub linear_velocity: f64,
    pub angular_velocity: f64,
    pub left_wheel_speed: f64,
    pub right_wheel_speed: f64,
    pub timestamp: f64,
}

impl WheelchairState {
    pub fn at(x: f64, y: f64, theta: f64) -> Self {
        Self {
            x,
            y,
            theta: normalize_angle(theta),
            ..Self::default()
        }
    }

    pub fn is_stationary(&self) -> bool {
        self.linear_velocity == 0.0 && self.angular_velocity == 0.0
    }
}

/// Actuation capability. A physical backend writes the wheel targets to its
/// motor controllers and reports `ActuationFailure` when it cannot.
pub trait Drive {
    fn update(
        &mut self,
        state: &WheelchairState,
        command: &DriveCommand,
        dt: f64,
    ) -> SimResult<WheelchairState>;

    fn limits(&self) -> DriveLimits;

    /// Replaces the effective limits, e.g. after the safety limits change.
    fn set_limits(&mut self, limits: DriveLimits);
}

/// Wraps an angle into (-pi, pi].
pub fn normalize_angle(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(TAU);
    if wrapped > PI {
        wrapped - TAU
    } else {
        wrapped
    }
}

pub(crate) fn clamp_magnitude(value: f64, limit: f64) -> f64 {
    if value.is_finite() {
        value.clamp(-limit, limit)
    } else {
        0.0
    }
}

fn approach(current: f64, target: f64, max_step: f64) -> f64 {
    let delta = target - current;
    if delta.abs() <= max_step + RAMP_TOLERANCE {
        target
    } else {
        current + max_step.copysign(delta)
    }
}

/// Kinematic differential-drive model with per-tick acceleration limits.
#[derive(Debug, Clone)]
pub struct DifferentialDrive {
    wheelbase: f64,
    limits: DriveLimits,
}

impl DifferentialDrive {
    pub fn new(config: &DriveConfig, limits: DriveLimits) -> SimResult<Self> {
        config.validate()?;
        for (name, value) in [
            ("max_linear_velocity", limits.max_linear_velocity),
            ("max_angular_velocity", limits.max_angular_velocity),
            ("max_linear_acceleration", limits.max_linear_acceleration),
            ("max_angular_acceleration", limits.max_angular_acceleration),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(SimError::config(
                    &format!("drive limits.{name}"),
                    "must be positive and finite",
                ));
            }
        }

        Ok(Self {
            wheelbase: config.wheelbase,
            limits,
        })
    }

    pub fn from_config(config: &EmulatorConfig) -> SimResult<Self> {
        Self::new(&config.drive, config.drive_limits())
    }

    pub fn wheelbase(&self) -> f64 {
        self.wheelbase
    }

    /// Left and right wheel surface speeds for a body velocity.
    pub fn wheel_speeds(&self, linear: f64, angular: f64) -> (f64, f64) {
        let half_track = angular * self.wheelbase / 2.0;
        (linear - half_track, linear + half_track)
    }
}

impl Drive for DifferentialDrive {
    fn update(
        &mut self,
        state: &WheelchairState,
        command: &DriveCommand,
        dt: f64,
    ) -> SimResult<WheelchairState> {
        if !(dt.is_finite() && dt > 0.0) {
            return Err(SimError::InvalidTimestep(dt));
        }

        // Requests are clamped here as well as upstream; the ramp is applied
        // once, against the actual velocity from the previous tick.
        let target_linear = clamp_magnitude(command.linear, self.limits.max_linear_velocity);
        let target_angular = clamp_magnitude(command.angular, self.limits.max_angular_velocity);

        let linear = approach(
            state.linear_velocity,
            target_linear,
            self.limits.max_linear_acceleration * dt,
        );
        let angular = approach(
            state.angular_velocity,
            target_angular,
            self.limits.max_angular_acceleration * dt,
        );

        let (left, right) = self.wheel_speeds(linear, angular);

        let next = WheelchairState {
            x: state.x + linear * state.theta.cos() * dt,
            y: state.y + linear * state.theta.sin() * dt,
            theta: normalize_angle(state.theta + angular * dt),
            linear_velocity: linear,
            angular_velocity: angular,
            left_wheel_speed: left,
            right_wheel_speed: right,
            timestamp: state.timestamp + dt,
        };

        debug_assert!(
            (linear - state.linear_velocity).abs()
                <= self.limits.max_linear_acceleration * dt + RAMP_TOLERANCE,
            "linear step {} exceeds acceleration budget",
            linear - state.linear_velocity
        );

        Ok(next)
    }

    fn limits(&self) -> DriveLimits {
        self.limits
    }

    fn set_limits(&mut self, limits: DriveLimits) {
        self.limits = limits;
    }
}
