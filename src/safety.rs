use crate::config::SafetyConfig;
use crate::error::{SimError, SimResult};
use crate::protocol::DriveCommand;
use crate::subsystems::drive::clamp_magnitude;
use crate::subsystems::{PowerState, ProximityReading, SensorReading};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const MAX_SAFETY_EVENTS: usize = 32;
const CLOSING_EPSILON: f64 = 1e-9;

/// Why the forwarded command differs from the request, ordered by priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum LimitReason {
    #[default]
    None,
    Acceleration,
    Speed,
    Obstacle,
    LowBattery,
    Deadman,
    FailSafe,
    EmergencyStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstopCause {
    /// The controller's e-stop button.
    Operator,
    /// A trigger from outside the control path.
    External,
    /// An immediate shutdown of the loop.
    ForcedShutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EstopLatch {
    pub cause: EstopCause,
    pub latched_at: f64,
}

/// Per-tick verdict. Every active condition is flagged, while
/// `active_limit_reason` names only the highest-priority one.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SafetyStatus {
    pub emergency_stop_active: bool,
    pub deadman_expired: bool,
    pub obstacle_detected: bool,
    /// Closing speed scaled down for an obstacle inside the slow distance.
    pub obstacle_slowdown: bool,
    pub speed_limited: bool,
    pub battery_critical: bool,
    pub fail_safe_active: bool,
    pub active_limit_reason: LimitReason,
}

impl SafetyStatus {
    /// Raises the reported reason if `reason` outranks the current one.
    pub fn raise(&mut self, reason: LimitReason) {
        self.active_limit_reason = self.active_limit_reason.max(reason);
    }

    pub fn is_normal(&self) -> bool {
        self.active_limit_reason == LimitReason::None
    }

    pub fn forces_stop(&self) -> bool {
        matches!(
            self.active_limit_reason,
            LimitReason::EmergencyStop | LimitReason::FailSafe | LimitReason::Deadman | LimitReason::LowBattery
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyEvent {
    EmergencyStopLatched,
    EmergencyStopReset,
    ResetRejected,
    DeadmanExpired,
    ObstacleBlocked,
    ObstacleSlowdown,
    SpeedLimited,
    BatteryCritical,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyEventRecord {
    pub event: SafetyEvent,
    pub timestamp: f64,
}

/// Safety authority. Implementations may only keep the e-stop latch between
/// ticks; every other condition is recomputed from the inputs.
pub trait SafetyMonitor {
    fn arbitrate(
        &mut self,
        requested: &DriveCommand,
        sensors: &SensorReading,
        power: &PowerState,
        now: f64,
    ) -> (DriveCommand, SafetyStatus);

    fn trigger_emergency_stop(&mut self, cause: EstopCause, now: f64);

    /// Clears the latch, unless the hazard behind it is still present.
    fn reset_emergency_stop(
        &mut self,
        sensors: &SensorReading,
        requested: &DriveCommand,
    ) -> SimResult<()>;

    fn latch(&self) -> Option<EstopLatch>;

    /// Swaps in a new configuration. The latch survives; an invalid
    /// configuration leaves the monitor unchanged.
    fn reconfigure(&mut self, config: SafetyConfig) -> SimResult<()>;
}

#[derive(Debug)]
pub struct SafetyManager {
    config: SafetyConfig,
    latch: Option<EstopLatch>,
    last_status: SafetyStatus,
    event_history: Vec<SafetyEventRecord, MAX_SAFETY_EVENTS>,
}

impl SafetyManager {
    pub fn new(config: SafetyConfig) -> SimResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            latch: None,
            last_status: SafetyStatus::default(),
            event_history: Vec::new(),
        })
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    pub fn get_event_history(&self) -> &[SafetyEventRecord] {
        &self.event_history
    }

    pub fn clear_event_history(&mut self) {
        self.event_history.clear();
    }

    fn record_event(&mut self, event: SafetyEvent, timestamp: f64) {
        if self.event_history.is_full() {
            self.event_history.remove(0);
        }
        let _ = self.event_history.push(SafetyEventRecord { event, timestamp });
    }

    fn record_transitions(&mut self, status: &SafetyStatus, now: f64) {
        let previous = self.last_status;
        let rising = [
            (previous.deadman_expired, status.deadman_expired, SafetyEvent::DeadmanExpired),
            (previous.obstacle_detected, status.obstacle_detected, SafetyEvent::ObstacleBlocked),
            (previous.obstacle_slowdown, status.obstacle_slowdown, SafetyEvent::ObstacleSlowdown),
            (previous.speed_limited, status.speed_limited, SafetyEvent::SpeedLimited),
            (previous.battery_critical, status.battery_critical, SafetyEvent::BatteryCritical),
        ];
        for (was, is, event) in rising {
            if is && !was {
                self.record_event(event, now);
            }
        }

        if previous.active_limit_reason != status.active_limit_reason {
            debug!(
                from = ?previous.active_limit_reason,
                to = ?status.active_limit_reason,
                "active limit changed"
            );
        }
        self.last_status = *status;
    }

    /// Which velocity components would close on an obstacle that is already
    /// inside the stop distance: (linear, angular).
    fn closing_components(&self, linear: f64, angular: f64, sensors: &SensorReading) -> (bool, bool) {
        let mut block_linear = false;
        let mut block_angular = false;

        for reading in sensors.valid_proximity() {
            let Some(distance) = reading.distance else {
                continue;
            };
            if distance >= self.config.obstacle_stop_distance {
                continue;
            }

            let (closes_linear, closes_angular) = closing(reading, linear, angular);
            block_linear |= closes_linear;
            block_angular |= closes_angular;
        }

        (block_linear, block_angular)
    }

    /// Speed scale per component for obstacles between the stop and slow
    /// distances: 1 when clear, falling linearly to 0 at the stop distance.
    fn slow_zone_factors(&self, linear: f64, angular: f64, sensors: &SensorReading) -> (f64, f64) {
        let stop = self.config.obstacle_stop_distance;
        let slow = self.config.obstacle_slow_distance;
        let mut linear_factor = 1.0f64;
        let mut angular_factor = 1.0f64;
        if slow <= stop {
            return (linear_factor, angular_factor);
        }

        for reading in sensors.valid_proximity() {
            let Some(distance) = reading.distance else {
                continue;
            };
            if !(stop..slow).contains(&distance) {
                continue;
            }

            let factor = ((distance - stop) / (slow - stop)).clamp(0.0, 1.0);
            let (closes_linear, closes_angular) = closing(reading, linear, angular);
            if closes_linear {
                linear_factor = linear_factor.min(factor);
            }
            if closes_angular {
                angular_factor = angular_factor.min(factor);
            }
        }

        (linear_factor, angular_factor)
    }

    fn obstacle_inside_stop_distance(&self, sensors: &SensorReading) -> Option<(f64, String)> {
        sensors
            .nearest_valid()
            .and_then(|r| r.distance.map(|d| (d, r.label.to_string())))
            .filter(|(d, _)| *d < self.config.obstacle_stop_distance)
    }
}

/// Whether each velocity component moves the sensor's mount point towards
/// what the beam sees: (linear, angular).
fn closing(reading: &ProximityReading, linear: f64, angular: f64) -> (bool, bool) {
    let (sin, cos) = reading.bearing.sin_cos();
    // Body translation along the beam.
    let closes_linear = linear * cos > CLOSING_EPSILON;
    // Velocity of the mount point under rotation, projected on the beam.
    let lever = -reading.mount_y * cos + reading.mount_x * sin;
    let closes_angular = angular * lever > CLOSING_EPSILON;
    (closes_linear, closes_angular)
}

impl SafetyMonitor for SafetyManager {
    fn arbitrate(
        &mut self,
        requested: &DriveCommand,
        sensors: &SensorReading,
        power: &PowerState,
        now: f64,
    ) -> (DriveCommand, SafetyStatus) {
        if requested.emergency_stop && self.latch.is_none() {
            self.trigger_emergency_stop(EstopCause::Operator, now);
        }

        let mut status = SafetyStatus::default();

        // Speed clamp first; higher-priority overrides act on what survives.
        let mut linear = clamp_magnitude(requested.linear, self.config.max_linear_velocity);
        let mut angular = clamp_magnitude(requested.angular, self.config.max_angular_velocity);
        if linear != requested.linear || angular != requested.angular {
            status.speed_limited = true;
            status.raise(LimitReason::Speed);
        }

        let (linear_factor, angular_factor) = self.slow_zone_factors(linear, angular, sensors);
        let slowed_linear = clamp_magnitude(linear, linear_factor * self.config.max_linear_velocity);
        let slowed_angular =
            clamp_magnitude(angular, angular_factor * self.config.max_angular_velocity);
        if slowed_linear != linear || slowed_angular != angular {
            linear = slowed_linear;
            angular = slowed_angular;
            status.obstacle_slowdown = true;
            status.raise(LimitReason::Obstacle);
        }

        let (block_linear, block_angular) = self.closing_components(linear, angular, sensors);
        if block_linear {
            linear = 0.0;
        }
        if block_angular {
            angular = 0.0;
        }
        if block_linear || block_angular {
            status.obstacle_detected = true;
            status.raise(LimitReason::Obstacle);
        }

        status.battery_critical = power.state_of_charge <= self.config.critical_state_of_charge;
        if status.battery_critical && self.config.stop_on_critical_battery {
            status.raise(LimitReason::LowBattery);
        }

        let age = now - requested.timestamp;
        if !(age <= self.config.deadman_timeout) {
            status.deadman_expired = true;
            status.raise(LimitReason::Deadman);
        }

        if self.latch.is_some() {
            status.emergency_stop_active = true;
            status.raise(LimitReason::EmergencyStop);
        }

        if status.forces_stop() {
            linear = 0.0;
            angular = 0.0;
        }

        self.record_transitions(&status, now);

        let forwarded = DriveCommand {
            linear,
            angular,
            ..*requested
        };
        (forwarded, status)
    }

    fn trigger_emergency_stop(&mut self, cause: EstopCause, now: f64) {
        if self.latch.is_some() {
            return;
        }
        warn!(?cause, time = now, "emergency stop latched");
        self.latch = Some(EstopLatch {
            cause,
            latched_at: now,
        });
        self.record_event(SafetyEvent::EmergencyStopLatched, now);
    }

    fn reset_emergency_stop(
        &mut self,
        sensors: &SensorReading,
        requested: &DriveCommand,
    ) -> SimResult<()> {
        let Some(latch) = self.latch else {
            return Ok(());
        };

        if !self.config.allow_estop_override {
            let blocker = if requested.emergency_stop {
                Some("operator emergency stop is still asserted".to_string())
            } else {
                self.obstacle_inside_stop_distance(sensors).map(|(distance, label)| {
                    format!(
                        "obstacle at {distance:.2} m on '{label}' is inside the {:.2} m stop distance",
                        self.config.obstacle_stop_distance
                    )
                })
            };

            if let Some(reason) = blocker {
                warn!(%reason, "emergency stop reset rejected");
                self.record_event(SafetyEvent::ResetRejected, sensors.timestamp);
                return Err(SimError::ResetRejected(reason));
            }
        }

        info!(cause = ?latch.cause, "emergency stop reset");
        self.latch = None;
        self.record_event(SafetyEvent::EmergencyStopReset, sensors.timestamp);
        Ok(())
    }

    fn latch(&self) -> Option<EstopLatch> {
        self.latch
    }

    fn reconfigure(&mut self, config: SafetyConfig) -> SimResult<()> {
        config.validate()?;
        info!(?config, "safety configuration replaced");
        self.config = config;
        Ok(())
    }
}
