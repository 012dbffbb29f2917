//! Attitude flight loop: target synthesis, per-axis regulation and X-frame mixing
use crate::config::FlightConfig;
use crate::device_manager::OperatingMode;
use crate::interfaces::{MotorPosition, MotorSink, RadioChannel, RadioSource};
use crate::{FlightError, IirFilter, Pid, PidGains, QuaternionExt};
use nalgebra::{Quaternion, Vector3};
use std::f32::consts::{PI, TAU};
use std::time::Instant;

/// Pilot input for one cycle, sticks in [-1, 1] and throttle in [0, 1]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StickInput {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
    pub throttle: f32,
}

impl StickInput {
    pub fn from_radio(radio: &dyn RadioSource) -> Self {
        Self {
            roll: radio.channel_value(RadioChannel::Roll),
            pitch: radio.channel_value(RadioChannel::Pitch),
            yaw: radio.channel_value(RadioChannel::Yaw),
            throttle: radio.channel_value(RadioChannel::Throttle),
        }
    }
}

/// Duty of each motor, every value in [0, 1]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MotorCommand {
    pub front_right: f32,
    pub front_left: f32,
    pub back_left: f32,
    pub back_right: f32,
}

impl MotorCommand {
    pub fn duty(&self, position: MotorPosition) -> f32 {
        match position {
            MotorPosition::FrontRight => self.front_right,
            MotorPosition::FrontLeft => self.front_left,
            MotorPosition::BackLeft => self.back_left,
            MotorPosition::BackRight => self.back_right,
        }
    }

    pub fn apply(&self, sink: &dyn MotorSink) {
        for position in MotorPosition::ALL {
            sink.set_motor(position, self.duty(position));
        }
    }
}

/// Throttle band and attitude authority of the mixer
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MixLimits {
    pub min_throttle: f32,
    pub max_throttle: f32,
    pub max_balance_xy: f32,
    pub max_balance_z: f32,
}

impl From<&FlightConfig> for MixLimits {
    fn from(config: &FlightConfig) -> Self {
        Self {
            min_throttle: config.min_throttle,
            max_throttle: config.max_throttle,
            max_balance_xy: config.max_balance_xy,
            max_balance_z: config.max_balance_z,
        }
    }
}

/// Mixes throttle and regulator outputs onto the four motors of an X frame
/// # Arguments
/// * `throttle` - Throttle request, clamped to [0, 1] and scaled by `max_throttle`
/// * `x` - Roll regulator output
/// * `y` - Pitch regulator output
/// * `z` - Yaw regulator output
/// * `limits` - Mixer limits
/// # Returns
/// * Motor duties, each clamped to [0, 1]
pub fn mix(throttle: f32, x: f32, y: f32, z: f32, limits: &MixLimits) -> MotorCommand {
    let throttle = throttle.clamp(0.0, 1.0) * limits.max_throttle;
    // less attitude authority near idle keeps a barely spinning vehicle from flipping
    let balance_cut = if throttle < limits.min_throttle {
        throttle / limits.min_throttle
    } else {
        1.0
    };
    let limit = |value: f32, max: f32| {
        let max = max * balance_cut;
        if value.abs() > max {
            max.copysign(value)
        } else {
            value
        }
    };
    let x = limit(x, limits.max_balance_xy);
    let y = limit(y, limits.max_balance_xy);
    let z = limit(z, limits.max_balance_z);
    MotorCommand {
        front_right: (throttle - x - y + z).clamp(0.0, 1.0),
        front_left: (throttle + x - y - z).clamp(0.0, 1.0),
        back_left: (throttle + x + y + z).clamp(0.0, 1.0),
        back_right: (throttle - x + y - z).clamp(0.0, 1.0),
    }
}

/// Wraps an angle into (-π, π]
pub fn wrap_angle(angle: f32) -> f32 {
    PI - (PI - angle).rem_euclid(TAU)
}

/// Yaw angle of an orientation as used for the yaw reference
fn heading_of(orientation: &Quaternion<f32>) -> f32 {
    orientation.canonical().to_rotation_vector().z
}

/// Attitude controller driven by the flight task
pub struct FlightController {
    limits: MixLimits,
    /// Stick limits in radians
    max_roll_pitch_angle: f32,
    max_yaw_rate: f32,
    yaw_deadzone: f32,
    roll_pitch_deadzone: f32,
    /// Running yaw reference
    yaw: f32,
    /// Whether the previous cycle integrated the yaw stick
    yaw_integrating: bool,
    pid_x: Pid,
    pid_y: Pid,
    pid_z: Pid,
    yaw_error_filter: IirFilter,
    last_cycle: Option<Instant>,
}

impl FlightController {
    /// Creates a controller
    /// # Arguments
    /// * `config` - Flight limits and yaw error filter
    /// * `gains_xy` - Gains shared by the roll and pitch regulators
    /// * `gains_z` - Gains of the yaw regulator
    /// # Errors
    /// * Any error reported by the yaw error filter construction
    pub fn new(
        config: &FlightConfig,
        gains_xy: PidGains,
        gains_z: PidGains,
    ) -> Result<Self, FlightError> {
        Ok(Self {
            limits: MixLimits::from(config),
            max_roll_pitch_angle: config.max_roll_pitch_angle.to_radians(),
            max_yaw_rate: config.max_yaw_rate.to_radians(),
            yaw_deadzone: config.yaw_deadzone.to_radians(),
            roll_pitch_deadzone: config.roll_pitch_deadzone.to_radians(),
            yaw: 0.0,
            yaw_integrating: false,
            pid_x: Pid::new(gains_xy),
            pid_y: Pid::new(gains_xy),
            pid_z: Pid::new(gains_z),
            yaw_error_filter: IirFilter::from_coefficients(&config.yaw_error_filter)?,
            last_cycle: None,
        })
    }

    pub fn set_gains(&mut self, gains_xy: PidGains, gains_z: PidGains) {
        self.pid_x.set_gains(gains_xy);
        self.pid_y.set_gains(gains_xy);
        self.pid_z.set_gains(gains_z);
    }

    pub fn yaw(&self) -> f32 {
        self.yaw
    }
    /// Re-anchors the yaw reference and every clock after the task was suspended
    ///
    /// Regulator and yaw error filter state from the previous flight is cleared.
    pub fn resume(&mut self, estimate: &Quaternion<f32>, now: Instant) {
        self.yaw = heading_of(estimate);
        self.yaw_integrating = false;
        self.last_cycle = Some(now);
        self.pid_x.reset(now);
        self.pid_y.reset(now);
        self.pid_z.reset(now);
        self.yaw_error_filter.reset();
    }
    /// Builds the target orientation from the sticks
    /// # Arguments
    /// * `sticks` - Pilot input
    /// * `estimate` - Current orientation estimate, used to re-anchor yaw
    /// * `ts` - Time since the previous cycle in seconds
    pub fn target_orientation(
        &mut self,
        sticks: &StickInput,
        estimate: &Quaternion<f32>,
        ts: f32,
    ) -> Quaternion<f32> {
        let increment = -sticks.yaw * self.max_yaw_rate * ts;
        if increment.abs() > self.yaw_deadzone * ts {
            self.yaw += increment;
            self.yaw_integrating = true;
        } else if self.yaw_integrating {
            self.yaw = heading_of(estimate);
            self.yaw_integrating = false;
        }
        self.yaw = wrap_angle(self.yaw);

        let deadzone = |angle: f32| {
            if angle.abs() < self.roll_pitch_deadzone {
                0.0
            } else {
                angle
            }
        };
        let roll_pitch = Vector3::new(
            deadzone(sticks.roll * self.max_roll_pitch_angle),
            deadzone(sticks.pitch * self.max_roll_pitch_angle),
            0.0,
        );
        let yaw = Quaternion::from_rotation_vector(&Vector3::new(0.0, 0.0, self.yaw));
        yaw * Quaternion::from_rotation_vector(&roll_pitch)
    }
    /// Runs one control cycle
    /// # Arguments
    /// * `estimate` - Current orientation estimate
    /// * `sticks` - Pilot input
    /// * `mode` - Operating mode; throttle is only passed through in Flight
    /// * `now` - Current instant
    /// # Returns
    /// * The motor command for this cycle
    pub fn update(
        &mut self,
        estimate: &Quaternion<f32>,
        sticks: &StickInput,
        mode: OperatingMode,
        now: Instant,
    ) -> MotorCommand {
        let ts = self
            .last_cycle
            .map(|last| now.saturating_duration_since(last).as_secs_f32())
            .unwrap_or(0.0);
        self.last_cycle = Some(now);

        let target = self.target_orientation(sticks, estimate, ts);
        let mut error = (estimate.safe_inverse() * target)
            .canonical()
            .to_rotation_vector();
        error.z = self.yaw_error_filter.process(error.z);
        log::trace!("Attitude error {:.4} {:.4} {:.4}", error.x, error.y, error.z);

        let throttle = if mode == OperatingMode::Flight {
            sticks.throttle
        } else {
            0.0
        };
        mix(
            throttle,
            self.pid_x.calc_at(error.x, now),
            self.pid_y.calc_at(error.y, now),
            self.pid_z.calc_at(error.z, now),
            &self.limits,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::time::Duration;

    fn limits() -> MixLimits {
        MixLimits::from(&FlightConfig::default())
    }

    fn gains() -> PidGains {
        PidGains {
            p: 0.2,
            i: 0.0,
            d: 0.0,
            n: 20.0,
        }
    }

    fn controller() -> FlightController {
        FlightController::new(&FlightConfig::default(), gains(), gains()).unwrap()
    }

    #[test]
    fn idle_mix_is_all_zero() {
        assert_eq!(mix(0.0, 0.0, 0.0, 0.0, &limits()), MotorCommand::default());
    }

    #[test]
    fn full_throttle_mix_is_max_throttle() {
        let command = mix(1.0, 0.0, 0.0, 0.0, &limits());
        for position in MotorPosition::ALL {
            assert_eq!(command.duty(position), 0.7);
        }
        assert_eq!(mix(3.0, 0.0, 0.0, 0.0, &limits()), command);
    }

    #[test]
    fn zero_throttle_removes_attitude_authority() {
        assert_eq!(mix(0.0, 0.5, -0.5, 0.5, &limits()), MotorCommand::default());
        assert_eq!(mix(-1.0, 0.5, 0.5, 0.5, &limits()), MotorCommand::default());
    }

    #[test]
    fn balance_is_cut_near_idle() {
        // 0.2 * 0.7 = 0.14, cut = 0.14 / 0.3
        let command = mix(0.2, 1.0, 0.0, 0.0, &limits());
        let authority = 0.1 * 0.14 / 0.3;
        assert_relative_eq!(command.front_left, 0.14 + authority, epsilon = 1e-6);
        assert_relative_eq!(command.front_right, 0.14 - authority, epsilon = 1e-6);
    }

    #[test]
    fn axis_outputs_follow_x_layout() {
        let command = mix(0.5, 0.02, 0.0, 0.0, &limits());
        assert!(command.front_left > command.front_right);
        assert!(command.back_left > command.back_right);
        let command = mix(0.5, 0.0, 0.0, 0.02, &limits());
        assert!(command.front_right > command.front_left);
        assert!(command.back_left > command.back_right);
        // saturated outputs keep their sign
        let command = mix(0.5, 0.0, -5.0, 0.0, &limits());
        assert_relative_eq!(command.front_right, 0.35 + 0.1, epsilon = 1e-6);
        assert_relative_eq!(command.back_right, 0.35 - 0.1, epsilon = 1e-6);
    }

    #[test]
    fn wrap_angle_stays_in_half_open_range() {
        assert_relative_eq!(wrap_angle(1.5 * PI), -0.5 * PI, epsilon = 1e-5);
        assert_relative_eq!(wrap_angle(-1.5 * PI), 0.5 * PI, epsilon = 1e-5);
        assert_relative_eq!(wrap_angle(0.3), 0.3, epsilon = 1e-6);
        assert_relative_eq!(wrap_angle(PI), PI);
        assert_relative_eq!(wrap_angle(-PI), PI);
    }

    #[test]
    fn level_hover_drives_all_motors_equally() {
        let mut controller = controller();
        let sticks = StickInput {
            throttle: 0.5,
            ..Default::default()
        };
        let start = Instant::now();
        for k in 0..10 {
            let now = start + Duration::from_millis(20 * k);
            let command =
                controller.update(&Quaternion::identity(), &sticks, OperatingMode::Flight, now);
            for position in MotorPosition::ALL {
                assert_relative_eq!(command.duty(position), 0.35, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn homing_forces_zero_throttle() {
        let mut controller = controller();
        let sticks = StickInput {
            roll: 0.5,
            throttle: 0.8,
            ..Default::default()
        };
        let command = controller.update(
            &Quaternion::identity(),
            &sticks,
            OperatingMode::Homing,
            Instant::now(),
        );
        assert_eq!(command, MotorCommand::default());
    }

    #[test]
    fn roll_stick_raises_left_motors() {
        let mut controller = controller();
        let sticks = StickInput {
            roll: 0.5,
            throttle: 0.5,
            ..Default::default()
        };
        let command = controller.update(
            &Quaternion::identity(),
            &sticks,
            OperatingMode::Flight,
            Instant::now(),
        );
        // 10 degree roll error times P
        let x = 0.2 * 10f32.to_radians();
        assert_relative_eq!(command.front_left, 0.35 + x, epsilon = 1e-5);
        assert_relative_eq!(command.back_left, 0.35 + x, epsilon = 1e-5);
        assert_relative_eq!(command.front_right, 0.35 - x, epsilon = 1e-5);
    }

    #[test]
    fn small_roll_inside_deadzone_is_ignored() {
        let mut controller = controller();
        let sticks = StickInput {
            roll: 0.005,
            ..Default::default()
        };
        let target = controller.target_orientation(&sticks, &Quaternion::identity(), 0.02);
        assert_eq!(target, Quaternion::identity());
    }

    #[test]
    fn yaw_stick_integrates_then_reanchors() {
        let mut controller = controller();
        let estimate = Quaternion::identity();
        let turning = StickInput {
            yaw: 1.0,
            ..Default::default()
        };
        for _ in 0..50 {
            controller.target_orientation(&turning, &estimate, 0.02);
        }
        assert_relative_eq!(controller.yaw(), -(40f32.to_radians()), epsilon = 1e-4);
        controller.target_orientation(&StickInput::default(), &estimate, 0.02);
        assert_eq!(controller.yaw(), 0.0);
    }

    #[test]
    fn yaw_below_deadzone_does_not_integrate() {
        let mut controller = controller();
        let creeping = StickInput {
            yaw: 0.04,
            ..Default::default()
        };
        for _ in 0..100 {
            controller.target_orientation(&creeping, &Quaternion::identity(), 0.02);
        }
        assert_eq!(controller.yaw(), 0.0);
    }

    #[test]
    fn resume_anchors_yaw_to_estimate() {
        let mut controller = controller();
        let estimate = Quaternion::from_rotation_vector(&Vector3::new(0.0, 0.0, 0.5));
        controller.resume(&estimate, Instant::now());
        assert_relative_eq!(controller.yaw(), 0.5, epsilon = 1e-5);
        let target = controller.target_orientation(&StickInput::default(), &estimate, 0.02);
        assert_relative_eq!(
            (estimate.safe_inverse() * target).to_rotation_vector().norm(),
            0.0,
            epsilon = 1e-5
        );
    }

    #[test]
    fn resume_drops_regulator_state_of_previous_flight() {
        let gains = PidGains {
            p: 0.2,
            i: 1.0,
            d: 0.1,
            n: 20.0,
        };
        let mut controller = FlightController::new(&FlightConfig::default(), gains, gains).unwrap();
        let sticks = StickInput {
            throttle: 0.5,
            ..Default::default()
        };
        let tilted = Quaternion::from_rotation_vector(&Vector3::new(0.3, 0.0, 0.2));
        let start = Instant::now();
        for cycle in 0..20 {
            let now = start + Duration::from_millis(20 * cycle);
            controller.update(&tilted, &sticks, OperatingMode::Flight, now);
        }
        let level = Quaternion::identity();
        let resumed = start + Duration::from_secs(5);
        controller.resume(&level, resumed);
        let command = controller.update(
            &level,
            &sticks,
            OperatingMode::Flight,
            resumed + Duration::from_millis(20),
        );
        for position in MotorPosition::ALL {
            assert_relative_eq!(command.duty(position), 0.35, epsilon = 1e-6);
        }
    }
}
