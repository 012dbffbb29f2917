//! Attitude test stand: rotational dynamics, simulated IMU, scripted radio and draining battery
//!
//! The vehicle is mounted on a frictionless gimbal, so only its orientation evolves.
use crate::config::{ImuConfig, RadioScriptStep, SimulationConfig, VehicleConfig};
use crate::interfaces::{
    InertialSource, MotorPosition, MotorSink, RadioChannel, RawChannel, RawRadioSource,
    VoltageSource,
};
use crate::{FlightError, InertialSample};
use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// IMU with white noise and random-walk gyroscope bias
#[derive(Clone, Debug)]
pub struct SimulatedImu {
    /// Gyroscope bias
    pub gyro_bias: Vector3<f32>,
    accel_noise: Normal<f32>,
    gyro_noise: Normal<f32>,
    mag_noise: Normal<f32>,
    bias_instability: f32,
    magnetic_field: Vector3<f32>,
}

impl SimulatedImu {
    /// Creates a new IMU
    /// # Errors
    /// * Returns a `Noise` error if a standard deviation is negative or not finite
    pub fn new(config: &ImuConfig) -> Result<Self, FlightError> {
        Ok(Self {
            gyro_bias: Vector3::zeros(),
            accel_noise: Normal::new(0.0, config.accel_noise_std)?,
            gyro_noise: Normal::new(0.0, config.gyro_noise_std)?,
            mag_noise: Normal::new(0.0, config.mag_noise_std)?,
            bias_instability: config.bias_instability,
            magnetic_field: Vector3::from(config.magnetic_field),
        })
    }
    /// Updates the IMU bias over time
    /// # Errors
    /// * Returns a `Noise` error if the bias drift cannot be calculated
    pub fn update(&mut self, dt: f32, rng: &mut ChaCha8Rng) -> Result<(), FlightError> {
        let drift = Normal::new(0.0, self.bias_instability * dt.max(0.0).sqrt())?;
        self.gyro_bias += Vector3::from_fn(|_, _| drift.sample(&mut *rng));
        Ok(())
    }
    /// Simulates one reading
    /// # Arguments
    /// * `orientation` - Body to world rotation
    /// * `angular_velocity` - Body angular rate in rad/s
    /// * `gravity` - Gravitational acceleration in m/s^2
    pub fn read(
        &self,
        orientation: &UnitQuaternion<f32>,
        angular_velocity: &Vector3<f32>,
        gravity: f32,
        rng: &mut ChaCha8Rng,
    ) -> InertialSample {
        let mut noise = |distribution: &Normal<f32>| {
            Vector3::from_fn(|_, _| distribution.sample(&mut *rng))
        };
        let to_body = orientation.inverse();
        InertialSample {
            accel: to_body * Vector3::new(0.0, 0.0, -gravity) + noise(&self.accel_noise),
            gyro: angular_velocity + self.gyro_bias + noise(&self.gyro_noise),
            mag: to_body * self.magnetic_field + noise(&self.mag_noise),
        }
    }
}

/// Rotational rigid body driven by four motor duties
pub struct SimulatedQuad {
    /// Body to world rotation
    pub orientation: UnitQuaternion<f32>,
    /// Body angular rate in rad/s
    pub angular_velocity: Vector3<f32>,
    /// Duties in front-right, front-left, back-left, back-right order
    motors: [f32; 4],
    inertia: Matrix3<f32>,
    inertia_inv: Matrix3<f32>,
    vehicle: VehicleConfig,
    imu: SimulatedImu,
    rng: ChaCha8Rng,
    /// Simulated seconds since start
    time: f32,
    /// Integral of mean motor duty over time
    duty_seconds: f32,
}

impl SimulatedQuad {
    /// Creates a level vehicle at rest
    /// # Errors
    /// * `Config` if the inertia tensor is singular, `Noise` for unusable IMU noise
    pub fn new(config: &SimulationConfig) -> Result<Self, FlightError> {
        let inertia = Matrix3::from_diagonal(&Vector3::from(config.vehicle.inertia));
        let inertia_inv = inertia
            .try_inverse()
            .ok_or_else(|| FlightError::Config("Failed to invert inertia matrix".to_string()))?;
        Ok(Self {
            orientation: UnitQuaternion::identity(),
            angular_velocity: Vector3::zeros(),
            motors: [0.0; 4],
            inertia,
            inertia_inv,
            vehicle: config.vehicle.clone(),
            imu: SimulatedImu::new(&config.imu)?,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            time: 0.0,
            duty_seconds: 0.0,
        })
    }

    pub fn set_motor(&mut self, position: MotorPosition, duty: f32) {
        self.motors[motor_index(position)] = duty.clamp(0.0, 1.0);
    }

    pub fn motors(&self) -> [f32; 4] {
        self.motors
    }

    pub fn time(&self) -> f32 {
        self.time
    }

    pub fn duty_seconds(&self) -> f32 {
        self.duty_seconds
    }
    /// Body torque produced by the current motor duties
    pub fn motor_torque(&self) -> Vector3<f32> {
        let [fr, fl, bl, br] = self.motors;
        let lever = self.vehicle.arm_length * self.vehicle.max_motor_thrust;
        Vector3::new(
            lever * (fl + bl - fr - br),
            lever * (bl + br - fr - fl),
            self.vehicle.yaw_torque_coefficient * (fr - fl + bl - br),
        )
    }
    /// Advances the dynamics and the IMU bias by `dt` seconds
    /// # Errors
    /// * Returns a `Noise` error if the bias drift cannot be calculated
    pub fn step(&mut self, dt: f32) -> Result<(), FlightError> {
        let torque = self.motor_torque() - self.angular_velocity * self.vehicle.angular_damping;
        let inertia_angular_velocity = self.inertia * self.angular_velocity;
        let gyroscopic_torque = self.angular_velocity.cross(&inertia_angular_velocity);
        let angular_acceleration = self.inertia_inv * (torque - gyroscopic_torque);
        self.angular_velocity += angular_acceleration * dt;
        self.orientation *= UnitQuaternion::from_scaled_axis(self.angular_velocity * dt);
        self.imu.update(dt, &mut self.rng)?;
        self.time += dt;
        self.duty_seconds += self.motors.iter().sum::<f32>() / 4.0 * dt;
        Ok(())
    }

    pub fn read_imu(&mut self) -> InertialSample {
        self.imu.read(
            &self.orientation,
            &self.angular_velocity,
            self.vehicle.gravity,
            &mut self.rng,
        )
    }
}

fn motor_index(position: MotorPosition) -> usize {
    match position {
        MotorPosition::FrontRight => 0,
        MotorPosition::FrontLeft => 1,
        MotorPosition::BackLeft => 2,
        MotorPosition::BackRight => 3,
    }
}

/// Shared handle to the simulated vehicle, used as IMU driver and motor driver
#[derive(Clone)]
pub struct SimHandle(Arc<Mutex<SimulatedQuad>>);

impl SimHandle {
    pub fn new(quad: SimulatedQuad) -> Self {
        Self(Arc::new(Mutex::new(quad)))
    }

    pub fn lock(&self) -> MutexGuard<'_, SimulatedQuad> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn step(&self, dt: f32) -> Result<(), FlightError> {
        self.lock().step(dt)
    }

    pub fn time(&self) -> f32 {
        self.lock().time()
    }

    pub fn orientation(&self) -> UnitQuaternion<f32> {
        self.lock().orientation
    }

    pub fn motors(&self) -> [f32; 4] {
        self.lock().motors()
    }
}

impl InertialSource for SimHandle {
    fn read_sample(&mut self) -> Result<InertialSample, FlightError> {
        Ok(self.lock().read_imu())
    }
}

impl MotorSink for SimHandle {
    fn set_motor(&self, position: MotorPosition, duty: f32) {
        self.lock().set_motor(position, duty);
    }
}

/// Radio whose raw channels follow a time-stamped script on the simulation clock
pub struct ScriptedRadio {
    steps: Vec<RadioScriptStep>,
    clock: SimHandle,
}

impl ScriptedRadio {
    pub fn new(mut steps: Vec<RadioScriptStep>, clock: SimHandle) -> Self {
        steps.sort_by(|a, b| a.time.total_cmp(&b.time));
        Self { steps, clock }
    }
    /// Script step active at `time`
    pub fn step_at(&self, time: f32) -> Option<&RadioScriptStep> {
        self.steps.iter().rev().find(|step| step.time <= time)
    }
}

impl RawRadioSource for ScriptedRadio {
    fn channel(&mut self, channel: RadioChannel) -> RawChannel {
        let time = self.clock.time();
        match self.step_at(time) {
            Some(step) if step.connected => RawChannel {
                value: step.channels[channel.index()],
                age: Duration::ZERO,
            },
            // values freeze at the last received pulse while the link is down
            Some(step) => RawChannel {
                value: step.channels[channel.index()],
                age: Duration::from_secs_f32((time - step.time).max(0.0)),
            },
            None => RawChannel {
                value: 0.0,
                age: Duration::MAX,
            },
        }
    }
}

/// Battery whose voltage sags with the energy the motors have drawn
pub struct SimulatedBattery {
    initial_voltage: f32,
    /// Volts lost per second at full duty
    drain: f32,
    vehicle: SimHandle,
}

impl SimulatedBattery {
    pub fn new(initial_voltage: f32, drain: f32, vehicle: SimHandle) -> Self {
        Self {
            initial_voltage,
            drain,
            vehicle,
        }
    }
}

impl VoltageSource for SimulatedBattery {
    fn battery_voltage(&mut self) -> f32 {
        self.initial_voltage - self.drain * self.vehicle.lock().duty_seconds()
    }
}
