//! # Calmar flight core
//! This crate is the flight-critical core of a small quadrotor's onboard firmware.
//! It turns raw inertial samples into a stabilized attitude estimate, turns pilot input
//! into a target attitude, closes the attitude loop with per-axis regulators and decides
//! when that loop is allowed to run through a supervisory operating-mode state machine.
//! ## Features
//! - Quaternion / vector helpers with total, non-failing semantics
//! - Generic order-N IIR filter for pre-filtering noisy sensor axes
//! - Filtered-derivative PID regulator, one instance per axis
//! - Mahony-style complementary filter fusing accelerometer, gyroscope and magnetometer
//! - Attitude flight loop with X-frame motor mixing
//! - Operating-mode state machine owning task suspension and resumption
//! - Attitude test-stand simulation used by the binary and the integration tests
use nalgebra::{Quaternion, Vector3};
use std::collections::VecDeque;
use std::time::Instant;

pub mod battery_status;
pub mod calibration;
pub mod config;
pub mod device_manager;
pub mod flight_controller;
pub mod interfaces;
pub mod radio_status;
pub mod seqlock;
pub mod settings;
pub mod sim;
pub mod tasks;

use config::{EstimatorConfig, FilterCoefficients};

#[derive(thiserror::Error, Debug)]
/// Represents errors that can occur in the flight core
pub enum FlightError {
    /// A filter was requested with order 0
    #[error("Filter order must be at least 1")]
    InvalidFilterOrder,
    /// The leading denominator coefficient of a filter is zero
    #[error("Leading denominator coefficient must not be zero")]
    ZeroLeadingDenominator,
    /// More coefficients were supplied than the filter order allows
    #[error("Expected at most {expected} coefficients, found {found}")]
    CoefficientLength { expected: usize, found: usize },
    /// A sensor sample could not be read this cycle
    #[error("Sensor error: {0}")]
    Sensor(String),
    /// Configuration is syntactically valid but unusable
    #[error("Config error: {0}")]
    Config(String),
    /// Error reading or writing a file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Error parsing or emitting YAML
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// Error related to normal distribution parameters of the simulated sensors
    #[error("Normal error: {0}")]
    Noise(#[from] rand_distr::NormalError),
}

/// Substitute for an exactly zero scalar part in [`QuaternionExt::to_rotation_vector`]
const ROTATION_W_EPSILON: f32 = 1e-9;

/// Vector operations nalgebra does not provide with zero-length fallback semantics
pub trait VectorExt {
    /// Normalizes the vector, returning it unchanged when its length is zero
    fn safe_normalize(&self) -> Self;
}

impl VectorExt for Vector3<f32> {
    fn safe_normalize(&self) -> Self {
        let length = self.norm();
        if length == 0.0 {
            *self
        } else {
            self / length
        }
    }
}

/// Quaternion operations with total semantics and rotation-vector conversions
///
/// Sum, difference, scalar multiply, Hamilton product and norm come straight from
/// nalgebra's operators; only the operations that must not divide by zero live here.
pub trait QuaternionExt {
    /// Inverse of the quaternion, or the quaternion itself when its squared norm is zero
    fn safe_inverse(&self) -> Self;
    /// Normalizes the quaternion, returning it unchanged when its norm is zero
    fn safe_normalize(&self) -> Self;
    /// Quaternion mapped to the `w >= 0` hemisphere, representing the same rotation
    fn canonical(&self) -> Self;
    /// Converts the quaternion to an axis-angle rotation vector
    /// # Returns
    /// * A vector whose direction is the rotation axis and whose length is `2·atan2(|v|, w)`
    fn to_rotation_vector(&self) -> Vector3<f32>;
    /// Exponential map from a rotation vector to a rotation quaternion
    /// # Arguments
    /// * `rotation` - Rotation axis scaled by the rotation angle in radians
    fn from_rotation_vector(rotation: &Vector3<f32>) -> Self;
}

impl QuaternionExt for Quaternion<f32> {
    fn safe_inverse(&self) -> Self {
        let norm_squared = self.norm_squared();
        if norm_squared == 0.0 {
            *self
        } else {
            self.conjugate() * (1.0 / norm_squared)
        }
    }

    fn safe_normalize(&self) -> Self {
        let norm = self.norm();
        if norm == 0.0 {
            *self
        } else {
            *self * (1.0 / norm)
        }
    }

    fn canonical(&self) -> Self {
        if self.w < 0.0 {
            -*self
        } else {
            *self
        }
    }

    fn to_rotation_vector(&self) -> Vector3<f32> {
        let w = if self.w == 0.0 { ROTATION_W_EPSILON } else { self.w };
        let vector = self.imag();
        let angle = 2.0 * vector.norm().atan2(w);
        vector.safe_normalize() * angle
    }

    fn from_rotation_vector(rotation: &Vector3<f32>) -> Self {
        let angle = rotation.norm();
        if angle == 0.0 {
            return Quaternion::identity();
        }
        let (sin, cos) = (0.5 * angle).sin_cos();
        Quaternion::from_parts(cos, rotation * (sin / angle))
    }
}

/// One entry of a filter's history
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FilterSample {
    /// Input fed to the filter
    pub input: f32,
    /// Output the filter produced for that input
    pub output: f32,
}

/// Digital IIR filter of arbitrary order
///
/// Computes `y = (b0·u + Σ (b[i]·u[k-i] - a[i]·y[k-i])) / a0` with the history kept
/// most-recent-first. Coefficient selection (cutoff, sample rate) belongs to the caller.
#[derive(Clone, Debug)]
pub struct IirFilter {
    /// Numerator coefficients `b[0..=order]`
    numerator: Vec<f32>,
    /// Denominator coefficients `a[0..=order]`
    denominator: Vec<f32>,
    /// Past (input, output) pairs, index 0 is the most recent
    history: VecDeque<FilterSample>,
}

impl IirFilter {
    /// Creates a new filter
    /// # Arguments
    /// * `numerator` - Numerator coefficients, zero-padded up to `order + 1`
    /// * `denominator` - Denominator coefficients, zero-padded up to `order + 1`
    /// * `order` - Filter order, at least 1
    /// # Returns
    /// * A filter with an all-zero history
    /// # Errors
    /// * `InvalidFilterOrder` if `order` is 0
    /// * `CoefficientLength` if a coefficient slice is longer than `order + 1`
    /// * `ZeroLeadingDenominator` if the first denominator coefficient is 0
    pub fn new(numerator: &[f32], denominator: &[f32], order: usize) -> Result<Self, FlightError> {
        if order == 0 {
            return Err(FlightError::InvalidFilterOrder);
        }
        let pad = |coefficients: &[f32]| -> Result<Vec<f32>, FlightError> {
            if coefficients.len() > order + 1 {
                return Err(FlightError::CoefficientLength {
                    expected: order + 1,
                    found: coefficients.len(),
                });
            }
            let mut padded = coefficients.to_vec();
            padded.resize(order + 1, 0.0);
            Ok(padded)
        };
        let numerator = pad(numerator)?;
        let denominator = pad(denominator)?;
        if denominator[0] == 0.0 {
            return Err(FlightError::ZeroLeadingDenominator);
        }
        Ok(Self {
            numerator,
            denominator,
            history: VecDeque::from(vec![FilterSample::default(); order]),
        })
    }
    /// Creates a filter from a configuration entry
    /// # Errors
    /// * Same as [`IirFilter::new`]
    pub fn from_coefficients(coefficients: &FilterCoefficients) -> Result<Self, FlightError> {
        Self::new(
            &coefficients.numerator,
            &coefficients.denominator,
            coefficients.order,
        )
    }
    /// Feeds one sample through the filter
    /// # Arguments
    /// * `input` - The newest signal value
    /// # Returns
    /// * The filtered value
    pub fn process(&mut self, input: f32) -> f32 {
        let mut output = self.numerator[0] * input;
        for (i, past) in self.history.iter().enumerate() {
            output += self.numerator[i + 1] * past.input - self.denominator[i + 1] * past.output;
        }
        output /= self.denominator[0];
        self.history.pop_back();
        self.history.push_front(FilterSample { input, output });
        output
    }
    /// History entry by relative age, 0 being the most recent
    pub fn history(&self, age: usize) -> Option<FilterSample> {
        self.history.get(age).copied()
    }

    pub fn order(&self) -> usize {
        self.history.len()
    }
    /// Clears the history as if the filter had only ever seen zeros
    pub fn reset(&mut self) {
        self.history.iter_mut().for_each(|past| *past = FilterSample::default());
    }
}

/// Gains of a single-axis PID regulator
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PidGains {
    /// Proportional gain
    pub p: f32,
    /// Integral gain
    pub i: f32,
    /// Derivative gain
    pub d: f32,
    /// Derivative low-pass coefficient
    pub n: f32,
}

/// Discrete PID regulator with filtered derivative and forward-Euler integral
#[derive(Clone, Debug)]
pub struct Pid {
    /// Current gains, hot-settable between calls
    gains: PidGains,
    /// Input of the previous call, `U[k-1]`
    previous_input: f32,
    /// Filtered derivative of the previous call, `Yv[k-1]`
    previous_derivative: f32,
    /// Integral accumulator, `YI[k-1]`
    integral: f32,
    /// Instant of the previous [`Pid::calc_at`] call
    last_call: Option<Instant>,
}

impl Pid {
    /// Creates a regulator with zeroed state
    /// # Arguments
    /// * `gains` - Initial P, I, D and N values
    pub fn new(gains: PidGains) -> Self {
        Self {
            gains,
            previous_input: 0.0,
            previous_derivative: 0.0,
            integral: 0.0,
            last_call: None,
        }
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    pub fn set_gains(&mut self, gains: PidGains) {
        self.gains = gains;
    }
    /// Computes the regulator output for an explicit sampling interval
    ///
    /// A non-positive or non-finite `ts` leaves the state untouched and yields the output
    /// of the stored integral and derivative terms.
    /// # Arguments
    /// * `input` - Control error for this cycle
    /// * `ts` - Time since the previous call in seconds
    /// # Returns
    /// * `P·input + I·YI[k] + D·Yv[k]`
    pub fn calc(&mut self, input: f32, ts: f32) -> f32 {
        let PidGains { p, i, d, n } = self.gains;
        if ts > 0.0 && ts.is_finite() {
            self.previous_derivative =
                -self.previous_derivative * (n * ts - 1.0) - self.previous_input * n + input * n;
            self.integral += ts * self.previous_input;
            self.previous_input = input;
        }
        p * input + i * self.integral + d * self.previous_derivative
    }
    /// Computes the regulator output using the time elapsed since the previous call
    /// # Arguments
    /// * `input` - Control error for this cycle
    /// * `now` - Current instant; the first call after construction uses `ts = 0`
    pub fn calc_at(&mut self, input: f32, now: Instant) -> f32 {
        let ts = self
            .last_call
            .map(|last| now.saturating_duration_since(last).as_secs_f32())
            .unwrap_or(0.0);
        self.last_call = Some(now);
        self.calc(input, ts)
    }
    /// Re-anchors the elapsed-time baseline used by [`Pid::calc_at`]
    pub fn reset_clock(&mut self, now: Instant) {
        self.last_call = Some(now);
    }
    /// Zeroes the integral, derivative and previous input and re-anchors the clock
    pub fn reset(&mut self, now: Instant) {
        self.previous_input = 0.0;
        self.previous_derivative = 0.0;
        self.integral = 0.0;
        self.reset_clock(now);
    }
}

/// One inertial measurement, already offset-corrected by the driver
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct InertialSample {
    /// Acceleration in m/s^2
    pub accel: Vector3<f32>,
    /// Angular rate in rad/s
    pub gyro: Vector3<f32>,
    /// Magnetic field in an arbitrary but consistent unit
    pub mag: Vector3<f32>,
}

/// Mahony-style complementary filter producing the vehicle orientation
///
/// The orientation maps body-frame vectors to the reference frame. Gravity and heading
/// references are the body-frame directions of gravity and of the horizontal magnetic
/// field when the vehicle is level at the reference heading; they are kept orthogonal.
#[derive(Clone, Debug)]
pub struct MahonyFilter {
    /// Running orientation estimate
    orientation: Quaternion<f32>,
    /// Expected gravity direction, unit length
    gravity_reference: Vector3<f32>,
    /// Expected horizontal magnetic field direction, unit length, perpendicular to gravity
    heading_reference: Vector3<f32>,
    /// Weight of the accelerometer correction
    acc_gain: f32,
    /// Weight of the magnetometer correction
    mag_gain: f32,
    /// When false only gyroscope and accelerometer are fused
    use_magnetometer: bool,
}

impl MahonyFilter {
    /// Creates a filter at identity orientation with default references
    /// # Arguments
    /// * `acc_gain` - Accelerometer correction gain
    /// * `mag_gain` - Magnetometer correction gain
    pub fn new(acc_gain: f32, mag_gain: f32) -> Self {
        Self {
            orientation: Quaternion::identity(),
            gravity_reference: Vector3::new(0.0, 0.0, -1.0),
            heading_reference: Vector3::new(1.0, 0.0, 0.0),
            acc_gain,
            mag_gain,
            use_magnetometer: true,
        }
    }
    /// Creates a filter from the estimator section of the configuration
    pub fn from_config(config: &EstimatorConfig) -> Self {
        let mut filter = Self::new(config.acc_gain, config.mag_gain);
        filter.set_gravity_reference(Vector3::from(config.gravity_reference));
        filter.set_heading_reference(Vector3::from(config.heading_reference));
        filter.use_magnetometer(config.use_magnetometer);
        filter
    }

    pub fn orientation(&self) -> Quaternion<f32> {
        self.orientation
    }

    pub fn gravity_reference(&self) -> Vector3<f32> {
        self.gravity_reference
    }

    pub fn heading_reference(&self) -> Vector3<f32> {
        self.heading_reference
    }
    /// Sets the expected gravity direction and re-projects the heading reference onto it
    pub fn set_gravity_reference(&mut self, gravity: Vector3<f32>) {
        self.gravity_reference = gravity.safe_normalize();
        self.set_heading_reference(self.heading_reference);
    }
    /// Sets the expected magnetic direction, keeping only its part perpendicular to gravity
    pub fn set_heading_reference(&mut self, heading: Vector3<f32>) {
        let heading = heading.safe_normalize();
        let gravity = self.gravity_reference;
        self.heading_reference = (heading - gravity * heading.dot(&gravity)).safe_normalize();
    }

    pub fn use_magnetometer(&mut self, enabled: bool) {
        self.use_magnetometer = enabled;
    }
    /// Advances the estimate by one sample
    /// # Arguments
    /// * `sample` - Filtered accelerometer, gyroscope and magnetometer readings
    /// * `ts` - Time since the previous update in seconds; non-positive values are ignored
    /// # Returns
    /// * The updated, normalized orientation
    pub fn update(&mut self, sample: &InertialSample, ts: f32) -> Quaternion<f32> {
        if !(ts > 0.0 && ts.is_finite()) {
            return self.orientation;
        }
        let inverse = self.orientation.safe_inverse();
        let acc_estimate =
            (inverse * Quaternion::from_imag(self.gravity_reference) * self.orientation).imag();
        let mag_estimate =
            (inverse * Quaternion::from_imag(self.heading_reference) * self.orientation).imag();
        // tilt compensation: keep only the field component perpendicular to estimated gravity
        let gravity = acc_estimate.safe_normalize();
        let mag = sample.mag.safe_normalize();
        let mag = (mag - gravity * mag.dot(&gravity)).safe_normalize();
        let acc = sample.accel.safe_normalize();
        let acc_error = vector_error(&acc_estimate, &acc) * self.acc_gain;
        let mag_error = if self.use_magnetometer {
            vector_error(&mag_estimate, &mag) * self.mag_gain
        } else {
            Vector3::zeros()
        };
        let rate = Quaternion::from_imag(sample.gyro + acc_error + mag_error);
        self.orientation =
            (self.orientation + self.orientation * rate * (0.5 * ts)).safe_normalize();
        self.orientation
    }
}

/// Vector part of `estimate⁻¹ ∘ measured` for two pure quaternions
fn vector_error(estimate: &Vector3<f32>, measured: &Vector3<f32>) -> Vector3<f32> {
    (Quaternion::from_imag(*estimate).safe_inverse() * Quaternion::from_imag(*measured)).imag()
}

/// Per-axis IIR pre-filters for the three inertial sensors
#[derive(Clone, Debug)]
pub struct SensorPrefilter {
    accel: [IirFilter; 3],
    gyro: [IirFilter; 3],
    mag: [IirFilter; 3],
}

impl SensorPrefilter {
    /// Creates a filter bank, one filter per axis
    /// # Errors
    /// * Any configuration error reported by [`IirFilter::new`]
    pub fn new(
        accel: &FilterCoefficients,
        gyro: &FilterCoefficients,
        mag: &FilterCoefficients,
    ) -> Result<Self, FlightError> {
        let axes = |coefficients: &FilterCoefficients| -> Result<[IirFilter; 3], FlightError> {
            Ok([
                IirFilter::from_coefficients(coefficients)?,
                IirFilter::from_coefficients(coefficients)?,
                IirFilter::from_coefficients(coefficients)?,
            ])
        };
        Ok(Self {
            accel: axes(accel)?,
            gyro: axes(gyro)?,
            mag: axes(mag)?,
        })
    }

    pub fn from_config(config: &EstimatorConfig) -> Result<Self, FlightError> {
        Self::new(&config.accel_filter, &config.gyro_filter, &config.mag_filter)
    }
    /// Filters every axis of a raw sample
    pub fn process(&mut self, sample: &InertialSample) -> InertialSample {
        InertialSample {
            accel: filter_axes(&mut self.accel, &sample.accel),
            gyro: filter_axes(&mut self.gyro, &sample.gyro),
            mag: filter_axes(&mut self.mag, &sample.mag),
        }
    }
}

fn filter_axes(filters: &mut [IirFilter; 3], value: &Vector3<f32>) -> Vector3<f32> {
    Vector3::new(
        filters[0].process(value.x),
        filters[1].process(value.y),
        filters[2].process(value.z),
    )
}
