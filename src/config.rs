use crate::FlightError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;

/// Top level configuration, every section falls back to the reference constants
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub rates: RatesConfig,
    pub estimator: EstimatorConfig,
    pub flight: FlightConfig,
    pub mode: ModeConfig,
    pub radio: RadioConfig,
    pub battery: BatteryConfig,
    pub calibration: CalibrationConfig,
    pub settings: SettingsConfig,
    pub simulation: SimulationConfig,
}

/// Task frequencies in Hz
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RatesConfig {
    pub estimator: f32,
    pub flight: f32,
    pub mode: f32,
    pub radio: f32,
    pub battery: f32,
}

impl Default for RatesConfig {
    fn default() -> Self {
        Self {
            estimator: 1000.0,
            flight: 50.0,
            mode: 10.0,
            radio: 50.0,
            battery: 10.0,
        }
    }
}

/// Coefficients of one IIR filter
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct FilterCoefficients {
    pub numerator: Vec<f32>,
    pub denominator: Vec<f32>,
    pub order: usize,
}

impl FilterCoefficients {
    /// First order filter whose output equals its input
    pub fn pass_through() -> Self {
        Self {
            numerator: vec![1.0],
            denominator: vec![1.0],
            order: 1,
        }
    }
    /// 2nd order Butterworth low-pass, 30 Hz cutoff at 1 kHz sampling
    pub fn sensor_low_pass() -> Self {
        Self {
            numerator: vec![0.007820, 0.015641, 0.007820],
            denominator: vec![1.0, -1.734725, 0.766006],
            order: 2,
        }
    }
    /// 2nd order Butterworth low-pass, 1 Hz cutoff at 50 Hz sampling
    pub fn yaw_error_low_pass() -> Self {
        Self {
            numerator: vec![0.003621681514929, 0.007243363029857, 0.003621681514929],
            denominator: vec![1.0, -1.822694925196308, 0.837181651256023],
            order: 2,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub acc_gain: f32,
    pub mag_gain: f32,
    pub use_magnetometer: bool,
    pub gravity_reference: [f32; 3],
    pub heading_reference: [f32; 3],
    pub accel_filter: FilterCoefficients,
    pub gyro_filter: FilterCoefficients,
    pub mag_filter: FilterCoefficients,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            acc_gain: 2.0,
            mag_gain: 0.5,
            use_magnetometer: true,
            gravity_reference: [0.0, 0.0, -1.0],
            heading_reference: [1.0, 0.0, 0.0],
            accel_filter: FilterCoefficients::sensor_low_pass(),
            gyro_filter: FilterCoefficients::pass_through(),
            mag_filter: FilterCoefficients::sensor_low_pass(),
        }
    }
}

/// Flight loop limits, angles in degrees
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct FlightConfig {
    pub max_roll_pitch_angle: f32,
    pub max_yaw_rate: f32,
    pub yaw_deadzone: f32,
    pub roll_pitch_deadzone: f32,
    pub min_throttle: f32,
    pub max_throttle: f32,
    pub max_balance_xy: f32,
    pub max_balance_z: f32,
    pub yaw_error_filter: FilterCoefficients,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            max_roll_pitch_angle: 20.0,
            max_yaw_rate: 40.0,
            yaw_deadzone: 2.0,
            roll_pitch_deadzone: 0.2,
            min_throttle: 0.3,
            max_throttle: 0.7,
            max_balance_xy: 0.1,
            max_balance_z: 0.1,
            yaw_error_filter: FilterCoefficients::yaw_error_low_pass(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ModeConfig {
    pub throttle_engage_threshold: f32,
    pub switch_threshold: f32,
    pub zero_throttle_cycles: u32,
    pub reconnect_cycles: u32,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            throttle_engage_threshold: 0.1,
            switch_threshold: 0.25,
            zero_throttle_cycles: 10,
            reconnect_cycles: 10,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Seconds after which a channel without updates reads as lost
    pub channel_timeout: f32,
    pub stick_centre: f32,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            channel_timeout: 1.0,
            stick_centre: 0.5,
        }
    }
}

/// Per-cell voltage thresholds in volts
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BatteryConfig {
    pub cell_min: f32,
    pub cell_min_safe: f32,
    pub cell_depleted: f32,
    pub cell_low: f32,
    pub cell_max_safe: f32,
    pub cell_max: f32,
    pub hysteresis: f32,
    pub max_cells: u8,
    pub cell_count_retries: u32,
    pub measurements: u32,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            cell_min: 3.0,
            cell_min_safe: 3.2,
            cell_depleted: 3.3,
            cell_low: 3.5,
            cell_max_safe: 4.3,
            cell_max: 4.4,
            hysteresis: 0.05,
            max_cells: 5,
            cell_count_retries: 5,
            measurements: 10,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub samples: u32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self { samples: 1000 }
    }
}

/// Where settings persist and the values used when nothing was stored yet
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SettingsConfig {
    pub storage_path: String,
    pub calibration: f32,
    /// P, I, D for roll and pitch
    pub pid_xy: [f32; 3],
    /// P, I, D for yaw
    pub pid_z: [f32; 3],
    pub pid_n: f32,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            storage_path: "calmar_settings.yaml".to_string(),
            calibration: 0.0,
            pid_xy: [0.2, 0.02, 0.04],
            pid_z: [0.05, 0.0, 0.05],
            pid_n: 20.0,
        }
    }
}

/// IMU noise model, same parameters as the simulated IMU of the physics stand
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ImuConfig {
    pub accel_noise_std: f32,
    pub gyro_noise_std: f32,
    pub mag_noise_std: f32,
    pub bias_instability: f32,
    pub magnetic_field: [f32; 3],
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self {
            accel_noise_std: 0.02,
            gyro_noise_std: 0.002,
            mag_noise_std: 0.005,
            bias_instability: 0.0001,
            magnetic_field: [0.6, 0.0, -0.8],
        }
    }
}

/// Rotational dynamics of the attitude test stand
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct VehicleConfig {
    /// Diagonal of the inertia tensor in kg·m^2
    pub inertia: [f32; 3],
    pub arm_length: f32,
    /// Thrust of one motor at full duty in N
    pub max_motor_thrust: f32,
    /// Reaction torque of one motor at full duty in N·m
    pub yaw_torque_coefficient: f32,
    pub angular_damping: f32,
    pub gravity: f32,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            inertia: [0.005, 0.005, 0.009],
            arm_length: 0.1,
            max_motor_thrust: 4.0,
            yaw_torque_coefficient: 0.1,
            angular_damping: 0.002,
            gravity: 9.81,
        }
    }
}

/// Raw radio state from `time` seconds on
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RadioScriptStep {
    pub time: f32,
    /// Roll, pitch, throttle, yaw, switch, dial, each in [0, 1]
    pub channels: [f32; 6],
    pub connected: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub duration: f32,
    pub physics_frequency: f32,
    pub log_frequency: f32,
    pub seed: u64,
    pub imu: ImuConfig,
    pub vehicle: VehicleConfig,
    pub battery_voltage: f32,
    /// Volts lost per second at full throttle
    pub battery_drain: f32,
    pub radio_script: Vec<RadioScriptStep>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        let step = |time: f32, channels: [f32; 6], connected: bool| RadioScriptStep {
            time,
            channels,
            connected,
        };
        Self {
            duration: 20.0,
            physics_frequency: 1000.0,
            log_frequency: 2.0,
            seed: 42,
            imu: ImuConfig::default(),
            vehicle: VehicleConfig::default(),
            battery_voltage: 12.4,
            battery_drain: 0.01,
            radio_script: vec![
                step(0.0, [0.5, 0.5, 0.0, 0.5, 0.0, 0.5], true),
                step(2.0, [0.5, 0.5, 0.5, 0.5, 0.0, 0.5], true),
                step(5.0, [0.75, 0.5, 0.5, 0.5, 0.0, 0.5], true),
                step(8.0, [0.5, 0.5, 0.5, 0.625, 0.0, 0.5], true),
                step(11.0, [0.5, 0.5, 0.5, 0.5, 0.0, 0.5], false),
                step(13.0, [0.5, 0.5, 0.5, 0.5, 0.0, 0.5], true),
                step(17.0, [0.5, 0.5, 0.0, 0.5, 0.0, 0.5], true),
            ],
        }
    }
}

impl Config {
    /// Loads configuration from a YAML file
    /// # Arguments
    /// * `filename` - Path to the YAML file
    /// # Errors
    /// * `Io` if the file cannot be read, `Yaml` if it cannot be parsed,
    ///   `Config` if a value is unusable
    pub fn from_yaml(filename: &str) -> Result<Self, FlightError> {
        let mut contents = String::new();
        File::open(filename)?.read_to_string(&mut contents)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, FlightError> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }
    /// Rejects rates and limits the tasks cannot run with
    pub fn validate(&self) -> Result<(), FlightError> {
        let rates = [
            ("rates.estimator", self.rates.estimator),
            ("rates.flight", self.rates.flight),
            ("rates.mode", self.rates.mode),
            ("rates.radio", self.rates.radio),
            ("rates.battery", self.rates.battery),
            ("simulation.physics_frequency", self.simulation.physics_frequency),
            ("simulation.log_frequency", self.simulation.log_frequency),
        ];
        if let Some((name, _)) = rates.iter().find(|(_, rate)| !(*rate > 0.0)) {
            return Err(FlightError::Config(format!("{name} must be positive")));
        }
        if self.rates.estimator < 10.0 * self.rates.flight {
            log::warn!(
                "Estimator rate {} Hz is below ten times the flight rate {} Hz",
                self.rates.estimator,
                self.rates.flight
            );
        }
        if self.flight.min_throttle <= 0.0 || self.flight.max_throttle > 1.0 {
            return Err(FlightError::Config(
                "flight throttle band must lie within (0, 1]".to_string(),
            ));
        }
        if self.simulation.radio_script.is_empty() {
            return Err(FlightError::Config(
                "simulation.radio_script must contain at least one step".to_string(),
            ));
        }
        Ok(())
    }
}
