//! Estimator reference capture while the vehicle rests at its reference pose
use crate::device_manager::OperatingMode;
use crate::settings::SettingsVariable;
use crate::tasks::{EstimatorCommand, FlightContext};
use crate::InertialSample;
use nalgebra::Vector3;
use std::thread;
use std::time::Duration;

/// Running mean of accelerometer and magnetometer samples
#[derive(Clone, Debug)]
pub struct ReferenceAccumulator {
    accel_sum: Vector3<f32>,
    mag_sum: Vector3<f32>,
    count: u32,
    target: u32,
}

impl ReferenceAccumulator {
    pub fn new(target: u32) -> Self {
        Self {
            accel_sum: Vector3::zeros(),
            mag_sum: Vector3::zeros(),
            count: 0,
            target: target.max(1),
        }
    }
    /// Adds a sample
    /// # Returns
    /// * True once enough samples were collected
    pub fn push(&mut self, sample: &InertialSample) -> bool {
        if !self.is_complete() {
            self.accel_sum += sample.accel;
            self.mag_sum += sample.mag;
            self.count += 1;
        }
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.count >= self.target
    }
    /// Estimator command carrying the mean directions
    /// # Arguments
    /// * `include_heading` - Whether the magnetometer mean replaces the heading reference
    pub fn references(&self, include_heading: bool) -> EstimatorCommand {
        let scale = 1.0 / self.count.max(1) as f32;
        EstimatorCommand::SetReferences {
            gravity: self.accel_sum * scale,
            heading: include_heading.then(|| self.mag_sum * scale),
        }
    }
}

/// A calibration flag below -1 captures gravity only
pub fn captures_heading(calibration_flag: f32) -> bool {
    calibration_flag >= -1.0
}

/// Averages fresh samples from the shared context while the mode stays Calibration
/// # Arguments
/// * `context` - Shared flight context
/// * `samples` - Number of samples to average
/// * `period` - Polling period, normally the estimator period
/// # Returns
/// * The reference command, or None if the mode changed or shutdown was requested
pub fn capture_references(
    context: &FlightContext,
    samples: u32,
    period: Duration,
) -> Option<EstimatorCommand> {
    let mut accumulator = ReferenceAccumulator::new(samples);
    let mut seen = context.latest_sample.version();
    while !accumulator.is_complete() {
        if context.is_shutdown() || context.mode.get() != OperatingMode::Calibration {
            return None;
        }
        let version = context.latest_sample.version();
        if version != seen {
            seen = version;
            accumulator.push(&context.latest_sample.load());
        }
        thread::sleep(period);
    }
    let flag = context.settings.get_variable(SettingsVariable::Calibration);
    Some(accumulator.references(captures_heading(flag)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettingsConfig;
    use crate::settings::RemoteSettings;
    use std::sync::Arc;

    fn sample(accel: Vector3<f32>, mag: Vector3<f32>) -> InertialSample {
        InertialSample {
            accel,
            gyro: Vector3::zeros(),
            mag,
        }
    }

    #[test]
    fn accumulator_averages_to_target() {
        let mut accumulator = ReferenceAccumulator::new(2);
        assert!(!accumulator.push(&sample(Vector3::new(0.0, 0.0, -9.0), Vector3::x())));
        assert!(accumulator.push(&sample(Vector3::new(0.0, 0.0, -11.0), Vector3::y())));
        // extra samples are ignored
        assert!(accumulator.push(&sample(Vector3::new(5.0, 5.0, 5.0), Vector3::z())));
        assert_eq!(
            accumulator.references(true),
            EstimatorCommand::SetReferences {
                gravity: Vector3::new(0.0, 0.0, -10.0),
                heading: Some(Vector3::new(0.5, 0.5, 0.0)),
            }
        );
        assert!(matches!(
            accumulator.references(false),
            EstimatorCommand::SetReferences { heading: None, .. }
        ));
    }

    #[test]
    fn strongly_negative_flag_skips_heading() {
        assert!(captures_heading(2.0));
        assert!(!captures_heading(-2.0));
    }

    #[test]
    fn capture_aborts_outside_calibration() {
        let context = FlightContext::new(RemoteSettings::new(&SettingsConfig::default()));
        context.mode.set(OperatingMode::Standby);
        assert_eq!(capture_references(&context, 10, Duration::from_millis(1)), None);
    }

    #[test]
    fn capture_averages_published_samples() {
        let context = FlightContext::new(RemoteSettings::new(&SettingsConfig::default()));
        context.mode.set(OperatingMode::Calibration);
        context
            .settings
            .set_variable(SettingsVariable::Calibration, -5.0);
        let publisher = {
            let context = Arc::clone(&context);
            thread::spawn(move || {
                while context.mode.get() == OperatingMode::Calibration {
                    context
                        .latest_sample
                        .store(&sample(Vector3::new(0.0, 0.0, -9.81), Vector3::x()));
                    thread::sleep(Duration::from_micros(200));
                }
            })
        };
        let command = capture_references(&context, 20, Duration::from_micros(100));
        context.mode.set(OperatingMode::Standby);
        publisher.join().unwrap();
        match command {
            Some(EstimatorCommand::SetReferences { gravity, heading }) => {
                approx::assert_relative_eq!(gravity, Vector3::new(0.0, 0.0, -9.81), epsilon = 1e-4);
                assert_eq!(heading, None);
            }
            other => panic!("unexpected calibration result {other:?}"),
        }
    }
}
