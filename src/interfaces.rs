//! Narrow contracts between the flight core and its hardware collaborators
//!
//! Drivers, the radio decoder and the ADC live outside the core; everything the
//! core consumes from them or hands back to them goes through these traits.
use crate::{FlightError, InertialSample};
use std::time::Duration;

/// Radio channels in receiver order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RadioChannel {
    Roll = 0,
    Pitch = 1,
    Throttle = 2,
    Yaw = 3,
    Switch = 4,
    Dial = 5,
}

impl RadioChannel {
    pub const COUNT: usize = 6;
    pub const ALL: [RadioChannel; Self::COUNT] = [
        RadioChannel::Roll,
        RadioChannel::Pitch,
        RadioChannel::Throttle,
        RadioChannel::Yaw,
        RadioChannel::Switch,
        RadioChannel::Dial,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
    /// Stick channels are re-centred to [-1, 1], the others stay in [0, 1]
    pub fn is_stick(self) -> bool {
        matches!(
            self,
            RadioChannel::Roll | RadioChannel::Pitch | RadioChannel::Yaw
        )
    }
}

/// Conditioned radio input as seen by the flight core
pub trait RadioSource: Send + Sync {
    fn channel_value(&self, channel: RadioChannel) -> f32;
    fn connection_status(&self) -> bool;
}

/// One decoded channel as published by the radio driver
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RawChannel {
    /// Normalized pulse width in [0, 1]
    pub value: f32,
    /// Time since the driver last updated this channel
    pub age: Duration,
}

/// Radio decoder output before conditioning
pub trait RawRadioSource: Send {
    fn channel(&mut self, channel: RadioChannel) -> RawChannel;
}

/// Battery state, declared in increasing distance from a healthy pack
/// except for `SensorError`, which is outside the voltage scale
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatteryStatus {
    Overvoltage = 0,
    Ok = 1,
    Low = 2,
    Depleted = 3,
    Undervoltage = 4,
    SensorError = 5,
}

impl BatteryStatus {
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> Self {
        match ordinal {
            0 => BatteryStatus::Overvoltage,
            1 => BatteryStatus::Ok,
            2 => BatteryStatus::Low,
            3 => BatteryStatus::Depleted,
            4 => BatteryStatus::Undervoltage,
            _ => BatteryStatus::SensorError,
        }
    }
    /// Anything but `Ok` drives the mode state machine towards a safe state
    pub fn is_fault(self) -> bool {
        self != BatteryStatus::Ok
    }
}

pub trait BatterySource: Send + Sync {
    fn status(&self) -> BatteryStatus;
}

/// Battery voltage as sampled by the ADC driver
pub trait VoltageSource: Send {
    fn battery_voltage(&mut self) -> f32;
}

/// Motor positions of the X frame
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MotorPosition {
    FrontRight,
    FrontLeft,
    BackLeft,
    BackRight,
}

impl MotorPosition {
    pub const ALL: [MotorPosition; 4] = [
        MotorPosition::FrontRight,
        MotorPosition::FrontLeft,
        MotorPosition::BackLeft,
        MotorPosition::BackRight,
    ];
}

/// Actuator driver, shared by the flight loop and the mode state machine
pub trait MotorSink: Send + Sync {
    /// Sets one motor duty
    /// # Arguments
    /// * `position` - Motor to drive
    /// * `duty` - Duty fraction in [0, 1]
    fn set_motor(&self, position: MotorPosition, duty: f32);

    fn zero_all(&self) {
        for position in MotorPosition::ALL {
            self.set_motor(position, 0.0);
        }
    }
}

/// Inertial sensor driver
pub trait InertialSource: Send {
    /// Reads one offset-corrected sample
    /// # Errors
    /// * `Sensor` if this cycle's sample is unavailable
    fn read_sample(&mut self) -> Result<InertialSample, FlightError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn battery_ordinals_round_trip() {
        for status in [
            BatteryStatus::Overvoltage,
            BatteryStatus::Ok,
            BatteryStatus::Low,
            BatteryStatus::Depleted,
            BatteryStatus::Undervoltage,
            BatteryStatus::SensorError,
        ] {
            assert_eq!(BatteryStatus::from_ordinal(status.ordinal()), status);
        }
        assert!(!BatteryStatus::Ok.is_fault());
        assert!(BatteryStatus::Low.is_fault());
    }

    #[test]
    fn zero_all_touches_every_motor() {
        struct Recorder(Mutex<Vec<(MotorPosition, f32)>>);
        impl MotorSink for Recorder {
            fn set_motor(&self, position: MotorPosition, duty: f32) {
                self.0.lock().unwrap().push((position, duty));
            }
        }
        let recorder = Recorder(Mutex::new(Vec::new()));
        recorder.zero_all();
        let calls = recorder.0.into_inner().unwrap();
        assert_eq!(calls.len(), 4);
        assert!(calls.iter().all(|(_, duty)| *duty == 0.0));
    }

    #[test]
    fn only_attitude_channels_are_sticks() {
        let sticks: Vec<_> = RadioChannel::ALL
            .iter()
            .filter(|channel| channel.is_stick())
            .collect();
        assert_eq!(
            sticks,
            [&RadioChannel::Roll, &RadioChannel::Pitch, &RadioChannel::Yaw]
        );
    }
}
