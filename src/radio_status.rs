//! Radio channel conditioning, link supervision and mode-dependent masking
use crate::config::RadioConfig;
use crate::device_manager::OperatingMode;
use crate::interfaces::{RadioChannel, RadioSource, RawRadioSource};
use crate::seqlock::SeqCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Conditioned channel values in receiver order
pub type ChannelValues = [f32; RadioChannel::COUNT];

/// Shared view of the conditioned radio, written by the radio task
pub struct RadioState {
    channels: SeqCell<ChannelValues, { RadioChannel::COUNT }>,
    connected: AtomicBool,
}

impl RadioState {
    pub fn new() -> Self {
        Self {
            channels: SeqCell::new([0.0; RadioChannel::COUNT]),
            connected: AtomicBool::new(false),
        }
    }

    pub fn publish(&self, channels: ChannelValues, connected: bool) {
        self.channels.store(&channels);
        self.connected.store(connected, Ordering::Release);
    }

    pub fn channels(&self) -> ChannelValues {
        self.channels.load()
    }
}

impl Default for RadioState {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioSource for RadioState {
    fn channel_value(&self, channel: RadioChannel) -> f32 {
        self.channels.load()[channel.index()]
    }

    fn connection_status(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// Turns raw driver channels into the values the flight core consumes
#[derive(Clone, Debug)]
pub struct RadioConditioner {
    timeout: Duration,
    stick_centre: f32,
}

impl RadioConditioner {
    pub fn new(config: &RadioConfig) -> Self {
        Self {
            timeout: Duration::from_secs_f32(config.channel_timeout.max(0.0)),
            stick_centre: config.stick_centre,
        }
    }
    /// Reads and conditions every channel
    /// # Arguments
    /// * `source` - Raw radio driver
    /// * `mode` - Current operating mode, selects which channels are masked
    /// # Returns
    /// * The conditioned channels and whether every channel is fresh
    pub fn condition(
        &self,
        source: &mut dyn RawRadioSource,
        mode: OperatingMode,
    ) -> (ChannelValues, bool) {
        let mut values = [0.0; RadioChannel::COUNT];
        let mut connected = true;
        for channel in RadioChannel::ALL {
            let raw = source.channel(channel);
            let value = if raw.age > self.timeout {
                connected = false;
                0.0
            } else if channel.is_stick() {
                (raw.value - self.stick_centre) * 2.0
            } else {
                raw.value
            };
            values[channel.index()] = if is_masked(channel, mode) { 0.0 } else { value };
        }
        (values, connected)
    }
}

/// Channels the current mode must not act on
fn is_masked(channel: RadioChannel, mode: OperatingMode) -> bool {
    use RadioChannel::*;
    match mode {
        OperatingMode::Initializing => true,
        OperatingMode::Homing => matches!(channel, Dial | Switch | Throttle),
        OperatingMode::Calibration => channel != Switch,
        OperatingMode::Settings => !matches!(channel, Switch | Dial),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::RawChannel;

    struct FixedRadio {
        values: ChannelValues,
        age: Duration,
        stale: Option<RadioChannel>,
    }

    impl RawRadioSource for FixedRadio {
        fn channel(&mut self, channel: RadioChannel) -> RawChannel {
            let age = if self.stale == Some(channel) {
                Duration::from_secs(2)
            } else {
                self.age
            };
            RawChannel {
                value: self.values[channel.index()],
                age,
            }
        }
    }

    fn radio(values: ChannelValues) -> FixedRadio {
        FixedRadio {
            values,
            age: Duration::from_millis(20),
            stale: None,
        }
    }

    const RAW: ChannelValues = [0.75, 0.25, 0.6, 0.5, 0.9, 0.3];

    #[test]
    fn sticks_are_recentred() {
        let conditioner = RadioConditioner::new(&RadioConfig::default());
        let (values, connected) = conditioner.condition(&mut radio(RAW), OperatingMode::Flight);
        assert!(connected);
        assert_eq!(values, [0.5, -0.5, 0.6, 0.0, 0.9, 0.3]);
    }

    #[test]
    fn stale_channel_reads_zero_and_drops_link() {
        let conditioner = RadioConditioner::new(&RadioConfig::default());
        let mut source = radio(RAW);
        source.stale = Some(RadioChannel::Throttle);
        let (values, connected) = conditioner.condition(&mut source, OperatingMode::Standby);
        assert!(!connected);
        assert_eq!(values[RadioChannel::Throttle.index()], 0.0);
        assert_eq!(values[RadioChannel::Roll.index()], 0.5);
    }

    #[test]
    fn modes_mask_channels() {
        let conditioner = RadioConditioner::new(&RadioConfig::default());
        let condition = |mode| conditioner.condition(&mut radio(RAW), mode).0;
        assert_eq!(condition(OperatingMode::Initializing), [0.0; 6]);
        assert_eq!(condition(OperatingMode::Homing), [0.5, -0.5, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(condition(OperatingMode::Calibration), [0.0, 0.0, 0.0, 0.0, 0.9, 0.0]);
        assert_eq!(condition(OperatingMode::Settings), [0.0, 0.0, 0.0, 0.0, 0.9, 0.3]);
        assert_eq!(condition(OperatingMode::Standby), [0.5, -0.5, 0.6, 0.0, 0.9, 0.3]);
    }

    #[test]
    fn state_publishes_snapshot() {
        let state = RadioState::new();
        assert!(!state.connection_status());
        state.publish([0.1, 0.2, 0.3, 0.4, 0.5, 0.6], true);
        assert!(state.connection_status());
        assert_eq!(state.channel_value(RadioChannel::Yaw), 0.4);
    }
}
