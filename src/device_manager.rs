//! Supervisory operating-mode state machine
//!
//! [`ModeStateMachine`] is a pure transition function over one cycle's inputs; it
//! returns the transition together with the side effects it requires.
//! [`DeviceManager`] gathers the inputs from the shared context, runs the machine and
//! carries the side effects out.
use crate::config::ModeConfig;
use crate::interfaces::{BatterySource, BatteryStatus, MotorSink, RadioChannel, RadioSource};
use crate::settings::SettingsVariable;
use crate::tasks::FlightContext;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatingMode {
    Initializing = 0,
    Standby = 1,
    Calibration = 2,
    Settings = 3,
    Flight = 4,
    Homing = 5,
    Error = 6,
}

impl OperatingMode {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => OperatingMode::Initializing,
            1 => OperatingMode::Standby,
            2 => OperatingMode::Calibration,
            3 => OperatingMode::Settings,
            4 => OperatingMode::Flight,
            5 => OperatingMode::Homing,
            _ => OperatingMode::Error,
        }
    }
    /// Modes in which the flight loop drives the motors
    pub fn is_airborne(self) -> bool {
        matches!(self, OperatingMode::Flight | OperatingMode::Homing)
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The single authoritative operating mode, written only by the device manager
#[derive(Debug)]
pub struct ModeCell(AtomicU8);

impl ModeCell {
    pub fn new(mode: OperatingMode) -> Self {
        Self(AtomicU8::new(mode as u8))
    }

    pub fn get(&self) -> OperatingMode {
        OperatingMode::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, mode: OperatingMode) {
        self.0.store(mode as u8, Ordering::Release);
    }
}

impl Default for ModeCell {
    fn default() -> Self {
        Self::new(OperatingMode::Initializing)
    }
}

/// Everything one cycle of the state machine looks at
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ModeInputs {
    pub battery: BatteryStatus,
    pub radio_connected: bool,
    /// Conditioned throttle channel, [0, 1]
    pub throttle: f32,
    /// Conditioned switch channel, [0, 1]
    pub switch: f32,
    /// Stored calibration request, meaningful outside [-1, 1]
    pub calibration_flag: f32,
    /// True when the calibration task is idle
    pub calibration_suspended: bool,
}

impl Default for ModeInputs {
    fn default() -> Self {
        Self {
            battery: BatteryStatus::Ok,
            radio_connected: true,
            throttle: 0.0,
            switch: 0.0,
            calibration_flag: 0.0,
            calibration_suspended: true,
        }
    }
}

/// Side effect required by a transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeAction {
    ResumeFlightTask,
    ResumeCalibrationTask,
    ZeroMotors,
    ClearCalibrationFlag,
    /// Fire the settings update callbacks
    CommitSettings,
    PersistSettings,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: OperatingMode,
    pub to: OperatingMode,
    /// Side effects in execution order
    pub actions: &'static [ModeAction],
}

use ModeAction::*;

/// Mode transition logic with its debounce counters
#[derive(Clone, Debug)]
pub struct ModeStateMachine {
    mode: OperatingMode,
    config: ModeConfig,
    /// Consecutive Flight cycles with throttle below the engage threshold
    zero_throttle_cycles: u32,
    /// Consecutive Homing cycles with a healthy radio link and battery
    reconnect_cycles: u32,
}

impl ModeStateMachine {
    pub fn new(config: &ModeConfig) -> Self {
        Self::starting_in(OperatingMode::Initializing, config)
    }

    pub fn starting_in(mode: OperatingMode, config: &ModeConfig) -> Self {
        Self {
            mode,
            config: config.clone(),
            zero_throttle_cycles: 0,
            reconnect_cycles: 0,
        }
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }
    /// Evaluates one cycle
    /// # Arguments
    /// * `inputs` - Snapshot of the battery, radio and calibration state
    /// # Returns
    /// * The transition taken this cycle, if any
    pub fn step(&mut self, inputs: &ModeInputs) -> Option<Transition> {
        let (to, actions) = self.evaluate(inputs)?;
        let transition = Transition {
            from: self.mode,
            to,
            actions,
        };
        self.mode = to;
        self.zero_throttle_cycles = 0;
        self.reconnect_cycles = 0;
        Some(transition)
    }

    fn evaluate(
        &mut self,
        inputs: &ModeInputs,
    ) -> Option<(OperatingMode, &'static [ModeAction])> {
        let battery_fault = inputs.battery.is_fault();
        let switch_on = inputs.switch > self.config.switch_threshold;
        match self.mode {
            OperatingMode::Initializing => {
                if battery_fault {
                    go(OperatingMode::Error, &[ZeroMotors])
                } else {
                    go(OperatingMode::Standby, &[])
                }
            }
            OperatingMode::Standby => {
                if battery_fault {
                    go(
                        OperatingMode::Error,
                        &[ZeroMotors, ClearCalibrationFlag, PersistSettings],
                    )
                } else if inputs.throttle > self.config.throttle_engage_threshold {
                    go(OperatingMode::Flight, &[ResumeFlightTask])
                } else if switch_on {
                    go(OperatingMode::Settings, &[])
                } else {
                    None
                }
            }
            OperatingMode::Settings => {
                if battery_fault {
                    go(
                        OperatingMode::Error,
                        &[ZeroMotors, ClearCalibrationFlag, PersistSettings],
                    )
                } else if switch_on {
                    None
                } else if inputs.calibration_flag.abs() > 1.0 {
                    go(OperatingMode::Calibration, &[ResumeCalibrationTask])
                } else {
                    go(OperatingMode::Standby, &[CommitSettings, PersistSettings])
                }
            }
            OperatingMode::Calibration => {
                if battery_fault {
                    go(OperatingMode::Error, &[ZeroMotors, ClearCalibrationFlag])
                } else if inputs.calibration_suspended {
                    go(OperatingMode::Standby, &[ClearCalibrationFlag, PersistSettings])
                } else if switch_on {
                    go(OperatingMode::Settings, &[ClearCalibrationFlag])
                } else {
                    None
                }
            }
            OperatingMode::Flight => {
                if battery_fault || !inputs.radio_connected {
                    return go(OperatingMode::Homing, &[]);
                }
                if inputs.throttle < self.config.throttle_engage_threshold {
                    self.zero_throttle_cycles += 1;
                } else {
                    self.zero_throttle_cycles = 0;
                }
                if self.zero_throttle_cycles >= self.config.zero_throttle_cycles {
                    go(OperatingMode::Standby, &[ZeroMotors])
                } else {
                    None
                }
            }
            OperatingMode::Homing => {
                if home_reached() {
                    return go(OperatingMode::Standby, &[ZeroMotors]);
                }
                if inputs.radio_connected && !battery_fault {
                    self.reconnect_cycles += 1;
                } else {
                    self.reconnect_cycles = 0;
                }
                if self.reconnect_cycles >= self.config.reconnect_cycles {
                    go(OperatingMode::Flight, &[])
                } else {
                    None
                }
            }
            OperatingMode::Error => None,
        }
    }
}

fn go(
    to: OperatingMode,
    actions: &'static [ModeAction],
) -> Option<(OperatingMode, &'static [ModeAction])> {
    Some((to, actions))
}

/// Homing arrival detection; no position source exists, so home is never reached
fn home_reached() -> bool {
    false
}

/// Runs the state machine against the shared context and executes its side effects
pub struct DeviceManager {
    machine: ModeStateMachine,
    context: Arc<FlightContext>,
    motors: Arc<dyn MotorSink>,
}

impl DeviceManager {
    pub fn new(config: &ModeConfig, context: Arc<FlightContext>, motors: Arc<dyn MotorSink>) -> Self {
        let machine = ModeStateMachine::starting_in(context.mode.get(), config);
        Self {
            machine,
            context,
            motors,
        }
    }

    pub fn mode(&self) -> OperatingMode {
        self.machine.mode()
    }
    /// Snapshot of this cycle's inputs from the shared context
    pub fn inputs(&self) -> ModeInputs {
        let context = &self.context;
        ModeInputs {
            battery: context.battery.status(),
            radio_connected: context.radio.connection_status(),
            throttle: context.radio.channel_value(RadioChannel::Throttle),
            switch: context.radio.channel_value(RadioChannel::Switch),
            calibration_flag: context.settings.get_variable(SettingsVariable::Calibration),
            calibration_suspended: context.calibration_gate.is_suspended(),
        }
    }
    /// Runs one cycle
    /// # Returns
    /// * The transition taken, after its side effects were executed
    pub fn poll(&mut self) -> Option<Transition> {
        let inputs = self.inputs();
        let transition = self.machine.step(&inputs)?;
        log::info!("Operating mode {} -> {}", transition.from, transition.to);
        // published first so resumed tasks observe their new mode
        self.context.mode.set(transition.to);
        for action in transition.actions {
            self.execute(*action);
        }
        Some(transition)
    }

    fn execute(&self, action: ModeAction) {
        let context = &self.context;
        log::debug!("Executing {action:?}");
        match action {
            ResumeFlightTask => context.flight_gate.resume(),
            ResumeCalibrationTask => context.calibration_gate.resume(),
            ZeroMotors => self.motors.zero_all(),
            ClearCalibrationFlag => context
                .settings
                .set_variable(SettingsVariable::Calibration, 0.0),
            CommitSettings => context.settings.notify_update(),
            PersistSettings => context.settings.save_all_registered_variables(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettingsConfig;
    use crate::interfaces::MotorPosition;
    use crate::settings::RemoteSettings;
    use std::sync::Mutex;

    fn machine_in(mode: OperatingMode) -> ModeStateMachine {
        ModeStateMachine::starting_in(mode, &ModeConfig::default())
    }

    fn idle() -> ModeInputs {
        ModeInputs::default()
    }

    #[test]
    fn initializing_moves_to_standby_on_healthy_battery() {
        let mut machine = ModeStateMachine::new(&ModeConfig::default());
        let transition = machine.step(&idle()).unwrap();
        assert_eq!(transition.to, OperatingMode::Standby);
        assert!(transition.actions.is_empty());
    }

    #[test]
    fn initializing_with_battery_fault_stops_safely() {
        let mut machine = ModeStateMachine::new(&ModeConfig::default());
        let inputs = ModeInputs {
            battery: BatteryStatus::SensorError,
            ..idle()
        };
        let transition = machine.step(&inputs).unwrap();
        assert_eq!(transition.to, OperatingMode::Error);
        assert_eq!(transition.actions, &[ZeroMotors]);
    }

    #[test]
    fn standby_holds_until_throttle_engages() {
        let mut machine = machine_in(OperatingMode::Standby);
        for _ in 0..50 {
            assert_eq!(machine.step(&idle()), None);
        }
        let inputs = ModeInputs {
            throttle: 0.2,
            ..idle()
        };
        let transition = machine.step(&inputs).unwrap();
        assert_eq!(transition.to, OperatingMode::Flight);
        assert_eq!(transition.actions, &[ResumeFlightTask]);
    }

    #[test]
    fn standby_battery_fault_goes_to_error() {
        let mut machine = machine_in(OperatingMode::Standby);
        let inputs = ModeInputs {
            battery: BatteryStatus::Low,
            throttle: 0.5,
            ..idle()
        };
        let transition = machine.step(&inputs).unwrap();
        assert_eq!(transition.to, OperatingMode::Error);
        assert!(transition.actions.contains(&PersistSettings));
        // terminal
        assert_eq!(machine.step(&idle()), None);
        assert_eq!(machine.mode(), OperatingMode::Error);
    }

    #[test]
    fn settings_battery_fault_goes_to_error() {
        let mut machine = machine_in(OperatingMode::Settings);
        let inputs = ModeInputs {
            battery: BatteryStatus::Low,
            switch: 0.9,
            ..idle()
        };
        let transition = machine.step(&inputs).unwrap();
        assert_eq!(transition.from, OperatingMode::Settings);
        assert_eq!(transition.to, OperatingMode::Error);
        assert_eq!(
            transition.actions,
            &[ZeroMotors, ClearCalibrationFlag, PersistSettings]
        );
    }

    #[test]
    fn flight_needs_ten_idle_cycles_to_land() {
        let mut machine = machine_in(OperatingMode::Flight);
        for _ in 0..9 {
            assert_eq!(machine.step(&idle()), None);
        }
        assert_eq!(machine.mode(), OperatingMode::Flight);
        let transition = machine.step(&idle()).unwrap();
        assert_eq!(transition.to, OperatingMode::Standby);
        assert_eq!(transition.actions, &[ZeroMotors]);
    }

    #[test]
    fn throttle_blip_restarts_landing_count() {
        let mut machine = machine_in(OperatingMode::Flight);
        let flying = ModeInputs {
            throttle: 0.5,
            ..idle()
        };
        for _ in 0..9 {
            assert_eq!(machine.step(&idle()), None);
        }
        assert_eq!(machine.step(&flying), None);
        for _ in 0..9 {
            assert_eq!(machine.step(&idle()), None);
        }
        assert!(machine.step(&idle()).is_some());
    }

    #[test]
    fn battery_fault_in_flight_goes_homing() {
        let mut machine = machine_in(OperatingMode::Flight);
        let inputs = ModeInputs {
            battery: BatteryStatus::Depleted,
            throttle: 0.5,
            ..idle()
        };
        let transition = machine.step(&inputs).unwrap();
        assert_eq!(transition.to, OperatingMode::Homing);
    }

    #[test]
    fn radio_loss_in_flight_goes_homing() {
        let mut machine = machine_in(OperatingMode::Flight);
        let inputs = ModeInputs {
            radio_connected: false,
            throttle: 0.5,
            ..idle()
        };
        assert_eq!(machine.step(&inputs).map(|t| t.to), Some(OperatingMode::Homing));
    }

    #[test]
    fn homing_returns_to_flight_after_stable_reconnect() {
        let mut machine = machine_in(OperatingMode::Homing);
        let lost = ModeInputs {
            radio_connected: false,
            ..idle()
        };
        for _ in 0..9 {
            assert_eq!(machine.step(&idle()), None);
        }
        // a single dropout restarts the debounce
        assert_eq!(machine.step(&lost), None);
        for _ in 0..9 {
            assert_eq!(machine.step(&idle()), None);
        }
        let transition = machine.step(&idle()).unwrap();
        assert_eq!(transition.to, OperatingMode::Flight);
        assert!(transition.actions.is_empty());
    }

    #[test]
    fn homing_stays_while_battery_is_faulty() {
        let mut machine = machine_in(OperatingMode::Homing);
        let inputs = ModeInputs {
            battery: BatteryStatus::Low,
            ..idle()
        };
        for _ in 0..100 {
            assert_eq!(machine.step(&inputs), None);
        }
    }

    #[test]
    fn settings_round_trip_commits_and_persists() {
        let mut machine = machine_in(OperatingMode::Standby);
        let switch_on = ModeInputs {
            switch: 0.5,
            ..idle()
        };
        assert_eq!(
            machine.step(&switch_on).map(|t| t.to),
            Some(OperatingMode::Settings)
        );
        assert_eq!(machine.step(&switch_on), None);
        let transition = machine.step(&idle()).unwrap();
        assert_eq!(transition.to, OperatingMode::Standby);
        assert_eq!(transition.actions, &[CommitSettings, PersistSettings]);
    }

    #[test]
    fn calibration_flag_routes_settings_to_calibration() {
        let mut machine = machine_in(OperatingMode::Settings);
        let inputs = ModeInputs {
            calibration_flag: 2.0,
            ..idle()
        };
        let transition = machine.step(&inputs).unwrap();
        assert_eq!(transition.to, OperatingMode::Calibration);
        assert_eq!(transition.actions, &[ResumeCalibrationTask]);

        let running = ModeInputs {
            calibration_flag: 2.0,
            calibration_suspended: false,
            ..idle()
        };
        assert_eq!(machine.step(&running), None);
        let transition = machine.step(&inputs).unwrap();
        assert_eq!(transition.to, OperatingMode::Standby);
        assert_eq!(transition.actions, &[ClearCalibrationFlag, PersistSettings]);
    }

    #[test]
    fn switch_aborts_calibration_back_to_settings() {
        let mut machine = machine_in(OperatingMode::Calibration);
        let inputs = ModeInputs {
            switch: 0.9,
            calibration_suspended: false,
            ..idle()
        };
        let transition = machine.step(&inputs).unwrap();
        assert_eq!(transition.to, OperatingMode::Settings);
        assert_eq!(transition.actions, &[ClearCalibrationFlag]);
    }

    #[test]
    fn calibration_battery_fault_goes_to_error() {
        let mut machine = machine_in(OperatingMode::Calibration);
        let inputs = ModeInputs {
            battery: BatteryStatus::Overvoltage,
            calibration_suspended: false,
            ..idle()
        };
        assert_eq!(machine.step(&inputs).map(|t| t.to), Some(OperatingMode::Error));
    }

    #[derive(Default)]
    struct RecordingMotors(Mutex<Vec<(MotorPosition, f32)>>);

    impl MotorSink for RecordingMotors {
        fn set_motor(&self, position: MotorPosition, duty: f32) {
            self.0.lock().unwrap().push((position, duty));
        }
    }

    fn manager() -> (DeviceManager, Arc<FlightContext>, Arc<RecordingMotors>) {
        let context = FlightContext::new(RemoteSettings::new(&SettingsConfig::default()));
        let motors = Arc::new(RecordingMotors::default());
        let manager = DeviceManager::new(&ModeConfig::default(), Arc::clone(&context), motors.clone());
        (manager, context, motors)
    }

    #[test]
    fn throttle_engage_resumes_flight_task_once() {
        let (mut manager, context, _) = manager();
        context.battery.set(BatteryStatus::Ok);
        context.radio.publish([0.0; RadioChannel::COUNT], true);
        assert_eq!(manager.poll().map(|t| t.to), Some(OperatingMode::Standby));
        for _ in 0..20 {
            assert_eq!(manager.poll(), None);
        }
        assert_eq!(context.flight_gate.resume_count(), 0);

        let mut channels = [0.0; RadioChannel::COUNT];
        channels[RadioChannel::Throttle.index()] = 0.5;
        context.radio.publish(channels, true);
        assert_eq!(manager.poll().map(|t| t.to), Some(OperatingMode::Flight));
        assert_eq!(context.mode.get(), OperatingMode::Flight);
        assert!(!context.flight_gate.is_suspended());
        for _ in 0..20 {
            assert_eq!(manager.poll(), None);
        }
        assert_eq!(context.flight_gate.resume_count(), 1);
    }

    #[test]
    fn landing_zeroes_every_motor() {
        let (mut manager, context, motors) = manager();
        context.radio.publish([0.0; RadioChannel::COUNT], true);
        manager.poll();
        let mut channels = [0.0; RadioChannel::COUNT];
        channels[RadioChannel::Throttle.index()] = 0.5;
        context.radio.publish(channels, true);
        manager.poll();
        context.radio.publish([0.0; RadioChannel::COUNT], true);
        for _ in 0..10 {
            manager.poll();
        }
        assert_eq!(manager.mode(), OperatingMode::Standby);
        let calls = motors.0.lock().unwrap();
        assert_eq!(calls.len(), 4);
        assert!(calls.iter().all(|(_, duty)| *duty == 0.0));
    }

    #[test]
    fn leaving_calibration_clears_flag() {
        let (mut manager, context, _) = manager();
        context.radio.publish([0.0; RadioChannel::COUNT], true);
        manager.poll();
        context.settings.set_variable(SettingsVariable::Calibration, 5.0);
        let mut channels = [0.0; RadioChannel::COUNT];
        channels[RadioChannel::Switch.index()] = 1.0;
        context.radio.publish(channels, true);
        assert_eq!(manager.poll().map(|t| t.to), Some(OperatingMode::Settings));
        context.radio.publish([0.0; RadioChannel::COUNT], true);
        assert_eq!(manager.poll().map(|t| t.to), Some(OperatingMode::Calibration));
        assert_eq!(context.calibration_gate.resume_count(), 1);
        // the calibration task reports completion by suspending itself
        context.calibration_gate.suspend();
        assert_eq!(manager.poll().map(|t| t.to), Some(OperatingMode::Standby));
        assert_eq!(
            context.settings.get_variable(SettingsVariable::Calibration),
            0.0
        );
    }
}
