//! Shared flight context and the periodic tasks that run the flight core
use crate::battery_status::{BatteryCell, BatteryMonitor};
use crate::calibration::capture_references;
use crate::config::Config;
use crate::device_manager::{DeviceManager, ModeCell, OperatingMode};
use crate::flight_controller::{FlightController, StickInput};
use crate::interfaces::{InertialSource, MotorSink, RadioSource, RawRadioSource, VoltageSource};
use crate::radio_status::{RadioConditioner, RadioState};
use crate::seqlock::{GainsCell, QuaternionCell, SampleCell};
use crate::settings::RemoteSettings;
use crate::{FlightError, MahonyFilter, SensorPrefilter};
use nalgebra::{Quaternion, Vector3};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thread_priority::{
    RealtimeThreadSchedulePolicy, ScheduleParams, ThreadBuilder, ThreadPriority,
    ThreadSchedulePolicy,
};

/// Requests to the estimator task
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EstimatorCommand {
    /// New gravity reference and, when captured, a new heading reference
    SetReferences {
        gravity: Vector3<f32>,
        heading: Option<Vector3<f32>>,
    },
    UseMagnetometer(bool),
}

/// Per-task suspended flag, resumed by the mode state machine
#[derive(Debug)]
pub struct TaskGate {
    name: &'static str,
    suspended: Mutex<bool>,
    wake: Condvar,
    resumes: AtomicU32,
}

/// Longest a suspended task sleeps before re-checking for shutdown
const GATE_POLL: Duration = Duration::from_millis(50);

impl TaskGate {
    /// Creates a gate in the suspended state
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            suspended: Mutex::new(true),
            wake: Condvar::new(),
            resumes: AtomicU32::new(0),
        }
    }

    pub fn resume(&self) {
        let mut suspended = self.suspended.lock().unwrap_or_else(PoisonError::into_inner);
        *suspended = false;
        self.resumes.fetch_add(1, Ordering::AcqRel);
        log::debug!("Resuming {} task", self.name);
        self.wake.notify_all();
    }

    pub fn suspend(&self) {
        *self.suspended.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
    /// Suspends unless `keep_running` holds, checked under the gate lock
    ///
    /// A resume issued after `keep_running` turned true cannot be lost.
    /// # Returns
    /// * True if the gate is now suspended
    pub fn suspend_unless(&self, keep_running: impl FnOnce() -> bool) -> bool {
        let mut suspended = self.suspended.lock().unwrap_or_else(PoisonError::into_inner);
        if keep_running() {
            return false;
        }
        *suspended = true;
        true
    }

    /// Suspends unless a resume arrived after the one counted in `resumes`
    /// # Returns
    /// * True if the gate is now suspended
    pub fn suspend_unless_resumed_since(&self, resumes: u32) -> bool {
        self.suspend_unless(|| self.resume_count() != resumes)
    }

    pub fn is_suspended(&self) -> bool {
        *self.suspended.lock().unwrap_or_else(PoisonError::into_inner)
    }
    /// Blocks while suspended
    /// # Returns
    /// * False if `shutdown` was raised instead
    pub fn wait_resumed(&self, shutdown: &AtomicBool) -> bool {
        let mut suspended = self.suspended.lock().unwrap_or_else(PoisonError::into_inner);
        while *suspended && !shutdown.load(Ordering::Acquire) {
            suspended = self
                .wake
                .wait_timeout(suspended, GATE_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        !shutdown.load(Ordering::Acquire)
    }
    /// Number of resume requests so far
    pub fn resume_count(&self) -> u32 {
        self.resumes.load(Ordering::Acquire)
    }

    fn wake_all(&self) {
        let _guard = self.suspended.lock().unwrap_or_else(PoisonError::into_inner);
        self.wake.notify_all();
    }
}

/// Deadline scheduler without drift: each wake time is the previous intended one plus a period
#[derive(Debug)]
pub struct Ticker {
    period: Duration,
    next: Instant,
}

impl Ticker {
    /// # Arguments
    /// * `frequency` - Task rate in Hz, must be positive
    pub fn new(frequency: f32) -> Self {
        Self::with_period(Duration::from_secs_f32(1.0 / frequency))
    }

    pub fn with_period(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now(),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }
    /// Re-anchors the schedule to now
    pub fn reset(&mut self) {
        self.next = Instant::now();
    }
    /// Computes the next deadline after `now`
    ///
    /// Falling more than one period behind re-anchors the schedule instead of bursting.
    pub fn advance(&mut self, now: Instant) -> Instant {
        self.next += self.period;
        if now > self.next + self.period {
            self.next = now;
        }
        self.next
    }
    /// Sleeps until the next deadline
    pub fn wait(&mut self) {
        let now = Instant::now();
        let deadline = self.advance(now);
        if deadline > now {
            thread::sleep(deadline - now);
        }
    }
}

/// State shared by every task of the flight core
pub struct FlightContext {
    /// Orientation estimate, written by the estimator only
    pub orientation: QuaternionCell,
    /// Latest filtered inertial sample
    pub latest_sample: SampleCell,
    pub gains_xy: GainsCell,
    pub gains_z: GainsCell,
    pub mode: ModeCell,
    pub battery: BatteryCell,
    pub radio: RadioState,
    pub flight_gate: TaskGate,
    pub calibration_gate: TaskGate,
    pub settings: RemoteSettings,
    shutdown: AtomicBool,
}

impl FlightContext {
    /// Creates the context and subscribes the gain cells to settings commits
    pub fn new(settings: RemoteSettings) -> Arc<Self> {
        let context = Arc::new(Self {
            orientation: QuaternionCell::new(Quaternion::identity()),
            latest_sample: SampleCell::default(),
            gains_xy: GainsCell::new(settings.pid_gains_xy()),
            gains_z: GainsCell::new(settings.pid_gains_z()),
            mode: ModeCell::default(),
            battery: BatteryCell::default(),
            radio: RadioState::new(),
            flight_gate: TaskGate::new("flight"),
            calibration_gate: TaskGate::new("calibration"),
            settings,
            shutdown: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&context);
        context.settings.add_update_callback(move || {
            if let Some(context) = weak.upgrade() {
                context.reload_gains();
            }
        });
        context
    }
    /// Republishes the regulator gains from the settings store
    pub fn reload_gains(&self) {
        self.gains_xy.store(&self.settings.pid_gains_xy());
        self.gains_z.store(&self.settings.pid_gains_z());
        log::info!("Regulator gains updated");
    }
    /// Asks every task to stop and wakes the suspended ones
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.flight_gate.wake_all();
        self.calibration_gate.wake_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn shutdown_flag(&self) -> &AtomicBool {
        &self.shutdown
    }
}

/// Fuses inertial samples into the shared orientation
pub fn run_estimator(
    context: Arc<FlightContext>,
    mut source: Box<dyn InertialSource>,
    mut prefilter: SensorPrefilter,
    mut filter: MahonyFilter,
    commands: Receiver<EstimatorCommand>,
    frequency: f32,
) {
    let mut ticker = Ticker::new(frequency);
    let mut last_sample: Option<Instant> = None;
    while !context.is_shutdown() {
        for command in commands.try_iter() {
            match command {
                EstimatorCommand::SetReferences { gravity, heading } => {
                    filter.set_gravity_reference(gravity);
                    if let Some(heading) = heading {
                        filter.set_heading_reference(heading);
                    }
                    log::info!(
                        "Estimator references set, gravity {:?} heading {:?}",
                        filter.gravity_reference().as_slice(),
                        filter.heading_reference().as_slice()
                    );
                }
                EstimatorCommand::UseMagnetometer(enabled) => filter.use_magnetometer(enabled),
            }
        }
        match source.read_sample() {
            Ok(raw) => {
                let now = Instant::now();
                let ts = last_sample
                    .map(|last| now.saturating_duration_since(last).as_secs_f32())
                    .unwrap_or(0.0);
                last_sample = Some(now);
                let sample = prefilter.process(&raw);
                context.latest_sample.store(&sample);
                context.orientation.store(&filter.update(&sample, ts));
            }
            Err(error) => log::debug!("Skipping estimator cycle: {error}"),
        }
        ticker.wait();
    }
}

/// Runs the attitude loop while the mode is Flight or Homing
pub fn run_flight_control(
    context: Arc<FlightContext>,
    mut controller: FlightController,
    motors: Arc<dyn MotorSink>,
    frequency: f32,
) {
    let mut ticker = Ticker::new(frequency);
    let mut gains_version = None;
    while !context.is_shutdown() {
        if !context.mode.get().is_airborne() {
            motors.zero_all();
            if context
                .flight_gate
                .suspend_unless(|| context.mode.get().is_airborne())
            {
                log::debug!("Flight task suspended");
                if !context.flight_gate.wait_resumed(context.shutdown_flag()) {
                    break;
                }
            }
            controller.resume(&context.orientation.load(), Instant::now());
            ticker.reset();
        }
        let version = (context.gains_xy.version(), context.gains_z.version());
        if gains_version != Some(version) {
            controller.set_gains(context.gains_xy.load(), context.gains_z.load());
            gains_version = Some(version);
        }
        let command = controller.update(
            &context.orientation.load(),
            &StickInput::from_radio(&context.radio),
            context.mode.get(),
            Instant::now(),
        );
        command.apply(motors.as_ref());
        ticker.wait();
    }
    motors.zero_all();
}

pub fn run_device_manager(context: Arc<FlightContext>, mut manager: DeviceManager, frequency: f32) {
    let mut ticker = Ticker::new(frequency);
    while !context.is_shutdown() {
        manager.poll();
        ticker.wait();
    }
}

pub fn run_radio_status(
    context: Arc<FlightContext>,
    conditioner: RadioConditioner,
    mut source: Box<dyn RawRadioSource>,
    frequency: f32,
) {
    let mut ticker = Ticker::new(frequency);
    while !context.is_shutdown() {
        let (channels, connected) = conditioner.condition(source.as_mut(), context.mode.get());
        if connected != context.radio.connection_status() {
            if connected {
                log::info!("Radio link established");
            } else {
                log::warn!("Radio link lost");
            }
        }
        context.radio.publish(channels, connected);
        ticker.wait();
    }
}

pub fn run_battery_status(
    context: Arc<FlightContext>,
    mut monitor: BatteryMonitor,
    mut source: Box<dyn VoltageSource>,
    frequency: f32,
) {
    let mut ticker = Ticker::new(frequency);
    while !context.is_shutdown() {
        context.battery.set(monitor.record(source.battery_voltage()));
        ticker.wait();
    }
}

/// Captures new estimator references each time the state machine resumes it
pub fn run_calibration(
    context: Arc<FlightContext>,
    samples: u32,
    period: Duration,
    commands: Sender<EstimatorCommand>,
) {
    while context.calibration_gate.wait_resumed(context.shutdown_flag()) {
        let round = context.calibration_gate.resume_count();
        if context.mode.get() == OperatingMode::Calibration {
            log::info!("Calibration started, averaging {samples} samples");
            match capture_references(&context, samples, period) {
                Some(command) => {
                    if commands.send(command).is_err() {
                        log::warn!("Estimator is gone, calibration result dropped");
                    } else {
                        log::info!("Calibration finished");
                    }
                }
                None => log::info!("Calibration aborted"),
            }
        }
        if !context.calibration_gate.suspend_unless_resumed_since(round) {
            log::debug!("Calibration resumed again during the last round");
        }
    }
}

/// Hardware the tasks drive
pub struct Collaborators {
    pub inertial: Box<dyn InertialSource>,
    pub radio: Box<dyn RawRadioSource>,
    pub voltage: Box<dyn VoltageSource>,
    pub motors: Arc<dyn MotorSink>,
}

/// Running tasks
pub struct TaskHandles {
    handles: Vec<JoinHandle<()>>,
    commands: Sender<EstimatorCommand>,
}

impl TaskHandles {
    /// Channel to the estimator task
    pub fn estimator_commands(&self) -> Sender<EstimatorCommand> {
        self.commands.clone()
    }
    /// Waits for every task; call after [`FlightContext::shutdown`]
    pub fn join(self) {
        for handle in self.handles {
            let name = handle.thread().name().unwrap_or("task").to_string();
            if handle.join().is_err() {
                log::warn!("Task {name} panicked");
            }
        }
    }
}

/// FIFO priorities, fastest task highest
const ESTIMATOR_PRIORITY: u8 = 50;
const FLIGHT_PRIORITY: u8 = 45;
const SUPERVISOR_PRIORITY: u8 = 40;
const CALIBRATION_PRIORITY: u8 = 35;

fn spawn<F>(name: &str, priority: u8, task: F) -> Result<JoinHandle<()>, FlightError>
where
    F: FnOnce() + Send + 'static,
{
    let handle = ThreadBuilder::default()
        .name(name)
        .policy(ThreadSchedulePolicy::Realtime(
            RealtimeThreadSchedulePolicy::Fifo,
        ))
        .priority(ThreadPriority::from_posix(ScheduleParams {
            sched_priority: priority.into(),
        }))
        .spawn_careless(task)?;
    Ok(handle)
}

/// Starts every task of the flight core
///
/// The battery cell count is detected before any task runs so the mode state machine
/// never sees an unassessed battery.
/// # Arguments
/// * `config` - Validated configuration
/// * `context` - Shared flight context
/// * `collaborators` - Hardware drivers
/// # Errors
/// * Filter configuration errors, or `Io` if a thread cannot be spawned
pub fn spawn_tasks(
    config: &Config,
    context: &Arc<FlightContext>,
    collaborators: Collaborators,
) -> Result<TaskHandles, FlightError> {
    let Collaborators {
        inertial,
        radio,
        mut voltage,
        motors,
    } = collaborators;
    let prefilter = SensorPrefilter::from_config(&config.estimator)?;
    let filter = MahonyFilter::from_config(&config.estimator);
    let controller = FlightController::new(
        &config.flight,
        context.settings.pid_gains_xy(),
        context.settings.pid_gains_z(),
    )?;
    let mut monitor = BatteryMonitor::new(&config.battery);
    context.battery.set(monitor.initialize(voltage.as_mut()));
    let (commands, receiver) = mpsc::channel();
    let rates = config.rates.clone();

    let mut handles = Vec::new();
    handles.push(spawn("estimator", ESTIMATOR_PRIORITY, {
        let context = Arc::clone(context);
        move || run_estimator(context, inertial, prefilter, filter, receiver, rates.estimator)
    })?);
    handles.push(spawn("flight", FLIGHT_PRIORITY, {
        let context = Arc::clone(context);
        let motors = Arc::clone(&motors);
        move || run_flight_control(context, controller, motors, rates.flight)
    })?);
    handles.push(spawn("radio", SUPERVISOR_PRIORITY, {
        let context = Arc::clone(context);
        let conditioner = RadioConditioner::new(&config.radio);
        move || run_radio_status(context, conditioner, radio, rates.radio)
    })?);
    handles.push(spawn("battery", SUPERVISOR_PRIORITY, {
        let context = Arc::clone(context);
        move || run_battery_status(context, monitor, voltage, rates.battery)
    })?);
    handles.push(spawn("device-manager", SUPERVISOR_PRIORITY, {
        let manager = DeviceManager::new(&config.mode, Arc::clone(context), motors);
        let context = Arc::clone(context);
        move || run_device_manager(context, manager, rates.mode)
    })?);
    handles.push(spawn("calibration", CALIBRATION_PRIORITY, {
        let context = Arc::clone(context);
        let commands = commands.clone();
        let samples = config.calibration.samples;
        let period = Duration::from_secs_f32(1.0 / rates.estimator);
        move || run_calibration(context, samples, period, commands)
    })?);
    log::info!("Started {} flight core tasks", handles.len());
    Ok(TaskHandles { handles, commands })
}
