//! Runs the flight core against the attitude test stand in real time
//!
//! Usage: `calmar_fc [config/calmar.yaml]`. Log verbosity follows `RUST_LOG`.
use calmar_fc::config::Config;
use calmar_fc::interfaces::BatterySource;
use calmar_fc::settings::{RemoteSettings, YamlStorage};
use calmar_fc::sim::{ScriptedRadio, SimHandle, SimulatedBattery, SimulatedQuad};
use calmar_fc::tasks::{spawn_tasks, Collaborators, FlightContext, Ticker};
use calmar_fc::FlightError;
use nalgebra::UnitQuaternion;
use std::sync::Arc;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run() {
        log::error!("Flight core stopped: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), FlightError> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/calmar.yaml".to_string());
    let config = Config::from_yaml(&path)?;
    log::info!("Loaded configuration from {path}");

    let simulation = &config.simulation;
    let vehicle = SimHandle::new(SimulatedQuad::new(simulation)?);
    let settings = RemoteSettings::with_storage(
        &config.settings,
        Box::new(YamlStorage::new(&config.settings.storage_path)),
    );
    let context = FlightContext::new(settings);
    let collaborators = Collaborators {
        inertial: Box::new(vehicle.clone()),
        radio: Box::new(ScriptedRadio::new(
            simulation.radio_script.clone(),
            vehicle.clone(),
        )),
        voltage: Box::new(SimulatedBattery::new(
            simulation.battery_voltage,
            simulation.battery_drain,
            vehicle.clone(),
        )),
        motors: Arc::new(vehicle.clone()),
    };
    let tasks = spawn_tasks(&config, &context, collaborators)?;

    let mut physics = Ticker::new(simulation.physics_frequency);
    let dt = physics.period().as_secs_f32();
    let log_every = (simulation.physics_frequency / simulation.log_frequency).max(1.0) as u64;
    let mut step: u64 = 0;
    let result = loop {
        if vehicle.time() >= simulation.duration {
            break Ok(());
        }
        if let Err(e) = vehicle.step(dt) {
            break Err(e);
        }
        if step % log_every == 0 {
            let (roll, pitch, yaw) = vehicle.orientation().euler_angles();
            let (est_roll, est_pitch, est_yaw) =
                UnitQuaternion::from_quaternion(context.orientation.load()).euler_angles();
            log::info!(
                "t={:.2}s mode={} battery={:?} attitude=({:.3}, {:.3}, {:.3}) estimate=({:.3}, {:.3}, {:.3}) motors={:.2?}",
                vehicle.time(),
                context.mode.get(),
                context.battery.status(),
                roll,
                pitch,
                yaw,
                est_roll,
                est_pitch,
                est_yaw,
                vehicle.motors()
            );
        }
        step += 1;
        physics.wait();
    };

    context.shutdown();
    tasks.join();
    log::info!("Simulation finished after {:.2}s", vehicle.time());
    result
}
