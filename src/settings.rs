//! Operator-tunable variables, their update callbacks and persistence
use crate::config::SettingsConfig;
use crate::{FlightError, PidGains};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingsVariable {
    /// Calibration request; values outside [-1, 1] start a calibration
    Calibration,
    PidXyP,
    PidXyI,
    PidXyD,
    PidZP,
    PidZI,
    PidZD,
    /// Derivative filter coefficient shared by all axes
    PidN,
}

impl SettingsVariable {
    pub const COUNT: usize = 8;
    pub const ALL: [SettingsVariable; Self::COUNT] = [
        SettingsVariable::Calibration,
        SettingsVariable::PidXyP,
        SettingsVariable::PidXyI,
        SettingsVariable::PidXyD,
        SettingsVariable::PidZP,
        SettingsVariable::PidZI,
        SettingsVariable::PidZD,
        SettingsVariable::PidN,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Persisted form of the settings
pub type StoredSettings = BTreeMap<SettingsVariable, f32>;

/// Non-volatile storage backend
pub trait SettingsStorage: Send + Sync {
    /// Stored values; variables never saved are absent
    fn load(&self) -> Result<StoredSettings, FlightError>;
    fn save(&self, values: &StoredSettings) -> Result<(), FlightError>;
}

/// Settings kept in a YAML file
pub struct YamlStorage {
    path: PathBuf,
}

impl YamlStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SettingsStorage for YamlStorage {
    fn load(&self) -> Result<StoredSettings, FlightError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(serde_yaml::from_str(&contents)?),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(StoredSettings::new()),
            Err(error) => Err(error.into()),
        }
    }

    fn save(&self, values: &StoredSettings) -> Result<(), FlightError> {
        std::fs::write(&self.path, serde_yaml::to_string(values)?)?;
        Ok(())
    }
}

type UpdateCallback = Arc<dyn Fn() + Send + Sync>;

/// Settings store shared by the flight loop, calibration and the mode state machine
pub struct RemoteSettings {
    values: Mutex<[f32; SettingsVariable::COUNT]>,
    callbacks: Mutex<Vec<UpdateCallback>>,
    storage: Option<Box<dyn SettingsStorage>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RemoteSettings {
    /// Creates an in-memory store holding the configured defaults
    pub fn new(defaults: &SettingsConfig) -> Self {
        let mut values = [0.0; SettingsVariable::COUNT];
        let [p, i, d] = defaults.pid_xy;
        let [pz, iz, dz] = defaults.pid_z;
        for (variable, value) in [
            (SettingsVariable::Calibration, defaults.calibration),
            (SettingsVariable::PidXyP, p),
            (SettingsVariable::PidXyI, i),
            (SettingsVariable::PidXyD, d),
            (SettingsVariable::PidZP, pz),
            (SettingsVariable::PidZI, iz),
            (SettingsVariable::PidZD, dz),
            (SettingsVariable::PidN, defaults.pid_n),
        ] {
            values[variable.index()] = value;
        }
        Self {
            values: Mutex::new(values),
            callbacks: Mutex::new(Vec::new()),
            storage: None,
        }
    }
    /// Creates a store backed by `storage`, stored values override the defaults
    ///
    /// A storage that cannot be read leaves the defaults in place.
    pub fn with_storage(defaults: &SettingsConfig, storage: Box<dyn SettingsStorage>) -> Self {
        let mut settings = Self::new(defaults);
        settings.storage = Some(storage);
        if let Err(error) = settings.load() {
            log::warn!("Failed to load stored settings, using defaults: {error}");
        }
        settings
    }
    /// Replaces the current values with the stored ones
    /// # Returns
    /// * The number of variables read from storage
    /// # Errors
    /// * Any error reported by the storage backend; current values stay untouched
    pub fn load(&self) -> Result<usize, FlightError> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let stored = storage.load()?;
        let mut values = lock(&self.values);
        for (variable, value) in &stored {
            values[variable.index()] = *value;
        }
        Ok(stored.len())
    }

    pub fn get_variable(&self, variable: SettingsVariable) -> f32 {
        lock(&self.values)[variable.index()]
    }

    pub fn set_variable(&self, variable: SettingsVariable, value: f32) {
        lock(&self.values)[variable.index()] = value;
    }
    /// Registers a callback fired by [`RemoteSettings::notify_update`]
    pub fn add_update_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.callbacks).push(Arc::new(callback));
    }
    /// Fires every update callback; called when the operator commits a change
    pub fn notify_update(&self) {
        // callbacks may read settings, so the list lock is released first
        let callbacks: Vec<UpdateCallback> = lock(&self.callbacks).clone();
        for callback in callbacks {
            callback();
        }
    }
    /// Persists every variable, best effort
    pub fn save_all_registered_variables(&self) {
        let Some(storage) = &self.storage else {
            log::debug!("No settings storage configured, nothing persisted");
            return;
        };
        let values = self.snapshot();
        match storage.save(&values) {
            Ok(()) => log::info!("Persisted {} settings variables", values.len()),
            Err(error) => log::warn!("Failed to persist settings: {error}"),
        }
    }

    pub fn snapshot(&self) -> StoredSettings {
        let values = *lock(&self.values);
        SettingsVariable::ALL
            .iter()
            .map(|variable| (*variable, values[variable.index()]))
            .collect()
    }
    /// Gains shared by the roll and pitch regulators
    pub fn pid_gains_xy(&self) -> PidGains {
        let values = *lock(&self.values);
        PidGains {
            p: values[SettingsVariable::PidXyP.index()],
            i: values[SettingsVariable::PidXyI.index()],
            d: values[SettingsVariable::PidXyD.index()],
            n: values[SettingsVariable::PidN.index()],
        }
    }
    /// Gains of the yaw regulator
    pub fn pid_gains_z(&self) -> PidGains {
        let values = *lock(&self.values);
        PidGains {
            p: values[SettingsVariable::PidZP.index()],
            i: values[SettingsVariable::PidZI.index()],
            d: values[SettingsVariable::PidZD.index()],
            n: values[SettingsVariable::PidN.index()],
        }
    }
}
