//! Battery voltage classification with cell count detection and hysteresis
use crate::config::BatteryConfig;
use crate::interfaces::{BatterySource, BatteryStatus, VoltageSource};
use std::sync::atomic::{AtomicU8, Ordering};

/// Latest published battery status
#[derive(Debug)]
pub struct BatteryCell(AtomicU8);

impl BatteryCell {
    pub fn new(status: BatteryStatus) -> Self {
        Self(AtomicU8::new(status.ordinal()))
    }

    pub fn set(&self, status: BatteryStatus) {
        self.0.store(status.ordinal(), Ordering::Release);
    }
}

impl Default for BatteryCell {
    fn default() -> Self {
        Self::new(BatteryStatus::Ok)
    }
}

impl BatterySource for BatteryCell {
    fn status(&self) -> BatteryStatus {
        BatteryStatus::from_ordinal(self.0.load(Ordering::Acquire))
    }
}

/// Turns raw pack voltage into a debounced [`BatteryStatus`]
#[derive(Clone, Debug)]
pub struct BatteryMonitor {
    config: BatteryConfig,
    cell_count: Option<u8>,
    status: BatteryStatus,
    /// Sum of the measurements of the running window
    sum: f32,
    measurements: u32,
}

impl BatteryMonitor {
    pub fn new(config: &BatteryConfig) -> Self {
        Self {
            config: config.clone(),
            cell_count: None,
            status: BatteryStatus::Ok,
            sum: 0.0,
            measurements: 0,
        }
    }

    pub fn status(&self) -> BatteryStatus {
        self.status
    }

    pub fn cell_count(&self) -> Option<u8> {
        self.cell_count
    }
    /// Smallest cell count whose voltage window contains `voltage`
    pub fn detect_cell_count(&self, voltage: f32) -> Option<u8> {
        (1..=self.config.max_cells).find(|&cells| {
            let cells = f32::from(cells);
            voltage >= self.config.cell_min * cells && voltage <= self.config.cell_max * cells
        })
    }
    /// Detects the pack's cell count and derives the initial status
    ///
    /// After `cell_count_retries` failed readings the status is `SensorError` for good.
    /// # Arguments
    /// * `source` - ADC voltage reading
    /// # Returns
    /// * The initial status
    pub fn initialize(&mut self, source: &mut dyn VoltageSource) -> BatteryStatus {
        for _ in 0..self.config.cell_count_retries.max(1) {
            let voltage = source.battery_voltage();
            if let Some(cells) = self.detect_cell_count(voltage) {
                self.cell_count = Some(cells);
                self.status = self.momentary_status(source.battery_voltage()).0;
                log::info!("Detected {cells} cell battery, status {:?}", self.status);
                return self.status;
            }
            log::debug!("Battery voltage {voltage:.2} V matches no cell count");
        }
        log::warn!("Battery cell count detection failed");
        self.status = BatteryStatus::SensorError;
        self.status
    }
    /// Status for one voltage reading and whether it lies in a hysteresis band
    ///
    /// Without a detected cell count the reading is classified as `SensorError`.
    pub fn momentary_status(&self, voltage: f32) -> (BatteryStatus, bool) {
        let Some(cells) = self.cell_count else {
            return (BatteryStatus::SensorError, false);
        };
        let cells = f32::from(cells);
        let c = &self.config;
        let band = |low: f32, high: f32| voltage >= low * cells && voltage < high * cells;
        if voltage < c.cell_min_safe * cells {
            (BatteryStatus::Undervoltage, false)
        } else if band(c.cell_min_safe, c.cell_min_safe + c.hysteresis) {
            (BatteryStatus::Depleted, true)
        } else if voltage < c.cell_depleted * cells {
            (BatteryStatus::Depleted, false)
        } else if band(c.cell_depleted, c.cell_depleted + c.hysteresis) {
            (BatteryStatus::Low, true)
        } else if voltage < c.cell_low * cells {
            (BatteryStatus::Low, false)
        } else if band(c.cell_low, c.cell_low + c.hysteresis) {
            (BatteryStatus::Ok, true)
        } else if voltage < (c.cell_max_safe - c.hysteresis) * cells {
            (BatteryStatus::Ok, false)
        } else if voltage <= c.cell_max_safe * cells {
            (BatteryStatus::Ok, true)
        } else {
            (BatteryStatus::Overvoltage, false)
        }
    }
    /// Adds one measurement; the status is re-evaluated when a window completes
    /// # Returns
    /// * The current status
    pub fn record(&mut self, voltage: f32) -> BatteryStatus {
        if self.cell_count.is_none() {
            return self.status;
        }
        self.sum += voltage;
        self.measurements += 1;
        if self.measurements < self.config.measurements {
            return self.status;
        }
        let mean = self.sum / self.measurements as f32;
        self.sum = 0.0;
        self.measurements = 0;
        let (candidate, in_hysteresis) = self.momentary_status(mean);
        if candidate == self.status {
            return self.status;
        }
        let jump = self.status.ordinal().abs_diff(candidate.ordinal());
        if jump > 1 || !in_hysteresis {
            log::warn!(
                "Battery status {:?} -> {:?} at {mean:.2} V",
                self.status,
                candidate
            );
            self.status = candidate;
        }
        self.status
    }
}
