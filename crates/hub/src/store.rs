//! Durable snapshot of the regulation state with debounced writes.
//!
//! The controller ticks at 1 Hz but the SD card underneath has finite write
//! endurance, so the store keeps an in-memory copy, marks it dirty on
//! change, and writes at most once per save interval. A failed write keeps
//! the dirty flag set and retries on a later tick.

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::pump::PumpState;
use crate::regulator::OperatingMode;

/// The durable projection of the aggregate system state. Loaded once at
/// boot, compared every tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub valve_position: i64,
    pub pump_state: PumpState,
    pub mode: OperatingMode,
    pub gain: f64,
    pub offset: f64,
    pub proportional_gain: f64,
}

impl Default for Snapshot {
    /// Safe boot defaults for absent or corrupt storage: pump commanded on
    /// (heat delivery over comfort of silence), manual mode so nothing
    /// moves autonomously until an operator confirms.
    fn default() -> Self {
        Self {
            valve_position: 0,
            pump_state: PumpState::On,
            mode: OperatingMode::Manual,
            gain: 1.0,
            offset: 30.0,
            proportional_gain: 1.0,
        }
    }
}

pub struct StateStore {
    path: PathBuf,
    snapshot: Snapshot,
    dirty: bool,
    last_save: Instant,
    save_interval: Duration,
}

impl StateStore {
    pub fn new(path: PathBuf, save_interval: Duration) -> Self {
        Self {
            path,
            snapshot: Snapshot::default(),
            dirty: false,
            last_save: Instant::now(),
            save_interval,
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Read the snapshot from disk. Missing or corrupt storage keeps the
    /// defaults — boot never fails on state.
    pub fn load(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str::<Snapshot>(&text) {
                Ok(snapshot) => {
                    info!(path = %self.path.display(), "state restored");
                    self.snapshot = snapshot;
                    self.dirty = false;
                }
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        "corrupt state file, using defaults: {e}"
                    );
                }
            },
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    "no persisted state, using defaults: {e}"
                );
            }
        }
    }

    /// Compare-and-maybe-save, called once per control tick.
    pub fn update(&mut self, current: Snapshot) {
        if current != self.snapshot {
            self.snapshot = current;
            self.dirty = true;
        }

        if self.dirty && self.last_save.elapsed() > self.save_interval {
            self.save();
        }
    }

    /// Write the snapshot to disk now. Also used by the shutdown path to
    /// flush regardless of the debounce interval.
    pub fn save(&mut self) {
        match self.write_to_disk() {
            Ok(()) => {
                self.last_save = Instant::now();
                self.dirty = false;
            }
            Err(e) => {
                // Stay dirty; a later tick retries.
                error!(path = %self.path.display(), "failed to save state: {e}");
            }
        }
    }

    fn write_to_disk(&self) -> std::io::Result<()> {
        // Write-then-rename so a failed write can't truncate the only copy.
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(&self.snapshot)?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
