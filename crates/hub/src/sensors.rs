//! DS18B20 temperature probes via the kernel w1 sysfs interface.
//!
//! Each probe is a file like
//! `/sys/bus/w1/devices/28-0316a2d9c1ff/w1_slave` containing two lines: a
//! raw dump with the CRC verdict and a `t=` millidegree value. Any read or
//! parse failure is a dropout (`None`), never an error that stops the scan.

use std::path::PathBuf;
use std::time::Duration;

use tokio::fs;
use tracing::{debug, warn};

use crate::state::SharedState;

/// The DS18B20 power-on reset value. Reading it back means the conversion
/// never ran, so it is a dropout, not a plausible 85 °C.
const POWER_ON_RESET_C: f64 = 85.0;

#[derive(Debug, Clone)]
pub struct TempSensor {
    pub name: String,
    pub path: PathBuf,
}

impl TempSensor {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Read and parse the probe. `None` on any failure.
    pub async fn read(&self) -> Option<f64> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => {
                let value = parse_w1_slave(&text);
                if value.is_none() {
                    warn!(sensor = %self.name, "unusable w1_slave payload");
                }
                value
            }
            Err(e) => {
                warn!(sensor = %self.name, path = %self.path.display(), "probe read failed: {e}");
                None
            }
        }
    }
}

/// Parse the two-line w1_slave payload into degrees Celsius.
///
/// Rejects CRC failures (first line not ending in `YES`), missing or
/// malformed `t=` fields, and the 85 °C power-on reset value.
pub fn parse_w1_slave(text: &str) -> Option<f64> {
    let mut lines = text.lines();
    let crc_line = lines.next()?;
    if !crc_line.trim_end().ends_with("YES") {
        return None;
    }

    let data_line = lines.next()?;
    let raw = data_line.rsplit_once("t=")?.1.trim();
    let millidegrees: i32 = raw.parse().ok()?;

    let celsius = f64::from(millidegrees) / 1000.0;
    if celsius == POWER_ON_RESET_C {
        return None;
    }
    Some(celsius)
}

/// Background scan loop: read every probe, publish readings into shared
/// state, sleep, repeat. Runs for the life of the process.
pub async fn run_scan(shared: SharedState, sensors: Vec<TempSensor>, interval: Duration) {
    loop {
        for sensor in &sensors {
            let value = sensor.read().await;
            debug!(sensor = %sensor.name, ?value, "probe scanned");
            shared.write().await.record_sensor(&sensor.name, value);
        }
        tokio::time::sleep(interval).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
