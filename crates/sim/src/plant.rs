//! Stateful thermal plant simulator for local development.
//!
//! Models the pieces the hub observes:
//! - Outdoor temperature: diurnal sine plus a mean-reverting random walk
//! - Secondary supply temperature: relaxes toward the mixing-valve outlet
//!   when the pump circulates, and decays toward room temperature when it
//!   does not
//! - Per-reading sensor noise

use std::f64::consts::PI;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Plant model
// ---------------------------------------------------------------------------

/// District-loop primary supply temperature at the heat exchanger.
const PRIMARY_SUPPLY_C: f64 = 70.0;

/// Radiator return temperature fed back into the mixing valve.
const RETURN_C: f64 = 28.0;

/// What the secondary loop cools toward with the pump stopped.
const ROOM_C: f64 = 21.0;

pub struct Plant {
    /// Mean outdoor temperature the diurnal cycle swings around.
    outdoor_mean: f64,
    outdoor_walk: f64,
    diurnal_amplitude: f64,
    /// Day length. Use 600 s for fast dev iteration, 86400 for real-time.
    diurnal_period_s: f64,
    elapsed_s: f64,
    secondary: f64,
    valve_frac: f64,
    pump_on: bool,
}

impl Plant {
    pub fn new(outdoor_mean: f64, diurnal_period_s: f64) -> Self {
        Self {
            outdoor_mean,
            outdoor_walk: 0.0,
            diurnal_amplitude: 4.0,
            diurnal_period_s,
            elapsed_s: 0.0,
            secondary: ROOM_C,
            valve_frac: 0.0,
            pump_on: false,
        }
    }

    /// Advance the plant by `dt_s` seconds.
    ///
    /// `valve_frac` is the mixing-valve opening in [0, 1]; `pump_on` is the
    /// confirmed circulation state from the fake relay.
    pub fn step(&mut self, dt_s: f64, valve_frac: f64, pump_on: bool) {
        self.elapsed_s += dt_s;

        // Mean-reverting random walk on top of the diurnal sine.
        self.outdoor_walk += gaussian(0.0, 0.05 * dt_s.sqrt()) - 0.01 * self.outdoor_walk * dt_s;

        let valve_frac = valve_frac.clamp(0.0, 1.0);
        self.valve_frac = valve_frac;
        self.pump_on = pump_on;
        if pump_on {
            // The valve mixes hot primary water with the radiator return;
            // the supply sensor relaxes toward that outlet temperature.
            let outlet = RETURN_C + valve_frac * (PRIMARY_SUPPLY_C - RETURN_C);
            self.secondary += (outlet - self.secondary) * (dt_s / 45.0);
        } else {
            // No circulation: the sensor slowly cools to room temperature.
            self.secondary += (ROOM_C - self.secondary) * (dt_s / 600.0);
        }
    }

    /// True outdoor temperature (noise-free).
    pub fn outdoor(&self) -> f64 {
        let phase = 2.0 * PI * self.elapsed_s / self.diurnal_period_s;
        self.outdoor_mean + self.diurnal_amplitude * phase.sin() + self.outdoor_walk
    }

    /// True secondary supply temperature (noise-free).
    pub fn secondary(&self) -> f64 {
        self.secondary
    }

    /// District primary supply at the heat exchanger; the network runs
    /// slightly hotter in cold weather.
    pub fn primary_supply(&self) -> f64 {
        PRIMARY_SUPPLY_C - 0.3 * self.outdoor()
    }

    /// Primary return: cooler the harder the substation draws.
    pub fn primary_return(&self) -> f64 {
        let extraction = if self.pump_on {
            5.0 + 25.0 * self.valve_frac
        } else {
            2.0
        };
        self.primary_supply() - extraction
    }

    /// Secondary return after the radiators.
    pub fn secondary_return(&self) -> f64 {
        let drop = if self.pump_on {
            1.0 + 8.0 * self.valve_frac
        } else {
            0.5
        };
        self.secondary - drop
    }

    /// Noisy sensor reading of a true value.
    pub fn measure(true_value: f64) -> f64 {
        gaussian(true_value, 0.06)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
