//! Mixing-valve actuation: timed open/close strokes with position tracking.
//! The `gpio` feature gates the real rppal drive pins; without it, a mock
//! drive logs transitions so the hub runs on a dev machine.

use anyhow::Result;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};
#[cfg(not(feature = "gpio"))]
use tracing::debug;

/// Full travel of the valve motor in ticks (one tick = one position unit).
pub const MAX_POSITION: i64 = 150;

/// Extra ticks added when a close stroke would reach the fully-closed
/// position, so the motor is driven onto the mechanical endstop despite
/// position-tracking drift.
const CLOSE_MARGIN_TICKS: i64 = 5;

// ---------------------------------------------------------------------------
// Real GPIO drive (production — requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub(crate) struct ValveDrive {
    open_pin: OutputPin,
    close_pin: OutputPin,
    active_low: bool, // drive relays idle high
}

#[cfg(feature = "gpio")]
impl ValveDrive {
    pub(crate) fn new(open_gpio: u8, close_gpio: u8, active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let open_pin = gpio.get(open_gpio)?.into_output();
        let close_pin = gpio.get(close_gpio)?.into_output();

        // Fail-safe: both outputs de-energized at startup.
        let mut drive = Self {
            open_pin,
            close_pin,
            active_low,
        };
        drive.idle();
        Ok(drive)
    }

    fn set(pin: &mut OutputPin, active_low: bool, energized: bool) {
        if energized != active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
    }

    pub(crate) fn energize_open(&mut self) {
        Self::set(&mut self.open_pin, self.active_low, true);
    }

    pub(crate) fn energize_close(&mut self) {
        Self::set(&mut self.close_pin, self.active_low, true);
    }

    pub(crate) fn idle(&mut self) {
        Self::set(&mut self.open_pin, self.active_low, false);
        Self::set(&mut self.close_pin, self.active_low, false);
    }
}

// ---------------------------------------------------------------------------
// Mock drive (development — no hardware, logs transitions)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "gpio"))]
pub(crate) struct ValveDrive {
    pub(crate) open_energized: bool,
    pub(crate) close_energized: bool,
}

#[cfg(not(feature = "gpio"))]
impl ValveDrive {
    pub(crate) fn new(open_gpio: u8, close_gpio: u8, _active_low: bool) -> Result<Self> {
        debug!(
            open_gpio,
            close_gpio, "[mock-gpio] valve drive initialised (no hardware)"
        );
        Ok(Self {
            open_energized: false,
            close_energized: false,
        })
    }

    pub(crate) fn energize_open(&mut self) {
        if !self.open_energized {
            debug!("[mock-gpio] valve drive: open energized");
        }
        self.open_energized = true;
    }

    pub(crate) fn energize_close(&mut self) {
        if !self.close_energized {
            debug!("[mock-gpio] valve drive: close energized");
        }
        self.close_energized = true;
    }

    pub(crate) fn idle(&mut self) {
        if self.open_energized || self.close_energized {
            debug!("[mock-gpio] valve drive: idle");
        }
        self.open_energized = false;
        self.close_energized = false;
    }
}

// ---------------------------------------------------------------------------
// Actuator state machine
// ---------------------------------------------------------------------------

pub struct ValveActuator {
    drive: ValveDrive,
    /// Tracked position in [0, MAX_POSITION]; 0 = fully closed.
    position: i64,
    opening: bool,
    closing: bool,
    /// Ticks remaining in the current stroke; 0 = idle.
    adjusting: i64,
}

impl ValveActuator {
    pub fn new(drive: ValveDrive, restored_position: i64) -> Self {
        Self {
            drive,
            position: restored_position.clamp(0, MAX_POSITION),
            opening: false,
            closing: false,
            adjusting: 0,
        }
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn opening(&self) -> bool {
        self.opening
    }

    pub fn closing(&self) -> bool {
        self.closing
    }

    pub fn adjusting(&self) -> i64 {
        self.adjusting
    }

    /// De-energize both drive outputs immediately. Part of the orderly
    /// shutdown path.
    pub fn park(&mut self) {
        self.drive.idle();
    }

    /// Advance the stroke by one tick and drive the physical outputs.
    /// Idle with no stroke pending is a stable no-op (outputs stay
    /// de-energized).
    pub fn refresh(&mut self) {
        if self.adjusting > 0 {
            self.adjusting -= 1;
        } else {
            // Rest state: outputs must never be left energized.
            self.drive.idle();
            self.opening = false;
            self.closing = false;
        }

        if self.closing {
            self.position = (self.position - 1).max(0);
            self.drive.energize_close();
        } else if self.opening {
            self.position = (self.position + 1).min(MAX_POSITION);
            self.drive.energize_open();
        }
    }

    /// Start an open stroke. Rejected while a stroke is in progress or at
    /// the fully-open endstop.
    pub fn open(&mut self, duration_ticks: i64) {
        if self.adjusting > 0 || self.position >= MAX_POSITION {
            return;
        }
        self.adjusting = duration_ticks;
        self.opening = true;
    }

    /// Start a close stroke. Rejected while a stroke is in progress or at
    /// the fully-closed endstop. When the remaining travel is shorter than
    /// the request, the stroke is lengthened past fully-closed so the motor
    /// reaches the mechanical endstop.
    pub fn close(&mut self, duration_ticks: i64) {
        if self.adjusting > 0 || self.position <= 0 {
            return;
        }
        let duration = if self.position <= duration_ticks {
            self.position + CLOSE_MARGIN_TICKS
        } else {
            duration_ticks
        };
        self.adjusting = duration;
        self.closing = true;
    }

    /// Force a full-travel close regardless of tracked position. Used once
    /// at startup to resynchronize against the mechanical endstop.
    pub fn full_close(&mut self) {
        self.adjusting = MAX_POSITION;
        self.closing = true;
        self.opening = false;
    }

    /// Map a signed regulation output to a stroke: positive opens, negative
    /// closes, magnitude (rounded, at least one tick) sets the duration.
    pub fn adjust(&mut self, signed_magnitude: f64) {
        let ticks = (signed_magnitude.abs().round() as i64).clamp(1, MAX_POSITION);
        if signed_magnitude > 0.0 {
            self.open(ticks);
        } else if signed_magnitude < 0.0 {
            self.close(ticks);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
