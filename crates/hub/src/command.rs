//! Discrete operator commands delivered over the web UI or the MQTT
//! command topics. Parsing happens here at the boundary; malformed input is
//! rejected before it can touch core state.

use crate::regulator::{OperatingMode, GAIN_STEP, OFFSET_STEP, PROPORTIONAL_GAIN_STEP};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValveMove {
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Command the pump on or off.
    Pump(bool),
    /// Manual one-tick valve stroke.
    Valve(ValveMove),
    SetMode(OperatingMode),
    /// Signed deltas in the fixed remote-tuning increments.
    NudgeGain(f64),
    NudgeOffset(f64),
    NudgeProportionalGain(f64),
    /// Orderly shutdown; the service manager restarts the process.
    Restart,
}

/// Parse a `<target>/<action>` pair (case-insensitive, whitespace-trimmed)
/// into a command.
pub fn parse(target: &str, action: &str) -> Result<Command, String> {
    let target = target.trim().to_ascii_lowercase();
    let action = action.trim().to_ascii_lowercase();

    match target.as_str() {
        "pump" => match action.as_str() {
            "on" => Ok(Command::Pump(true)),
            "off" => Ok(Command::Pump(false)),
            _ => Err(format!("unknown pump action '{action}' (use on/off)")),
        },
        "valve" => match action.as_str() {
            "open" => Ok(Command::Valve(ValveMove::Open)),
            "close" => Ok(Command::Valve(ValveMove::Close)),
            _ => Err(format!("unknown valve action '{action}' (use open/close)")),
        },
        "mode" => action
            .parse::<OperatingMode>()
            .map(Command::SetMode)
            .map_err(|e| format!("{e} (use manual/automatic)")),
        "gain" => step(&action, GAIN_STEP).map(Command::NudgeGain),
        "offset" => step(&action, OFFSET_STEP).map(Command::NudgeOffset),
        "proportional_gain" => step(&action, PROPORTIONAL_GAIN_STEP)
            .map(Command::NudgeProportionalGain),
        "restart" => Ok(Command::Restart),
        _ => Err(format!("unknown command target '{target}'")),
    }
}

fn step(action: &str, increment: f64) -> Result<f64, String> {
    match action {
        "increase" => Ok(increment),
        "decrease" => Ok(-increment),
        _ => Err(format!(
            "unknown tuning action '{action}' (use increase/decrease)"
        )),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
