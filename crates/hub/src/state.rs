//! Shared system state: the one aggregate the web UI, MQTT adapter, and
//! control loop communicate through. Adapters queue commands here and read
//! mirrored component views; the control loop drains the queue at the top
//! of every tick, so a command is visible to the very next tick.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::command::Command;
use crate::pump::PumpState;
use crate::regulator::OperatingMode;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

/// Pending-command cap; the loop drains every second, so hitting this means
/// an adapter is misbehaving.
const MAX_PENDING_COMMANDS: usize = 32;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    /// Latest temperature by sensor name; `None` is a dropout, not 0 °C.
    pub sensors: HashMap<String, Option<f64>>,
    pub valve: ValveView,
    pub pump: PumpView,
    pub regulation: RegulationView,
    pub events: VecDeque<SystemEvent>,
    commands: VecDeque<Command>,
}

#[derive(Clone, Copy, Serialize, Default)]
pub struct ValveView {
    pub position: i64,
    pub opening: bool,
    pub closing: bool,
    pub adjusting: i64,
}

#[derive(Clone, Copy, Serialize)]
pub struct PumpView {
    pub status: PumpState,
    pub wanted: PumpState,
    pub power: Option<f64>,
}

#[derive(Clone, Copy, Serialize)]
pub struct RegulationView {
    pub mode: OperatingMode,
    pub gain: f64,
    pub offset: f64,
    pub proportional_gain: f64,
    pub desired_setpoint: Option<f64>,
    pub regulation_output: Option<f64>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Command,
    Valve,
    Pump,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub regulation: RegulationView,
    pub valve: ValveView,
    pub pump: PumpView,
    pub sensors: HashMap<String, Option<f64>>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(sensor_names: &[String]) -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            sensors: sensor_names
                .iter()
                .map(|n| (n.clone(), None))
                .collect(),
            valve: ValveView::default(),
            pump: PumpView {
                status: PumpState::Unknown,
                wanted: PumpState::Unknown,
                power: None,
            },
            regulation: RegulationView {
                mode: OperatingMode::Manual,
                gain: 1.0,
                offset: 30.0,
                proportional_gain: 1.0,
                desired_setpoint: None,
                regulation_output: None,
            },
            events: VecDeque::with_capacity(MAX_EVENTS),
            commands: VecDeque::new(),
        }
    }

    /// Queue an operator command for the next control tick. A full queue
    /// drops the command and records the fault.
    pub fn push_command(&mut self, cmd: Command) {
        if self.commands.len() >= MAX_PENDING_COMMANDS {
            self.record_error(format!("command queue full, dropping {cmd:?}"));
            return;
        }
        self.commands.push_back(cmd);
        self.record_event(EventKind::Command, format!("queued {cmd:?}"));
    }

    /// Take all pending commands, oldest first. Called by the control loop
    /// at the top of every tick.
    pub fn drain_commands(&mut self) -> Vec<Command> {
        self.commands.drain(..).collect()
    }

    /// Store the latest reading for a sensor; `None` marks a dropout.
    pub fn record_sensor(&mut self, name: &str, value: Option<f64>) {
        self.sensors.insert(name.to_string(), value);
    }

    pub fn sensor(&self, name: &str) -> Option<f64> {
        self.sensors.get(name).copied().flatten()
    }

    pub fn record_error(&mut self, detail: String) {
        self.record_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.record_event(EventKind::System, detail);
    }

    pub fn record_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }

    /// Build the JSON-serialisable status snapshot, newest events first.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            regulation: self.regulation,
            valve: self.valve,
            pump: self.pump,
            sensors: self.sensors.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
