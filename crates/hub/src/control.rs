//! The 1 Hz control loop: the single owner of every actuator.
//!
//! Adapters never touch the valve or pump directly; they queue commands in
//! shared state and the loop applies them at the top of the next tick. One
//! tick runs command intake, pump supervision, valve motion, regulation,
//! persistence, state mirroring, and telemetry, then sleeps for whatever is
//! left of the period.

use std::time::{Duration, Instant};

use anyhow::Result;
use rumqttc::AsyncClient;
use tracing::{info, warn};

use crate::command::{Command, ValveMove};
use crate::config::{AMBIENT_SENSOR, SUPPLY_SENSOR};
use crate::mqtt;
use crate::pump::PumpSupervisor;
use crate::regulator::Regulator;
use crate::state::{EventKind, PumpView, RegulationView, SharedState, ValveView};
use crate::store::{Snapshot, StateStore};
use crate::valve::ValveActuator;

pub struct ControlLoop {
    shared: SharedState,
    valve: ValveActuator,
    pump: PumpSupervisor,
    regulator: Regulator,
    store: StateStore,
    mqtt: AsyncClient,
    topic_prefix: String,
    tick_period: Duration,
}

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shared: SharedState,
        valve: ValveActuator,
        pump: PumpSupervisor,
        regulator: Regulator,
        store: StateStore,
        mqtt: AsyncClient,
        topic_prefix: String,
        tick_period: Duration,
    ) -> Self {
        Self {
            shared,
            valve,
            pump,
            regulator,
            store,
            mqtt,
            topic_prefix,
            tick_period,
        }
    }

    /// Run until a restart command arrives, then shut down in order: park
    /// the valve drive and flush the persisted state.
    pub async fn run(mut self) -> Result<()> {
        info!(period_ms = self.tick_period.as_millis() as u64, "control loop running");

        loop {
            let tick_start = Instant::now();

            let shutdown = self.tick().await;
            mqtt::publish_telemetry(&self.mqtt, &self.topic_prefix, &self.shared).await;

            if shutdown {
                break;
            }

            // A tick that overran its period starts the next one immediately.
            let elapsed = tick_start.elapsed();
            if elapsed > self.tick_period {
                warn!(elapsed_ms = elapsed.as_millis() as u64, "control tick overran period");
            }
            tokio::time::sleep(self.tick_period.saturating_sub(elapsed)).await;
        }

        info!("control loop stopping");
        self.valve.park();
        self.store.save();
        Ok(())
    }

    /// One complete control tick. Returns true when shutdown was requested.
    async fn tick(&mut self) -> bool {
        let mut shutdown = false;

        let pending = self.shared.write().await.drain_commands();
        for cmd in pending {
            if self.apply_command(cmd).await {
                shutdown = true;
            }
        }

        self.pump.refresh().await;
        self.valve.refresh();

        let (ambient, secondary) = {
            let st = self.shared.read().await;
            (st.sensor(AMBIENT_SENSOR), st.sensor(SUPPLY_SENSOR))
        };
        self.regulator
            .regulate(ambient, secondary, &mut self.valve, &mut self.pump);

        self.store.update(Snapshot {
            valve_position: self.valve.position(),
            pump_state: self.pump.wanted(),
            mode: self.regulator.mode(),
            gain: self.regulator.gain(),
            offset: self.regulator.offset(),
            proportional_gain: self.regulator.proportional_gain(),
        });

        self.mirror().await;
        shutdown
    }

    /// Apply one drained command. Returns true for a restart request.
    async fn apply_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Pump(on) => {
                if on {
                    self.pump.start();
                } else {
                    self.pump.stop();
                }
                self.record(EventKind::Pump, format!("pump commanded {}", self.pump.wanted()))
                    .await;
            }
            Command::Valve(movement) => {
                match movement {
                    ValveMove::Open => self.valve.open(1),
                    ValveMove::Close => self.valve.close(1),
                }
                self.record(EventKind::Valve, format!("manual valve stroke: {movement:?}"))
                    .await;
            }
            Command::SetMode(mode) => {
                self.regulator.set_mode(mode);
                self.record(EventKind::System, format!("mode set to {mode}")).await;
            }
            Command::NudgeGain(delta) => {
                self.regulator.nudge_gain(delta);
                self.record(
                    EventKind::System,
                    format!("gain adjusted to {:.2}", self.regulator.gain()),
                )
                .await;
            }
            Command::NudgeOffset(delta) => {
                self.regulator.nudge_offset(delta);
                self.record(
                    EventKind::System,
                    format!("offset adjusted to {:.1}", self.regulator.offset()),
                )
                .await;
            }
            Command::NudgeProportionalGain(delta) => {
                self.regulator.nudge_proportional_gain(delta);
                self.record(
                    EventKind::System,
                    format!(
                        "proportional gain adjusted to {:.2}",
                        self.regulator.proportional_gain()
                    ),
                )
                .await;
            }
            Command::Restart => {
                info!("restart requested over the command channel");
                self.record(EventKind::System, "restart requested".to_string()).await;
                return true;
            }
        }
        false
    }

    /// Mirror component state into the shared aggregate for the adapters.
    async fn mirror(&self) {
        let mut st = self.shared.write().await;
        st.valve = ValveView {
            position: self.valve.position(),
            opening: self.valve.opening(),
            closing: self.valve.closing(),
            adjusting: self.valve.adjusting(),
        };
        st.pump = PumpView {
            status: self.pump.status(),
            wanted: self.pump.wanted(),
            power: self.pump.power(),
        };
        st.regulation = RegulationView {
            mode: self.regulator.mode(),
            gain: self.regulator.gain(),
            offset: self.regulator.offset(),
            proportional_gain: self.regulator.proportional_gain(),
            desired_setpoint: self.regulator.desired_setpoint(),
            regulation_output: self.regulator.regulation_output(),
        };
    }

    async fn record(&self, kind: EventKind, detail: String) {
        self.shared.write().await.record_event(kind, detail);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
