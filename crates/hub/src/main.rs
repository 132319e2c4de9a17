mod command;
mod config;
mod control;
mod mqtt;
mod pid;
mod pump;
mod regulator;
mod relay;
mod sensors;
mod state;
mod store;
mod valve;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, MqttOptions};
use std::{env, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use control::ControlLoop;
use pid::PidController;
use pump::PumpSupervisor;
use regulator::{Regulator, RegulatorParams};
use relay::RelayClient;
use sensors::TempSensor;
use state::SystemState;
use store::StateStore;
use valve::{ValveActuator, ValveDrive};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    info!(config = %config_path, "config loaded");

    // ── Persisted state ─────────────────────────────────────────────
    let mut store = StateStore::new(
        PathBuf::from(&cfg.control.state_path),
        Duration::from_secs(cfg.control.save_interval_secs),
    );
    store.load();
    let snap = *store.snapshot();

    // ── Valve ───────────────────────────────────────────────────────
    let drive = ValveDrive::new(cfg.valve.open_pin, cfg.valve.close_pin, cfg.valve.active_low)?;
    let mut valve = ValveActuator::new(drive, snap.valve_position);
    if cfg.control.home_on_start {
        // Resynchronize the tracked position against the mechanical
        // endstop before trusting it.
        info!("homing valve against the closed endstop");
        valve.full_close();
    }

    // ── Pump relay ──────────────────────────────────────────────────
    let relay = RelayClient::new(
        &cfg.relay.host,
        cfg.relay.port,
        Duration::from_millis(cfg.relay.timeout_ms),
        cfg.relay.presence_probe,
    )?;
    let pump = PumpSupervisor::new(relay, snap.pump_state);

    // ── Regulator ───────────────────────────────────────────────────
    let tick_period = Duration::from_millis(cfg.control.tick_ms);
    let pid = PidController::new(
        tick_period.as_secs_f64(),
        cfg.regulation.integral_gain,
        cfg.regulation.derivative_gain,
    );
    let regulator = Regulator::new(
        snap.mode,
        RegulatorParams {
            gain: snap.gain,
            offset: snap.offset,
            proportional_gain: snap.proportional_gain,
            adjustment_threshold: cfg.regulation.adjustment_threshold,
            adjustment_interval_ticks: cfg.regulation.adjustment_interval_ticks as u32,
        },
        pid,
    );

    // ── Shared state ────────────────────────────────────────────────
    let probe_names: Vec<String> = cfg.sensors.probes.iter().map(|p| p.name.clone()).collect();
    let shared = Arc::new(RwLock::new(SystemState::new(&probe_names)));
    {
        let mut st = shared.write().await;
        st.record_system("hub started".to_string());
    }

    // ── Web server ──────────────────────────────────────────────────
    let web_state = Arc::clone(&shared);
    let web_port = cfg.web.port;
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("web server error: {e}");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(&cfg.mqtt.client_id, &cfg.mqtt.broker, cfg.mqtt.port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (mqtt_client, eventloop) = AsyncClient::new(mqttoptions, 20);
    tokio::spawn(mqtt::run_eventloop(
        mqtt_client.clone(),
        eventloop,
        Arc::clone(&shared),
        cfg.mqtt.topic_prefix.clone(),
    ));

    // ── Sensor scan ─────────────────────────────────────────────────
    let probes: Vec<TempSensor> = cfg
        .sensors
        .probes
        .iter()
        .map(|p| TempSensor::new(&p.name, &p.path))
        .collect();
    tokio::spawn(sensors::run_scan(
        Arc::clone(&shared),
        probes,
        Duration::from_secs(cfg.sensors.scan_secs),
    ));

    // ── Control loop ────────────────────────────────────────────────
    // Runs until a restart command; the service manager brings the
    // process back up.
    ControlLoop::new(
        shared,
        valve,
        pump,
        regulator,
        store,
        mqtt_client,
        cfg.mqtt.topic_prefix,
        tick_period,
    )
    .run()
    .await
}
