//! Local development harness for the heating hub.
//!
//! Runs three fakes against which a hub with mock GPIO can be pointed:
//! - an HTTP relay speaking the Shelly Gen2 RPC subset the hub uses
//! - DS18B20 probe files in w1_slave format, rewritten every tick from a
//!   thermal plant model
//! - an MQTT subscription on the hub's status topic, so the simulated
//!   plant reacts to the hub's own valve position and pump state

mod plant;
mod relay;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::{env, time::Duration};
use tokio::net::TcpListener;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use plant::Plant;
use relay::Relay;

/// Full valve travel on the hub side; status positions map onto [0, 1].
const VALVE_MAX_POSITION: f64 = 150.0;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// Render a temperature as the two-line w1_slave payload the kernel
/// produces for a DS18B20.
fn format_w1_slave(celsius: f64) -> String {
    let millidegrees = (celsius * 1000.0).round() as i64;
    format!(
        "5f 01 4b 46 7f ff 0c 10 aa : crc=aa YES\n\
         5f 01 4b 46 7f ff 0c 10 aa t={millidegrees}\n"
    )
}

/// Pull the valve opening fraction out of the hub's status document.
fn valve_fraction(status: &serde_json::Value) -> Option<f64> {
    let position = status.get("valve")?.get("position")?.as_f64()?;
    Some((position / VALVE_MAX_POSITION).clamp(0.0, 1.0))
}

async fn write_probe(dir: &Path, name: &str, celsius: f64) {
    let path = dir.join(name);
    if let Err(e) = tokio::fs::write(&path, format_w1_slave(celsius)).await {
        warn!(path = %path.display(), "probe write failed: {e}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port: u16 = env_or("MQTT_PORT", 1883);
    let topic_prefix = env::var("TOPIC_PREFIX").unwrap_or_else(|_| "heating".to_string());
    let relay_port: u16 = env_or("RELAY_PORT", 8087);
    let sensor_dir = PathBuf::from(
        env::var("SENSOR_DIR").unwrap_or_else(|_| "/tmp/heating-sim".to_string()),
    );
    let tick_ms: u64 = env_or("TICK_MS", 1000);
    let outdoor_mean: f64 = env_or("OUTDOOR_MEAN", 2.0);
    // 600 s day by default for fast iteration; 86400 for real-time.
    let diurnal_period_s: f64 = env_or("DIURNAL_PERIOD_S", 600.0);

    tokio::fs::create_dir_all(&sensor_dir).await?;

    // ── Fake relay ──────────────────────────────────────────────────
    let relay_state = Relay::shared();
    let listener = TcpListener::bind(("0.0.0.0", relay_port)).await?;
    info!("fake shelly relay on http://0.0.0.0:{relay_port}/rpc");
    let relay_router = relay::router(Arc::clone(&relay_state));
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, relay_router).await {
            error!("relay server error: {e}");
        }
    });

    // ── Hub status over MQTT (closes the loop) ──────────────────────
    let valve_frac = Arc::new(Mutex::new(0.0_f64));
    let status_topic = format!("{topic_prefix}/status");
    let mut mqttoptions = MqttOptions::new("heating-sim", broker, mqtt_port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    let frac_writer = Arc::clone(&valve_frac);
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("sim connected to mqtt");
                    if let Err(e) = client.subscribe(&status_topic, QoS::AtMostOnce).await {
                        error!("subscribe failed: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    match serde_json::from_slice::<serde_json::Value>(&p.payload) {
                        Ok(status) => {
                            if let Some(frac) = valve_fraction(&status) {
                                if let Ok(mut v) = frac_writer.lock() {
                                    *v = frac;
                                }
                            }
                        }
                        Err(e) => warn!("bad status json: {e}"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    // ── Plant loop ──────────────────────────────────────────────────
    let mut plant = Plant::new(outdoor_mean, diurnal_period_s);
    let dt_s = tick_ms as f64 / 1000.0;
    info!(dir = %sensor_dir.display(), "simulating; probe files updated every {tick_ms} ms");

    loop {
        let frac = valve_frac.lock().map(|v| *v).unwrap_or(0.0);
        let pump_on = relay::output(&relay_state);
        plant.step(dt_s, frac, pump_on);

        write_probe(&sensor_dir, "ambient_temp", Plant::measure(plant.outdoor())).await;
        write_probe(
            &sensor_dir,
            "primary_supply_temp",
            Plant::measure(plant.primary_supply()),
        )
        .await;
        write_probe(
            &sensor_dir,
            "primary_return_temp",
            Plant::measure(plant.primary_return()),
        )
        .await;
        write_probe(
            &sensor_dir,
            "secondary_supply_temp",
            Plant::measure(plant.secondary()),
        )
        .await;
        write_probe(
            &sensor_dir,
            "secondary_return_temp",
            Plant::measure(plant.secondary_return()),
        )
        .await;

        sleep(Duration::from_millis(tick_ms)).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
