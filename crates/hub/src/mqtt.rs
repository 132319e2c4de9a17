//! MQTT command intake and telemetry publishing.
//!
//! Commands arrive on `<prefix>/cmd/<target>` with the action as payload
//! and are queued for the control loop; telemetry goes out per sensor on
//! `<prefix>/<name>` plus a full status document on `<prefix>/status`.
//! All publishing is best-effort.

use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::command;
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Subscription filter matching every command topic under the prefix.
pub fn command_filter(prefix: &str) -> String {
    format!("{prefix}/cmd/+")
}

/// Extract the command target from "<prefix>/cmd/<target>".
pub fn extract_command_target<'a>(topic: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix("/cmd/")?;
    if rest.is_empty() || rest.contains('/') {
        None
    } else {
        Some(rest)
    }
}

/// Per-sensor telemetry topic: "<prefix>/<name>".
pub fn sensor_topic(prefix: &str, name: &str) -> String {
    format!("{prefix}/{name}")
}

/// Full status document topic.
pub fn status_topic(prefix: &str) -> String {
    format!("{prefix}/status")
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Drive the broker connection for the life of the process: queue inbound
/// commands, track connection state, back off and reconnect on errors.
pub async fn run_eventloop(
    client: AsyncClient,
    mut eventloop: EventLoop,
    shared: SharedState,
    topic_prefix: String,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some(target) = extract_command_target(&p.topic, &topic_prefix) else {
                    debug!(topic = %p.topic, "unhandled topic");
                    continue;
                };
                let action = String::from_utf8_lossy(&p.payload);
                match command::parse(target, &action) {
                    Ok(cmd) => {
                        info!(%target, action = %action.trim(), "mqtt command");
                        shared.write().await.push_command(cmd);
                    }
                    Err(e) => {
                        warn!(topic = %p.topic, "rejected mqtt command: {e}");
                        shared.write().await.record_error(format!("mqtt: {e}"));
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // (Re)subscribe after every connect; the session may be clean.
                if let Err(e) = client
                    .subscribe(command_filter(&topic_prefix), QoS::AtLeastOnce)
                    .await
                {
                    error!("mqtt subscribe failed: {e}");
                }
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                {
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                }
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Publish one telemetry round: every sensor reading plus the status
/// document. Called once per control tick; failures are logged and the
/// tick goes on.
pub async fn publish_telemetry(client: &AsyncClient, prefix: &str, shared: &SharedState) {
    let (sensors, status_json) = {
        let st = shared.read().await;
        let sensors: Vec<(String, Option<f64>)> = st
            .sensors
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        let status_json = serde_json::to_vec(&st.to_status());
        (sensors, status_json)
    };

    for (name, value) in sensors {
        // A dropout publishes the literal string "null" so subscribers can
        // tell "no reading" from a stale retained value.
        let payload = match value {
            Some(v) => format!("{v:.3}"),
            None => "null".to_string(),
        };
        if let Err(e) = client
            .publish(sensor_topic(prefix, &name), QoS::AtMostOnce, false, payload)
            .await
        {
            warn!(sensor = %name, "telemetry publish failed: {e}");
            return;
        }
    }

    match status_json {
        Ok(body) => {
            if let Err(e) = client
                .publish(status_topic(prefix), QoS::AtMostOnce, false, body)
                .await
            {
                warn!("status publish failed: {e}");
            }
        }
        Err(e) => error!("status serialization failed: {e}"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
