//! Fake Shelly Gen2 relay: a minimal `/rpc` endpoint speaking just enough
//! of the protocol for the hub's pump supervision (`Shelly.GetStatus`,
//! `Switch.Set`). Energy accumulates while the switch is on so the hub's
//! power telemetry moves.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::info;

/// Nominal draw of the simulated circulation pump.
const PUMP_POWER_W: f64 = 45.0;

pub struct Relay {
    output: bool,
    energy_wh: f64,
    last_update: Instant,
}

pub type SharedRelay = Arc<Mutex<Relay>>;

impl Relay {
    pub fn shared() -> SharedRelay {
        Arc::new(Mutex::new(Self {
            output: false,
            energy_wh: 0.0,
            last_update: Instant::now(),
        }))
    }

    /// Bring the energy counter up to date, then read the switch state.
    fn settle(&mut self) -> (bool, f64) {
        let now = Instant::now();
        if self.output {
            let hours = now.duration_since(self.last_update).as_secs_f64() / 3600.0;
            self.energy_wh += PUMP_POWER_W * hours;
        }
        self.last_update = now;
        (self.output, self.energy_wh)
    }

    fn set(&mut self, on: bool) -> bool {
        let (was_on, _) = self.settle();
        self.output = on;
        was_on
    }
}

/// Confirmed switch state, for closing the plant loop.
pub fn output(relay: &SharedRelay) -> bool {
    relay.lock().map(|r| r.output).unwrap_or(false)
}

// ---------------------------------------------------------------------------
// RPC surface
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RpcRequest {
    id: i64,
    method: String,
    #[serde(default)]
    params: Option<RpcParams>,
}

#[derive(Deserialize)]
struct RpcParams {
    #[serde(default)]
    on: Option<bool>,
}

pub fn router(relay: SharedRelay) -> Router {
    Router::new().route("/rpc", post(rpc)).with_state(relay)
}

async fn rpc(State(relay): State<SharedRelay>, Json(req): Json<RpcRequest>) -> impl IntoResponse {
    let Ok(mut relay) = relay.lock() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "id": req.id, "error": "relay state poisoned" })),
        );
    };

    match req.method.as_str() {
        "Shelly.GetStatus" => {
            let (output, energy_wh) = relay.settle();
            let body = serde_json::json!({
                "id": req.id,
                "result": {
                    "switch:0": {
                        "id": 0,
                        "output": output,
                        "apower": if output { PUMP_POWER_W } else { 0.0 },
                        "aenergy": { "total": energy_wh }
                    }
                }
            });
            (StatusCode::OK, Json(body))
        }
        "Switch.Set" => {
            let Some(on) = req.params.and_then(|p| p.on) else {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "id": req.id, "error": "Switch.Set requires params.on" })),
                );
            };
            let was_on = relay.set(on);
            info!(on, "relay switched");
            (
                StatusCode::OK,
                Json(serde_json::json!({ "id": req.id, "result": { "was_on": was_on } })),
            )
        }
        other => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "id": req.id, "error": format!("unknown method '{other}'") })),
        ),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
