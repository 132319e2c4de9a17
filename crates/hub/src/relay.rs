//! Shelly Gen2 RPC client for the circulation-pump relay.
//!
//! All timeout behaviour lives here in the transport: the HTTP client
//! carries a request timeout, and the optional presence probe does a cheap
//! TCP connect before the RPC so an absent relay fails in milliseconds
//! instead of waiting out the HTTP timeout.

use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpStream;

/// Fault taxonomy for relay round trips. Every variant is a transient I/O
/// fault from the supervisor's point of view: it degrades the pump status
/// to Unknown and is retried on a later tick.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("relay returned HTTP {0}")]
    Http(u16),
    #[error("relay not reachable on the local network")]
    NotPresent,
}

/// Decoded `Shelly.GetStatus` result for the single switch channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelayStatus {
    pub output: bool,
    pub energy_total: f64,
}

// Wire shapes for the Gen2 RPC envelope.
#[derive(Deserialize)]
struct StatusEnvelope {
    result: StatusResult,
}

#[derive(Deserialize)]
struct StatusResult {
    #[serde(rename = "switch:0")]
    switch: SwitchStatus,
}

#[derive(Deserialize)]
struct SwitchStatus {
    output: bool,
    aenergy: EnergyCounter,
}

#[derive(Deserialize)]
struct EnergyCounter {
    total: f64,
}

#[derive(Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    rpc_url: String,
    probe_addr: Option<String>,
    probe_timeout: Duration,
}

impl RelayClient {
    pub fn new(host: &str, port: u16, timeout: Duration, presence_probe: bool) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            rpc_url: format!("http://{host}:{port}/rpc"),
            probe_addr: presence_probe.then(|| format!("{host}:{port}")),
            probe_timeout: Duration::from_millis(500),
        })
    }

    /// TCP connect probe. A relay that is not associated with the local
    /// network fails here without an HTTP round trip.
    async fn probe(&self) -> Result<(), RelayError> {
        let Some(addr) = &self.probe_addr else {
            return Ok(());
        };
        match tokio::time::timeout(self.probe_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(RelayError::NotPresent),
        }
    }

    pub async fn get_status(&self) -> Result<RelayStatus, RelayError> {
        self.probe().await?;

        let body = json!({ "id": 1, "method": "Shelly.GetStatus" });
        let resp = self.http.post(&self.rpc_url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(RelayError::Http(resp.status().as_u16()));
        }
        let envelope: StatusEnvelope = resp.json().await?;
        Ok(RelayStatus {
            output: envelope.result.switch.output,
            energy_total: envelope.result.switch.aenergy.total,
        })
    }

    pub async fn set_power(&self, on: bool) -> Result<(), RelayError> {
        self.probe().await?;

        let body = json!({
            "id": 1,
            "method": "Switch.Set",
            "params": { "id": 0, "on": on }
        });
        let resp = self.http.post(&self.rpc_url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(RelayError::Http(resp.status().as_u16()));
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
