//! Circulation-pump supervision over the network relay.
//!
//! The supervisor reconciles a commanded state against the state the relay
//! reports, one best-effort round trip per tick. The round trip runs on a
//! spawned task so a stalled relay never blocks the control loop; while one
//! is in flight, `refresh` is a no-op. Every fault degrades to
//! `PumpState::Unknown` — "not confirmed running" — and nothing propagates
//! to the caller.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::relay::{RelayClient, RelayError, RelayStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpState {
    On,
    Off,
    /// Relay unreachable or not yet reconciled. Deliberately distinct from
    /// Off: downstream consumers must treat it as "not confirmed running".
    Unknown,
}

impl fmt::Display for PumpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

pub struct PumpSupervisor {
    relay: RelayClient,
    wanted: PumpState,
    status: PumpState,
    power: Option<f64>,
    inflight: Option<JoinHandle<Result<RelayStatus, RelayError>>>,
}

impl PumpSupervisor {
    /// `restored_wanted` comes from the persisted snapshot so a restart
    /// re-issues the last pump command instead of leaving the relay as-is.
    pub fn new(relay: RelayClient, restored_wanted: PumpState) -> Self {
        Self {
            relay,
            wanted: restored_wanted,
            status: PumpState::Unknown,
            power: None,
            inflight: None,
        }
    }

    pub fn start(&mut self) {
        self.wanted = PumpState::On;
    }

    pub fn stop(&mut self) {
        self.wanted = PumpState::Off;
    }

    pub fn wanted(&self) -> PumpState {
        self.wanted
    }

    pub fn status(&self) -> PumpState {
        self.status
    }

    pub fn power(&self) -> Option<f64> {
        self.power
    }

    /// One supervision step per control tick.
    ///
    /// Skips entirely while a round trip is still in flight. Otherwise the
    /// finished trip's outcome is applied, then the next trip is spawned:
    /// an optional `Switch.Set` when wanted and reported state diverge
    /// (fire-and-forget, logged on failure) followed by `Shelly.GetStatus`.
    pub async fn refresh(&mut self) {
        if let Some(handle) = &self.inflight {
            if !handle.is_finished() {
                return;
            }
        }

        if let Some(handle) = self.inflight.take() {
            match handle.await {
                Ok(outcome) => self.apply_outcome(outcome),
                Err(e) => {
                    warn!("pump: relay task failed to join: {e}");
                    self.status = PumpState::Unknown;
                    self.power = None;
                }
            }
        }

        let set = decide_set(self.wanted, self.status);
        let relay = self.relay.clone();
        self.inflight = Some(tokio::spawn(async move {
            if let Some(on) = set {
                if let Err(e) = relay.set_power(on).await {
                    warn!(on, "pump: relay set_power failed: {e}");
                }
            }
            relay.get_status().await
        }));
    }

    fn apply_outcome(&mut self, outcome: Result<RelayStatus, RelayError>) {
        match outcome {
            Ok(status) => {
                self.status = if status.output {
                    PumpState::On
                } else {
                    PumpState::Off
                };
                self.power = Some(status.energy_total);
            }
            Err(e) => {
                warn!("pump: relay status fetch failed: {e}");
                self.status = PumpState::Unknown;
                self.power = None;
            }
        }
    }
}

/// Whether a `Switch.Set` is needed before the status fetch. Only when a
/// command has been issued (`wanted` known) and the relay last reported
/// something else.
fn decide_set(wanted: PumpState, status: PumpState) -> Option<bool> {
    if wanted != PumpState::Unknown && wanted != status {
        Some(wanted == PumpState::On)
    } else {
        None
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Duration;

    /// Client pointed at a port that refuses connections.
    fn dead_relay() -> RelayClient {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        RelayClient::new("127.0.0.1", port, Duration::from_millis(300), false).unwrap()
    }

    // -- decide_set ---------------------------------------------------------

    #[test]
    fn decide_set_no_command_yet() {
        assert_eq!(decide_set(PumpState::Unknown, PumpState::Off), None);
        assert_eq!(decide_set(PumpState::Unknown, PumpState::Unknown), None);
    }

    #[test]
    fn decide_set_already_reconciled() {
        assert_eq!(decide_set(PumpState::On, PumpState::On), None);
        assert_eq!(decide_set(PumpState::Off, PumpState::Off), None);
    }

    #[test]
    fn decide_set_divergence_issues_command() {
        assert_eq!(decide_set(PumpState::On, PumpState::Off), Some(true));
        assert_eq!(decide_set(PumpState::Off, PumpState::On), Some(false));
        // Unknown reported state also triggers a set: the command was never
        // confirmed.
        assert_eq!(decide_set(PumpState::On, PumpState::Unknown), Some(true));
    }

    // -- apply_outcome ------------------------------------------------------

    #[test]
    fn apply_success_sets_status_and_power() {
        let mut pump = PumpSupervisor::new(dead_relay(), PumpState::Unknown);
        pump.apply_outcome(Ok(RelayStatus {
            output: true,
            energy_total: 987.6,
        }));
        assert_eq!(pump.status(), PumpState::On);
        assert_eq!(pump.power(), Some(987.6));

        pump.apply_outcome(Ok(RelayStatus {
            output: false,
            energy_total: 988.0,
        }));
        assert_eq!(pump.status(), PumpState::Off);
    }

    #[test]
    fn apply_failure_degrades_to_unknown_regardless_of_prior_state() {
        let mut pump = PumpSupervisor::new(dead_relay(), PumpState::On);
        pump.apply_outcome(Ok(RelayStatus {
            output: true,
            energy_total: 10.0,
        }));
        assert_eq!(pump.status(), PumpState::On);

        pump.apply_outcome(Err(RelayError::NotPresent));
        assert_eq!(pump.status(), PumpState::Unknown);
        assert_eq!(pump.power(), None);
    }

    // -- start / stop -------------------------------------------------------

    #[test]
    fn start_and_stop_only_touch_wanted_state() {
        let mut pump = PumpSupervisor::new(dead_relay(), PumpState::Unknown);
        pump.start();
        assert_eq!(pump.wanted(), PumpState::On);
        assert_eq!(pump.status(), PumpState::Unknown);
        pump.stop();
        assert_eq!(pump.wanted(), PumpState::Off);
    }

    // -- refresh ------------------------------------------------------------

    #[tokio::test]
    async fn refresh_against_dead_relay_ends_unknown() {
        let mut pump = PumpSupervisor::new(dead_relay(), PumpState::On);
        // Pretend a previous tick had confirmed the pump running.
        pump.status = PumpState::On;
        pump.power = Some(42.0);

        pump.refresh().await; // spawns the round trip
        while !pump.inflight.as_ref().unwrap().is_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pump.refresh().await; // applies the failed outcome

        assert_eq!(pump.status(), PumpState::Unknown);
        assert_eq!(pump.power(), None);
    }

    #[tokio::test]
    async fn refresh_skips_while_round_trip_in_flight() {
        // A listener that accepts but never answers keeps the trip pending.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            let _conn = listener.accept();
            std::thread::sleep(Duration::from_secs(5));
        });

        let relay = RelayClient::new("127.0.0.1", port, Duration::from_secs(4), false).unwrap();
        let mut pump = PumpSupervisor::new(relay, PumpState::On);

        pump.refresh().await;
        pump.status = PumpState::Off; // sentinel: must not be overwritten
        pump.refresh().await; // in flight: no-op
        pump.refresh().await;

        assert_eq!(pump.status(), PumpState::Off);
        assert!(!pump.inflight.as_ref().unwrap().is_finished());
    }

    // -- serde --------------------------------------------------------------

    #[test]
    fn pump_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&PumpState::On).unwrap(), "\"on\"");
        assert_eq!(
            serde_json::to_string(&PumpState::Unknown).unwrap(),
            "\"unknown\""
        );
        let back: PumpState = serde_json::from_str("\"off\"").unwrap();
        assert_eq!(back, PumpState::Off);
    }

    #[test]
    fn pump_state_display_matches_wire_form() {
        assert_eq!(PumpState::On.to_string(), "on");
        assert_eq!(PumpState::Off.to_string(), "off");
        assert_eq!(PumpState::Unknown.to_string(), "unknown");
    }
}
