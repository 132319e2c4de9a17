//! TOML config file loading and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

/// Sensor names the regulator depends on. The config must define a probe
/// for each.
pub const AMBIENT_SENSOR: &str = "ambient_temp";
pub const SUPPLY_SENSOR: &str = "secondary_supply_temp";

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub sensors: SensorsConfig,
    #[serde(default)]
    pub regulation: RegulationConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub valve: ValveConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub topic_prefix: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "127.0.0.1".into(),
            port: 1883,
            client_id: "heating-hub".into(),
            topic_prefix: "heating".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

/// The Shelly relay switching the circulation pump.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub timeout_ms: u64,
    /// TCP-probe the relay before each RPC so an absent device fails in
    /// milliseconds instead of a full HTTP timeout.
    pub presence_probe: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 80,
            timeout_ms: 1500,
            presence_probe: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SensorsConfig {
    pub scan_secs: u64,
    pub probes: Vec<ProbeEntry>,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            scan_secs: 5,
            probes: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ProbeEntry {
    pub name: String,
    /// Path to the probe's w1_slave file.
    pub path: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RegulationConfig {
    pub integral_gain: f64,
    pub derivative_gain: f64,
    pub adjustment_threshold: f64,
    pub adjustment_interval_ticks: u64,
}

impl Default for RegulationConfig {
    fn default() -> Self {
        Self {
            integral_gain: 0.0,
            derivative_gain: 0.0,
            adjustment_threshold: 3.0,
            adjustment_interval_ticks: 300,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub tick_ms: u64,
    pub save_interval_secs: u64,
    pub state_path: String,
    /// Drive the valve fully closed at boot so the persisted position and
    /// the physical position agree.
    pub home_on_start: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            save_interval_secs: 600,
            state_path: "heating-state.json".into(),
            home_on_start: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ValveConfig {
    pub open_pin: u8,
    pub close_pin: u8,
    /// Many common relay boards are active-low. If yours is active-high,
    /// set false.
    pub active_low: bool,
}

impl Default for ValveConfig {
    fn default() -> Self {
        Self {
            open_pin: 17,
            close_pin: 27,
            active_low: true,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_relay(&mut errors);
        self.validate_sensors(&mut errors);
        self.validate_regulation(&mut errors);
        self.validate_control(&mut errors);
        self.validate_valve(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        if self.mqtt.broker.trim().is_empty() {
            errors.push("mqtt: broker is empty".into());
        }
        if self.mqtt.client_id.trim().is_empty() {
            errors.push("mqtt: client_id is empty".into());
        }

        let prefix = &self.mqtt.topic_prefix;
        if prefix.is_empty() {
            errors.push("mqtt: topic_prefix is empty".into());
        } else if prefix.starts_with('/') || prefix.ends_with('/') {
            errors.push(format!(
                "mqtt: topic_prefix '{prefix}' must not start or end with '/'"
            ));
        } else if prefix.contains('+') || prefix.contains('#') {
            errors.push(format!(
                "mqtt: topic_prefix '{prefix}' must not contain wildcards"
            ));
        }
    }

    fn validate_relay(&self, errors: &mut Vec<String>) {
        if self.relay.host.trim().is_empty() {
            errors.push("relay: host is empty".into());
        }
        if self.relay.timeout_ms == 0 {
            errors.push("relay: timeout_ms must be positive".into());
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        if self.sensors.scan_secs == 0 {
            errors.push("sensors: scan_secs must be positive".into());
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for (i, p) in self.sensors.probes.iter().enumerate() {
            let ctx = || {
                if p.name.is_empty() {
                    format!("sensors.probes[{i}]")
                } else {
                    format!("probe '{}'", p.name)
                }
            };

            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen.insert(&p.name) {
                errors.push(format!("{}: duplicate probe name", ctx()));
            }

            if p.path.trim().is_empty() {
                errors.push(format!("{}: path is empty", ctx()));
            }
        }

        // The regulator cannot run without these two probes.
        for required in [AMBIENT_SENSOR, SUPPLY_SENSOR] {
            if !self.sensors.probes.iter().any(|p| p.name == required) {
                errors.push(format!("sensors: no probe named '{required}' defined"));
            }
        }
    }

    fn validate_regulation(&self, errors: &mut Vec<String>) {
        let r = &self.regulation;
        if !r.integral_gain.is_finite() || r.integral_gain < 0.0 {
            errors.push(format!(
                "regulation: integral_gain must be finite and non-negative, got {}",
                r.integral_gain
            ));
        }
        if !r.derivative_gain.is_finite() || r.derivative_gain < 0.0 {
            errors.push(format!(
                "regulation: derivative_gain must be finite and non-negative, got {}",
                r.derivative_gain
            ));
        }
        if !(r.adjustment_threshold.is_finite() && r.adjustment_threshold > 0.0) {
            errors.push(format!(
                "regulation: adjustment_threshold must be positive, got {}",
                r.adjustment_threshold
            ));
        }
        if r.adjustment_interval_ticks == 0 {
            errors.push("regulation: adjustment_interval_ticks must be positive".into());
        }
    }

    fn validate_control(&self, errors: &mut Vec<String>) {
        if self.control.tick_ms == 0 {
            errors.push("control: tick_ms must be positive".into());
        }
        if self.control.save_interval_secs == 0 {
            errors.push("control: save_interval_secs must be positive".into());
        }
        if self.control.state_path.trim().is_empty() {
            errors.push("control: state_path is empty".into());
        }
    }

    fn validate_valve(&self, errors: &mut Vec<String>) {
        for (label, pin) in [
            ("open_pin", self.valve.open_pin),
            ("close_pin", self.valve.close_pin),
        ] {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "valve: {label} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            }
        }
        if self.valve.open_pin == self.valve.close_pin {
            errors.push(format!(
                "valve: open_pin and close_pin are both {}",
                self.valve.open_pin
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Helper: build a valid baseline config that passes validation ------

    fn valid_config() -> Config {
        let mut cfg = Config::default();
        cfg.sensors.probes = vec![
            ProbeEntry {
                name: AMBIENT_SENSOR.into(),
                path: "/sys/bus/w1/devices/28-0316a2d9c1ff/w1_slave".into(),
            },
            ProbeEntry {
                name: SUPPLY_SENSOR.into(),
                path: "/sys/bus/w1/devices/28-0416b1e2d4aa/w1_slave".into(),
            },
        ];
        cfg
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[mqtt]
broker = "broker.lan"
port = 1884
client_id = "substation-1"
topic_prefix = "site/sub1"

[web]
port = 9090

[relay]
host = "shelly-pump.lan"
port = 80
timeout_ms = 2000
presence_probe = false

[sensors]
scan_secs = 10
probes = [
  { name = "ambient_temp", path = "/sys/bus/w1/devices/28-aa/w1_slave" },
  { name = "secondary_supply_temp", path = "/sys/bus/w1/devices/28-bb/w1_slave" },
  { name = "secondary_return_temp", path = "/sys/bus/w1/devices/28-cc/w1_slave" },
]

[regulation]
integral_gain = 0.02
derivative_gain = 0.5
adjustment_threshold = 2.5
adjustment_interval_ticks = 120

[control]
tick_ms = 500
save_interval_secs = 300
state_path = "/var/lib/heating/state.json"
home_on_start = false

[valve]
open_pin = 23
close_pin = 24
active_low = false
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.mqtt.topic_prefix, "site/sub1");
        assert_eq!(cfg.web.port, 9090);
        assert_eq!(cfg.relay.timeout_ms, 2000);
        assert_eq!(cfg.sensors.probes.len(), 3);
        assert_eq!(cfg.regulation.adjustment_interval_ticks, 120);
        assert_eq!(cfg.control.tick_ms, 500);
        assert_eq!(cfg.valve.open_pin, 23);
        assert!(!cfg.valve.active_low);
    }

    #[test]
    fn parse_empty_config_fills_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.mqtt.broker, "127.0.0.1");
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.web.port, 8080);
        assert_eq!(cfg.control.tick_ms, 1000);
        assert_eq!(cfg.control.save_interval_secs, 600);
        assert!(cfg.control.home_on_start);
        assert_eq!(cfg.regulation.adjustment_threshold, 3.0);
        assert_eq!(cfg.regulation.adjustment_interval_ticks, 300);
        assert!(cfg.sensors.probes.is_empty());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let cfg: Config = toml::from_str("[mqtt]\nbroker = \"broker.lan\"\n").unwrap();
        assert_eq!(cfg.mqtt.broker, "broker.lan");
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.mqtt.topic_prefix, "heating");
    }

    // -- Validation: valid configs pass -----------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    // -- mqtt --------------------------------------------------------------

    #[test]
    fn empty_broker_rejected() {
        let mut cfg = valid_config();
        cfg.mqtt.broker = " ".into();
        assert_validation_err(&cfg, "broker is empty");
    }

    #[test]
    fn topic_prefix_with_slash_rejected() {
        let mut cfg = valid_config();
        cfg.mqtt.topic_prefix = "heating/".into();
        assert_validation_err(&cfg, "must not start or end with '/'");
    }

    #[test]
    fn topic_prefix_with_wildcard_rejected() {
        let mut cfg = valid_config();
        cfg.mqtt.topic_prefix = "heating/+".into();
        assert_validation_err(&cfg, "must not contain wildcards");
    }

    // -- relay --------------------------------------------------------------

    #[test]
    fn zero_relay_timeout_rejected() {
        let mut cfg = valid_config();
        cfg.relay.timeout_ms = 0;
        assert_validation_err(&cfg, "timeout_ms must be positive");
    }

    // -- sensors ------------------------------------------------------------

    #[test]
    fn missing_required_probes_rejected() {
        let mut cfg = valid_config();
        cfg.sensors.probes.clear();
        assert_validation_err(&cfg, "no probe named 'ambient_temp'");
        assert_validation_err(&cfg, "no probe named 'secondary_supply_temp'");
    }

    #[test]
    fn duplicate_probe_name_rejected() {
        let mut cfg = valid_config();
        cfg.sensors.probes.push(ProbeEntry {
            name: AMBIENT_SENSOR.into(),
            path: "/sys/bus/w1/devices/28-dd/w1_slave".into(),
        });
        assert_validation_err(&cfg, "duplicate probe name");
    }

    #[test]
    fn empty_probe_path_rejected() {
        let mut cfg = valid_config();
        cfg.sensors.probes[0].path = "".into();
        assert_validation_err(&cfg, "path is empty");
    }

    #[test]
    fn zero_scan_interval_rejected() {
        let mut cfg = valid_config();
        cfg.sensors.scan_secs = 0;
        assert_validation_err(&cfg, "scan_secs must be positive");
    }

    // -- regulation ----------------------------------------------------------

    #[test]
    fn negative_integral_gain_rejected() {
        let mut cfg = valid_config();
        cfg.regulation.integral_gain = -0.1;
        assert_validation_err(&cfg, "integral_gain");
    }

    #[test]
    fn zero_adjustment_threshold_rejected() {
        let mut cfg = valid_config();
        cfg.regulation.adjustment_threshold = 0.0;
        assert_validation_err(&cfg, "adjustment_threshold must be positive");
    }

    #[test]
    fn zero_adjustment_interval_rejected() {
        let mut cfg = valid_config();
        cfg.regulation.adjustment_interval_ticks = 0;
        assert_validation_err(&cfg, "adjustment_interval_ticks must be positive");
    }

    // -- control ------------------------------------------------------------

    #[test]
    fn zero_tick_rejected() {
        let mut cfg = valid_config();
        cfg.control.tick_ms = 0;
        assert_validation_err(&cfg, "tick_ms must be positive");
    }

    #[test]
    fn empty_state_path_rejected() {
        let mut cfg = valid_config();
        cfg.control.state_path = "  ".into();
        assert_validation_err(&cfg, "state_path is empty");
    }

    // -- valve --------------------------------------------------------------

    #[test]
    fn gpio_pin_outside_header_rejected() {
        let mut cfg = valid_config();
        cfg.valve.open_pin = 0;
        assert_validation_err(&cfg, "not a valid BCM GPIO pin");

        let mut cfg = valid_config();
        cfg.valve.close_pin = 28;
        assert_validation_err(&cfg, "not a valid BCM GPIO pin");
    }

    #[test]
    fn shared_open_and_close_pin_rejected() {
        let mut cfg = valid_config();
        cfg.valve.close_pin = cfg.valve.open_pin;
        assert_validation_err(&cfg, "open_pin and close_pin are both");
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.mqtt.broker = "".into();
        cfg.control.tick_ms = 0;
        cfg.valve.open_pin = 0;

        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("broker is empty"), "missing broker error in: {msg}");
        assert!(msg.contains("tick_ms"), "missing tick error in: {msg}");
        assert!(
            msg.contains("not a valid BCM GPIO pin"),
            "missing gpio error in: {msg}"
        );
    }
}
