//! TOML config loading and validation, plus conversion into the runtime
//! types the node is assembled from.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::calibration::TwoPoint;
use crate::clock::{SntpClient, TimeSource};
use crate::controller::{Settings, SleepMode};
use crate::display::DisplayKind;
use crate::retry::RetryPolicy;
use crate::sensors::ads1115::MAX_CHANNEL;
use crate::sensors::{Calibration, Channels, Scenario};
use crate::transport::{parse_http_url, Endpoint, TlsMode};
use crate::validate::DEFAULT_MAX_AIR_VALUE;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Value of the `plant_id` label / tag on everything this node sends.
    pub sensor_id: String,
    pub sample_interval_sec: u32,
    #[serde(default)]
    pub sleep_mode: SleepMode,
    /// Plausibility bound for temperature, humidity and dew point.
    #[serde(default = "default_max_air_value")]
    pub max_air_value: f32,
    pub sensors: SensorsConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub time: TimeConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
    #[serde(default)]
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorDriver {
    /// Simulated board (feature `sim`).
    Sim,
    /// ADS1115 + SHT20 on I2C bus 1 (feature `hw`).
    Hw,
}

#[derive(Debug, Deserialize)]
pub struct SensorsConfig {
    pub driver: SensorDriver,
    #[serde(default = "default_adc_address")]
    pub adc_address: u16,
    pub channels: ChannelsConfig,
    pub calibration: CalibrationConfig,
    /// Only used with `driver = "sim"`.
    #[serde(default)]
    pub sim_scenario: Scenario,
    #[serde(default = "default_sim_day_length")]
    pub sim_day_length_samples: u32,
    #[serde(default = "default_sensor_init_retry")]
    pub init_retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
pub struct ChannelsConfig {
    pub soil: u8,
    pub battery: u8,
    pub solar: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct CalibrationConfig {
    /// Soil probe count in open air (0 %).
    pub air_value: i64,
    /// Soil probe count submerged in water (100 %).
    pub water_value: i64,
    pub battery_min_volts: f32,
    pub battery_max_volts: f32,
    #[serde(default = "default_divider")]
    pub battery_divider: f32,
    #[serde(default = "default_divider")]
    pub solar_divider: f32,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    /// `host:port` that must accept a TCP connection for the link to count
    /// as up.
    #[serde(default = "default_probe")]
    pub probe: String,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_connect_retry")]
    pub connect_retry: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeSourceKind {
    Ntp,
    Session,
}

#[derive(Debug, Deserialize)]
pub struct TimeConfig {
    #[serde(default = "default_time_source")]
    pub source: TimeSourceKind,
    #[serde(default = "default_ntp_server")]
    pub server: String,
    #[serde(default = "default_ntp_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_time_retry")]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsKind {
    Verified,
    Pinned,
    Insecure,
}

#[derive(Debug, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_tls")]
    pub tls: TlsKind,
    /// PEM certificate trusted in `pinned` mode.
    pub ca_cert: Option<PathBuf>,
    #[serde(default = "default_transport_init_retry")]
    pub init_retry: RetryPolicy,
}

#[derive(Debug, Default, Deserialize)]
pub struct BackendsConfig {
    pub log_stream: Option<LogStreamBackend>,
    pub metrics: Option<MetricsBackend>,
}

#[derive(Debug, Deserialize)]
pub struct LogStreamBackend {
    /// Push URL; basic-auth credentials go in the userinfo part.
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct MetricsBackend {
    pub url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DisplayConfig {
    #[serde(default)]
    pub kind: DisplayKind,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_max_air_value() -> f32 {
    DEFAULT_MAX_AIR_VALUE
}

fn default_adc_address() -> u16 {
    0x48
}

fn default_sim_day_length() -> u32 {
    288
}

fn default_divider() -> f32 {
    1.0
}

fn default_sensor_init_retry() -> RetryPolicy {
    RetryPolicy::forever(1000)
}

fn default_probe() -> String {
    "1.1.1.1:443".into()
}

fn default_probe_timeout_ms() -> u64 {
    3000
}

fn default_connect_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: None,
        initial_delay_ms: 1000,
        max_delay_ms: 60_000,
        multiplier: 2.0,
    }
}

fn default_time_source() -> TimeSourceKind {
    TimeSourceKind::Ntp
}

fn default_ntp_server() -> String {
    "pool.ntp.org:123".into()
}

fn default_ntp_timeout_ms() -> u64 {
    2000
}

fn default_time_retry() -> RetryPolicy {
    RetryPolicy::backoff(5, 500, 8000)
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_tls() -> TlsKind {
    TlsKind::Verified
}

fn default_transport_init_retry() -> RetryPolicy {
    RetryPolicy::forever(1000)
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe: default_probe(),
            probe_timeout_ms: default_probe_timeout_ms(),
            connect_retry: default_connect_retry(),
        }
    }
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            source: default_time_source(),
            server: default_ntp_server(),
            timeout_ms: default_ntp_timeout_ms(),
            retry: default_time_retry(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_request_timeout_ms(),
            tls: default_tls(),
            ca_cert: None,
            init_retry: default_transport_init_retry(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate the whole file. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_node(&mut errors);
        self.validate_sensors(&mut errors);
        self.validate_network(&mut errors);
        self.validate_backends(&mut errors);

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

    fn validate_node(&self, errors: &mut Vec<String>) {
        if self.sensor_id.trim().is_empty() {
            errors.push("sensor_id is empty".into());
        }
        if self.sample_interval_sec == 0 {
            errors.push("sample_interval_sec must be positive".into());
        }
        if !(self.max_air_value.is_finite() && self.max_air_value > 0.0) {
            errors.push(format!(
                "max_air_value must be a positive number, got {}",
                self.max_air_value
            ));
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let s = &self.sensors;

        // ── Channels ────────────────────────────────────────
        let mut seen: HashSet<u8> = HashSet::new();
        let named = [
            ("soil", Some(s.channels.soil)),
            ("battery", Some(s.channels.battery)),
            ("solar", s.channels.solar),
        ];
        for (name, channel) in named {
            let Some(ch) = channel else { continue };
            if ch > MAX_CHANNEL {
                errors.push(format!(
                    "sensors.channels.{name}: channel {ch} out of range [0, {MAX_CHANNEL}]"
                ));
            } else if !seen.insert(ch) {
                errors.push(format!(
                    "sensors.channels.{name}: channel {ch} is already assigned"
                ));
            }
        }

        // ── Calibration ─────────────────────────────────────
        let c = &s.calibration;
        if c.air_value == c.water_value {
            errors.push(format!(
                "sensors.calibration: air_value and water_value are both {}: calibration range is zero",
                c.air_value
            ));
        }
        if c.battery_min_volts == c.battery_max_volts {
            errors.push(format!(
                "sensors.calibration: battery_min_volts and battery_max_volts are both {}: calibration range is zero",
                c.battery_min_volts
            ));
        } else if c.battery_min_volts > c.battery_max_volts {
            errors.push(format!(
                "sensors.calibration: battery_min_volts ({}) is above battery_max_volts ({})",
                c.battery_min_volts, c.battery_max_volts
            ));
        }
        for (name, ratio) in [
            ("battery_divider", c.battery_divider),
            ("solar_divider", c.solar_divider),
        ] {
            if !(ratio.is_finite() && ratio > 0.0) {
                errors.push(format!(
                    "sensors.calibration.{name} must be positive, got {ratio}"
                ));
            }
        }

        if s.sim_day_length_samples < 2 {
            errors.push(format!(
                "sensors.sim_day_length_samples must be at least 2, got {}",
                s.sim_day_length_samples
            ));
        }

        errors.extend(s.init_retry.problems("sensors.init_retry"));
    }

    fn validate_network(&self, errors: &mut Vec<String>) {
        if self.network.probe.trim().is_empty() {
            errors.push("network.probe is empty".into());
        }
        if self.network.probe_timeout_ms == 0 {
            errors.push("network.probe_timeout_ms must be positive".into());
        }
        errors.extend(self.network.connect_retry.problems("network.connect_retry"));

        if self.time.source == TimeSourceKind::Ntp && self.time.server.trim().is_empty() {
            errors.push("time.server is empty".into());
        }
        if self.time.timeout_ms == 0 {
            errors.push("time.timeout_ms must be positive".into());
        }
        errors.extend(self.time.retry.problems("time.retry"));

        if self.transport.timeout_ms == 0 {
            errors.push("transport.timeout_ms must be positive".into());
        }
        if self.transport.tls == TlsKind::Pinned && self.transport.ca_cert.is_none() {
            errors.push("transport.tls is \"pinned\" but transport.ca_cert is not set".into());
        }
        errors.extend(self.transport.init_retry.problems("transport.init_retry"));
    }

    fn validate_backends(&self, errors: &mut Vec<String>) {
        let b = &self.backends;
        if b.log_stream.is_none() && b.metrics.is_none() {
            errors.push("no backend configured (need backends.log_stream and/or backends.metrics)".into());
        }
        if let Some(log) = &b.log_stream {
            if let Err(e) = parse_http_url(&log.url) {
                errors.push(format!("backends.log_stream.url: {e}"));
            }
        }
        if let Some(m) = &b.metrics {
            if let Err(e) = parse_http_url(&m.url) {
                errors.push(format!("backends.metrics.url: {e}"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime views
// ---------------------------------------------------------------------------

impl Config {
    pub fn channels(&self) -> Channels {
        let c = &self.sensors.channels;
        Channels {
            soil: c.soil,
            battery: c.battery,
            solar: c.solar,
        }
    }

    pub fn calibration(&self) -> Result<Calibration> {
        let c = &self.sensors.calibration;
        Ok(Calibration {
            soil: TwoPoint::new(c.air_value as f64, c.water_value as f64)
                .context("soil calibration")?,
            battery: TwoPoint::new(c.battery_min_volts as f64, c.battery_max_volts as f64)
                .context("battery calibration")?,
            battery_divider: c.battery_divider,
            solar_divider: c.solar_divider,
        })
    }

    pub fn time_source(&self) -> TimeSource {
        match self.time.source {
            TimeSourceKind::Session => TimeSource::Session,
            TimeSourceKind::Ntp => TimeSource::Ntp(SntpClient::new(
                self.time.server.clone(),
                Duration::from_millis(self.time.timeout_ms),
                self.time.retry.clone(),
            )),
        }
    }

    pub fn tls_mode(&self) -> Result<TlsMode> {
        Ok(match self.transport.tls {
            TlsKind::Verified => TlsMode::Verified,
            TlsKind::Insecure => TlsMode::Insecure,
            TlsKind::Pinned => TlsMode::Pinned(
                self.transport
                    .ca_cert
                    .clone()
                    .context("pinned tls mode needs transport.ca_cert")?,
            ),
        })
    }

    /// Configured backends, log stream first.
    pub fn endpoints(&self) -> Result<Vec<Endpoint>> {
        let mut out = Vec::new();
        if let Some(log) = &self.backends.log_stream {
            out.push(Endpoint::log_stream(&log.url).context("backends.log_stream")?);
        }
        if let Some(m) = &self.backends.metrics {
            out.push(Endpoint::metrics(&m.url, &m.user, &m.password).context("backends.metrics")?);
        }
        Ok(out)
    }

    pub fn settings(&self) -> Settings {
        Settings {
            sensor_id: self.sensor_id.clone(),
            interval_sec: self.sample_interval_sec,
            max_air_value: self.max_air_value,
            connect_retry: self.network.connect_retry.clone(),
            sleep_mode: self.sleep_mode,
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
