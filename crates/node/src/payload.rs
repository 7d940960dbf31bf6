//! Wire documents for the two ingestion backends.
//!
//! Both are built as typed serde trees and only turned into bytes at send
//! time, so label values (the sensor id in particular) are always escaped
//! correctly.
//!
//! Log stream (Loki push API):
//!
//! ```json
//! {"streams":[{"stream":{"plant_id":"<id>","monitoring_type":"plant"},
//!              "values":[["<ts_ns>","temperature=22.5 humidity=55 ..."]]}]}
//! ```
//!
//! Metrics batch (Graphite JSON ingest): one gauge object per field, all
//! sharing the cycle timestamp.

use std::fmt::Write as _;

use serde::Serialize;

use crate::reading::{CycleReading, Destination};

/// Fixed value of the `monitoring_type` stream label.
pub const MONITORING_TYPE: &str = "plant";

const NANOS_PER_SEC: i128 = 1_000_000_000;

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LokiPush {
    streams: Vec<LokiStream>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct LokiStream {
    stream: StreamLabels,
    /// `[timestamp_ns, line]` pairs, both as strings.
    values: Vec<[String; 2]>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct StreamLabels {
    plant_id: String,
    monitoring_type: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Float(f32),
    Int(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub name: &'static str,
    /// Seconds between samples of this series.
    pub interval: u32,
    pub value: MetricValue,
    pub mtype: &'static str,
    /// Seconds since epoch.
    pub time: i64,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    LogStream(LokiPush),
    Metrics(Vec<Metric>),
}

impl Payload {
    pub fn destination(&self) -> Destination {
        match self {
            Self::LogStream(_) => Destination::LogStream,
            Self::Metrics(_) => Destination::Metrics,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Self::LogStream(doc) => serde_json::to_vec(doc),
            Self::Metrics(batch) => serde_json::to_vec(batch),
        }
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Loki wants nanoseconds as a decimal string; the cycle clock is seconds.
fn nanos_string(ts_secs: i64) -> String {
    (ts_secs as i128 * NANOS_PER_SEC).to_string()
}

/// Space-separated `key=value` tokens for every field of the reading.
pub fn log_line(r: &CycleReading) -> String {
    let mut line = format!(
        "temperature={} humidity={} dew_point={} soil_moisture={} soil_moisture_raw={} \
         battery_raw={} battery_percent={}",
        r.air.temperature,
        r.air.humidity,
        r.air.dew_point,
        r.soil.percent,
        r.soil.raw,
        r.power.volts,
        r.power.percent,
    );
    if let Some(v) = r.solar_volts {
        let _ = write!(line, " solar_panel_volts={v}");
    }
    line
}

pub fn build_log_stream(r: &CycleReading, sensor_id: &str) -> Payload {
    Payload::LogStream(LokiPush {
        streams: vec![LokiStream {
            stream: StreamLabels {
                plant_id: sensor_id.to_string(),
                monitoring_type: MONITORING_TYPE,
            },
            values: vec![[nanos_string(r.ts), log_line(r)]],
        }],
    })
}

pub fn build_metrics(r: &CycleReading, sensor_id: &str, interval_sec: u32) -> Payload {
    let tags = vec![format!("plant_id={sensor_id}")];
    let gauge = |name: &'static str, value: MetricValue| Metric {
        name,
        interval: interval_sec,
        value,
        mtype: "gauge",
        time: r.ts,
        tags: tags.clone(),
    };

    let mut batch = vec![
        gauge("temperature", MetricValue::Float(r.air.temperature)),
        gauge("humidity", MetricValue::Float(r.air.humidity)),
        gauge("dew_point", MetricValue::Float(r.air.dew_point)),
        gauge(
            "soil_moisture_percent",
            MetricValue::Int(r.soil.percent as i64),
        ),
        gauge("battery_raw", MetricValue::Float(r.power.volts)),
        gauge("battery_percent", MetricValue::Float(r.power.percent)),
    ];
    if let Some(v) = r.solar_volts {
        batch.push(gauge("solar_panel_volts", MetricValue::Float(v)));
    }
    Payload::Metrics(batch)
}

// ===========================================================================
// Tests
// ===========================================================================
