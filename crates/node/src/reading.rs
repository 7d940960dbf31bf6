//! Per-cycle sample types.  Nothing here outlives the wake cycle that
//! produced it.

use std::fmt;

/// Temperature / humidity probe output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AirSample {
    /// °C
    pub temperature: f32,
    /// %RH
    pub humidity: f32,
    /// °C
    pub dew_point: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoilSample {
    /// Raw ADC count, passed through unmodified.
    pub raw: i16,
    /// Clamped to 0..=100.
    pub percent: u8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerSample {
    /// Battery volts after the divider correction.
    pub volts: f32,
    /// Clamped to 0..=100.
    pub percent: f32,
}

/// Everything acquired in one wake cycle, stamped with seconds since epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleReading {
    pub ts: i64,
    pub air: AirSample,
    pub soil: SoilSample,
    pub power: PowerSample,
    /// Only present on nodes with a solar input; not clamped.
    pub solar_volts: Option<f32>,
}

/// Where a payload is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    LogStream,
    Metrics,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LogStream => write!(f, "log-stream"),
            Self::Metrics => write!(f, "metrics"),
        }
    }
}

/// Result of one send; logged, then dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub destination: Destination,
    pub success: bool,
    pub message: String,
}

impl DeliveryOutcome {
    pub fn ok(destination: Destination, message: impl Into<String>) -> Self {
        Self {
            destination,
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(destination: Destination, message: impl Into<String>) -> Self {
        Self {
            destination,
            success: false,
            message: message.into(),
        }
    }
}
