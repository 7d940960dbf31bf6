//! Sensor acquisition: one bus transaction per quantity per cycle, no
//! caching and no retry.
//!
//! The hardware seams are [`Adc`] and [`AirProbe`]; the ADS1115/SHT20
//! drivers (feature `hw`) and the simulator (feature `sim`) implement them.
//! [`Acquisition`] layers channel assignment and calibration on top.

pub mod ads1115;
#[cfg(feature = "sim")]
pub mod sim;
pub mod sht20;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::calibration::TwoPoint;
use crate::reading::{AirSample, PowerSample, SoilSample};

/// A multi-channel single-ended ADC.
pub trait Adc {
    fn read_raw(&mut self, channel: u8) -> Result<i16>;
    /// Convert a raw count from this ADC into volts at the pin.
    fn volts(&self, raw: i16) -> f32;
}

/// Temperature / humidity probe.
pub trait AirProbe {
    fn measure(&mut self) -> Result<AirSample>;
}

/// Soil behaviour presets for the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    /// Mid-range start, slow drift toward dry, ~3% spikes.
    #[default]
    Drying,
    /// Hovers near the centre with little noise.
    Stable,
    /// Noisy, ~10% spike rate.
    Flaky,
    /// Starts near the wet end and dries very slowly.
    Wet,
}

/// ADC channel assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channels {
    pub soil: u8,
    pub battery: u8,
    /// Only wired on solar-powered nodes.
    pub solar: Option<u8>,
}

/// Calibration applied on top of the raw channel reads.
#[derive(Debug, Clone, Copy)]
pub struct Calibration {
    /// 0 % = probe in air, 100 % = probe in water.
    pub soil: TwoPoint,
    /// 0 % = min rated cell volts, 100 % = max.
    pub battery: TwoPoint,
    /// Multiplier undoing the battery sense divider.
    pub battery_divider: f32,
    /// Multiplier undoing the solar sense divider.
    pub solar_divider: f32,
}

pub struct Acquisition {
    adc: Box<dyn Adc + Send>,
    air: Box<dyn AirProbe + Send>,
    channels: Channels,
    calibration: Calibration,
}

impl Acquisition {
    pub fn new(
        adc: Box<dyn Adc + Send>,
        air: Box<dyn AirProbe + Send>,
        channels: Channels,
        calibration: Calibration,
    ) -> Self {
        Self {
            adc,
            air,
            channels,
            calibration,
        }
    }

    pub fn read_air(&mut self) -> Result<AirSample> {
        self.air.measure().context("air probe read failed")
    }

    pub fn read_soil(&mut self) -> Result<SoilSample> {
        let raw = self
            .adc
            .read_raw(self.channels.soil)
            .with_context(|| format!("soil read on channel {} failed", self.channels.soil))?;
        Ok(SoilSample {
            raw,
            percent: self.calibration.soil.percent_int(raw as i64),
        })
    }

    pub fn read_power(&mut self) -> Result<PowerSample> {
        let raw = self
            .adc
            .read_raw(self.channels.battery)
            .with_context(|| format!("battery read on channel {} failed", self.channels.battery))?;
        let volts = self.adc.volts(raw) * self.calibration.battery_divider;
        Ok(PowerSample {
            volts,
            percent: self.calibration.battery.percent(volts),
        })
    }

    /// `Ok(None)` on nodes without a solar input.
    pub fn read_solar_voltage(&mut self) -> Result<Option<f32>> {
        let Some(channel) = self.channels.solar else {
            return Ok(None);
        };
        let raw = self
            .adc
            .read_raw(channel)
            .with_context(|| format!("solar read on channel {channel} failed"))?;
        Ok(Some(self.adc.volts(raw) * self.calibration.solar_divider))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
