//! Stateful sensor simulator for running the node without hardware.
//!
//! One simulated day drives everything: the soil probe drifts dry with a
//! mean-reverting random walk plus ADC noise and the odd spike, air
//! temperature swings through the day with humidity moving the other way,
//! and a small panel charges the cell by day while the node drains it.
//!
//! Counts are produced at the ADS1115's ±6.144 V scale so readings go
//! through the same calibration path as real ones.

use std::f64::consts::TAU;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};

use super::ads1115::{compute_volts, FULL_SCALE, VOLTS_PER_BIT};
use super::sht20::dew_point;
use super::{Adc, AirProbe, Channels, Scenario};
use crate::reading::AirSample;

/// Zero-mean normal sample (Box-Muller).
fn jitter(rng: &mut fastrand::Rng, sigma: f64) -> f64 {
    // 1 - f64() is in (0, 1], keeping ln finite.
    let u = 1.0 - rng.f64();
    let v = rng.f64();
    sigma * (-2.0 * u.ln()).sqrt() * (TAU * v).cos()
}

fn to_counts(x: f64) -> i16 {
    x.round().clamp(0.0, FULL_SCALE as f64) as i16
}

// ── Soil ────────────────────────────────────────────────────────────────────

/// Per-scenario soil dynamics, in ADC counts per sample.
#[derive(Debug, Clone, Copy)]
struct SoilProfile {
    /// Steady movement toward the dry reference.
    dry_rate: f64,
    step_sigma: f64,
    /// Fraction of the distance to mid-range recovered each sample.
    pull: f64,
    read_sigma: f64,
    spike_chance: f64,
    spike_sigma: f64,
    /// Starting point: 0.0 = wet reference, 1.0 = dry reference.
    start: f64,
}

impl SoilProfile {
    fn for_scenario(s: Scenario) -> Self {
        match s {
            Scenario::Drying => Self {
                dry_rate: 10.0,
                step_sigma: 100.0,
                pull: 0.02,
                read_sigma: 60.0,
                spike_chance: 0.03,
                spike_sigma: 1500.0,
                start: 0.5,
            },
            Scenario::Stable => Self {
                dry_rate: 1.5,
                step_sigma: 40.0,
                pull: 0.05,
                read_sigma: 30.0,
                spike_chance: 0.005,
                spike_sigma: 800.0,
                start: 0.5,
            },
            Scenario::Flaky => Self {
                dry_rate: 7.0,
                step_sigma: 180.0,
                pull: 0.02,
                read_sigma: 150.0,
                spike_chance: 0.10,
                spike_sigma: 2200.0,
                start: 0.5,
            },
            Scenario::Wet => Self {
                dry_rate: 2.0,
                step_sigma: 60.0,
                pull: 0.02,
                read_sigma: 45.0,
                spike_chance: 0.02,
                spike_sigma: 1100.0,
                start: 0.2,
            },
        }
    }
}

struct SoilModel {
    profile: SoilProfile,
    /// Underlying moisture level in counts, before read noise.
    level: f64,
    dry: f64,
    wet: f64,
}

impl SoilModel {
    fn new(rng: &mut fastrand::Rng, scenario: Scenario, dry: f64, wet: f64) -> Self {
        let profile = SoilProfile::for_scenario(scenario);
        let span = dry - wet;
        let level = wet + profile.start * span + jitter(rng, span.abs() * 0.03);
        Self {
            profile,
            level: level.clamp(dry.min(wet), dry.max(wet)),
            dry,
            wet,
        }
    }

    fn mid(&self) -> f64 {
        (self.dry + self.wet) / 2.0
    }

    fn read(&mut self, rng: &mut fastrand::Rng) -> f64 {
        let p = self.profile;
        // Toward `dry`, whichever side of `wet` that is.
        let drift = p.dry_rate * (self.dry - self.wet).signum();
        let pull = p.pull * (self.mid() - self.level);
        let margin = 500.0;
        self.level = (self.level + drift + pull + jitter(rng, p.step_sigma)).clamp(
            self.dry.min(self.wet) - margin,
            self.dry.max(self.wet) + margin,
        );

        let spike = if rng.f64() < p.spike_chance {
            jitter(rng, p.spike_sigma)
        } else {
            0.0
        };
        self.level + jitter(rng, p.read_sigma) + spike
    }
}

// ── Board ───────────────────────────────────────────────────────────────────

/// Simulated ADS1115 + SHT20 sharing one simulated day.
pub struct SimBoard {
    rng: fastrand::Rng,
    channels: Channels,
    soil: SoilModel,
    cell_volts: f64,
    /// 0.0..1.0 through the day; 0.5 is solar noon.
    time_of_day: f64,
    /// Advance per cycle.
    day_step: f64,
}

impl SimBoard {
    /// `dry` / `wet` should be the soil calibration points so the probe
    /// sweeps the calibrated range.  `day_length_samples` cycles make one
    /// simulated day.
    pub fn new(
        scenario: Scenario,
        channels: Channels,
        dry: f64,
        wet: f64,
        day_length_samples: u32,
    ) -> Self {
        Self::seeded(fastrand::Rng::new(), scenario, channels, dry, wet, day_length_samples)
    }

    fn seeded(
        mut rng: fastrand::Rng,
        scenario: Scenario,
        channels: Channels,
        dry: f64,
        wet: f64,
        day_length_samples: u32,
    ) -> Self {
        let soil = SoilModel::new(&mut rng, scenario, dry, wet);
        Self {
            rng,
            channels,
            soil,
            cell_volts: 3.9,
            time_of_day: 0.25,
            day_step: 1.0 / day_length_samples.max(2) as f64,
        }
    }

    /// Irradiance, 0 overnight and 1 at noon.
    fn sun(&self) -> f64 {
        (TAU * (self.time_of_day - 0.25)).sin().max(0.0)
    }

    /// One cycle of charge/drain, then move the clock on.
    fn advance(&mut self) {
        self.cell_volts = (self.cell_volts + 0.004 * self.sun() - 0.0015).clamp(3.0, 4.2);
        self.time_of_day = (self.time_of_day + self.day_step).fract();
    }

    fn volts_to_counts(v: f64) -> i16 {
        to_counts(v / VOLTS_PER_BIT as f64)
    }

    /// ADC and air-probe handles over this board, for
    /// [`super::Acquisition::new`].
    pub fn split(self) -> (SimHandle, SimHandle) {
        let shared = SimHandle(Arc::new(Mutex::new(self)));
        (shared.clone(), shared)
    }
}

impl Adc for SimBoard {
    fn read_raw(&mut self, channel: u8) -> Result<i16> {
        let ch = self.channels;
        if channel == ch.soil {
            Ok(to_counts(self.soil.read(&mut self.rng)))
        } else if channel == ch.battery {
            // Read exactly once per cycle, so it doubles as the day tick.
            self.advance();
            let v = self.cell_volts + jitter(&mut self.rng, 0.005);
            Ok(Self::volts_to_counts(v))
        } else if Some(channel) == ch.solar {
            let v = (6.0 * self.sun() + jitter(&mut self.rng, 0.05)).max(0.0);
            Ok(Self::volts_to_counts(v))
        } else {
            bail!("sim: nothing wired to channel {channel}")
        }
    }

    fn volts(&self, raw: i16) -> f32 {
        compute_volts(raw)
    }
}

impl AirProbe for SimBoard {
    fn measure(&mut self) -> Result<AirSample> {
        // Peak mid-afternoon, trough before dawn.
        let swing = (TAU * (self.time_of_day - 0.375)).sin();
        let temperature = (19.0 + 5.0 * swing + jitter(&mut self.rng, 0.2)) as f32;
        let humidity =
            (60.0 - 15.0 * swing + jitter(&mut self.rng, 1.0)).clamp(5.0, 99.0) as f32;
        Ok(AirSample {
            temperature,
            humidity,
            dew_point: dew_point(temperature, humidity),
        })
    }
}

/// Shared handle so the ADC and air probe see the same simulated day.
#[derive(Clone)]
pub struct SimHandle(Arc<Mutex<SimBoard>>);

impl SimHandle {
    fn board(&self) -> Result<MutexGuard<'_, SimBoard>> {
        self.0.lock().map_err(|_| anyhow!("sim board lock poisoned"))
    }
}

impl Adc for SimHandle {
    fn read_raw(&mut self, channel: u8) -> Result<i16> {
        self.board()?.read_raw(channel)
    }

    fn volts(&self, raw: i16) -> f32 {
        compute_volts(raw)
    }
}

impl AirProbe for SimHandle {
    fn measure(&mut self) -> Result<AirSample> {
        self.board()?.measure()
    }
}
