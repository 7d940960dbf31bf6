//! ADS1115 16-bit ADC over I2C: soil probe, battery and solar channels.
//!
//! Single-shot, single-ended conversions at ±6.144 V full scale and
//! 128 SPS.  The wide range covers a 4.2 V Li-ion cell wired straight to a
//! pin; the soil reference points in `node.example.toml` (`air_value ≈
//! 16000`, `water_value ≈ 6780`) were measured at this gain.

#[cfg(feature = "hw")]
use std::{thread, time::Duration};

use anyhow::bail;

#[cfg(feature = "hw")]
use anyhow::ensure;
#[cfg(feature = "hw")]
use rppal::i2c::I2c;

#[cfg(feature = "hw")]
use super::Adc;

/// Highest single-ended input (AIN0..AIN3).
pub const MAX_CHANNEL: u8 = 3;

/// ±6.144 V over the positive 15-bit span: 0.1875 mV per count.
pub const VOLTS_PER_BIT: f32 = 6.144 / 32768.0;

/// Largest count a single-ended read can return.
pub const FULL_SCALE: i16 = i16::MAX;

#[cfg_attr(not(feature = "hw"), allow(dead_code))]
mod reg {
    pub const CONVERSION: u8 = 0x00;
    pub const CONFIG: u8 = 0x01;
}

/// Fields of the 16-bit config register for one conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(feature = "hw"), allow(dead_code))]
struct ConfigWord {
    /// AINx against GND.
    channel: u8,
    /// PGA code; 0 selects ±6.144 V.
    gain: u16,
    /// DR code; 4 selects 128 SPS.
    rate: u16,
}

#[cfg_attr(not(feature = "hw"), allow(dead_code))]
impl ConfigWord {
    const START: u16 = 1 << 15;
    const SINGLE_SHOT: u16 = 1 << 8;
    const COMPARATOR_OFF: u16 = 0b11;
    /// MUX codes 4..=7 are the single-ended inputs.
    const MUX_SINGLE_BASE: u16 = 0b100;

    fn single_ended(channel: u8) -> Self {
        Self {
            channel,
            gain: 0b000,
            rate: 0b100,
        }
    }

    fn bits(self) -> u16 {
        let mux = Self::MUX_SINGLE_BASE + self.channel as u16;
        Self::START
            | mux << 12
            | self.gain << 9
            | Self::SINGLE_SHOT
            | self.rate << 5
            | Self::COMPARATOR_OFF
    }
}

/// Ask `done` up to `polls` times whether the conversion finished, pausing
/// between misses.  Running out means the conversion register still holds
/// the previous channel's result.
#[cfg_attr(not(feature = "hw"), allow(dead_code))]
fn wait_ready(
    channel: u8,
    polls: usize,
    mut done: impl FnMut() -> anyhow::Result<bool>,
    mut pause: impl FnMut(),
) -> anyhow::Result<()> {
    for n in 1..=polls {
        if done()? {
            return Ok(());
        }
        if n < polls {
            pause();
        }
    }
    bail!("conversion not ready on channel {channel}")
}

/// Raw count to volts at the pin.
pub fn compute_volts(raw: i16) -> f32 {
    raw as f32 * VOLTS_PER_BIT
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// 1 / 128 SPS is ~7.8 ms.
#[cfg(feature = "hw")]
const CONVERSION_WAIT: Duration = Duration::from_millis(9);
#[cfg(feature = "hw")]
const READY_POLLS: usize = 3;

#[cfg(feature = "hw")]
pub struct Ads1115 {
    i2c: I2c,
}

#[cfg(feature = "hw")]
impl Ads1115 {
    /// Open I2C bus 1 and read the config register once, so an absent or
    /// unpowered chip fails at boot rather than mid-cycle.
    pub fn open(addr: u16) -> anyhow::Result<Self> {
        let mut i2c = I2c::new()?;
        i2c.set_slave_address(addr)?;

        let mut buf = [0u8; 2];
        i2c.block_read(reg::CONFIG, &mut buf)?;

        tracing::info!(
            addr = format_args!("0x{addr:02x}"),
            config = format_args!("0x{:04x}", u16::from_be_bytes(buf)),
            "ads1115 ready"
        );
        Ok(Self { i2c })
    }

    fn conversion_done(&mut self) -> anyhow::Result<bool> {
        let mut buf = [0u8; 2];
        self.i2c.block_read(reg::CONFIG, &mut buf)?;
        Ok(u16::from_be_bytes(buf) & ConfigWord::START != 0)
    }
}

#[cfg(feature = "hw")]
impl Adc for Ads1115 {
    fn read_raw(&mut self, channel: u8) -> anyhow::Result<i16> {
        ensure!(
            channel <= MAX_CHANNEL,
            "ads1115 has no channel {channel} (0..={MAX_CHANNEL})"
        );
        let word = ConfigWord::single_ended(channel).bits();
        self.i2c.block_write(reg::CONFIG, &word.to_be_bytes())?;
        thread::sleep(CONVERSION_WAIT);

        wait_ready(
            channel,
            READY_POLLS,
            || self.conversion_done(),
            || thread::sleep(Duration::from_millis(2)),
        )?;

        let mut buf = [0u8; 2];
        self.i2c.block_read(reg::CONVERSION, &mut buf)?;
        // Small negative offsets near 0 V are real readings.
        Ok(i16::from_be_bytes(buf))
    }

    fn volts(&self, raw: i16) -> f32 {
        compute_volts(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_words_per_channel() {
        let words: Vec<u16> = (0..=MAX_CHANNEL)
            .map(|ch| ConfigWord::single_ended(ch).bits())
            .collect();
        assert_eq!(words, [0xC183, 0xD183, 0xE183, 0xF183]);
    }

    #[test]
    fn config_word_fields() {
        let w = ConfigWord::single_ended(2).bits();
        assert_eq!(w >> 15, 1, "start bit");
        assert_eq!((w >> 12) & 0b111, 0b110, "mux AIN2/GND");
        assert_eq!((w >> 9) & 0b111, 0, "±6.144 V");
        assert_eq!((w >> 8) & 1, 1, "single-shot");
        assert_eq!((w >> 5) & 0b111, 0b100, "128 SPS");
        assert_eq!(w & 0b11, 0b11, "comparator off");
    }

    #[test]
    fn ready_on_a_later_poll() {
        let mut seen = 0;
        let mut pauses = 0;
        let ready = || -> anyhow::Result<bool> {
            seen += 1;
            Ok(seen == 2)
        };
        wait_ready(1, 3, ready, || pauses += 1).unwrap();
        assert_eq!((seen, pauses), (2, 1));
    }

    #[test]
    fn never_ready_is_an_error_not_a_stale_read() {
        let mut seen = 0;
        let mut pauses = 0;
        let never = || -> anyhow::Result<bool> {
            seen += 1;
            Ok(false)
        };
        let err = wait_ready(3, 3, never, || pauses += 1).unwrap_err();
        assert_eq!(err.to_string(), "conversion not ready on channel 3");
        assert_eq!((seen, pauses), (3, 2));
    }

    #[test]
    fn bus_error_while_polling_propagates() {
        let err = wait_ready(0, 3, || anyhow::bail!("nack"), || {}).unwrap_err();
        assert_eq!(err.to_string(), "nack");
    }

    #[test]
    fn counts_to_volts() {
        assert!((VOLTS_PER_BIT - 0.000_187_5).abs() < 1e-9);
        assert_eq!(compute_volts(0), 0.0);
        assert!((compute_volts(FULL_SCALE) - 6.144).abs() < 0.001);
        // 3.7 V cell
        assert!((compute_volts(19733) - 3.7).abs() < 0.001);
    }
}
