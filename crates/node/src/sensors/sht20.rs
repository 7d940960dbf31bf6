//! SHT20 temperature / humidity probe over I2C, plus the dew point math.
//!
//! Uses the no-hold-master commands so the bus is released while the
//! sensor converts.  Every reply is 2 data bytes + CRC-8 (poly 0x31).

#[cfg(feature = "hw")]
use rppal::i2c::I2c;
#[cfg(feature = "hw")]
use std::{thread, time::Duration};

#[cfg(feature = "hw")]
use super::AirProbe;
#[cfg(feature = "hw")]
use crate::reading::AirSample;

/// Fixed 7-bit address.
#[cfg_attr(not(feature = "hw"), allow(dead_code))]
pub const ADDRESS: u16 = 0x40;

#[cfg_attr(not(feature = "hw"), allow(dead_code))]
const CMD_TEMP_NO_HOLD: u8 = 0xF3;
#[cfg_attr(not(feature = "hw"), allow(dead_code))]
const CMD_RH_NO_HOLD: u8 = 0xF5;
#[cfg_attr(not(feature = "hw"), allow(dead_code))]
const CMD_SOFT_RESET: u8 = 0xFE;

/// Max conversion times at 14-bit T / 12-bit RH, rounded up.
#[cfg(feature = "hw")]
const TEMP_WAIT: Duration = Duration::from_millis(86);
#[cfg(feature = "hw")]
const RH_WAIT: Duration = Duration::from_millis(30);
#[cfg(feature = "hw")]
const RESET_WAIT: Duration = Duration::from_millis(15);

// Magnus coefficients (Sonntag 1990), valid -45..60 °C.
const MAGNUS_A: f32 = 17.62;
const MAGNUS_B: f32 = 243.12;

/// CRC-8, polynomial x^8 + x^5 + x^4 + 1, init 0x00.
#[cfg_attr(not(feature = "hw"), allow(dead_code))]
fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Check the CRC and strip the two status bits.
#[cfg_attr(not(feature = "hw"), allow(dead_code))]
fn decode_word(reply: [u8; 3]) -> anyhow::Result<u16> {
    let expected = crc8(&reply[..2]);
    anyhow::ensure!(
        expected == reply[2],
        "sht20 crc mismatch: got 0x{:02x}, expected 0x{expected:02x}",
        reply[2]
    );
    Ok(u16::from_be_bytes([reply[0], reply[1]]) & !0b11)
}

#[cfg_attr(not(feature = "hw"), allow(dead_code))]
fn convert_temperature(raw: u16) -> f32 {
    -46.85 + 175.72 * raw as f32 / 65536.0
}

#[cfg_attr(not(feature = "hw"), allow(dead_code))]
fn convert_humidity(raw: u16) -> f32 {
    (-6.0 + 125.0 * raw as f32 / 65536.0).clamp(0.0, 100.0)
}

/// Dew point in °C from air temperature (°C) and relative humidity (%).
pub fn dew_point(temperature: f32, humidity: f32) -> f32 {
    // ln(0) is -inf; the sensor floor is well above 0.01 %RH anyway.
    let rh = humidity.max(0.01) / 100.0;
    let gamma = rh.ln() + MAGNUS_A * temperature / (MAGNUS_B + temperature);
    MAGNUS_B * gamma / (MAGNUS_A - gamma)
}

// ── Driver ──────────────────────────────────────────────────────────────────

#[cfg(feature = "hw")]
pub struct Sht20 {
    i2c: I2c,
}

#[cfg(feature = "hw")]
impl Sht20 {
    /// Open I2C bus 1 and soft-reset the probe.
    pub fn open() -> anyhow::Result<Self> {
        let mut i2c = I2c::new()?;
        i2c.set_slave_address(ADDRESS)?;
        i2c.write(&[CMD_SOFT_RESET])?;
        thread::sleep(RESET_WAIT);

        tracing::info!(addr = format_args!("0x{ADDRESS:02x}"), "sht20 initialised");
        Ok(Self { i2c })
    }

    fn measure_word(&mut self, command: u8, wait: Duration) -> anyhow::Result<u16> {
        self.i2c.write(&[command])?;
        thread::sleep(wait);
        let mut reply = [0u8; 3];
        self.i2c.read(&mut reply)?;
        decode_word(reply)
    }
}

#[cfg(feature = "hw")]
impl AirProbe for Sht20 {
    fn measure(&mut self) -> anyhow::Result<AirSample> {
        let temperature = convert_temperature(self.measure_word(CMD_TEMP_NO_HOLD, TEMP_WAIT)?);
        let humidity = convert_humidity(self.measure_word(CMD_RH_NO_HOLD, RH_WAIT)?);
        Ok(AirSample {
            temperature,
            humidity,
            dew_point: dew_point(temperature, humidity),
        })
    }
}
