//! Plausibility gate applied before anything leaves the node.
//!
//! Only the air sample is checked.  The bound is a crude sanity limit
//! (a glitching SHT20 tends to report values well above 100), so it is a
//! config knob rather than a physical constant.

use crate::reading::AirSample;

pub const DEFAULT_MAX_AIR_VALUE: f32 = 100.0;

/// False iff temperature, humidity or dew point exceeds `max`.
/// A NaN field is treated as implausible.
pub fn is_plausible(air: &AirSample, max: f32) -> bool {
    [air.temperature, air.humidity, air.dew_point]
        .iter()
        .all(|v| !v.is_nan() && *v <= max)
}
