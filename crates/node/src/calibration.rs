//! Two-point linear calibration from raw ADC counts / volts to percent.
//!
//! Soil moisture uses the integer form (reference points are ADC counts
//! measured with the probe in open air and submerged in water).  Battery
//! charge uses the float form between the cell's rated min and max volts.
//! Interpolation itself does not clamp; the percent helpers do.

use anyhow::{ensure, Result};

/// Linear interpolation of `x` from `[in_min, in_max]` onto
/// `[out_min, out_max]`.  Returns `None` for a zero-width input range.
///
/// Exact at both endpoints and monotonic in between; values outside the
/// input range extrapolate.
pub fn map_range(x: f64, in_min: f64, in_max: f64, out_min: f64, out_max: f64) -> Option<f64> {
    let span = in_max - in_min;
    if span == 0.0 || !span.is_finite() {
        return None;
    }
    let t = (x - in_min) / span;
    Some(out_min * (1.0 - t) + out_max * t)
}

/// Integer variant; the division truncates toward zero.
pub fn map_range_int(x: i64, in_min: i64, in_max: i64, out_min: i64, out_max: i64) -> Option<i64> {
    let span = in_max - in_min;
    if span == 0 {
        return None;
    }
    Some((x - in_min) * (out_max - out_min) / span + out_min)
}

/// Calibration reference pair mapping to 0 % and 100 % respectively.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TwoPoint {
    zero: f64,
    full: f64,
}

impl TwoPoint {
    /// `zero` is the reading at 0 %, `full` the reading at 100 %.  The two
    /// may be in either order (soil probes read lower when wet).
    pub fn new(zero: f64, full: f64) -> Result<Self> {
        ensure!(
            zero.is_finite() && full.is_finite(),
            "calibration points must be finite (got {zero}, {full})"
        );
        ensure!(
            zero != full,
            "calibration points are both {zero}: calibration range is zero"
        );
        Ok(Self { zero, full })
    }

    /// Percent in the float domain, clamped to [0, 100].
    pub fn percent(&self, value: f32) -> f32 {
        // `new` rejected a zero-width range, so interpolation always succeeds.
        let p = map_range(value as f64, self.zero, self.full, 0.0, 100.0).unwrap_or(0.0);
        clamp_percent(p) as f32
    }

    /// Percent in the integer domain, clamped to [0, 100].
    pub fn percent_int(&self, raw: i64) -> u8 {
        let p = map_range_int(raw, self.zero as i64, self.full as i64, 0, 100).unwrap_or(0);
        p.clamp(0, 100) as u8
    }
}

fn clamp_percent(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 100.0)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- map_range ------------------------------------------------------------

    #[test]
    fn map_range_hits_both_endpoints_exactly() {
        assert_eq!(map_range(2.8, 2.8, 4.2, 0.0, 100.0), Some(0.0));
        assert_eq!(map_range(4.2, 2.8, 4.2, 0.0, 100.0), Some(100.0));
        assert_eq!(map_range(16000.0, 16000.0, 6780.0, 0.0, 100.0), Some(0.0));
        assert_eq!(map_range(6780.0, 16000.0, 6780.0, 0.0, 100.0), Some(100.0));
    }

    #[test]
    fn map_range_midpoint() {
        let v = map_range(3.5, 2.8, 4.2, 0.0, 100.0).unwrap();
        assert!((v - 50.0).abs() < 1e-9, "got {v}");
    }

    #[test]
    fn map_range_is_monotonic_inside_range() {
        let mut prev = f64::NEG_INFINITY;
        for i in 0..=1400 {
            let x = 2.8 + i as f64 * 0.001;
            let v = map_range(x, 2.8, 4.2, 0.0, 100.0).unwrap();
            assert!(v >= prev, "not monotonic at x={x}: {v} < {prev}");
            prev = v;
        }
    }

    #[test]
    fn map_range_decreasing_input_range_is_monotonic_decreasing() {
        let a = map_range(15000.0, 16000.0, 6780.0, 0.0, 100.0).unwrap();
        let b = map_range(10000.0, 16000.0, 6780.0, 0.0, 100.0).unwrap();
        assert!(a < b);
    }

    #[test]
    fn map_range_extrapolates_without_clamping() {
        let v = map_range(5.0, 2.8, 4.2, 0.0, 100.0).unwrap();
        assert!(v > 100.0);
        let v = map_range(2.0, 2.8, 4.2, 0.0, 100.0).unwrap();
        assert!(v < 0.0);
    }

    #[test]
    fn map_range_zero_width_is_none() {
        assert_eq!(map_range(1.0, 3.0, 3.0, 0.0, 100.0), None);
    }

    // -- map_range_int --------------------------------------------------------

    #[test]
    fn map_range_int_endpoints() {
        assert_eq!(map_range_int(16000, 16000, 6780, 0, 100), Some(0));
        assert_eq!(map_range_int(6780, 16000, 6780, 0, 100), Some(100));
    }

    #[test]
    fn map_range_int_truncates_toward_zero() {
        // (16000-11390)*100/(6780-16000) = 461000 / -9220 = -50 exactly;
        // one count off truncates rather than rounds.
        assert_eq!(map_range_int(11390, 16000, 6780, 0, 100), Some(50));
        assert_eq!(map_range_int(11391, 16000, 6780, 0, 100), Some(49));
    }

    #[test]
    fn map_range_int_zero_width_is_none() {
        assert_eq!(map_range_int(5, 7, 7, 0, 100), None);
    }

    // -- TwoPoint -------------------------------------------------------------

    #[test]
    fn two_point_rejects_zero_width() {
        let err = TwoPoint::new(15000.0, 15000.0).unwrap_err();
        assert!(format!("{err}").contains("calibration range is zero"));
    }

    #[test]
    fn two_point_rejects_nan() {
        assert!(TwoPoint::new(f64::NAN, 1.0).is_err());
    }

    #[test]
    fn soil_percent_clamps_wetter_than_water() {
        let soil = TwoPoint::new(16000.0, 6780.0).unwrap();
        assert_eq!(soil.percent_int(6780), 100);
        // Below the water reference means "wetter than wet".
        assert_eq!(soil.percent_int(3000), 100);
    }

    #[test]
    fn soil_percent_clamps_drier_than_air() {
        let soil = TwoPoint::new(16000.0, 6780.0).unwrap();
        assert_eq!(soil.percent_int(16000), 0);
        assert_eq!(soil.percent_int(20000), 0);
        assert_eq!(soil.percent_int(-5), 100);
    }

    #[test]
    fn battery_percent_clamped() {
        let batt = TwoPoint::new(2.8, 4.2).unwrap();
        assert_eq!(batt.percent(4.5), 100.0);
        assert_eq!(batt.percent(2.0), 0.0);
        assert_eq!(batt.percent(f32::NAN), 0.0);
        let mid = batt.percent(3.5);
        assert!((mid - 50.0).abs() < 0.01, "got {mid}");
    }

    #[test]
    fn percent_always_within_bounds() {
        let batt = TwoPoint::new(2.8, 4.2).unwrap();
        let soil = TwoPoint::new(16000.0, 6780.0).unwrap();
        for i in -100..100 {
            let p = batt.percent(i as f32 * 0.1);
            assert!((0.0..=100.0).contains(&p), "battery {p}");
            let q = soil.percent_int(i * 400);
            assert!(q <= 100, "soil {q}");
        }
    }
}
