// SPDX-License-Identifier: GPL-2.0-or-later

//! Timestamp math between time scales. All conversions use checked 128-bit
//! intermediates so overflow surfaces as `None` instead of wrapping.

/// Convert a duration in seconds to ticks in the given time scale, rounding
/// to nearest.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::as_conversions
)]
pub fn seconds_to_ticks(seconds: f64, time_scale: u32) -> i64 {
    (seconds * f64::from(time_scale)).round() as i64
}

/// Convert ticks in the given time scale to seconds.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
pub fn ticks_to_seconds(ticks: i64, time_scale: u32) -> f64 {
    ticks as f64 / f64::from(time_scale)
}

/// Rescale `ticks` from one time scale to another, rounding to nearest.
#[must_use]
pub fn rescale_ticks(ticks: i64, from_scale: u32, to_scale: u32) -> Option<i64> {
    if from_scale == 0 {
        return None;
    }
    if from_scale == to_scale {
        return Some(ticks);
    }
    let num = i128::from(ticks).checked_mul(i128::from(to_scale))?;
    let den = i128::from(from_scale);
    let half = den / 2;
    let rounded = if num >= 0 { num + half } else { num - half } / den;
    i64::try_from(rounded).ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(1.0, 90000, 90000)]
    #[test_case(0.3, 1000, 300)]
    #[test_case(2.736, 1000, 2736)]
    #[test_case(0.0, 90000, 0)]
    fn test_seconds_to_ticks(seconds: f64, scale: u32, want: i64) {
        assert_eq!(want, seconds_to_ticks(seconds, scale));
    }

    #[test_case(90000, 90000, 1000, Some(1000) ; "same_scale")]
    #[test_case(1, 3, 1000, Some(333) ; "one_third")]
    #[test_case(2, 3, 1000, Some(667) ; "two_thirds")]
    #[test_case(-90000, 90000, 1000, Some(-1000) ; "negative")]
    #[test_case(500, 1000, 1000, Some(500) ; "half")]
    fn test_rescale_ticks(ticks: i64, from: u32, to: u32, want: Option<i64>) {
        assert_eq!(want, rescale_ticks(ticks, from, to));
    }

    #[test]
    fn test_rescale_zero_scale() {
        assert_eq!(None, rescale_ticks(1, 0, 1000));
    }
}
