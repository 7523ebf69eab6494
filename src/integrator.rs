use itertools::Itertools;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Trapezoidal integration of power samples (watts) taken every
/// `sampling_ms` milliseconds. Returns watt-hours; fewer than two samples
/// enclose no area and integrate to zero.
///
/// Spacing is assumed uniform even though real acquisition jitters.
pub fn trapezoidal_wh(samples_w: &[f64], sampling_ms: u64) -> f64 {
    let dt_hours = sampling_ms as f64 / MS_PER_HOUR;
    samples_w
        .iter()
        .tuple_windows()
        .map(|(a, b)| (a + b) / 2.0 * dt_hours)
        .sum()
}

pub fn milliwatts_to_watts(samples_mw: &[f64]) -> Vec<f64> {
    samples_mw.iter().map(|mw| mw / 1000.0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_samples() {
        let energy = trapezoidal_wh(&[10.0, 20.0, 30.0], 100);
        let expected = (15.0 + 25.0) * (100.0 / 3_600_000.0);
        assert!((energy - expected).abs() < 1e-12);
        assert!((energy - 0.0011111).abs() < 1e-7);
    }

    #[test]
    fn test_constant_power() {
        // 60 W for ten 1 s intervals is 600 J
        let energy = trapezoidal_wh(&[60.0; 11], 1000);
        assert!((energy - 600.0 / 3600.0).abs() < 1e-12);
    }

    #[test]
    fn test_insufficient_samples() {
        assert_eq!(trapezoidal_wh(&[], 100), 0.0);
        assert_eq!(trapezoidal_wh(&[42.0], 100), 0.0);
    }

    #[test]
    fn test_milliwatt_conversion() {
        assert_eq!(milliwatts_to_watts(&[5000.0, 250.0]), vec![5.0, 0.25]);
    }
}
