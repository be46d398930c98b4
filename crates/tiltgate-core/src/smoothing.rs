/// Exponential moving average over raw roll angles.
///
/// `smoothed = alpha * smoothed + (1 - alpha) * raw`, where `alpha` is the
/// weight kept on history. State starts at 0 rather than the first sample.
#[derive(Debug, Clone)]
pub struct AngleSmoother {
    alpha: f32,
    value: f32,
}

impl AngleSmoother {
    /// Default history weight.
    pub const DEFAULT_ALPHA: f32 = 0.7;

    pub fn new(alpha: f32) -> Self {
        assert!((0.0..1.0).contains(&alpha), "alpha must be in [0, 1)");
        Self { alpha, value: 0.0 }
    }

    /// Fold one raw sample in and return the new smoothed angle.
    pub fn update(&mut self, raw: f32) -> f32 {
        self.value = self.alpha * self.value + (1.0 - self.alpha) * raw;
        self.value
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
    }
}

impl Default for AngleSmoother {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ALPHA)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_zero() {
        let mut s = AngleSmoother::default();
        assert_eq!(s.value(), 0.0);
        // First sample only gets 30% weight.
        assert!((s.update(10.0) - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_matches_closed_form() {
        // smoothed_n = sum_i alpha^(n-i) * (1 - alpha) * raw_i
        let raws = [3.0f32, -7.5, 12.0, 40.0, 40.0, -2.0, 18.25];
        let mut s = AngleSmoother::default();
        for (n, &raw) in raws.iter().enumerate() {
            let got = s.update(raw);
            let expected: f64 = raws[..=n]
                .iter()
                .enumerate()
                .map(|(i, &r)| 0.7f64.powi((n - i) as i32) * 0.3 * r as f64)
                .sum();
            assert!(
                (got as f64 - expected).abs() < 1e-4,
                "frame {n}: got {got}, expected {expected}"
            );
        }
    }

    #[test]
    fn test_ramp_sequence() {
        let mut s = AngleSmoother::default();
        let out: Vec<f32> = [0.0, 5.0, 40.0, 40.0, 40.0, 40.0]
            .iter()
            .map(|&r| s.update(r))
            .collect();
        let expected = [0.0, 1.5, 13.05, 21.135, 26.7945, 30.756];
        for (got, want) in out.iter().zip(expected) {
            assert!((got - want).abs() < 1e-3, "got {got}, want {want}");
        }
    }

    #[test]
    fn test_reset() {
        let mut s = AngleSmoother::default();
        s.update(50.0);
        s.reset();
        assert_eq!(s.value(), 0.0);
    }

    #[test]
    #[should_panic]
    fn test_rejects_full_history_weight() {
        AngleSmoother::new(1.0);
    }
}
