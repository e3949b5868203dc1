/// Exponential moving average series with smoothing `2 / (period + 1)`,
/// seeded with the first value. Output has the same length as `values`.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if values.is_empty() || period == 0 {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut ema_val = values[0];
    out.push(ema_val);
    for &price in &values[1..] {
        ema_val = price * k + ema_val * (1.0 - k);
        out.push(ema_val);
    }
    out
}

/// Direction of a fast/slow crossover on the latest bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cross {
    /// Fast crossed above slow.
    Golden,
    /// Fast crossed below slow.
    Death,
    /// No crossover on the latest bar.
    None,
}

/// Fast/slow EMA crossover detector.
#[derive(Debug, Clone)]
pub struct EmaCross {
    pub fast: usize,
    pub slow: usize,
}

impl EmaCross {
    pub fn new(fast: usize, slow: usize) -> Self {
        Self { fast, slow }
    }

    /// Bars needed before `compute` returns a value.
    pub fn warmup(&self) -> usize {
        self.slow + 1
    }

    /// Detect a crossover between the last two bars of `closes` (oldest first).
    /// Returns `None` if there isn't enough data or the periods are unusable.
    pub fn compute(&self, closes: &[f64]) -> Option<Cross> {
        if self.fast == 0 || self.fast >= self.slow || closes.len() < self.warmup() {
            return None;
        }

        let fast = ema_series(closes, self.fast);
        let slow = ema_series(closes, self.slow);
        let n = closes.len();
        let (prev_fast, curr_fast) = (fast[n - 2], fast[n - 1]);
        let (prev_slow, curr_slow) = (slow[n - 2], slow[n - 1]);

        if prev_fast <= prev_slow && curr_fast > curr_slow {
            Some(Cross::Golden)
        } else if prev_fast >= prev_slow && curr_fast < curr_slow {
            Some(Cross::Death)
        } else {
            Some(Cross::None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_of_constant_series_is_constant() {
        let out = ema_series(&[5.0; 10], 3);
        assert_eq!(out.len(), 10);
        assert!(out.iter().all(|v| (v - 5.0).abs() < 1e-12));
    }

    #[test]
    fn cross_returns_none_with_insufficient_data() {
        let cross = EmaCross::new(3, 6);
        assert!(cross.compute(&[100.0; 6]).is_none());
    }

    #[test]
    fn cross_rejects_inverted_periods() {
        let cross = EmaCross::new(6, 3);
        assert!(cross.compute(&[100.0; 50]).is_none());
    }

    #[test]
    fn golden_cross_after_reversal() {
        let cross = EmaCross::new(2, 5);
        let mut prices: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        // Flat then a single sharp jump pulls the fast EMA through the slow one.
        prices.push(140.0);
        assert_eq!(cross.compute(&prices), Some(Cross::Golden));
    }

    #[test]
    fn death_cross_after_reversal() {
        let cross = EmaCross::new(2, 5);
        let mut prices: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        prices.push(60.0);
        assert_eq!(cross.compute(&prices), Some(Cross::Death));
    }

    #[test]
    fn steady_trend_has_no_cross() {
        let cross = EmaCross::new(3, 6);
        let prices: Vec<f64> = (0..40).map(|i| 100.0 + i as f64 * 0.5).collect();
        assert_eq!(cross.compute(&prices), Some(Cross::None));
    }
}
