/// RSI (Relative Strength Index) with Wilder smoothing and
/// overbought/oversold bands.
#[derive(Debug, Clone)]
pub struct RsiIndicator {
    pub period: usize,
    pub overbought: f64,
    pub oversold: f64,
}

/// Where the latest RSI value sits relative to the bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsiZone {
    Overbought,
    Oversold,
    Neutral,
}

impl RsiIndicator {
    pub fn new(period: usize, overbought: f64, oversold: f64) -> Self {
        Self { period, overbought, oversold }
    }

    /// RSI of `closes` (oldest first). `None` with fewer than `period + 1`
    /// values or a period below 2.
    pub fn compute(&self, closes: &[f64]) -> Option<f64> {
        if self.period < 2 || closes.len() < self.period + 1 {
            return None;
        }

        let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
        let initial = &changes[..self.period];
        let n = self.period as f64;

        let mut avg_gain = initial.iter().filter(|&&c| c > 0.0).sum::<f64>() / n;
        let mut avg_loss = initial.iter().filter(|&&c| c < 0.0).map(|c| c.abs()).sum::<f64>() / n;

        for &change in &changes[self.period..] {
            avg_gain = (avg_gain * (n - 1.0) + change.max(0.0)) / n;
            avg_loss = (avg_loss * (n - 1.0) + (-change).max(0.0)) / n;
        }

        if avg_loss == 0.0 {
            return Some(100.0);
        }
        let rs = avg_gain / avg_loss;
        Some(100.0 - 100.0 / (1.0 + rs))
    }

    pub fn zone(&self, closes: &[f64]) -> Option<RsiZone> {
        let value = self.compute(closes)?;
        Some(if value >= self.overbought {
            RsiZone::Overbought
        } else if value <= self.oversold {
            RsiZone::Oversold
        } else {
            RsiZone::Neutral
        })
    }
}
