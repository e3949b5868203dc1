use common::{Bar, Error, FeatureVector, Result};
use strategy::indicators::{atr, sma};

/// Turns a bar window into the feature vector the classifier consumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureExtractor {
    pub short_window: usize,
    pub long_window: usize,
    pub atr_window: usize,
}

impl FeatureExtractor {
    /// Bars needed to fill every indicator window.
    pub fn required_bars(&self) -> usize {
        self.long_window.max(self.short_window).max(self.atr_window + 1)
    }

    /// Fails with `InsufficientData` when `bars` cannot fill the longest window.
    pub fn extract(&self, bars: &[Bar], inflation_rate: Option<f64>) -> Result<FeatureVector> {
        let needed = self.required_bars();
        let insufficient = || Error::InsufficientData {
            needed,
            available: bars.len(),
        };
        if bars.len() < needed {
            return Err(insufficient());
        }

        let closes: Vec<f64> = bars[bars.len() - needed..].iter().map(|b| b.close).collect();
        let close = *closes.last().ok_or_else(insufficient)?;
        let sma_short = sma(&closes, self.short_window).ok_or_else(insufficient)?;
        let sma_long = sma(&closes, self.long_window).ok_or_else(insufficient)?;
        let atr_abs = atr(bars, self.atr_window).ok_or_else(insufficient)?;
        let atr_pct = if close > 0.0 { atr_abs / close } else { 0.0 };

        Ok(FeatureVector {
            close,
            sma_short,
            sma_long,
            atr_pct,
            inflation_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bars(closes: &[f64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                timestamp: start + Duration::days(i as i64),
                open: c,
                high: c + 1.0,
                low: c - 1.0,
                close: c,
                volume: 10.0,
            })
            .collect()
    }

    const EXTRACTOR: FeatureExtractor = FeatureExtractor {
        short_window: 3,
        long_window: 5,
        atr_window: 2,
    };

    #[test]
    fn short_history_is_insufficient() {
        let err = EXTRACTOR.extract(&bars(&[1.0, 2.0, 3.0, 4.0]), None).unwrap_err();
        assert!(matches!(err, Error::InsufficientData { needed: 5, available: 4 }));
    }

    #[test]
    fn features_from_trailing_windows() {
        let f = EXTRACTOR
            .extract(&bars(&[100.0, 1.0, 2.0, 3.0, 4.0, 5.0]), Some(0.03))
            .unwrap();
        assert_eq!(f.close, 5.0);
        assert_eq!(f.sma_short, 4.0);
        assert_eq!(f.sma_long, 3.0);
        assert!((f.atr_pct - 2.0 / 5.0).abs() < 1e-12);
        assert_eq!(f.inflation_rate, Some(0.03));
    }
}
