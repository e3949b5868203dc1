use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::{Bar, FeatureVector, RegimeKind, RegimeLabel, RegimeSnapshot, Result};

use crate::features::FeatureExtractor;

/// Windows and thresholds for regime classification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub short_window: usize,
    pub long_window: usize,
    pub atr_window: usize,
    /// ATR as a fraction of price at or above which the market is volatile.
    pub volatility_threshold: f64,
    /// Inflation rate at or above which the regime is inflationary.
    pub inflation_threshold: f64,
    /// SMA spread (fraction of the long SMA) at which trend confidence saturates.
    pub trend_saturation: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            short_window: 50,
            long_window: 200,
            atr_window: 14,
            volatility_threshold: 0.05,
            inflation_threshold: 0.05,
            trend_saturation: 0.05,
        }
    }
}

/// Pure mapping from features to a regime label.
///
/// Rule order: inflationary, volatile, then the SMA crossover decides bull,
/// bear or sideways. Identical input always yields an identical label.
#[derive(Debug, Clone, Default)]
pub struct RegimeClassifier {
    cfg: ClassifierConfig,
}

impl RegimeClassifier {
    pub fn new(cfg: ClassifierConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.cfg
    }

    pub fn extractor(&self) -> FeatureExtractor {
        FeatureExtractor {
            short_window: self.cfg.short_window,
            long_window: self.cfg.long_window,
            atr_window: self.cfg.atr_window,
        }
    }

    pub fn required_bars(&self) -> usize {
        self.extractor().required_bars()
    }

    pub fn classify(&self, timestamp: DateTime<Utc>, features: &FeatureVector) -> RegimeSnapshot {
        RegimeSnapshot {
            timestamp,
            label: self.label(features),
            features: features.clone(),
        }
    }

    /// Extract features from `bars` and classify at the last bar's timestamp.
    pub fn classify_bars(&self, bars: &[Bar], inflation_rate: Option<f64>) -> Result<RegimeSnapshot> {
        let features = self.extractor().extract(bars, inflation_rate)?;
        // extract() guarantees a non-empty window
        let timestamp = bars.last().map(|b| b.timestamp).unwrap_or_default();
        Ok(self.classify(timestamp, &features))
    }

    fn label(&self, f: &FeatureVector) -> RegimeLabel {
        let cfg = &self.cfg;

        if let Some(rate) = f.inflation_rate {
            if rate >= cfg.inflation_threshold {
                return RegimeLabel::new(
                    RegimeKind::Inflationary,
                    past_boundary(rate, cfg.inflation_threshold, cfg.inflation_threshold),
                );
            }
        }

        if f.atr_pct >= cfg.volatility_threshold {
            return RegimeLabel::new(
                RegimeKind::Volatile,
                past_boundary(f.atr_pct, cfg.volatility_threshold, cfg.volatility_threshold),
            );
        }

        let spread = if f.sma_long > 0.0 {
            (f.sma_short - f.sma_long) / f.sma_long
        } else {
            0.0
        };

        if f.sma_short > f.sma_long && f.close > f.sma_short {
            RegimeLabel::new(RegimeKind::Bull, past_boundary(spread, 0.0, cfg.trend_saturation))
        } else if f.sma_short < f.sma_long && f.close < f.sma_short {
            RegimeLabel::new(RegimeKind::Bear, past_boundary(-spread, 0.0, cfg.trend_saturation))
        } else {
            let strength = saturate(spread.abs(), cfg.trend_saturation);
            RegimeLabel::new(RegimeKind::Sideways, 1.0 - 0.5 * strength)
        }
    }
}

/// 0.5 at the boundary, rising linearly to 1.0 once `value` is `scale` past it.
fn past_boundary(value: f64, boundary: f64, scale: f64) -> f64 {
    0.5 + 0.5 * saturate(value - boundary, scale)
}

fn saturate(x: f64, scale: f64) -> f64 {
    if scale <= 0.0 {
        return 1.0;
    }
    (x / scale).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn features(close: f64, sma_short: f64, sma_long: f64, atr_pct: f64) -> FeatureVector {
        FeatureVector {
            close,
            sma_short,
            sma_long,
            atr_pct,
            inflation_rate: None,
        }
    }

    fn kind(f: &FeatureVector) -> RegimeKind {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        RegimeClassifier::default().classify(ts, f).kind()
    }

    #[test]
    fn sma_crossover_rules() {
        assert_eq!(kind(&features(110.0, 105.0, 100.0, 0.01)), RegimeKind::Bull);
        assert_eq!(kind(&features(90.0, 95.0, 100.0, 0.01)), RegimeKind::Bear);
        // Short above long but price back below the short SMA
        assert_eq!(kind(&features(104.0, 105.0, 100.0, 0.01)), RegimeKind::Sideways);
        assert_eq!(kind(&features(100.0, 100.0, 100.0, 0.01)), RegimeKind::Sideways);
    }

    #[test]
    fn volatility_overrides_trend() {
        assert_eq!(kind(&features(110.0, 105.0, 100.0, 0.08)), RegimeKind::Volatile);
    }

    #[test]
    fn inflation_overrides_everything() {
        let mut f = features(110.0, 105.0, 100.0, 0.08);
        f.inflation_rate = Some(0.07);
        assert_eq!(kind(&f), RegimeKind::Inflationary);
        f.inflation_rate = Some(0.02);
        assert_eq!(kind(&f), RegimeKind::Volatile);
    }

    #[test]
    fn confidence_grows_with_trend_strength() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let c = RegimeClassifier::default();
        let weak = c.classify(ts, &features(102.0, 101.0, 100.0, 0.01)).label.confidence();
        let strong = c.classify(ts, &features(120.0, 110.0, 100.0, 0.01)).label.confidence();
        assert!(weak < strong);
        assert!((0.5..=1.0).contains(&weak));
        assert_eq!(strong, 1.0);
    }

    #[test]
    fn classify_bars_reports_insufficient_history() {
        let c = RegimeClassifier::default();
        let bars: Vec<Bar> = (0..50)
            .map(|i| Bar {
                timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                    + chrono::Duration::days(i),
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 1.0,
            })
            .collect();
        assert!(matches!(
            c.classify_bars(&bars, None),
            Err(common::Error::InsufficientData { needed: 200, available: 50 })
        ));
    }
}
