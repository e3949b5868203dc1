use common::Bar;

/// Average true range over the last `period` bars.
/// Needs `period + 1` bars since each true range looks at the prior close.
pub fn atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }
    let tail = &bars[bars.len() - period - 1..];
    let sum: f64 = tail
        .windows(2)
        .map(|w| {
            let (prev, bar) = (&w[0], &w[1]);
            (bar.high - bar.low)
                .max((bar.high - prev.close).abs())
                .max((bar.low - prev.close).abs())
        })
        .sum();
    Some(sum / period as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bar(high: f64, low: f64, close: f64) -> Bar {
        Bar {
            timestamp: Utc::now(),
            open: close,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn atr_needs_period_plus_one_bars() {
        let bars = vec![bar(11.0, 9.0, 10.0); 3];
        assert!(atr(&bars, 3).is_none());
        assert_eq!(atr(&bars, 2), Some(2.0));
    }

    #[test]
    fn gap_counts_toward_true_range() {
        let bars = vec![bar(11.0, 9.0, 10.0), bar(21.0, 19.0, 20.0)];
        // |high - prev close| = 11 dominates the 2.0 intrabar range
        assert_eq!(atr(&bars, 1), Some(11.0));
    }
}
