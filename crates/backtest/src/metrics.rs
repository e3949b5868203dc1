/// Simple per-period returns of an equity curve. Periods starting from a
/// non-positive equity contribute zero.
pub fn returns(equity: &[f64]) -> Vec<f64> {
    equity
        .windows(2)
        .map(|w| if w[0] > 0.0 { w[1] / w[0] - 1.0 } else { 0.0 })
        .collect()
}

/// Annualized Sharpe ratio (risk-free rate 0) using the sample standard
/// deviation. Zero when there are fewer than two returns or no variance.
pub fn sharpe_ratio(returns: &[f64], periods_per_year: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std = variance.sqrt();
    if !std.is_finite() || std < 1e-12 {
        return 0.0;
    }
    mean / std * periods_per_year.sqrt()
}

/// Largest peak-to-trough decline as a fraction of the peak, in [0, 1].
pub fn max_drawdown(equity: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0f64;
    for &e in equity {
        peak = peak.max(e);
        if peak > 0.0 {
            worst = worst.max((peak - e) / peak);
        }
    }
    worst.clamp(0.0, 1.0)
}

/// Share of round trips that made money. Zero with no round trips.
pub fn win_rate(trade_pnls: &[f64]) -> f64 {
    if trade_pnls.is_empty() {
        return 0.0;
    }
    trade_pnls.iter().filter(|&&p| p > 0.0).count() as f64 / trade_pnls.len() as f64
}

pub fn total_return(initial: f64, last: f64) -> f64 {
    if initial > 0.0 {
        last / initial - 1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_curve_has_zero_sharpe_and_drawdown() {
        let curve = [100.0; 10];
        assert_eq!(sharpe_ratio(&returns(&curve), 365.0), 0.0);
        assert_eq!(max_drawdown(&curve), 0.0);
    }

    #[test]
    fn drawdown_is_measured_from_running_peak() {
        let curve = [100.0, 120.0, 90.0, 130.0, 117.0];
        assert!((max_drawdown(&curve) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn steady_gains_have_positive_sharpe() {
        let curve = [100.0, 101.0, 102.5, 103.0, 104.8, 105.0];
        assert!(sharpe_ratio(&returns(&curve), 365.0) > 0.0);
    }

    #[test]
    fn win_rate_counts_profitable_round_trips() {
        assert_eq!(win_rate(&[]), 0.0);
        assert_eq!(win_rate(&[5.0, -1.0, 2.0, 0.0]), 0.5);
    }

    #[test]
    fn total_return_relative_to_start() {
        assert!((total_return(10_000.0, 11_000.0) - 0.1).abs() < 1e-12);
    }
}
