use backtest::evaluate;
use chrono::{TimeZone, Utc};
use common::{ApprovalThresholds, LifecycleState, PerformanceReport, RegimeKind, TimeRange};
use proptest::prelude::*;
use uuid::Uuid;

fn report(sharpe: f64, drawdown: f64, win_rate: f64, trades: usize) -> PerformanceReport {
    let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    PerformanceReport {
        id: Uuid::new_v4(),
        strategy: "prop".into(),
        regime: RegimeKind::Bull,
        range: TimeRange { start: t, end: t },
        sharpe_ratio: sharpe,
        max_drawdown: drawdown,
        win_rate,
        trade_count: trades,
        total_return: 0.0,
        bars_in_regime: 100,
        total_bars: 100,
        partial_fills: 0,
        signal_errors: 0,
        equity_curve: Vec::new(),
        created_at: t,
    }
}

fn thresholds() -> impl Strategy<Value = ApprovalThresholds> {
    (-1.0f64..3.0, 0.0f64..1.0, 0.0f64..1.0, 0usize..50).prop_map(
        |(min_sharpe, max_drawdown, min_win_rate, min_trades)| ApprovalThresholds {
            min_sharpe,
            max_drawdown,
            min_win_rate,
            min_trades,
        },
    )
}

proptest! {
    /// A report at least as good on every metric as an approved one is approved.
    #[test]
    fn approval_is_monotonic(
        t in thresholds(),
        sharpe in -3.0f64..5.0,
        drawdown in 0.0f64..1.0,
        win_rate in 0.0f64..1.0,
        trades in 0usize..100,
        d_sharpe in 0.0f64..2.0,
        d_drawdown in 0.0f64..1.0,
        d_win in 0.0f64..1.0,
        d_trades in 0usize..50,
    ) {
        let b = report(sharpe, drawdown, win_rate, trades);
        let a = report(
            sharpe + d_sharpe,
            (drawdown - d_drawdown).max(0.0),
            (win_rate + d_win).min(1.0),
            trades + d_trades,
        );
        if evaluate(&b, &t) == LifecycleState::Approved {
            prop_assert_eq!(evaluate(&a, &t), LifecycleState::Approved);
        }
    }

    /// A report with no closed trades is never approved, whatever the thresholds.
    #[test]
    fn zero_trades_never_approve(t in thresholds(), sharpe in -3.0f64..10.0) {
        prop_assert_eq!(evaluate(&report(sharpe, 0.0, 1.0, 0), &t), LifecycleState::Trash);
    }
}
