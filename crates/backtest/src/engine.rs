use std::panic::{catch_unwind, AssertUnwindSafe};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::config::FillSettings;
use common::{
    Bar, EquityPoint, Error, FillRecord, MarketState, OrderIntent, OrderSide, PerformanceReport,
    RegimeKind, Result, TimeRange,
};
use regime::RegimeSeries;
use strategy::{check_capabilities, CancelFlag, Strategy};

use crate::metrics;

const EPS: f64 = 1e-9;

/// How simulated orders reach the market.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillModel {
    pub slippage_bps: f64,
    /// Bars between a signal and the first bar it can fill on. Values below 1
    /// are treated as 1: a signal never fills on the bar that produced it.
    pub latency_bars: usize,
    /// Fraction of each bar's volume available to this strategy's orders.
    pub max_participation: f64,
    /// Bars an order stays working before the unfilled rest is cancelled.
    pub order_ttl_bars: usize,
}

impl Default for FillModel {
    fn default() -> Self {
        Self {
            slippage_bps: 10.0,
            latency_bars: 1,
            max_participation: 0.1,
            order_ttl_bars: 5,
        }
    }
}

impl From<FillSettings> for FillModel {
    fn from(s: FillSettings) -> Self {
        Self {
            slippage_bps: s.slippage_bps,
            latency_bars: s.latency_bars,
            max_participation: s.max_participation,
            ..Self::default()
        }
    }
}

impl FillModel {
    /// Buys pay more, sells receive less.
    fn slipped(&self, side: OrderSide, price: f64) -> f64 {
        price * (1.0 + side.sign() * self.slippage_bps / 10_000.0)
    }
}

/// An order waiting for liquidity.
#[derive(Debug, Clone)]
struct WorkingOrder {
    side: OrderSide,
    requested: f64,
    remaining: f64,
    limit: Option<f64>,
    active_from: usize,
    expires_at: usize,
    /// Forced exit after the regime moved away.
    flatten: bool,
}

impl WorkingOrder {
    fn from_intent(intent: &OrderIntent, active_from: usize, ttl: usize) -> Option<Self> {
        let qty_ok = intent.quantity.is_finite() && intent.quantity > 0.0;
        let limit_ok = intent.limit_price.map_or(true, |p| p.is_finite() && p > 0.0);
        (qty_ok && limit_ok).then(|| Self {
            side: intent.side,
            requested: intent.quantity,
            remaining: intent.quantity,
            limit: intent.limit_price,
            active_from,
            expires_at: active_from + ttl - 1,
            flatten: false,
        })
    }

    fn flatten(position: f64, active_from: usize, ttl: usize) -> Self {
        let side = if position > 0.0 { OrderSide::Sell } else { OrderSide::Buy };
        Self {
            side,
            requested: position.abs(),
            remaining: position.abs(),
            limit: None,
            active_from,
            expires_at: active_from + ttl - 1,
            flatten: true,
        }
    }
}

/// Cash, net position and round-trip bookkeeping.
#[derive(Debug)]
struct Ledger {
    cash: f64,
    position: f64,
    avg_price: f64,
    trip_pnl: f64,
    round_trips: Vec<f64>,
}

impl Ledger {
    fn new(cash: f64) -> Self {
        Self {
            cash,
            position: 0.0,
            avg_price: 0.0,
            trip_pnl: 0.0,
            round_trips: Vec::new(),
        }
    }

    fn equity(&self, mark: f64) -> f64 {
        self.cash + self.position * mark
    }

    fn apply(&mut self, side: OrderSide, qty: f64, price: f64) {
        let signed = side.sign() * qty;
        self.cash -= signed * price;

        let held = self.position.abs();
        if held <= EPS || self.position.signum() == signed.signum() {
            self.avg_price = (self.avg_price * held + price * qty) / (held + qty);
            self.position += signed;
            return;
        }

        let closing = qty.min(held);
        self.trip_pnl += closing * (price - self.avg_price) * self.position.signum();
        if held - closing <= EPS {
            self.round_trips.push(std::mem::take(&mut self.trip_pnl));
            self.position = 0.0;
            self.avg_price = 0.0;
            let rest = qty - closing;
            if rest > EPS {
                self.position = side.sign() * rest;
                self.avg_price = price;
            }
        } else {
            self.position += signed;
        }
    }
}

/// Replays one strategy over a labelled bar series.
///
/// The strategy is only asked for signals on bars labelled with the regime
/// under test. Orders fill with latency, slippage and a per-bar volume cap;
/// leaving the regime flattens any open position on the following bars.
#[derive(Debug, Clone)]
pub struct BacktestEngine {
    pub fills: FillModel,
    pub initial_capital: f64,
    /// Used to annualize the Sharpe ratio (365 for daily crypto bars).
    pub periods_per_year: f64,
    /// Most bars of history handed to a strategy per call.
    pub max_history: usize,
}

impl Default for BacktestEngine {
    fn default() -> Self {
        Self::new(FillModel::default())
    }
}

impl BacktestEngine {
    pub fn new(fills: FillModel) -> Self {
        Self {
            fills,
            initial_capital: 10_000.0,
            periods_per_year: 365.0,
            max_history: 500,
        }
    }

    pub fn with_capital(mut self, capital: f64) -> Self {
        self.initial_capital = capital;
        self
    }

    pub fn with_periods_per_year(mut self, periods: f64) -> Self {
        self.periods_per_year = periods;
        self
    }

    /// Run a backtest. The capability check happens before anything else.
    ///
    /// Errors: `IncompatibleStrategy`, `InsufficientData` for an empty series
    /// or one with no bar in `regime`, `SpanMismatch` when a label has no
    /// matching bar, `Cancelled` once `cancel` is raised.
    pub fn run(
        &self,
        strategy: &dyn Strategy,
        regime: RegimeKind,
        series: &RegimeSeries,
        cancel: &CancelFlag,
    ) -> Result<PerformanceReport> {
        check_capabilities(strategy, regime)?;

        let labels = align(series)?;
        let bars = &series.bars;
        let bars_in_regime = labels.iter().filter(|l| **l == Some(regime)).count();
        if bars_in_regime == 0 {
            return Err(Error::InsufficientData {
                needed: 1,
                available: 0,
            });
        }

        let latency = self.fills.latency_bars.max(1);
        let ttl = self.fills.order_ttl_bars.max(1);
        let history = self.max_history.max(strategy.warmup_bars()).max(1);

        let mut ledger = Ledger::new(self.initial_capital);
        let mut working: Vec<WorkingOrder> = Vec::new();
        let mut curve = Vec::with_capacity(bars.len());
        let mut partial_fills = 0;
        let mut signal_errors = 0;

        for (i, bar) in bars.iter().enumerate() {
            if cancel.is_cancelled() {
                debug!(strategy = %strategy.name(), bar = i, "Backtest cancelled");
                return Err(Error::Cancelled);
            }

            let fills = self.execute(&mut working, &mut ledger, i, bar);
            partial_fills += fills.iter().filter(|f| f.is_partial()).count();

            if labels[i] == Some(regime) {
                working.retain(|o| !o.flatten);
                let state = MarketState {
                    symbol: strategy.symbol().to_string(),
                    bars: bars[(i + 1).saturating_sub(history)..=i].to_vec(),
                    regime: labels[i],
                    position: ledger.position,
                };
                match catch_unwind(AssertUnwindSafe(|| strategy.generate_signal(&state))) {
                    Ok(Ok(Some(intent))) => match WorkingOrder::from_intent(&intent, i + latency, ttl) {
                        Some(order) => working.push(order),
                        None => {
                            signal_errors += 1;
                            debug!(strategy = %strategy.name(), ?intent, "Malformed order intent dropped");
                        }
                    },
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => {
                        signal_errors += 1;
                        debug!(strategy = %strategy.name(), bar = i, error = %e, "Signal error");
                    }
                    Err(_) => {
                        signal_errors += 1;
                        warn!(strategy = %strategy.name(), bar = i, "Strategy panicked during backtest");
                    }
                }
            } else {
                working.retain(|o| o.flatten);
                if ledger.position.abs() > EPS && working.is_empty() {
                    working.push(WorkingOrder::flatten(ledger.position, i + 1, ttl));
                }
            }

            curve.push(EquityPoint {
                timestamp: bar.timestamp,
                equity: ledger.equity(bar.close),
                position: ledger.position,
                fills,
            });
        }

        let equity: Vec<f64> = curve.iter().map(|p| p.equity).collect();
        let last_equity = equity.last().copied().unwrap_or(self.initial_capital);
        let report = PerformanceReport {
            id: Uuid::new_v4(),
            strategy: strategy.name().to_string(),
            regime,
            range: TimeRange {
                start: bars[0].timestamp,
                end: bars[bars.len() - 1].timestamp,
            },
            sharpe_ratio: metrics::sharpe_ratio(&metrics::returns(&equity), self.periods_per_year),
            max_drawdown: metrics::max_drawdown(&equity),
            win_rate: metrics::win_rate(&ledger.round_trips),
            trade_count: ledger.round_trips.len(),
            total_return: metrics::total_return(self.initial_capital, last_equity),
            bars_in_regime,
            total_bars: bars.len(),
            partial_fills,
            signal_errors,
            equity_curve: curve,
            created_at: Utc::now(),
        };

        info!(
            strategy = %report.strategy,
            %regime,
            sharpe = report.sharpe_ratio,
            drawdown = report.max_drawdown,
            win_rate = report.win_rate,
            trades = report.trade_count,
            coverage = report.coverage(),
            "Backtest complete"
        );
        Ok(report)
    }

    /// Fill whatever working orders the bar allows, then drop finished and
    /// expired ones.
    fn execute(
        &self,
        working: &mut Vec<WorkingOrder>,
        ledger: &mut Ledger,
        i: usize,
        bar: &Bar,
    ) -> Vec<FillRecord> {
        let mut capacity = if bar.volume > 0.0 {
            self.fills.max_participation * bar.volume
        } else {
            0.0
        };
        let mut fills = Vec::new();

        for order in working.iter_mut().filter(|o| o.active_from <= i) {
            let Some(price) = self.fill_price(order, bar) else {
                continue;
            };
            let qty = order.remaining.min(capacity);
            if qty <= EPS {
                continue;
            }
            capacity -= qty;
            order.remaining -= qty;
            ledger.apply(order.side, qty, price);
            debug!(side = %order.side, qty, price, remaining = order.remaining, "Backtest fill");
            fills.push(FillRecord {
                side: order.side,
                requested_quantity: order.requested,
                filled_quantity: qty,
                price,
            });
        }

        working.retain(|o| {
            if o.remaining <= EPS {
                return false;
            }
            if o.active_from <= i && i >= o.expires_at {
                debug!(side = %o.side, unfilled = o.remaining, "Working order expired");
                return false;
            }
            true
        });
        fills
    }

    fn fill_price(&self, order: &WorkingOrder, bar: &Bar) -> Option<f64> {
        match (order.limit, order.side) {
            (None, side) => Some(self.fills.slipped(side, bar.open)),
            (Some(limit), OrderSide::Buy) => (bar.low <= limit).then(|| bar.open.min(limit)),
            (Some(limit), OrderSide::Sell) => (bar.high >= limit).then(|| bar.open.max(limit)),
        }
    }
}

/// Map each bar to its regime label. Labels must land exactly on bar
/// timestamps; bars before the first label stay unlabelled.
fn align(series: &RegimeSeries) -> Result<Vec<Option<RegimeKind>>> {
    let bars = &series.bars;
    if bars.is_empty() {
        return Err(Error::InsufficientData {
            needed: 1,
            available: 0,
        });
    }
    if bars.windows(2).any(|w| w[1].timestamp <= w[0].timestamp) {
        return Err(Error::SpanMismatch("bars are not strictly increasing".into()));
    }

    let mut labels = vec![None; bars.len()];
    let mut i = 0;
    for snapshot in &series.snapshots {
        while i < bars.len() && bars[i].timestamp < snapshot.timestamp {
            i += 1;
        }
        match bars.get(i) {
            Some(bar) if bar.timestamp == snapshot.timestamp => {
                labels[i] = Some(snapshot.kind());
                i += 1;
            }
            _ => {
                return Err(Error::SpanMismatch(format!(
                    "regime label at {} has no matching bar",
                    snapshot.timestamp
                )))
            }
        }
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use common::{FeatureVector, RegimeLabel, RegimeSnapshot};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strategy::StrategyParams;

    type SignalFn = dyn Fn(&MarketState) -> Result<Option<OrderIntent>> + Send + Sync;

    struct Scripted {
        regime: RegimeKind,
        params: StrategyParams,
        calls: AtomicUsize,
        signal: Box<SignalFn>,
    }

    impl Scripted {
        fn new(
            signal: impl Fn(&MarketState) -> Result<Option<OrderIntent>> + Send + Sync + 'static,
        ) -> Self {
            Self {
                regime: RegimeKind::Bull,
                params: StrategyParams::new(),
                calls: AtomicUsize::new(0),
                signal: Box::new(signal),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Strategy for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        fn symbol(&self) -> &str {
            "BTCUSDT"
        }
        fn required_parameters(&self) -> &'static [&'static str] {
            &[]
        }
        fn parameters(&self) -> &StrategyParams {
            &self.params
        }
        fn regime_affinity(&self) -> RegimeKind {
            self.regime
        }
        fn generate_signal(&self, state: &MarketState) -> Result<Option<OrderIntent>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.signal)(state)
        }
    }

    /// Buys `qty` whenever flat.
    fn buy_when_flat(qty: f64) -> Scripted {
        Scripted::new(move |s| {
            Ok((s.position == 0.0).then(|| OrderIntent::market("scripted", "BTCUSDT", OrderSide::Buy, qty)))
        })
    }

    fn bars(n: usize, volume: f64) -> Vec<Bar> {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let open = 100.0 + 10.0 * i as f64;
                Bar {
                    timestamp: t0 + Duration::days(i as i64),
                    open,
                    high: open + 6.0,
                    low: open - 1.0,
                    close: open + 5.0,
                    volume,
                }
            })
            .collect()
    }

    fn series(bars: Vec<Bar>, labels: &[Option<RegimeKind>]) -> RegimeSeries {
        let snapshots = bars
            .iter()
            .zip(labels)
            .filter_map(|(bar, label)| {
                label.map(|kind| RegimeSnapshot {
                    timestamp: bar.timestamp,
                    label: RegimeLabel::new(kind, 1.0),
                    features: FeatureVector {
                        close: bar.close,
                        sma_short: bar.close,
                        sma_long: bar.close,
                        atr_pct: 0.0,
                        inflation_rate: None,
                    },
                })
            })
            .collect();
        RegimeSeries { bars, snapshots }
    }

    const BULL: Option<RegimeKind> = Some(RegimeKind::Bull);
    const BEAR: Option<RegimeKind> = Some(RegimeKind::Bear);

    #[test]
    fn incompatible_strategy_fails_before_simulation() {
        let mut s = buy_when_flat(1.0);
        s.regime = RegimeKind::Bear;
        let err = BacktestEngine::default()
            .run(&s, RegimeKind::Bull, &RegimeSeries::default(), &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, Error::IncompatibleStrategy { .. }));
        assert_eq!(s.calls(), 0);
    }

    #[test]
    fn empty_range_is_insufficient_not_passing() {
        let err = BacktestEngine::default()
            .run(&buy_when_flat(1.0), RegimeKind::Bull, &RegimeSeries::default(), &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientData { .. }));
    }

    #[test]
    fn series_without_target_regime_is_insufficient() {
        let s = series(bars(4, 1000.0), &[BEAR, BEAR, BEAR, BEAR]);
        let err = BacktestEngine::default()
            .run(&buy_when_flat(1.0), RegimeKind::Bull, &s, &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientData { .. }));
    }

    #[test]
    fn label_off_the_bar_grid_is_span_mismatch() {
        let mut s = series(bars(3, 1000.0), &[BULL, BULL, BULL]);
        s.snapshots[1].timestamp += Duration::hours(1);
        let err = BacktestEngine::default()
            .run(&buy_when_flat(1.0), RegimeKind::Bull, &s, &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, Error::SpanMismatch(_)));
    }

    #[test]
    fn signal_fills_after_latency_with_slippage() {
        let s = series(bars(4, 1000.0), &[BULL; 4]);
        let report = BacktestEngine::default()
            .run(&buy_when_flat(1.0), RegimeKind::Bull, &s, &CancelFlag::new())
            .unwrap();

        assert!(report.equity_curve[0].fills.is_empty());
        let fill = &report.equity_curve[1].fills[0];
        assert!((fill.price - 110.0 * 1.001).abs() < 1e-9);
        assert_eq!(fill.filled_quantity, 1.0);
        assert_eq!(report.equity_curve[1].position, 1.0);
        assert_eq!(report.coverage(), 1.0);
    }

    #[test]
    fn volume_cap_produces_partial_fills_until_ttl() {
        let engine = BacktestEngine::new(FillModel {
            slippage_bps: 0.0,
            latency_bars: 1,
            max_participation: 0.1,
            order_ttl_bars: 2,
        });
        // One order for 3 units; each bar can only absorb 1.
        let fired = std::sync::atomic::AtomicBool::new(false);
        let s = Scripted::new(move |_| {
            Ok((!fired.swap(true, Ordering::SeqCst))
                .then(|| OrderIntent::market("scripted", "BTCUSDT", OrderSide::Buy, 3.0)))
        });
        let report = engine
            .run(&s, RegimeKind::Bull, &series(bars(5, 10.0), &[BULL; 5]), &CancelFlag::new())
            .unwrap();

        let fills: Vec<&FillRecord> = report.equity_curve.iter().flat_map(|p| &p.fills).collect();
        assert_eq!(fills.len(), 2);
        assert!(fills.iter().all(|f| f.requested_quantity == 3.0 && f.filled_quantity == 1.0));
        assert_eq!(report.partial_fills, 2);
        assert_eq!(report.equity_curve.last().unwrap().position, 2.0);
    }

    #[test]
    fn leaving_the_regime_flattens_and_stops_evaluation() {
        let s = buy_when_flat(1.0);
        let labelled = series(bars(5, 1000.0), &[BULL, BULL, BEAR, BEAR, BEAR]);
        let report = BacktestEngine::default()
            .run(&s, RegimeKind::Bull, &labelled, &CancelFlag::new())
            .unwrap();

        assert_eq!(s.calls(), 2);
        let exit = &report.equity_curve[3].fills[0];
        assert_eq!(exit.side, OrderSide::Sell);
        assert!((exit.price - 130.0 * 0.999).abs() < 1e-9);
        assert_eq!(report.equity_curve[3].position, 0.0);
        assert_eq!(report.trade_count, 1);
        assert_eq!(report.win_rate, 1.0);
        assert_eq!(report.bars_in_regime, 2);
        assert_eq!(report.total_bars, 5);
    }

    #[test]
    fn signal_errors_are_counted_not_fatal() {
        let s = Scripted::new(|_| {
            Err(Error::StrategyRuntime {
                strategy: "scripted".into(),
                reason: "boom".into(),
            })
        });
        let report = BacktestEngine::default()
            .run(&s, RegimeKind::Bull, &series(bars(3, 1000.0), &[BULL; 3]), &CancelFlag::new())
            .unwrap();
        assert_eq!(report.signal_errors, 3);
        assert_eq!(report.trade_count, 0);
    }

    #[test]
    fn raised_cancel_flag_aborts() {
        let flag = CancelFlag::new();
        flag.cancel();
        let err = BacktestEngine::default()
            .run(&buy_when_flat(1.0), RegimeKind::Bull, &series(bars(3, 1000.0), &[BULL; 3]), &flag)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn ledger_closes_round_trip_on_flip() {
        let mut ledger = Ledger::new(1_000.0);
        ledger.apply(OrderSide::Buy, 2.0, 10.0);
        ledger.apply(OrderSide::Sell, 3.0, 12.0);
        assert_eq!(ledger.round_trips, vec![4.0]);
        assert_eq!(ledger.position, -1.0);
        assert_eq!(ledger.avg_price, 12.0);
        assert!((ledger.equity(12.0) - 1_004.0).abs() < 1e-9);
    }
}
