use std::sync::Arc;

use common::{Error, MarketState, OrderIntent, OrderSide, RegimeKind, Result};

use crate::config::StrategyConfig;
use crate::indicators::{sma_series, Cross, EmaCross, RsiIndicator, RsiZone};
use crate::{Strategy, StrategyParams};

/// Build a strategy instance from its config entry.
///
/// Parameters are taken as configured, never defaulted: a missing required
/// parameter surfaces later as `IncompatibleStrategy` in the capability check.
pub fn build_strategy(cfg: &StrategyConfig) -> Result<Arc<dyn Strategy>> {
    let base = Base {
        name: cfg.name.clone(),
        symbol: cfg.symbol.clone(),
        regime: cfg.regime,
        quantity: cfg.quantity,
        params: cfg.numeric_params()?,
    };
    match cfg.strategy_type.as_str() {
        "ema_crossover" => Ok(Arc::new(EmaCrossover { base })),
        "bear_rsi" => Ok(Arc::new(BearRsi { base })),
        "range_reversion" => Ok(Arc::new(RangeReversion { base })),
        other => Err(Error::Config(format!(
            "strategy '{}': unknown type '{other}'",
            cfg.name
        ))),
    }
}

// ─── Shared plumbing ──────────────────────────────────────────────────────────

struct Base {
    name: String,
    symbol: String,
    regime: RegimeKind,
    quantity: f64,
    params: StrategyParams,
}

impl Base {
    fn param(&self, key: &str) -> Result<f64> {
        self.params
            .get(key)
            .copied()
            .ok_or_else(|| Error::StrategyRuntime {
                strategy: self.name.clone(),
                reason: format!("parameter '{key}' not configured"),
            })
    }

    fn period(&self, key: &str) -> Result<usize> {
        let value = self.param(key)?;
        if !is_period(value) {
            return Err(Error::StrategyRuntime {
                strategy: self.name.clone(),
                reason: format!("parameter '{key}' must be a whole number >= 1, got {value}"),
            });
        }
        Ok(value as usize)
    }

    fn period_or(&self, key: &str, fallback: usize) -> usize {
        self.params
            .get(key)
            .filter(|v| is_period(**v))
            .map(|v| *v as usize)
            .unwrap_or(fallback)
    }

    fn check_periods(&self, keys: &[&str]) -> std::result::Result<(), String> {
        for key in keys {
            self.period(key).map_err(|e| match e {
                Error::StrategyRuntime { reason, .. } => reason,
                other => other.to_string(),
            })?;
        }
        Ok(())
    }

    fn order(&self, side: OrderSide, quantity: f64) -> Option<OrderIntent> {
        if quantity <= 0.0 {
            return None;
        }
        Some(OrderIntent::market(&self.name, &self.symbol, side, quantity))
    }
}

/// A whole number of bars, at least one.
fn is_period(value: f64) -> bool {
    value >= 1.0 && value.fract() == 0.0
}

// ─── EMA crossover (trend following, long only) ──────────────────────────────

/// Buys on a golden cross, closes the long on a death cross.
struct EmaCrossover {
    base: Base,
}

impl Strategy for EmaCrossover {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn symbol(&self) -> &str {
        &self.base.symbol
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        &["short_period", "long_period"]
    }

    fn parameters(&self) -> &StrategyParams {
        &self.base.params
    }

    fn regime_affinity(&self) -> RegimeKind {
        self.base.regime
    }

    fn warmup_bars(&self) -> usize {
        self.base.period_or("long_period", 1) + 1
    }

    fn validate(&self) -> std::result::Result<(), String> {
        self.base.check_periods(&["short_period", "long_period"])?;
        let short = self.base.param("short_period").map_err(|e| e.to_string())?;
        let long = self.base.param("long_period").map_err(|e| e.to_string())?;
        if short < 1.0 || short >= long {
            return Err(format!("short_period ({short}) must be >= 1 and below long_period ({long})"));
        }
        Ok(())
    }

    fn generate_signal(&self, state: &MarketState) -> Result<Option<OrderIntent>> {
        let cross = EmaCross::new(
            self.base.period("short_period")?,
            self.base.period("long_period")?,
        );
        let Some(signal) = cross.compute(&state.closes()) else {
            return Ok(None);
        };

        Ok(match signal {
            Cross::Golden if state.position <= 0.0 => {
                self.base.order(OrderSide::Buy, self.base.quantity - state.position)
            }
            Cross::Death if state.position > 0.0 => {
                self.base.order(OrderSide::Sell, state.position)
            }
            _ => None,
        })
    }
}

// ─── Bear RSI (sells rallies in a falling market, long only) ─────────────────

/// Sells the held position when the SMA is falling and RSI is overbought;
/// buys back once RSI turns oversold. Never opens a short.
struct BearRsi {
    base: Base,
}

impl BearRsi {
    const DEFAULT_OVERSOLD: f64 = 30.0;
}

impl Strategy for BearRsi {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn symbol(&self) -> &str {
        &self.base.symbol
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        &["sma_period", "rsi_period", "overbought"]
    }

    fn parameters(&self) -> &StrategyParams {
        &self.base.params
    }

    fn regime_affinity(&self) -> RegimeKind {
        self.base.regime
    }

    fn warmup_bars(&self) -> usize {
        (self.base.period_or("sma_period", 1) + 1).max(self.base.period_or("rsi_period", 1) + 1)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        self.base.check_periods(&["sma_period", "rsi_period"])?;
        let overbought = self.base.param("overbought").map_err(|e| e.to_string())?;
        let oversold = self.base.params.get("oversold").copied().unwrap_or(Self::DEFAULT_OVERSOLD);
        if !(0.0..=100.0).contains(&overbought) || oversold >= overbought {
            return Err(format!("need 0 <= oversold ({oversold}) < overbought ({overbought}) <= 100"));
        }
        Ok(())
    }

    fn generate_signal(&self, state: &MarketState) -> Result<Option<OrderIntent>> {
        let sma_period = self.base.period("sma_period")?;
        let rsi = RsiIndicator::new(
            self.base.period("rsi_period")?,
            self.base.param("overbought")?,
            self.base.params.get("oversold").copied().unwrap_or(Self::DEFAULT_OVERSOLD),
        );

        let closes = state.closes();
        let sma = sma_series(&closes, sma_period);
        let (Some(zone), [.., prev, last]) = (rsi.zone(&closes), sma.as_slice()) else {
            return Ok(None);
        };
        let falling = last < prev;

        Ok(match zone {
            RsiZone::Overbought if falling && state.position > 0.0 => {
                self.base.order(OrderSide::Sell, state.position)
            }
            RsiZone::Oversold if state.position <= 0.0 => {
                self.base.order(OrderSide::Buy, self.base.quantity - state.position)
            }
            _ => None,
        })
    }
}

// ─── Range reversion (sideways markets) ──────────────────────────────────────

/// Buys near the rolling support, sells near the rolling resistance.
struct RangeReversion {
    base: Base,
}

impl Strategy for RangeReversion {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn symbol(&self) -> &str {
        &self.base.symbol
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        &["lookback", "band"]
    }

    fn parameters(&self) -> &StrategyParams {
        &self.base.params
    }

    fn regime_affinity(&self) -> RegimeKind {
        self.base.regime
    }

    fn warmup_bars(&self) -> usize {
        self.base.period_or("lookback", 1) + 1
    }

    fn validate(&self) -> std::result::Result<(), String> {
        self.base.check_periods(&["lookback"])?;
        let band = self.base.param("band").map_err(|e| e.to_string())?;
        if !(0.0..0.5).contains(&band) {
            return Err(format!("band must be in [0, 0.5), got {band}"));
        }
        Ok(())
    }

    fn generate_signal(&self, state: &MarketState) -> Result<Option<OrderIntent>> {
        let lookback = self.base.period("lookback")?;
        let band = self.base.param("band")?;
        let bars = &state.bars;
        if bars.len() < lookback + 1 {
            return Ok(None);
        }

        // Range is taken from the bars before the current one.
        let window = &bars[bars.len() - 1 - lookback..bars.len() - 1];
        let support = window.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
        let resistance = window.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
        let Some(price) = state.last_price() else {
            return Ok(None);
        };

        Ok(if price <= support * (1.0 + band) && state.position <= 0.0 {
            self.base.order(OrderSide::Buy, self.base.quantity - state.position)
        } else if price >= resistance * (1.0 - band) && state.position > 0.0 {
            self.base.order(OrderSide::Sell, state.position)
        } else {
            None
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check_capabilities;
    use chrono::{Duration, TimeZone, Utc};
    use common::Bar;

    fn cfg(kind: &str, regime: RegimeKind, params: &[(&str, f64)]) -> StrategyConfig {
        StrategyConfig {
            strategy_type: kind.into(),
            name: format!("{kind}-test"),
            symbol: "BTCUSDT".into(),
            regime,
            quantity: 1.0,
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), toml::Value::Float(*v)))
                .collect(),
        }
    }

    fn state(closes: &[f64], position: f64) -> MarketState {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let bars = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                timestamp: start + Duration::days(i as i64),
                open: c,
                high: c * 1.001,
                low: c * 0.999,
                close: c,
                volume: 100.0,
            })
            .collect();
        MarketState {
            position,
            ..MarketState::new("BTCUSDT", bars)
        }
    }

    #[test]
    fn unknown_type_is_a_config_error() {
        let err = build_strategy(&cfg("martingale", RegimeKind::Bull, &[])).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_params_fail_capability_check_not_build() {
        let s = build_strategy(&cfg("ema_crossover", RegimeKind::Bull, &[])).unwrap();
        assert!(matches!(
            check_capabilities(s.as_ref(), RegimeKind::Bull),
            Err(Error::IncompatibleStrategy { .. })
        ));
    }

    #[test]
    fn inverted_ema_periods_fail_validation() {
        let s = build_strategy(&cfg(
            "ema_crossover",
            RegimeKind::Bull,
            &[("short_period", 50.0), ("long_period", 20.0)],
        ))
        .unwrap();
        assert!(check_capabilities(s.as_ref(), RegimeKind::Bull).is_err());
    }

    #[test]
    fn ema_buys_on_golden_cross_and_sells_position_on_death_cross() {
        let s = build_strategy(&cfg(
            "ema_crossover",
            RegimeKind::Bull,
            &[("short_period", 2.0), ("long_period", 5.0)],
        ))
        .unwrap();

        let mut up: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        up.push(140.0);
        let buy = s.generate_signal(&state(&up, 0.0)).unwrap().unwrap();
        assert_eq!(buy.side, OrderSide::Buy);
        assert_eq!(buy.quantity, 1.0);

        let mut down: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        down.push(60.0);
        let sell = s.generate_signal(&state(&down, 0.4)).unwrap().unwrap();
        assert_eq!(sell.side, OrderSide::Sell);
        assert_eq!(sell.quantity, 0.4);

        // Death cross with nothing held: nothing to do.
        assert!(s.generate_signal(&state(&down, 0.0)).unwrap().is_none());
    }

    #[test]
    fn ema_without_params_reports_runtime_error() {
        let s = build_strategy(&cfg("ema_crossover", RegimeKind::Bull, &[])).unwrap();
        let err = s.generate_signal(&state(&[1.0; 10], 0.0)).unwrap_err();
        assert!(matches!(err, Error::StrategyRuntime { .. }));
    }

    #[test]
    fn bear_rsi_sells_held_position_into_overbought_rally() {
        let s = build_strategy(&cfg(
            "bear_rsi",
            RegimeKind::Bear,
            &[("sma_period", 20.0), ("rsi_period", 3.0), ("overbought", 70.0)],
        ))
        .unwrap();
        // Long decline keeps the SMA falling; a sharp rally pushes RSI up.
        let mut closes: Vec<f64> = (0..30).map(|i| 200.0 - i as f64 * 3.0).collect();
        closes.extend([125.0, 137.0, 150.0]);
        let intent = s.generate_signal(&state(&closes, 0.7)).unwrap().unwrap();
        assert_eq!(intent.side, OrderSide::Sell);
        assert_eq!(intent.quantity, 0.7);

        // Nothing held: no short is opened
        assert!(s.generate_signal(&state(&closes, 0.0)).unwrap().is_none());
    }

    #[test]
    fn bear_rsi_buys_back_when_oversold() {
        let s = build_strategy(&cfg(
            "bear_rsi",
            RegimeKind::Bear,
            &[("sma_period", 5.0), ("rsi_period", 3.0), ("overbought", 70.0)],
        ))
        .unwrap();
        let closes: Vec<f64> = (0..20).map(|i| 200.0 - i as f64 * 2.0).collect();
        let intent = s.generate_signal(&state(&closes, 0.0)).unwrap().unwrap();
        assert_eq!(intent.side, OrderSide::Buy);
        assert_eq!(intent.quantity, 1.0);

        // Already holding: nothing more to buy
        assert!(s.generate_signal(&state(&closes, 1.0)).unwrap().is_none());
    }

    #[test]
    fn fractional_periods_fail_validation() {
        for (kind, regime, params) in [
            (
                "ema_crossover",
                RegimeKind::Bull,
                vec![("short_period", 14.7), ("long_period", 50.0)],
            ),
            (
                "bear_rsi",
                RegimeKind::Bear,
                vec![("sma_period", 20.0), ("rsi_period", 14.5), ("overbought", 70.0)],
            ),
            ("range_reversion", RegimeKind::Sideways, vec![("lookback", 30.2), ("band", 0.02)]),
        ] {
            let s = build_strategy(&cfg(kind, regime, &params)).unwrap();
            match check_capabilities(s.as_ref(), regime) {
                Err(Error::IncompatibleStrategy { reason, .. }) => {
                    assert!(reason.contains("whole number"), "{kind}: {reason}")
                }
                other => panic!("{kind}: expected incompatible, got {other:?}"),
            }
            // Signal generation refuses to truncate the period as well
            assert!(matches!(
                s.generate_signal(&state(&[100.0; 60], 0.0)),
                Err(Error::StrategyRuntime { .. })
            ));
        }

        let whole = build_strategy(&cfg(
            "ema_crossover",
            RegimeKind::Bull,
            &[("short_period", 14.0), ("long_period", 50.0)],
        ))
        .unwrap();
        assert!(check_capabilities(whole.as_ref(), RegimeKind::Bull).is_ok());
    }

    #[test]
    fn range_reversion_trades_the_band_edges() {
        let s = build_strategy(&cfg(
            "range_reversion",
            RegimeKind::Sideways,
            &[("lookback", 5.0), ("band", 0.01)],
        ))
        .unwrap();
        let mut closes = vec![100.0, 104.0, 101.0, 103.0, 102.0];
        closes.push(99.95);
        let buy = s.generate_signal(&state(&closes, 0.0)).unwrap().unwrap();
        assert_eq!(buy.side, OrderSide::Buy);

        closes.pop();
        closes.push(104.0);
        let sell = s.generate_signal(&state(&closes, 1.0)).unwrap().unwrap();
        assert_eq!(sell.side, OrderSide::Sell);
        assert_eq!(sell.quantity, 1.0);

        closes.pop();
        closes.push(102.0);
        assert!(s.generate_signal(&state(&closes, 0.0)).unwrap().is_none());
    }
}
