use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use common::{Error, RegimeKind, Result};

use crate::StrategyParams;

/// Top-level strategy config file (TOML).
///
/// Example `config/strategies.toml`:
/// ```toml
/// [[strategy]]
/// type = "ema_crossover"
/// name = "BTC EMA 20/50"
/// symbol = "BTCUSDT"
/// regime = "bull"
/// quantity = 0.001
///
/// [strategy.params]
/// short_period = 20
/// long_period = 50
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategyFileConfig {
    #[serde(rename = "strategy", default)]
    pub strategies: Vec<StrategyConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategyConfig {
    /// Strategy type identifier: "ema_crossover", "bear_rsi" or "range_reversion".
    #[serde(rename = "type")]
    pub strategy_type: String,
    /// Human-readable name shown in logs; unique per regime.
    pub name: String,
    /// Trading symbol, e.g. "BTCUSDT".
    pub symbol: String,
    /// Regime partition the strategy is submitted to.
    pub regime: RegimeKind,
    /// Order quantity in base asset units.
    pub quantity: f64,
    /// Indicator-specific parameters.
    #[serde(default)]
    pub params: HashMap<String, toml::Value>,
}

impl StrategyConfig {
    /// Numeric view of `params`. Integers are widened to `f64`; any other
    /// TOML type is a configuration error.
    pub fn numeric_params(&self) -> Result<StrategyParams> {
        self.params
            .iter()
            .map(|(key, value)| {
                let number = match value {
                    toml::Value::Integer(i) => *i as f64,
                    toml::Value::Float(f) => *f,
                    other => {
                        return Err(Error::Config(format!(
                            "strategy '{}': parameter '{key}' must be numeric, got {}",
                            self.name,
                            other.type_str()
                        )))
                    }
                };
                Ok((key.clone(), number))
            })
            .collect()
    }
}

impl StrategyFileConfig {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("failed to parse strategy config at '{path}': {e}")))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[strategy]]
        type = "ema_crossover"
        name = "BTC EMA"
        symbol = "BTCUSDT"
        regime = "bull"
        quantity = 0.01

        [strategy.params]
        short_period = 20
        long_period = 50.0

        [[strategy]]
        type = "bear_rsi"
        name = "BTC bear"
        symbol = "BTCUSDT"
        regime = "bear"
        quantity = 0.01
    "#;

    #[test]
    fn parses_strategy_tables() {
        let cfg = StrategyFileConfig::parse(SAMPLE).unwrap();
        assert_eq!(cfg.strategies.len(), 2);
        assert_eq!(cfg.strategies[0].regime, RegimeKind::Bull);
        assert_eq!(cfg.strategies[1].regime, RegimeKind::Bear);
        assert!(cfg.strategies[1].params.is_empty());
    }

    #[test]
    fn integer_and_float_params_become_f64() {
        let cfg = StrategyFileConfig::parse(SAMPLE).unwrap();
        let params = cfg.strategies[0].numeric_params().unwrap();
        assert_eq!(params.get("short_period"), Some(&20.0));
        assert_eq!(params.get("long_period"), Some(&50.0));
    }

    #[test]
    fn string_param_is_rejected() {
        let cfg = StrategyFileConfig::parse(
            r#"
            [[strategy]]
            type = "ema_crossover"
            name = "x"
            symbol = "BTCUSDT"
            regime = "bull"
            quantity = 1.0
            [strategy.params]
            short_period = "twenty"
            "#,
        )
        .unwrap();
        assert!(cfg.strategies[0].numeric_params().is_err());
    }

    #[test]
    fn unknown_regime_fails_to_parse() {
        let bad = SAMPLE.replace("\"bear\"", "\"crab\"");
        assert!(StrategyFileConfig::parse(&bad).is_err());
    }
}
