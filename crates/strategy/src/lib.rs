pub mod builtin;
pub mod config;
pub mod indicators;
pub mod registry;

use std::collections::BTreeMap;

pub use builtin::build_strategy;
pub use config::{StrategyConfig, StrategyFileConfig};
pub use registry::{CancelFlag, Candidate, EntrySummary, RestoreSummary, StrategyRegistry};

use common::{Error, MarketState, OrderIntent, RegimeKind, Result};

/// Numeric strategy parameters by name.
pub type StrategyParams = BTreeMap<String, f64>;

/// Capability set every tradeable strategy exposes.
///
/// Implementations must be stateless across calls: everything a signal
/// depends on arrives in the `MarketState`. That lets the same instance be
/// backtested and traded live, and lets the coordinator share it across
/// active sets.
pub trait Strategy: Send + Sync {
    /// Stable name; unique within a regime partition.
    fn name(&self) -> &str;

    /// The symbol this strategy trades (e.g. "BTCUSDT").
    fn symbol(&self) -> &str;

    /// Parameter names that must be configured for the strategy to run.
    fn required_parameters(&self) -> &'static [&'static str];

    /// Parameters as configured.
    fn parameters(&self) -> &StrategyParams;

    /// The regime this strategy is designed for.
    fn regime_affinity(&self) -> RegimeKind;

    /// Bars of history `generate_signal` needs to say anything.
    fn warmup_bars(&self) -> usize {
        1
    }

    /// Strategy-specific parameter checks beyond presence (e.g. fast < slow).
    fn validate(&self) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Evaluate the market and optionally emit an order.
    /// Errors are reported per strategy and never abort a tick.
    fn generate_signal(&self, state: &MarketState) -> Result<Option<OrderIntent>>;
}

/// Pre-flight check run before any simulation work: the strategy must
/// expose a name and symbol, target `regime`, and have every required
/// parameter configured with a finite value.
pub fn check_capabilities(strategy: &dyn Strategy, regime: RegimeKind) -> Result<()> {
    let incompatible = |reason: String| Error::IncompatibleStrategy {
        strategy: strategy.name().to_string(),
        reason,
    };

    if strategy.name().trim().is_empty() {
        return Err(incompatible("strategy has no name".into()));
    }
    if strategy.symbol().trim().is_empty() {
        return Err(incompatible("strategy has no symbol".into()));
    }
    if strategy.regime_affinity() != regime {
        return Err(incompatible(format!(
            "regime affinity is {}, tested for {regime}",
            strategy.regime_affinity()
        )));
    }

    let params = strategy.parameters();
    let missing: Vec<&str> = strategy
        .required_parameters()
        .iter()
        .copied()
        .filter(|name| !params.get(*name).is_some_and(|v| v.is_finite()))
        .collect();
    if !missing.is_empty() {
        return Err(incompatible(format!(
            "missing required parameters: {}",
            missing.join(", ")
        )));
    }

    strategy.validate().map_err(incompatible)
}
