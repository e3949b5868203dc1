use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use common::{
    MarketState, OrderHandle, OrderIntent, OrderSide, RegimeChangeEvent, RegimeKind, Result,
};
use strategy::{Strategy, StrategyRegistry};

use crate::executor::OrderRouter;
use crate::risk::RiskGate;

/// The strategies allowed to trade right now. Never mutated after
/// construction; replaced wholesale on every swap.
#[derive(Clone)]
pub struct ActiveStrategySet {
    /// Regime the set was built for. `None` before the first classification.
    pub regime: Option<RegimeKind>,
    /// Approved strategies for `regime`.
    pub strategies: Vec<Arc<dyn Strategy>>,
    pub activated_at: DateTime<Utc>,
    /// In flat state, the previously active strategies. They may still emit
    /// position-reducing orders until their positions are closed.
    pub exit_only: Vec<Arc<dyn Strategy>>,
}

impl ActiveStrategySet {
    fn empty() -> Self {
        Self {
            regime: None,
            strategies: Vec::new(),
            activated_at: Utc::now(),
            exit_only: Vec::new(),
        }
    }

    /// A regime is known but nothing is approved for it.
    pub fn is_flat(&self) -> bool {
        self.regime.is_some() && self.strategies.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

impl std::fmt::Debug for ActiveStrategySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveStrategySet")
            .field("regime", &self.regime)
            .field("strategies", &self.names())
            .field(
                "exit_only",
                &self.exit_only.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("activated_at", &self.activated_at)
            .finish()
    }
}

/// Outcome of one `tick`.
#[derive(Debug, Default, Clone)]
pub struct TickReport {
    pub regime: Option<RegimeKind>,
    pub flat: bool,
    /// Strategies asked for a signal.
    pub evaluated: usize,
    pub submitted: Vec<OrderHandle>,
    /// (strategy, reason) for signal errors, panics and rejected orders.
    pub errors: Vec<(String, String)>,
    /// Intents withheld because they would not reduce a position in flat state.
    pub suppressed: usize,
    /// Intents refused by the risk gate.
    pub risk_rejected: usize,
}

/// Swaps the active strategy set on regime changes and turns strategy
/// signals into orders.
///
/// The set is held as an `Arc` behind a lock that is only taken long enough
/// to clone or replace the pointer, so a tick always works on one complete
/// set even if a swap lands mid-tick. Swaps are serialized by `swap_lock`,
/// held from the registry read to the pointer store, so they install in the
/// order they were requested.
pub struct ExecutionCoordinator {
    registry: Arc<StrategyRegistry>,
    router: Arc<OrderRouter>,
    active: RwLock<Arc<ActiveStrategySet>>,
    swap_lock: Mutex<()>,
    risk: Option<Arc<RiskGate>>,
}

impl ExecutionCoordinator {
    pub fn new(registry: Arc<StrategyRegistry>, router: Arc<OrderRouter>) -> Self {
        Self {
            registry,
            router,
            active: RwLock::new(Arc::new(ActiveStrategySet::empty())),
            swap_lock: Mutex::new(()),
            risk: None,
        }
    }

    /// Check every order against `gate` before it is routed.
    pub fn with_risk(mut self, gate: Arc<RiskGate>) -> Self {
        self.risk = Some(gate);
        self
    }

    /// The current set. Cheap: clones an `Arc`.
    pub async fn active(&self) -> Arc<ActiveStrategySet> {
        self.active.read().await.clone()
    }

    pub fn router(&self) -> &Arc<OrderRouter> {
        &self.router
    }

    pub async fn on_regime_change(&self, event: &RegimeChangeEvent) -> Arc<ActiveStrategySet> {
        let regime = event.current.kind();
        info!(
            from = ?event.previous.map(|l| l.kind()),
            to = %regime,
            confidence = event.current.confidence(),
            "Regime change received"
        );
        let _swap = self.swap_lock.lock().await;
        self.swap_to(regime).await
    }

    /// Rebuild the set for the current regime, picking up approvals and
    /// trashings since the last swap. No-op before the first regime.
    pub async fn refresh(&self) -> Arc<ActiveStrategySet> {
        let _swap = self.swap_lock.lock().await;
        let current = self.active().await;
        match current.regime {
            Some(regime) => self.swap_to(regime).await,
            None => current,
        }
    }

    /// Caller holds `swap_lock`. The registry is read before the write lock
    /// is taken so ticks are not held up by registry contention.
    async fn swap_to(&self, regime: RegimeKind) -> Arc<ActiveStrategySet> {
        let strategies = self.registry.approved(regime).await;

        let mut slot = self.active.write().await;
        let previous = slot.clone();
        let exit_only = if strategies.is_empty() {
            let mut carried: Vec<Arc<dyn Strategy>> = Vec::new();
            for s in previous.strategies.iter().chain(previous.exit_only.iter()) {
                if !carried.iter().any(|c| c.name() == s.name()) {
                    carried.push(s.clone());
                }
            }
            carried
        } else {
            Vec::new()
        };

        let next = Arc::new(ActiveStrategySet {
            regime: Some(regime),
            strategies,
            activated_at: Utc::now(),
            exit_only,
        });
        *slot = next.clone();
        drop(slot);

        if next.is_flat() {
            warn!(
                %regime,
                exit_only = ?next.exit_only.iter().map(|s| s.name()).collect::<Vec<_>>(),
                "No approved strategies for regime; entering flat state"
            );
        } else {
            info!(%regime, strategies = ?next.names(), "Active strategy set swapped");
        }
        next
    }

    /// Ask every active strategy for a signal and route the resulting orders.
    ///
    /// `market.position` must be the current net position in `market.symbol`.
    /// A failing or panicking strategy is reported in the `TickReport` and
    /// never stops the others.
    pub async fn tick(&self, market: &MarketState) -> TickReport {
        let set = self.active().await;
        let flat = set.is_flat();
        let mut report = TickReport {
            regime: set.regime,
            flat,
            ..TickReport::default()
        };

        if let (Some(risk), Some(price)) = (&self.risk, market.last_price()) {
            risk.mark(&market.symbol, price).await;
        }

        let strategies = if flat { &set.exit_only } else { &set.strategies };
        let mut state = market.clone();
        state.regime = set.regime;

        // Remaining position that reduce-only orders may still close.
        let mut reducible = market.position;
        let mut intents: Vec<OrderIntent> = Vec::new();

        for strategy in strategies.iter().filter(|s| s.symbol() == market.symbol) {
            report.evaluated += 1;
            let name = strategy.name().to_string();
            let intent = match catch_unwind(AssertUnwindSafe(|| strategy.generate_signal(&state))) {
                Ok(Ok(Some(intent))) => intent,
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => {
                    warn!(strategy = %name, error = %e, "Strategy signal failed; skipped this tick");
                    report.errors.push((name, e.to_string()));
                    continue;
                }
                Err(_) => {
                    warn!(strategy = %name, "Strategy panicked; skipped this tick");
                    report.errors.push((name, "panicked during signal generation".into()));
                    continue;
                }
            };

            if flat {
                match reduce_only(intent, reducible) {
                    Some(clamped) => {
                        reducible += clamped.side.sign() * clamped.quantity;
                        intents.push(clamped);
                    }
                    None => {
                        debug!(strategy = %name, "Opening order suppressed in flat state");
                        report.suppressed += 1;
                    }
                }
            } else {
                intents.push(intent);
            }
        }

        let mut position = market.position;
        for intent in intents {
            if let Some(risk) = &self.risk {
                if let Err(reason) = risk.check(&intent, position).await {
                    warn!(strategy = %intent.strategy, %reason, "Order refused by risk gate");
                    report.risk_rejected += 1;
                    report.errors.push((intent.strategy.clone(), reason.to_string()));
                    continue;
                }
            }
            match self.router.route(&intent).await {
                Ok(handle) => {
                    position += intent.side.sign() * intent.quantity;
                    if let Some(risk) = &self.risk {
                        risk.record_fill(&handle).await;
                    }
                    report.submitted.push(handle);
                }
                Err(e) => report.errors.push((intent.strategy.clone(), e.to_string())),
            }
        }
        report
    }

    /// Net position in `symbol` according to the backend.
    pub async fn position(&self, symbol: &str) -> Result<f64> {
        Ok(self.router.positions().await?.quantity(symbol))
    }
}

/// Keep `intent` only if it shrinks `position`, clamped so it cannot flip it.
fn reduce_only(mut intent: OrderIntent, position: f64) -> Option<OrderIntent> {
    const EPS: f64 = 1e-12;
    let reduces = match intent.side {
        OrderSide::Sell => position > EPS,
        OrderSide::Buy => position < -EPS,
    };
    if !reduces || !(intent.quantity > 0.0) {
        return None;
    }
    intent.quantity = intent.quantity.min(position.abs());
    Some(intent)
}
