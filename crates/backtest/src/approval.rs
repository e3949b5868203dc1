use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{error, info, warn};

use common::{
    ApprovalThresholds, EntryId, Error, LifecycleState, PerformanceReport, RegimeKind,
    ReportSink, Result, TimeRange,
};
use regime::{HistoricalRegimeProvider, RegimeSeries};
use strategy::{check_capabilities, Candidate, StrategyRegistry};

use crate::engine::BacktestEngine;

/// One threshold a report did not clear.
#[derive(Debug, Clone, PartialEq)]
pub enum ThresholdFailure {
    Sharpe { actual: f64, min: f64 },
    Drawdown { actual: f64, max: f64 },
    WinRate { actual: f64, min: f64 },
    TooFewTrades { actual: usize, min: usize },
    /// A metric came out NaN or infinite.
    NonFinite(&'static str),
}

impl fmt::Display for ThresholdFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdFailure::Sharpe { actual, min } => {
                write!(f, "sharpe {actual:.3} < {min:.3}")
            }
            ThresholdFailure::Drawdown { actual, max } => {
                write!(f, "drawdown {:.1}% > {:.1}%", actual * 100.0, max * 100.0)
            }
            ThresholdFailure::WinRate { actual, min } => {
                write!(f, "win rate {:.1}% < {:.1}%", actual * 100.0, min * 100.0)
            }
            ThresholdFailure::TooFewTrades { actual, min } => {
                write!(f, "{actual} trades < {min} required")
            }
            ThresholdFailure::NonFinite(metric) => write!(f, "{metric} is not finite"),
        }
    }
}

/// Every threshold `report` fails. Empty means approvable.
pub fn check(report: &PerformanceReport, thresholds: &ApprovalThresholds) -> Vec<ThresholdFailure> {
    let mut failures = Vec::new();

    for (name, value) in [
        ("sharpe", report.sharpe_ratio),
        ("drawdown", report.max_drawdown),
        ("win rate", report.win_rate),
    ] {
        if !value.is_finite() {
            failures.push(ThresholdFailure::NonFinite(name));
        }
    }

    if report.trade_count < thresholds.min_trades || report.trade_count == 0 {
        failures.push(ThresholdFailure::TooFewTrades {
            actual: report.trade_count,
            min: thresholds.min_trades.max(1),
        });
    }
    if report.sharpe_ratio.is_finite() && report.sharpe_ratio < thresholds.min_sharpe {
        failures.push(ThresholdFailure::Sharpe {
            actual: report.sharpe_ratio,
            min: thresholds.min_sharpe,
        });
    }
    if report.max_drawdown.is_finite() && report.max_drawdown > thresholds.max_drawdown {
        failures.push(ThresholdFailure::Drawdown {
            actual: report.max_drawdown,
            max: thresholds.max_drawdown,
        });
    }
    if report.win_rate.is_finite() && report.win_rate < thresholds.min_win_rate {
        failures.push(ThresholdFailure::WinRate {
            actual: report.win_rate,
            min: thresholds.min_win_rate,
        });
    }
    failures
}

/// Pure decision: `Approved` only when every threshold passes.
pub fn evaluate(report: &PerformanceReport, thresholds: &ApprovalThresholds) -> LifecycleState {
    if check(report, thresholds).is_empty() {
        LifecycleState::Approved
    } else {
        LifecycleState::Trash
    }
}

/// What happened to one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalOutcome {
    Approved(Box<PerformanceReport>),
    /// Routed to trash, with the report when a backtest completed.
    Trashed {
        report: Option<Box<PerformanceReport>>,
        reasons: Vec<String>,
    },
    /// No decision this pass; the entry keeps its state.
    Deferred(String),
    /// The candidate was withdrawn while its backtest ran. Report dropped.
    Discarded,
}

#[derive(Debug)]
pub struct CandidateResult {
    pub strategy: String,
    pub regime: RegimeKind,
    pub outcome: Result<ApprovalOutcome>,
}

/// Backtests candidates and moves them through the registry.
///
/// The only component that moves entries out of `to_test`.
pub struct ApprovalManager {
    registry: Arc<StrategyRegistry>,
    provider: HistoricalRegimeProvider,
    engine: BacktestEngine,
    thresholds: ApprovalThresholds,
    sink: Arc<dyn ReportSink>,
    run_timeout: Duration,
    fetch_timeout: Duration,
}

impl ApprovalManager {
    pub fn new(
        registry: Arc<StrategyRegistry>,
        provider: HistoricalRegimeProvider,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        Self {
            registry,
            provider,
            engine: BacktestEngine::default(),
            thresholds: ApprovalThresholds::default(),
            sink,
            run_timeout: Duration::from_secs(120),
            fetch_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_engine(mut self, engine: BacktestEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_thresholds(mut self, thresholds: ApprovalThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_timeouts(mut self, run: Duration, fetch: Duration) -> Self {
        self.run_timeout = run;
        self.fetch_timeout = fetch;
        self
    }

    pub fn thresholds(&self) -> &ApprovalThresholds {
        &self.thresholds
    }

    /// Perform a registry transition on behalf of an evaluation.
    pub async fn apply(
        &self,
        id: EntryId,
        regime: RegimeKind,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Result<()> {
        self.registry.transition(id, regime, from, to).await
    }

    /// Backtest a `to_test` candidate over `series`, move it to approved or
    /// trash, and record the report once the move has landed.
    pub async fn process_candidate(
        &self,
        candidate: &Candidate,
        series: Arc<RegimeSeries>,
    ) -> Result<ApprovalOutcome> {
        self.assess(candidate, series, LifecycleState::ToTest).await
    }

    /// Backtest every `to_test` entry over `range`.
    pub async fn run_pending(&self, range: TimeRange) -> Vec<CandidateResult> {
        let mut candidates = Vec::new();
        for regime in RegimeKind::ALL {
            candidates.extend(self.registry.candidates(regime).await);
        }
        info!(count = candidates.len(), "Approval pass starting");
        self.run_batch(candidates, range, LifecycleState::ToTest).await
    }

    /// Re-run approved strategies over `range`; failures move to trash.
    pub async fn retest_approved(&self, range: TimeRange) -> Vec<CandidateResult> {
        let mut approved = Vec::new();
        for regime in RegimeKind::ALL {
            approved.extend(self.registry.in_state(regime, LifecycleState::Approved).await);
        }
        info!(count = approved.len(), "Re-test pass starting");
        self.run_batch(approved, range, LifecycleState::Approved).await
    }

    async fn run_batch(
        &self,
        candidates: Vec<Candidate>,
        range: TimeRange,
        from: LifecycleState,
    ) -> Vec<CandidateResult> {
        // One replay per symbol; a failed fetch defers every candidate on it.
        let mut series: HashMap<String, std::result::Result<Arc<RegimeSeries>, String>> =
            HashMap::new();
        let mut results = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let outcome = if check_capabilities(candidate.strategy.as_ref(), candidate.regime).is_err() {
                // Routed to trash by the engine's own pre-flight check.
                self.assess(&candidate, Arc::new(RegimeSeries::default()), from).await
            } else {
                let symbol = candidate.strategy.symbol().to_string();
                if !series.contains_key(&symbol) {
                    let loaded = self.load_series(&symbol, range).await;
                    series.insert(symbol.clone(), loaded);
                }
                match &series[&symbol] {
                    Ok(s) => self.assess(&candidate, s.clone(), from).await,
                    Err(reason) => Ok(ApprovalOutcome::Deferred(reason.clone())),
                }
            };

            if let Err(e) = &outcome {
                error!(strategy = %candidate.strategy.name(), regime = %candidate.regime, error = %e, "Approval failed");
            }
            results.push(CandidateResult {
                strategy: candidate.strategy.name().to_string(),
                regime: candidate.regime,
                outcome,
            });
        }
        results
    }

    async fn load_series(
        &self,
        symbol: &str,
        range: TimeRange,
    ) -> std::result::Result<Arc<RegimeSeries>, String> {
        match self.provider.replay(symbol, range, self.fetch_timeout).await {
            Ok(s) => Ok(Arc::new(s)),
            // An empty range is evidence of nothing; the engine turns it
            // into an insufficient-data rejection.
            Err(Error::InsufficientData { .. }) => Ok(Arc::new(RegimeSeries::default())),
            Err(e) => {
                warn!(symbol, error = %e, "Historical data unavailable; deferring candidates");
                Err(e.to_string())
            }
        }
    }

    async fn assess(
        &self,
        candidate: &Candidate,
        series: Arc<RegimeSeries>,
        from: LifecycleState,
    ) -> Result<ApprovalOutcome> {
        let name = candidate.strategy.name().to_string();
        let regime = candidate.regime;
        if candidate.cancel.is_cancelled() {
            return Ok(ApprovalOutcome::Discarded);
        }

        // Cancelled by withdrawal (parent) or by our own timeout (child).
        let run_flag = candidate.cancel.child();
        let task = {
            let engine = self.engine.clone();
            let strategy = candidate.strategy.clone();
            let flag = run_flag.clone();
            tokio::task::spawn_blocking(move || engine.run(strategy.as_ref(), regime, &series, &flag))
        };

        let result = match timeout(self.run_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => {
                error!(strategy = %name, %regime, error = %join, "Backtest task failed");
                return Ok(ApprovalOutcome::Deferred(format!("backtest task failed: {join}")));
            }
            Err(_) => {
                run_flag.cancel();
                warn!(strategy = %name, %regime, timeout = ?self.run_timeout, "Backtest timed out");
                return Ok(ApprovalOutcome::Deferred(format!(
                    "backtest timed out after {:?}",
                    self.run_timeout
                )));
            }
        };

        if candidate.cancel.is_cancelled()
            || self.registry.state_of(candidate.id, regime).await != Some(from)
        {
            info!(strategy = %name, %regime, "Candidate withdrawn during backtest; report discarded");
            return Ok(ApprovalOutcome::Discarded);
        }

        match result {
            Ok(report) => {
                let failures = check(&report, &self.thresholds);
                let to = if failures.is_empty() {
                    LifecycleState::Approved
                } else {
                    LifecycleState::Trash
                };
                // A report is only kept for a decision that actually landed
                if to != from && !self.settle(candidate, from, to).await? {
                    return Ok(ApprovalOutcome::Discarded);
                }
                self.sink.record(&report).await?;

                let report = Box::new(report);
                if failures.is_empty() {
                    info!(strategy = %name, %regime, "Strategy approved");
                    Ok(ApprovalOutcome::Approved(report))
                } else {
                    let reasons: Vec<String> = failures.iter().map(ToString::to_string).collect();
                    info!(strategy = %name, %regime, reasons = ?reasons, "Strategy trashed");
                    Ok(ApprovalOutcome::Trashed {
                        report: Some(report),
                        reasons,
                    })
                }
            }
            Err(Error::Cancelled) => Ok(ApprovalOutcome::Discarded),
            Err(e @ Error::IncompatibleStrategy { .. }) => self.reject(candidate, from, e).await,
            Err(e @ Error::InsufficientData { .. }) if from == LifecycleState::ToTest => {
                self.reject(candidate, from, e).await
            }
            Err(e) => {
                warn!(strategy = %name, %regime, error = %e, "Backtest inconclusive; keeping state");
                Ok(ApprovalOutcome::Deferred(e.to_string()))
            }
        }
    }

    async fn reject(
        &self,
        candidate: &Candidate,
        from: LifecycleState,
        reason: Error,
    ) -> Result<ApprovalOutcome> {
        if !self.settle(candidate, from, LifecycleState::Trash).await? {
            return Ok(ApprovalOutcome::Discarded);
        }
        warn!(
            strategy = %candidate.strategy.name(),
            regime = %candidate.regime,
            reason = %reason,
            "Strategy trashed without a report"
        );
        Ok(ApprovalOutcome::Trashed {
            report: None,
            reasons: vec![reason.to_string()],
        })
    }

    /// `false` when the entry disappeared (withdrawn) before the move.
    async fn settle(
        &self,
        candidate: &Candidate,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Result<bool> {
        match self.apply(candidate.id, candidate.regime, from, to).await {
            Ok(()) => Ok(true),
            Err(Error::UnknownEntry(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
