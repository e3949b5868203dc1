use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use backtest::{ApprovalManager, ApprovalOutcome, BacktestEngine, CandidateResult, FillModel};
use common::{
    periods_per_year, Config, DataFeed, EngineCommand, ExecutionBackend, MacroFeed, MacroSettings,
    RunMode, TimeRange, TradingMode,
};
use engine::{
    BinanceClient, Engine, ExecutionCoordinator, HttpInflationFeed, OrderRouter, RiskGate,
    SqliteLifecycleStore, SqliteReportSink, StaticInflation,
};
use paper::SimulatedBackend;
use regime::{ClassifierConfig, HistoricalRegimeProvider, MonitorConfig, RegimeClassifier, RegimeMonitor};
use strategy::{build_strategy, StrategyFileConfig, StrategyRegistry};

/// How often approvals are re-run while trading.
const APPROVAL_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::from_env();
    info!(mode = %cfg.trading_mode, run = ?cfg.run_mode, symbol = %cfg.symbol, interval = %cfg.bar_interval, "RegimeBot starting");

    // ── Database ──────────────────────────────────────────────────────────────
    let options: SqliteConnectOptions = cfg
        .database_url
        .parse()
        .with_context(|| format!("invalid DATABASE_URL '{}'", cfg.database_url))?;
    let db = SqlitePool::connect_with(options.create_if_missing(true))
        .await
        .context("failed to connect to database")?;
    engine::migrate(&db).await.context("database migration failed")?;
    info!("Database ready");

    // ── Strategy registry ─────────────────────────────────────────────────────
    let strategy_file = StrategyFileConfig::load(&cfg.strategy_config_path)
        .with_context(|| format!("failed to load {}", cfg.strategy_config_path))?;
    let mut configured = Vec::with_capacity(strategy_file.strategies.len());
    for sc in &strategy_file.strategies {
        match build_strategy(sc) {
            Ok(strategy) => configured.push((strategy, sc.regime)),
            Err(e) => warn!(strategy = %sc.name, error = %e, "Strategy skipped"),
        }
    }
    let registry = Arc::new(StrategyRegistry::with_store(Arc::new(SqliteLifecycleStore::new(
        db.clone(),
    ))));
    registry.restore(configured).await.context("registry restore failed")?;

    // ── Regime classification and approval ────────────────────────────────────
    // One interval for classification, backtests and the live stream
    let feed: Arc<dyn DataFeed> = Arc::new(BinanceClient::public()?.with_interval(cfg.bar_interval.clone()));
    let periods = periods_per_year(&cfg.bar_interval)
        .with_context(|| format!("unsupported BAR_INTERVAL '{}'", cfg.bar_interval))?;
    let macro_feed = macro_feed(&cfg.macro_data)?;
    let classifier = RegimeClassifier::new(ClassifierConfig::default());
    let mut provider = HistoricalRegimeProvider::new(feed.clone(), classifier.clone());
    if let Some(m) = &macro_feed {
        provider = provider.with_macro_feed(m.clone());
    }
    let approvals = Arc::new(
        ApprovalManager::new(registry.clone(), provider, Arc::new(SqliteReportSink::new(db.clone())))
            .with_engine(BacktestEngine::new(FillModel::from(cfg.fills)).with_periods_per_year(periods))
            .with_thresholds(cfg.thresholds)
            .with_timeouts(cfg.backtest_timeout, cfg.monitor.fetch_timeout),
    );

    let backtest_days = cfg.backtest_days;
    let range = move || {
        let end = Utc::now();
        TimeRange {
            start: end - chrono::Duration::days(backtest_days),
            end,
        }
    };

    log_results(&approvals.run_pending(range()).await);

    if cfg.run_mode == RunMode::Backtest {
        info!("Approval pass finished; exiting (RUN_MODE=backtest)");
        return Ok(());
    }

    // ── Execution backend (injected based on TRADING_MODE) ────────────────────
    let mut paper_backend = None;
    let backend: Arc<dyn ExecutionBackend> = match cfg.trading_mode {
        TradingMode::Live => {
            info!("Live trading mode, using BinanceClient");
            let key = cfg.binance_api_key.clone().unwrap_or_default();
            let secret = cfg.binance_secret.clone().unwrap_or_default();
            Arc::new(BinanceClient::new(key, secret)?)
        }
        TradingMode::Paper => {
            info!(balance = cfg.paper_balance_usd, slippage_bps = cfg.fills.slippage_bps, "Paper trading mode, using SimulatedBackend");
            let paper = Arc::new(SimulatedBackend::new(cfg.paper_balance_usd, cfg.fills.slippage_bps));
            paper_backend = Some(paper.clone());
            paper
        }
    };

    let router = Arc::new(OrderRouter::new(backend, SUBMIT_TIMEOUT));
    let risk = Arc::new(RiskGate::new(cfg.risk, cfg.risk_capital_usd));
    let coordinator = Arc::new(ExecutionCoordinator::new(registry.clone(), router).with_risk(risk));

    // ── Engine ────────────────────────────────────────────────────────────────
    let symbols: Vec<String> = {
        let mut seen = HashSet::new();
        std::iter::once(cfg.symbol.clone())
            .chain(strategy_file.strategies.iter().map(|s| s.symbol.clone()))
            .filter(|s| seen.insert(s.clone()))
            .collect()
    };
    let (regime_tx, regime_rx) = mpsc::channel(16);
    let (engine, handle) = Engine::new(symbols, coordinator, regime_rx);
    let mut engine = engine.with_stream_interval(cfg.bar_interval.clone());
    if let Some(paper) = paper_backend {
        engine = engine.with_paper(paper);
    }

    // ── Regime monitor ────────────────────────────────────────────────────────
    let monitor_cfg = MonitorConfig {
        window_bars: cfg.monitor.window_bars,
        poll_interval: cfg.monitor.poll_interval,
        fetch_timeout: cfg.monitor.fetch_timeout,
        confirmations: cfg.monitor.confirmations,
        ..MonitorConfig::new(cfg.symbol.clone())
    };
    let mut monitor = RegimeMonitor::new(feed, classifier, monitor_cfg);
    if let Some(m) = macro_feed {
        monitor = monitor.with_macro_feed(m);
    }

    // ── Periodic re-approval ──────────────────────────────────────────────────
    let approval_handle = handle.clone();
    let approval_task = approvals.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(APPROVAL_INTERVAL);
        interval.tick().await; // the first pass already ran
        loop {
            interval.tick().await;
            log_results(&approval_task.run_pending(range()).await);
            log_results(&approval_task.retest_approved(range()).await);
            approval_handle.send(EngineCommand::Refresh).await;
        }
    });

    // ── Spawn all tasks ───────────────────────────────────────────────────────
    tokio::spawn(engine.run());
    tokio::spawn(monitor.run(regime_tx));
    handle.send(EngineCommand::Start).await;

    info!("All subsystems started. Waiting for shutdown signal.");
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    handle.send(EngineCommand::Stop).await;
    info!("Shutdown signal received. Exiting.");
    Ok(())
}

/// Static rate first, then the HTTP CPI feed, else classify on price alone.
fn macro_feed(settings: &MacroSettings) -> anyhow::Result<Option<Arc<dyn MacroFeed>>> {
    if let Some(rate) = settings.static_inflation {
        info!(rate, "Using fixed inflation rate");
        return Ok(Some(Arc::new(StaticInflation(rate))));
    }
    match &settings.api_url {
        Some(url) => {
            info!(%url, country = %settings.country, "Using HTTP CPI feed");
            let feed = HttpInflationFeed::new(url.clone(), settings.api_key.clone(), settings.country.clone())?;
            Ok(Some(Arc::new(feed)))
        }
        None => {
            info!("No macro feed configured; the inflationary regime is disabled");
            Ok(None)
        }
    }
}

fn log_results(results: &[CandidateResult]) {
    for r in results {
        match &r.outcome {
            Ok(ApprovalOutcome::Approved(report)) => info!(
                strategy = %r.strategy,
                regime = %r.regime,
                sharpe = report.sharpe_ratio,
                drawdown = report.max_drawdown,
                trades = report.trade_count,
                "Strategy approved"
            ),
            Ok(ApprovalOutcome::Trashed { reasons, .. }) => {
                info!(strategy = %r.strategy, regime = %r.regime, ?reasons, "Strategy trashed")
            }
            Ok(ApprovalOutcome::Deferred(why)) => {
                warn!(strategy = %r.strategy, regime = %r.regime, reason = %why, "Approval deferred")
            }
            Ok(ApprovalOutcome::Discarded) => {
                info!(strategy = %r.strategy, regime = %r.regime, "Candidate withdrawn during backtest")
            }
            Err(e) => warn!(strategy = %r.strategy, regime = %r.regime, error = %e, "Approval failed"),
        }
    }
}
