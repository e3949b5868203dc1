use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use common::{Bar, EngineCommand, EngineState, MarketEvent, MarketState, RegimeChangeEvent};
use paper::SimulatedBackend;

use crate::binance::BinanceStream;
use crate::coordinator::{ExecutionCoordinator, TickReport};

/// Closed bars kept per symbol for strategy signals.
const DEFAULT_HISTORY: usize = 250;
/// Same default as `BinanceClient`, which serves the backtest series.
const DEFAULT_STREAM_INTERVAL: &str = "1d";

/// Cloneable handle for driving a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    command_tx: mpsc::Sender<EngineCommand>,
    state: Arc<RwLock<EngineState>>,
    market_tx: broadcast::Sender<MarketEvent>,
    tick_tx: broadcast::Sender<TickReport>,
}

impl EngineHandle {
    pub async fn send(&self, cmd: EngineCommand) {
        let _ = self.command_tx.send(cmd).await;
    }

    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    /// Subscribe to the closed-candle broadcast.
    pub fn subscribe_market(&self) -> broadcast::Receiver<MarketEvent> {
        self.market_tx.subscribe()
    }

    /// Subscribe to the outcome of every coordinator tick.
    pub fn subscribe_ticks(&self) -> broadcast::Receiver<TickReport> {
        self.tick_tx.subscribe()
    }

    /// Inject a closed candle as if the stream had produced it.
    pub fn publish(&self, event: MarketEvent) {
        let _ = self.market_tx.send(event);
    }
}

/// Drives the trading loop: market streams, regime events and commands.
///
/// Regime events are applied in every state so the active set is already
/// right when trading resumes. Strategies are only ticked while `Running`.
pub struct Engine {
    symbols: Vec<String>,
    coordinator: Arc<ExecutionCoordinator>,
    state: Arc<RwLock<EngineState>>,
    market_tx: broadcast::Sender<MarketEvent>,
    tick_tx: broadcast::Sender<TickReport>,
    command_rx: mpsc::Receiver<EngineCommand>,
    regime_rx: mpsc::Receiver<RegimeChangeEvent>,
    history: HashMap<String, VecDeque<Bar>>,
    history_limit: usize,
    spawn_streams: bool,
    stream_interval: String,
    /// Paper backend to mark to market before each tick.
    paper: Option<Arc<SimulatedBackend>>,
}

impl Engine {
    pub fn new(
        symbols: Vec<String>,
        coordinator: Arc<ExecutionCoordinator>,
        regime_rx: mpsc::Receiver<RegimeChangeEvent>,
    ) -> (Self, EngineHandle) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (market_tx, _) = broadcast::channel(1024);
        let (tick_tx, _) = broadcast::channel(256);
        let state = Arc::new(RwLock::new(EngineState::Stopped));

        let handle = EngineHandle {
            command_tx,
            state: state.clone(),
            market_tx: market_tx.clone(),
            tick_tx: tick_tx.clone(),
        };

        let engine = Engine {
            symbols,
            coordinator,
            state,
            market_tx,
            tick_tx,
            command_rx,
            regime_rx,
            history: HashMap::new(),
            history_limit: DEFAULT_HISTORY,
            spawn_streams: true,
            stream_interval: DEFAULT_STREAM_INTERVAL.to_string(),
            paper: None,
        };

        (engine, handle)
    }

    /// Do not open exchange streams on Start; bars arrive via
    /// `EngineHandle::publish` instead.
    pub fn without_streams(mut self) -> Self {
        self.spawn_streams = false;
        self
    }

    /// Kline interval of the live streams. Must equal the interval the
    /// approving backtests ran on.
    pub fn with_stream_interval(mut self, interval: impl Into<String>) -> Self {
        self.stream_interval = interval.into();
        self
    }

    pub fn stream_interval(&self) -> &str {
        &self.stream_interval
    }

    pub fn with_history(mut self, bars: usize) -> Self {
        self.history_limit = bars.max(1);
        self
    }

    pub fn with_paper(mut self, backend: Arc<SimulatedBackend>) -> Self {
        self.paper = Some(backend);
        self
    }

    /// Run until the command channel closes. Call from `tokio::spawn`.
    pub async fn run(mut self) {
        info!(symbols = ?self.symbols, "Engine initialized in Stopped state. Waiting for Start command.");

        let mut market_rx = self.market_tx.subscribe();
        let mut stream_handles: Vec<JoinHandle<()>> = Vec::new();
        let mut regime_open = true;

        loop {
            tokio::select! {
                biased;

                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd, &mut stream_handles).await,
                    None => {
                        warn!("Engine command channel closed, shutting down");
                        break;
                    }
                },

                event = self.regime_rx.recv(), if regime_open => match event {
                    Some(event) => {
                        self.coordinator.on_regime_change(&event).await;
                    }
                    None => {
                        warn!("Regime event channel closed; active set is frozen");
                        regime_open = false;
                    }
                },

                event = market_rx.recv() => match event {
                    Ok(event) => self.on_bar(event).await,
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Engine fell behind the market stream");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        for h in stream_handles {
            h.abort();
        }
    }

    async fn handle_command(&mut self, cmd: EngineCommand, streams: &mut Vec<JoinHandle<()>>) {
        let current = *self.state.read().await;
        match cmd {
            EngineCommand::Start => {
                if current != EngineState::Stopped {
                    info!(state = %current, "Engine already started");
                    return;
                }
                if self.spawn_streams {
                    info!(symbols = ?self.symbols, "Starting market data streams");
                    for symbol in &self.symbols {
                        let stream = BinanceStream::new(symbol.clone(), self.market_tx.clone())
                            .with_interval(self.stream_interval.clone());
                        streams.push(tokio::spawn(stream.run()));
                    }
                }
                *self.state.write().await = EngineState::Running;
            }

            EngineCommand::Stop => {
                info!("Engine stopping, aborting stream tasks");
                *self.state.write().await = EngineState::Stopped;
                for h in streams.drain(..) {
                    h.abort();
                }
            }

            EngineCommand::Pause => {
                if current == EngineState::Running {
                    info!("Engine paused; bars are recorded, signals suppressed");
                    *self.state.write().await = EngineState::Paused;
                }
            }

            EngineCommand::Resume => {
                if current == EngineState::Paused {
                    info!("Engine resumed");
                    *self.state.write().await = EngineState::Running;
                }
            }

            EngineCommand::Refresh => {
                let set = self.coordinator.refresh().await;
                info!(regime = ?set.regime, strategies = ?set.names(), "Active set refreshed");
            }
        }
    }

    async fn on_bar(&mut self, event: MarketEvent) {
        if !self.symbols.contains(&event.symbol) {
            return;
        }

        let bars = self.history.entry(event.symbol.clone()).or_default();
        if bars.back().is_some_and(|last| last.timestamp >= event.bar.timestamp) {
            debug!(symbol = %event.symbol, "Out-of-order bar dropped");
            return;
        }
        bars.push_back(event.bar.clone());
        while bars.len() > self.history_limit {
            bars.pop_front();
        }

        if let Some(paper) = &self.paper {
            for filled in paper.update_price(&event.symbol, event.bar.close).await {
                info!(order = %filled.order_id, price = ?filled.average_price, "Resting paper order filled");
            }
        }

        if *self.state.read().await != EngineState::Running {
            return;
        }

        let position = match self.coordinator.position(&event.symbol).await {
            Ok(qty) => qty,
            Err(e) => {
                // Without a position, flat-state exits cannot be sized
                warn!(symbol = %event.symbol, error = %e, "Position query failed; tick skipped");
                return;
            }
        };

        let market = MarketState {
            position,
            ..MarketState::new(event.symbol.clone(), bars.iter().cloned().collect())
        };
        let report = self.coordinator.tick(&market).await;

        for (strategy, reason) in &report.errors {
            warn!(%strategy, %reason, "Strategy tick error");
        }
        if !report.submitted.is_empty() {
            info!(
                symbol = %event.symbol,
                regime = ?report.regime,
                orders = report.submitted.len(),
                flat = report.flat,
                "Orders routed"
            );
        }
        let _ = self.tick_tx.send(report);
    }
}
