use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::RegimeKind;

/// One OHLCV candle. Series are always ordered oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Close time of the candle.
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Closed-candle event published by the market stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketEvent {
    pub symbol: String,
    pub bar: Bar,
}

/// Everything a strategy sees when asked for a signal.
#[derive(Debug, Clone)]
pub struct MarketState {
    pub symbol: String,
    /// Recent closed bars, oldest first. The last bar is "now".
    pub bars: Vec<Bar>,
    /// Regime active at this tick, if one has been classified.
    pub regime: Option<RegimeKind>,
    /// Net position held in `symbol` (positive = long).
    pub position: f64,
}

impl MarketState {
    pub fn new(symbol: impl Into<String>, bars: Vec<Bar>) -> Self {
        Self {
            symbol: symbol.into(),
            bars,
            regime: None,
            position: 0.0,
        }
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    pub fn last_price(&self) -> Option<f64> {
        self.bars.last().map(|b| b.close)
    }
}

/// Side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// +1 for buys, -1 for sells.
    pub fn sign(self) -> f64 {
        match self {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// An order a strategy wants placed. Carries a unique id so the router can
/// guarantee it reaches the backend at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub id: Uuid,
    /// Name of the strategy that produced the intent.
    pub strategy: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    /// `None` = market order; `Some(price)` = limit order.
    pub limit_price: Option<f64>,
}

impl OrderIntent {
    pub fn market(
        strategy: impl Into<String>,
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            strategy: strategy.into(),
            symbol: symbol.into(),
            side,
            quantity,
            limit_price: None,
        }
    }

    pub fn limit(
        strategy: impl Into<String>,
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: f64,
        price: f64,
    ) -> Self {
        Self {
            limit_price: Some(price),
            ..Self::market(strategy, symbol, side, quantity)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Accepted and resting (limit order not yet crossed).
    Working,
    PartiallyFilled,
    Filled,
    Cancelled,
}

/// Backend acknowledgement for a submitted intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderHandle {
    /// Backend order id (the intent id for the simulated backend).
    pub order_id: String,
    pub intent_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub filled_quantity: f64,
    pub average_price: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Net holding in one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Positive = long, negative = short.
    pub quantity: f64,
    pub average_price: f64,
}

/// Positions held by a backend at one moment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub positions: Vec<Position>,
    pub taken_at: Option<DateTime<Utc>>,
}

impl PositionSnapshot {
    pub fn quantity(&self, symbol: &str) -> f64 {
        self.positions
            .iter()
            .filter(|p| p.symbol == symbol)
            .map(|p| p.quantity)
            .sum()
    }
}

/// Whether the bot is running against the real exchange or simulating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Live,
    Paper,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Live => write!(f, "live"),
            TradingMode::Paper => write!(f, "paper"),
        }
    }
}

/// Current state of the trading engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    #[default]
    Stopped,
    Running,
    Paused,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Stopped => write!(f, "stopped"),
            EngineState::Running => write!(f, "running"),
            EngineState::Paused => write!(f, "paused"),
        }
    }
}

/// Commands sent to the engine via the command channel.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    Start,
    Stop,
    Pause,
    Resume,
    /// Rebuild the active strategy set for the current regime from the registry.
    Refresh,
}
