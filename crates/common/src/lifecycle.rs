use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, OrderSide, RegimeKind};

/// Approval status of a strategy within one regime partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    ToTest,
    Approved,
    Trash,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::ToTest => "to_test",
            LifecycleState::Approved => "approved",
            LifecycleState::Trash => "trash",
        }
    }

    /// Allowed moves: to_test → approved | trash, approved → trash.
    /// Trash is terminal; resubmission creates a new entry instead.
    pub fn can_transition_to(self, to: LifecycleState) -> bool {
        matches!(
            (self, to),
            (LifecycleState::ToTest, LifecycleState::Approved)
                | (LifecycleState::ToTest, LifecycleState::Trash)
                | (LifecycleState::Approved, LifecycleState::Trash)
        )
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "to_test" => Ok(LifecycleState::ToTest),
            "approved" => Ok(LifecycleState::Approved),
            "trash" => Ok(LifecycleState::Trash),
            other => Err(Error::Config(format!("unknown lifecycle state '{other}'"))),
        }
    }
}

/// Identity of one registry entry. A resubmitted strategy gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A (possibly partial) execution inside a backtest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillRecord {
    pub side: OrderSide,
    pub requested_quantity: f64,
    pub filled_quantity: f64,
    pub price: f64,
}

impl FillRecord {
    pub fn is_partial(&self) -> bool {
        self.filled_quantity + f64::EPSILON < self.requested_quantity
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub position: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fills: Vec<FillRecord>,
}

/// Result of one backtest run. Immutable and kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub id: Uuid,
    pub strategy: String,
    pub regime: RegimeKind,
    pub range: TimeRange,
    pub sharpe_ratio: f64,
    /// Largest peak-to-trough equity loss as a fraction of the peak.
    pub max_drawdown: f64,
    /// Share of closed round trips with positive P&L.
    pub win_rate: f64,
    pub trade_count: usize,
    pub total_return: f64,
    /// Bars labeled with the tested regime.
    pub bars_in_regime: usize,
    pub total_bars: usize,
    pub partial_fills: usize,
    pub signal_errors: usize,
    pub equity_curve: Vec<EquityPoint>,
    pub created_at: DateTime<Utc>,
}

impl PerformanceReport {
    /// Fraction of the tested span that was actually in the tested regime.
    pub fn coverage(&self) -> f64 {
        if self.total_bars == 0 {
            0.0
        } else {
            self.bars_in_regime as f64 / self.total_bars as f64
        }
    }
}

/// Thresholds a report must clear, all of them, to be approved.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ApprovalThresholds {
    pub min_sharpe: f64,
    /// Maximum tolerated drawdown as a fraction (0.30 = 30%).
    pub max_drawdown: f64,
    pub min_win_rate: f64,
    /// Fewer closed trades than this is insufficient evidence.
    pub min_trades: usize,
}

impl Default for ApprovalThresholds {
    fn default() -> Self {
        Self {
            min_sharpe: 1.0,
            max_drawdown: 0.25,
            min_win_rate: 0.45,
            min_trades: 5,
        }
    }
}
