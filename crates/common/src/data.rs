use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Bar, EntryId, LifecycleState, PerformanceReport, RegimeKind, Result};

/// Market data source. Every failure is reported as `Error::DataUnavailable`.
#[async_trait]
pub trait DataFeed: Send + Sync {
    /// Bars for `symbol` with close time in `[start, end]`, oldest first.
    async fn fetch_series(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>>;

    /// The most recent `window` closed bars, oldest first.
    async fn fetch_latest(&self, symbol: &str, window: usize) -> Result<Vec<Bar>>;
}

/// Macroeconomic indicators consumed by the classifier.
#[async_trait]
pub trait MacroFeed: Send + Sync {
    /// Year-over-year inflation as a fraction, if known for `at`.
    async fn inflation_rate(&self, at: DateTime<Utc>) -> Result<Option<f64>>;
}

/// One persisted registry row.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedEntry {
    pub id: EntryId,
    pub strategy: String,
    pub regime: RegimeKind,
    pub state: LifecycleState,
}

/// Durable (regime, lifecycle state) partitioning of strategies.
///
/// `move_entry` must be atomic: an entry is never visible in two states.
/// A mismatch between `from` and the stored state is a `RegistryConflict`.
#[async_trait]
pub trait LifecycleStore: Send + Sync {
    async fn insert(&self, entry: &PersistedEntry) -> Result<()>;

    async fn move_entry(
        &self,
        id: EntryId,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Result<()>;

    async fn remove(&self, id: EntryId) -> Result<()>;

    async fn load(&self) -> Result<Vec<PersistedEntry>>;
}

/// Append-only destination for backtest reports.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn record(&self, report: &PerformanceReport) -> Result<()>;
}
