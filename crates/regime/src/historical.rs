use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use common::{Bar, DataFeed, Error, MacroFeed, RegimeKind, RegimeSnapshot, Result, TimeRange};

use crate::classifier::RegimeClassifier;

/// Bars over a range together with the regime label of every bar that had
/// enough history to classify.
#[derive(Debug, Clone, Default)]
pub struct RegimeSeries {
    pub bars: Vec<Bar>,
    /// One per labelled bar, aligned by timestamp. Warmup bars have none.
    pub snapshots: Vec<RegimeSnapshot>,
}

impl RegimeSeries {
    pub fn bars_in(&self, regime: RegimeKind) -> usize {
        self.snapshots.iter().filter(|s| s.kind() == regime).count()
    }

    /// Label of the bar closing at `timestamp`, if it was classified.
    pub fn regime_at(&self, timestamp: chrono::DateTime<chrono::Utc>) -> Option<RegimeKind> {
        self.snapshots
            .binary_search_by_key(&timestamp, |s| s.timestamp)
            .ok()
            .map(|i| self.snapshots[i].kind())
    }
}

/// Replays past data through the live classifier so backtests see the same
/// labels the monitor would have produced.
///
/// Labels are raw per-bar classifications; no confirmation debounce is applied.
/// With a macro feed attached, every bar is classified with the inflation
/// rate in force at its close, as the monitor does.
#[derive(Clone)]
pub struct HistoricalRegimeProvider {
    feed: Arc<dyn DataFeed>,
    macro_feed: Option<Arc<dyn MacroFeed>>,
    classifier: RegimeClassifier,
}

impl HistoricalRegimeProvider {
    pub fn new(feed: Arc<dyn DataFeed>, classifier: RegimeClassifier) -> Self {
        Self {
            feed,
            macro_feed: None,
            classifier,
        }
    }

    pub fn with_macro_feed(mut self, macro_feed: Arc<dyn MacroFeed>) -> Self {
        self.macro_feed = Some(macro_feed);
        self
    }

    pub fn classifier(&self) -> &RegimeClassifier {
        &self.classifier
    }

    /// Label every bar from the first one with a full indicator window onward.
    pub fn label_series(&self, bars: &[Bar]) -> Vec<RegimeSnapshot> {
        self.label_with_inflation(bars, &[])
    }

    /// As `label_series`, with `rates[i]` the inflation rate at `bars[i]`.
    /// Missing entries classify without inflation.
    pub fn label_with_inflation(&self, bars: &[Bar], rates: &[Option<f64>]) -> Vec<RegimeSnapshot> {
        let warmup = self.classifier.required_bars();
        if warmup == 0 || bars.len() < warmup {
            return Vec::new();
        }
        (warmup - 1..bars.len())
            .filter_map(|i| {
                let rate = rates.get(i).copied().flatten();
                self.classifier.classify_bars(&bars[..=i], rate).ok()
            })
            .collect()
    }

    /// Per-bar inflation rates, or none at all if the macro feed fails or
    /// exceeds `limit`.
    async fn inflation_rates(&self, bars: &[Bar], limit: Duration) -> Vec<Option<f64>> {
        let Some(macro_feed) = &self.macro_feed else {
            return Vec::new();
        };
        let lookup = async {
            let mut rates = Vec::with_capacity(bars.len());
            for bar in bars {
                rates.push(macro_feed.inflation_rate(bar.timestamp).await?);
            }
            Ok::<_, Error>(rates)
        };
        match timeout(limit, lookup).await {
            Ok(Ok(rates)) => rates,
            Ok(Err(e)) => {
                warn!(error = %e, "Macro data unavailable; labelling history without inflation");
                Vec::new()
            }
            Err(_) => {
                warn!("Macro fetch timed out; labelling history without inflation");
                Vec::new()
            }
        }
    }

    /// Fetch `range` for `symbol` and label it. Fails with `DataUnavailable`
    /// when the feed errors or exceeds `limit`, and with `InsufficientData`
    /// when the range is empty.
    pub async fn replay(&self, symbol: &str, range: TimeRange, limit: Duration) -> Result<RegimeSeries> {
        if range.end <= range.start {
            return Err(Error::InsufficientData {
                needed: 1,
                available: 0,
            });
        }

        let bars = timeout(limit, self.feed.fetch_series(symbol, range.start, range.end))
            .await
            .map_err(|_| Error::DataUnavailable(format!("historical fetch timed out after {limit:?}")))??;

        if bars.is_empty() {
            return Err(Error::InsufficientData {
                needed: 1,
                available: 0,
            });
        }

        let rates = self.inflation_rates(&bars, limit).await;
        let snapshots = self.label_with_inflation(&bars, &rates);
        debug!(symbol, bars = bars.len(), labelled = snapshots.len(), "Historical regimes labelled");
        if snapshots.is_empty() {
            info!(
                symbol,
                bars = bars.len(),
                required = self.classifier.required_bars(),
                "Range too short to classify any bar"
            );
        }
        Ok(RegimeSeries { bars, snapshots })
    }
}
