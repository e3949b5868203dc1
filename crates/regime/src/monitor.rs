use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use common::{
    DataFeed, Error, MacroFeed, RegimeChangeEvent, RegimeKind, RegimeLabel, RegimeSnapshot,
};

use crate::classifier::RegimeClassifier;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub symbol: String,
    /// Bars fetched per tick; must cover the classifier's longest window.
    pub window_bars: usize,
    pub poll_interval: Duration,
    /// Upper bound on each data fetch.
    pub fetch_timeout: Duration,
    /// Consecutive identical classifications needed before a change is
    /// emitted. 1 disables debouncing.
    pub confirmations: usize,
    /// Snapshots retained in memory.
    pub history_limit: usize,
}

impl MonitorConfig {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            window_bars: 250,
            poll_interval: Duration::from_secs(3600),
            fetch_timeout: Duration::from_secs(30),
            confirmations: 2,
            history_limit: 1024,
        }
    }
}

/// What happened on one monitor tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The authoritative regime changed (or was established for the first time).
    Changed(RegimeChangeEvent),
    /// Classification agreed with the current regime.
    Unchanged(RegimeKind),
    /// A different regime was seen but has not been confirmed yet.
    Pending {
        candidate: RegimeKind,
        seen: usize,
        needed: usize,
    },
    /// No classification this tick; the previous regime stays authoritative.
    Skipped(String),
}

/// Polls the data feed, classifies, and emits regime-change events.
///
/// Owned by a single task; callers observe it only through the event channel.
pub struct RegimeMonitor {
    feed: Arc<dyn DataFeed>,
    macro_feed: Option<Arc<dyn MacroFeed>>,
    classifier: RegimeClassifier,
    cfg: MonitorConfig,
    current: Option<RegimeLabel>,
    pending: Option<(RegimeKind, usize)>,
    history: VecDeque<RegimeSnapshot>,
}

impl RegimeMonitor {
    pub fn new(feed: Arc<dyn DataFeed>, classifier: RegimeClassifier, cfg: MonitorConfig) -> Self {
        if cfg.window_bars < classifier.required_bars() {
            warn!(
                window = cfg.window_bars,
                required = classifier.required_bars(),
                "Monitor window is shorter than the classifier needs; every tick will be skipped"
            );
        }
        Self {
            feed,
            macro_feed: None,
            classifier,
            cfg,
            current: None,
            pending: None,
            history: VecDeque::new(),
        }
    }

    pub fn with_macro_feed(mut self, macro_feed: Arc<dyn MacroFeed>) -> Self {
        self.macro_feed = Some(macro_feed);
        self
    }

    /// The authoritative regime, if one has been established.
    pub fn current(&self) -> Option<RegimeLabel> {
        self.current
    }

    /// Accepted snapshots, oldest first, with strictly increasing timestamps.
    pub fn history(&self) -> &VecDeque<RegimeSnapshot> {
        &self.history
    }

    /// Run one fetch → classify → compare cycle. Never fails: every fault is
    /// folded into `TickOutcome::Skipped`.
    pub async fn tick(&mut self) -> TickOutcome {
        let bars = match timeout(
            self.cfg.fetch_timeout,
            self.feed.fetch_latest(&self.cfg.symbol, self.cfg.window_bars),
        )
        .await
        {
            Ok(Ok(bars)) => bars,
            Ok(Err(e)) => return self.skip(e),
            Err(_) => {
                return self.skip(Error::DataUnavailable(format!(
                    "fetch timed out after {:?}",
                    self.cfg.fetch_timeout
                )))
            }
        };

        let inflation = self.inflation_rate(&bars).await;
        let snapshot = match self.classifier.classify_bars(&bars, inflation) {
            Ok(snapshot) => snapshot,
            Err(e) => return self.skip(e),
        };

        if let Some(last) = self.history.back() {
            if snapshot.timestamp <= last.timestamp {
                debug!(at = %snapshot.timestamp, "No new bar since last classification");
                return TickOutcome::Skipped("no new bar".into());
            }
        }

        self.history.push_back(snapshot.clone());
        while self.history.len() > self.cfg.history_limit {
            self.history.pop_front();
        }

        self.observe(snapshot)
    }

    /// Apply the debounce rule to an accepted snapshot.
    fn observe(&mut self, snapshot: RegimeSnapshot) -> TickOutcome {
        let label = snapshot.label;
        let kind = label.kind();

        let Some(current) = self.current else {
            // Nothing to protect yet: the first classification is authoritative.
            return self.emit(None, snapshot);
        };

        if current.kind() == kind {
            self.pending = None;
            self.current = Some(label);
            return TickOutcome::Unchanged(kind);
        }

        let seen = match self.pending {
            Some((candidate, n)) if candidate == kind => n + 1,
            _ => 1,
        };
        if seen >= self.cfg.confirmations {
            return self.emit(Some(current), snapshot);
        }

        debug!(%kind, seen, needed = self.cfg.confirmations, "Regime change pending confirmation");
        self.pending = Some((kind, seen));
        TickOutcome::Pending {
            candidate: kind,
            seen,
            needed: self.cfg.confirmations,
        }
    }

    fn emit(&mut self, previous: Option<RegimeLabel>, snapshot: RegimeSnapshot) -> TickOutcome {
        let current = snapshot.label;
        info!(
            from = ?previous.map(|l| l.kind()),
            to = %current.kind(),
            confidence = current.confidence(),
            "Regime change"
        );
        self.current = Some(current);
        self.pending = None;
        TickOutcome::Changed(RegimeChangeEvent {
            previous,
            current,
            timestamp: snapshot.timestamp,
            snapshot,
        })
    }

    fn skip(&self, error: Error) -> TickOutcome {
        warn!(
            symbol = %self.cfg.symbol,
            error = %error,
            current = ?self.current.map(|l| l.kind()),
            "Regime tick skipped; keeping previous regime"
        );
        TickOutcome::Skipped(error.to_string())
    }

    async fn inflation_rate(&self, bars: &[common::Bar]) -> Option<f64> {
        let macro_feed = self.macro_feed.as_ref()?;
        let at = bars.last()?.timestamp;
        match timeout(self.cfg.fetch_timeout, macro_feed.inflation_rate(at)).await {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                warn!(error = %e, "Macro data unavailable; classifying without inflation");
                None
            }
            Err(_) => {
                warn!("Macro fetch timed out; classifying without inflation");
                None
            }
        }
    }

    /// Poll on the configured interval, forwarding changes to `event_tx`.
    /// Returns when the receiver is dropped. Call from `tokio::spawn`.
    pub async fn run(mut self, event_tx: mpsc::Sender<RegimeChangeEvent>) {
        info!(
            symbol = %self.cfg.symbol,
            interval = ?self.cfg.poll_interval,
            confirmations = self.cfg.confirmations,
            "RegimeMonitor running"
        );
        let mut ticker = interval(self.cfg.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if event_tx.is_closed() {
                break;
            }
            if let TickOutcome::Changed(event) = self.tick().await {
                if event_tx.send(event).await.is_err() {
                    break;
                }
            }
        }
        warn!("RegimeMonitor: event channel closed");
    }
}
