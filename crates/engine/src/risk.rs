use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::{info, warn};

use common::{OrderHandle, OrderIntent, RiskSettings};

const EPS: f64 = 1e-12;

/// Why the gate refused an order.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskRejection {
    /// Equity is too far below its peak to add exposure.
    DrawdownHalt { drawdown: f64 },
    /// One order would carry more notional than the per-order limit.
    ExposureLimit { notional: f64, limit: f64 },
    /// No price is known to value the order.
    NoPrice,
}

impl std::fmt::Display for RiskRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DrawdownHalt { drawdown } => {
                write!(f, "drawdown halt: equity {:.2}% below peak", drawdown * 100.0)
            }
            Self::ExposureLimit { notional, limit } => {
                write!(f, "order notional {notional:.2} exceeds limit {limit:.2}")
            }
            Self::NoPrice => write!(f, "no price to value the order"),
        }
    }
}

/// Cash and holdings accumulated from fills, marked to the latest prices.
#[derive(Debug)]
struct Book {
    cash: f64,
    holdings: HashMap<String, f64>,
    marks: HashMap<String, f64>,
    peak: f64,
    halted: bool,
}

impl Book {
    fn equity(&self) -> f64 {
        self.cash
            + self
                .holdings
                .iter()
                .map(|(symbol, qty)| qty * self.marks.get(symbol).copied().unwrap_or(0.0))
                .sum::<f64>()
    }

    /// Current drawdown from peak equity; raises the peak first.
    fn drawdown(&mut self) -> f64 {
        let equity = self.equity();
        if equity > self.peak {
            self.peak = equity;
        }
        if self.peak <= 0.0 {
            return 0.0;
        }
        ((self.peak - equity) / self.peak).max(0.0)
    }
}

/// Pre-trade limits between strategy signals and the order router.
///
/// Orders that only shrink a position always pass. Orders that add exposure
/// are refused while equity sits `max_drawdown_halt` or more below its peak,
/// and when their notional exceeds `max_position_fraction` of equity.
pub struct RiskGate {
    limits: RiskSettings,
    book: Mutex<Book>,
}

impl RiskGate {
    pub fn new(limits: RiskSettings, starting_equity: f64) -> Self {
        info!(
            max_position_fraction = limits.max_position_fraction,
            max_drawdown_halt = limits.max_drawdown_halt,
            equity = starting_equity,
            "RiskGate initialized"
        );
        Self {
            limits,
            book: Mutex::new(Book {
                cash: starting_equity,
                holdings: HashMap::new(),
                marks: HashMap::new(),
                peak: starting_equity,
                halted: false,
            }),
        }
    }

    pub fn limits(&self) -> RiskSettings {
        self.limits
    }

    /// Record the latest price for `symbol`.
    pub async fn mark(&self, symbol: &str, price: f64) {
        if price.is_finite() && price > 0.0 {
            self.book.lock().await.marks.insert(symbol.to_string(), price);
        }
    }

    pub async fn equity(&self) -> f64 {
        self.book.lock().await.equity()
    }

    /// Decide whether `intent` may be sent given the net `position` it
    /// would be applied to.
    pub async fn check(&self, intent: &OrderIntent, position: f64) -> Result<(), RiskRejection> {
        let after = position + intent.side.sign() * intent.quantity;
        if after.abs() <= position.abs() + EPS {
            return Ok(());
        }

        let mut book = self.book.lock().await;
        let drawdown = book.drawdown();
        if drawdown >= self.limits.max_drawdown_halt {
            if !book.halted {
                warn!(drawdown_pct = drawdown * 100.0, "Max drawdown breached; refusing new exposure");
                book.halted = true;
            }
            return Err(RiskRejection::DrawdownHalt { drawdown });
        }
        if book.halted {
            info!(drawdown_pct = drawdown * 100.0, "Drawdown back within limit; exposure allowed again");
            book.halted = false;
        }

        let price = intent
            .limit_price
            .or_else(|| book.marks.get(&intent.symbol).copied())
            .ok_or(RiskRejection::NoPrice)?;
        let notional = intent.quantity * price;
        let limit = self.limits.max_position_fraction * book.equity();
        if notional > limit {
            return Err(RiskRejection::ExposureLimit { notional, limit });
        }
        Ok(())
    }

    /// Apply an acknowledged order's fill to the book.
    pub async fn record_fill(&self, handle: &OrderHandle) {
        let Some(price) = handle.average_price else {
            return;
        };
        if handle.filled_quantity <= 0.0 {
            return;
        }
        let signed = handle.side.sign() * handle.filled_quantity;
        let mut book = self.book.lock().await;
        book.cash -= signed * price;
        *book.holdings.entry(handle.symbol.clone()).or_insert(0.0) += signed;
        book.marks.entry(handle.symbol.clone()).or_insert(price);
    }
}
