use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use common::{
    Error, ExecutionBackend, OrderHandle, OrderIntent, OrderSide, OrderStatus, Position,
    PositionSnapshot, Result,
};

const EPS: f64 = 1e-12;

/// Simulated execution backend for paper trading.
///
/// Market orders fill at the latest known price with configurable slippage.
/// Limit orders rest until a price update crosses them. No real orders are
/// ever sent to an exchange.
pub struct SimulatedBackend {
    /// Simulated quote balance in USDT.
    balance_usd: RwLock<f64>,
    /// Net position per symbol.
    positions: RwLock<HashMap<String, Position>>,
    /// Latest known price per symbol, updated via `update_price`.
    prices: RwLock<HashMap<String, f64>>,
    /// Limit orders that have not crossed yet, in arrival order.
    resting: RwLock<Vec<(OrderIntent, OrderHandle)>>,
    /// Slippage in basis points applied to market fills.
    slippage_bps: f64,
}

impl SimulatedBackend {
    pub fn new(initial_balance_usd: f64, slippage_bps: f64) -> Self {
        info!(
            balance = initial_balance_usd,
            slippage_bps = slippage_bps,
            "SimulatedBackend initialized"
        );
        Self {
            balance_usd: RwLock::new(initial_balance_usd),
            positions: RwLock::new(HashMap::new()),
            prices: RwLock::new(HashMap::new()),
            resting: RwLock::new(Vec::new()),
            slippage_bps,
        }
    }

    /// Record the latest price for a symbol and fill any resting limit order
    /// it crosses. Returns the handles of orders filled by this update.
    pub async fn update_price(&self, symbol: &str, price: f64) -> Vec<OrderHandle> {
        self.prices.write().await.insert(symbol.to_string(), price);

        let crossed: Vec<(OrderIntent, OrderHandle)> = {
            let mut resting = self.resting.write().await;
            let (hit, keep): (Vec<_>, Vec<_>) = resting
                .drain(..)
                .partition(|(intent, _)| intent.symbol == symbol && crosses(intent, price));
            *resting = keep;
            hit
        };

        let mut filled = Vec::with_capacity(crossed.len());
        for (intent, mut handle) in crossed {
            let fill_price = limit_fill_price(&intent, price);
            if let Err(e) = self.ensure_affordable(&intent, fill_price).await {
                warn!(symbol, order = %handle.order_id, error = %e, "Resting paper order dropped");
                continue;
            }
            self.book_fill(&intent, fill_price).await;
            handle.status = OrderStatus::Filled;
            handle.filled_quantity = intent.quantity;
            handle.average_price = Some(fill_price);
            handle.timestamp = Utc::now();
            info!(symbol, side = %intent.side, qty = intent.quantity, price = fill_price, "Resting paper order filled");
            filled.push(handle);
        }
        filled
    }

    pub async fn balance(&self) -> f64 {
        *self.balance_usd.read().await
    }

    /// Limit orders still waiting for their price.
    pub async fn open_orders(&self) -> Vec<OrderHandle> {
        self.resting.read().await.iter().map(|(_, h)| h.clone()).collect()
    }

    fn slipped(&self, side: OrderSide, price: f64) -> f64 {
        // Buys pay more, sells receive less
        price * (1.0 + side.sign() * self.slippage_bps / 10_000.0)
    }

    /// Buys must be covered by the quote balance.
    async fn ensure_affordable(&self, intent: &OrderIntent, price: f64) -> Result<()> {
        if intent.side == OrderSide::Sell {
            return Ok(());
        }
        let cost = intent.quantity * price;
        let balance = *self.balance_usd.read().await;
        if cost > balance + EPS {
            return Err(Error::Exchange(format!(
                "insufficient balance for {} {}: cost {cost:.2}, available {balance:.2}",
                intent.quantity, intent.symbol
            )));
        }
        Ok(())
    }

    async fn book_fill(&self, intent: &OrderIntent, price: f64) {
        let signed = intent.side.sign() * intent.quantity;
        *self.balance_usd.write().await -= signed * price;

        let mut positions = self.positions.write().await;
        let pos = positions.entry(intent.symbol.clone()).or_insert_with(|| Position {
            symbol: intent.symbol.clone(),
            quantity: 0.0,
            average_price: 0.0,
        });
        let held = pos.quantity.abs();
        if held <= EPS || pos.quantity.signum() == signed.signum() {
            pos.average_price = (pos.average_price * held + price * intent.quantity) / (held + intent.quantity);
            pos.quantity += signed;
        } else if intent.quantity > held + EPS {
            // Flipped through zero: the remainder opens at this price
            pos.quantity += signed;
            pos.average_price = price;
        } else {
            pos.quantity += signed;
        }
        if pos.quantity.abs() <= EPS {
            positions.remove(&intent.symbol);
        }
    }
}

fn crosses(intent: &OrderIntent, price: f64) -> bool {
    match (intent.limit_price, intent.side) {
        (None, _) => true,
        (Some(limit), OrderSide::Buy) => price <= limit,
        (Some(limit), OrderSide::Sell) => price >= limit,
    }
}

/// A crossed limit fills at the better of the market and its limit.
fn limit_fill_price(intent: &OrderIntent, price: f64) -> f64 {
    match (intent.limit_price, intent.side) {
        (Some(limit), OrderSide::Buy) => price.min(limit),
        (Some(limit), OrderSide::Sell) => price.max(limit),
        (None, _) => price,
    }
}

#[async_trait]
impl ExecutionBackend for SimulatedBackend {
    async fn submit(&self, intent: &OrderIntent) -> Result<OrderHandle> {
        if !(intent.quantity.is_finite() && intent.quantity > 0.0) {
            return Err(Error::Exchange(format!(
                "invalid order quantity {} for {}",
                intent.quantity, intent.symbol
            )));
        }

        let mid_price = self
            .prices
            .read()
            .await
            .get(&intent.symbol)
            .copied()
            .ok_or_else(|| {
                Error::Exchange(format!(
                    "SimulatedBackend has no price for '{}'. Ensure market events are flowing.",
                    intent.symbol
                ))
            })?;

        let mut handle = OrderHandle {
            order_id: intent.id.to_string(),
            intent_id: intent.id,
            symbol: intent.symbol.clone(),
            side: intent.side,
            status: OrderStatus::Working,
            filled_quantity: 0.0,
            average_price: None,
            timestamp: Utc::now(),
        };

        if !crosses(intent, mid_price) {
            if let Some(limit) = intent.limit_price {
                self.ensure_affordable(intent, limit).await?;
            }
            debug!(symbol = %intent.symbol, side = %intent.side, limit = ?intent.limit_price, "Paper limit order resting");
            self.resting.write().await.push((intent.clone(), handle.clone()));
            return Ok(handle);
        }

        let fill_price = match intent.limit_price {
            None => self.slipped(intent.side, mid_price),
            Some(_) => limit_fill_price(intent, mid_price),
        };
        self.ensure_affordable(intent, fill_price).await?;
        self.book_fill(intent, fill_price).await;

        debug!(
            symbol = %intent.symbol,
            side = %intent.side,
            mid = mid_price,
            fill = fill_price,
            qty = intent.quantity,
            "Paper fill simulated"
        );

        handle.status = OrderStatus::Filled;
        handle.filled_quantity = intent.quantity;
        handle.average_price = Some(fill_price);
        Ok(handle)
    }

    async fn cancel(&self, handle: &OrderHandle) -> Result<()> {
        let mut resting = self.resting.write().await;
        if let Some(idx) = resting.iter().position(|(_, h)| h.order_id == handle.order_id) {
            resting.remove(idx);
            info!(order = %handle.order_id, "Paper order cancelled");
        }
        Ok(())
    }

    async fn positions(&self) -> Result<PositionSnapshot> {
        Ok(PositionSnapshot {
            positions: self.positions.read().await.values().cloned().collect(),
            taken_at: Some(Utc::now()),
        })
    }
}
