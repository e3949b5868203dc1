use async_trait::async_trait;

use crate::{OrderHandle, OrderIntent, PositionSnapshot, Result};

/// Abstraction over where orders go.
///
/// `BinanceClient` implements this for live trading.
/// `SimulatedBackend` implements this for paper trading.
///
/// Only `OrderRouter` in `crates/engine` should hold a reference to a
/// `dyn ExecutionBackend`. All order flow from strategies goes through the
/// Execution Coordinator before reaching the router.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Submit an order and return the backend's acknowledgement.
    async fn submit(&self, intent: &OrderIntent) -> Result<OrderHandle>;

    /// Cancel a working order. Cancelling a finished order is a no-op.
    async fn cancel(&self, handle: &OrderHandle) -> Result<()>;

    /// Current holdings.
    async fn positions(&self) -> Result<PositionSnapshot>;
}
