use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use common::{Error, ExecutionBackend, OrderHandle, OrderIntent, PositionSnapshot, Result};

/// Intent ids remembered for duplicate detection.
const SEEN_CAPACITY: usize = 10_000;

#[derive(Default)]
struct SeenIntents {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl SeenIntents {
    /// `false` if `id` was already recorded.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > SEEN_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }
}

/// Forwards order intents to the execution backend, each at most once.
///
/// This is the ONLY component that calls `ExecutionBackend::submit`. An
/// intent id is recorded before the backend is called, so a failed or
/// timed-out submission is reported and never retried behind the caller's
/// back.
pub struct OrderRouter {
    backend: Arc<dyn ExecutionBackend>,
    seen: Mutex<SeenIntents>,
    submit_timeout: Duration,
}

impl OrderRouter {
    pub fn new(backend: Arc<dyn ExecutionBackend>, submit_timeout: Duration) -> Self {
        Self {
            backend,
            seen: Mutex::new(SeenIntents::default()),
            submit_timeout,
        }
    }

    pub async fn route(&self, intent: &OrderIntent) -> Result<OrderHandle> {
        if !self.seen.lock().await.insert(intent.id) {
            warn!(intent = %intent.id, strategy = %intent.strategy, "Duplicate order intent dropped");
            return Err(Error::Exchange(format!("intent {} already submitted", intent.id)));
        }

        info!(
            strategy = %intent.strategy,
            symbol = %intent.symbol,
            side = %intent.side,
            qty = intent.quantity,
            limit = ?intent.limit_price,
            "Submitting order"
        );

        match timeout(self.submit_timeout, self.backend.submit(intent)).await {
            Ok(Ok(handle)) => {
                info!(
                    order = %handle.order_id,
                    status = ?handle.status,
                    filled = handle.filled_quantity,
                    price = ?handle.average_price,
                    "Order acknowledged"
                );
                Ok(handle)
            }
            Ok(Err(e)) => {
                error!(strategy = %intent.strategy, symbol = %intent.symbol, error = %e, "Order submission failed");
                Err(e)
            }
            Err(_) => {
                error!(strategy = %intent.strategy, symbol = %intent.symbol, "Order submission timed out");
                Err(Error::Timeout(format!(
                    "submit of intent {} exceeded {:?}",
                    intent.id, self.submit_timeout
                )))
            }
        }
    }

    pub async fn cancel(&self, handle: &OrderHandle) -> Result<()> {
        timeout(self.submit_timeout, self.backend.cancel(handle))
            .await
            .map_err(|_| Error::Timeout(format!("cancel of {} timed out", handle.order_id)))?
    }

    pub async fn positions(&self) -> Result<PositionSnapshot> {
        timeout(self.submit_timeout, self.backend.positions())
            .await
            .map_err(|_| Error::Timeout("position query timed out".into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use common::{OrderSide, OrderStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingBackend {
        submits: AtomicUsize,
        stall: bool,
    }

    #[async_trait]
    impl ExecutionBackend for CountingBackend {
        async fn submit(&self, intent: &OrderIntent) -> Result<OrderHandle> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            if self.stall {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(OrderHandle {
                order_id: intent.id.to_string(),
                intent_id: intent.id,
                symbol: intent.symbol.clone(),
                side: intent.side,
                status: OrderStatus::Filled,
                filled_quantity: intent.quantity,
                average_price: Some(100.0),
                timestamp: Utc::now(),
            })
        }

        async fn cancel(&self, _handle: &OrderHandle) -> Result<()> {
            Ok(())
        }

        async fn positions(&self) -> Result<PositionSnapshot> {
            Ok(PositionSnapshot::default())
        }
    }

    #[tokio::test]
    async fn same_intent_reaches_backend_once() {
        let backend = Arc::new(CountingBackend::default());
        let router = OrderRouter::new(backend.clone(), Duration::from_secs(1));
        let intent = OrderIntent::market("s", "BTCUSDT", OrderSide::Buy, 1.0);

        assert!(router.route(&intent).await.is_ok());
        assert!(router.route(&intent).await.is_err());
        assert_eq!(backend.submits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_backend_times_out_without_retry() {
        let backend = Arc::new(CountingBackend {
            stall: true,
            ..CountingBackend::default()
        });
        let router = OrderRouter::new(backend.clone(), Duration::from_secs(5));
        let intent = OrderIntent::market("s", "BTCUSDT", OrderSide::Sell, 1.0);

        assert!(matches!(router.route(&intent).await, Err(Error::Timeout(_))));
        assert!(router.route(&intent).await.is_err());
        assert_eq!(backend.submits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn seen_set_is_bounded() {
        let mut seen = SeenIntents::default();
        let first = Uuid::new_v4();
        seen.insert(first);
        for _ in 0..SEEN_CAPACITY {
            seen.insert(Uuid::new_v4());
        }
        assert_eq!(seen.ids.len(), SEEN_CAPACITY);
        assert!(!seen.ids.contains(&first));
    }
}
