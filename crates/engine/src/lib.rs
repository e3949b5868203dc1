pub mod binance;
pub mod coordinator;
pub mod executor;
pub mod lifecycle;
pub mod macro_feed;
pub mod risk;
pub mod store;

pub use binance::{BinanceClient, BinanceStream};
pub use coordinator::{ActiveStrategySet, ExecutionCoordinator, TickReport};
pub use executor::OrderRouter;
pub use lifecycle::{Engine, EngineHandle};
pub use macro_feed::{HttpInflationFeed, StaticInflation};
pub use risk::{RiskGate, RiskRejection};
pub use store::{migrate, SqliteLifecycleStore, SqliteReportSink};
