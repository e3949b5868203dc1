pub mod config;
pub mod data;
pub mod error;
pub mod exchange;
pub mod lifecycle;
pub mod regime;
pub mod types;

pub use config::{
    interval_minutes, periods_per_year, Config, FillSettings, MacroSettings, MonitorSettings,
    RiskSettings, RunMode,
};
pub use data::{DataFeed, LifecycleStore, MacroFeed, PersistedEntry, ReportSink};
pub use error::{Error, Result};
pub use exchange::ExecutionBackend;
pub use lifecycle::*;
pub use regime::*;
pub use types::*;
