pub mod classifier;
pub mod features;
pub mod historical;
pub mod monitor;

pub use classifier::{ClassifierConfig, RegimeClassifier};
pub use features::FeatureExtractor;
pub use historical::{HistoricalRegimeProvider, RegimeSeries};
pub use monitor::{MonitorConfig, RegimeMonitor, TickOutcome};
