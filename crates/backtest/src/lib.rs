pub mod approval;
pub mod engine;
pub mod metrics;
pub mod sink;

pub use approval::{
    check, evaluate, ApprovalManager, ApprovalOutcome, CandidateResult, ThresholdFailure,
};
pub use engine::{BacktestEngine, FillModel};
pub use sink::InMemoryReportSink;
