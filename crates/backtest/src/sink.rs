use async_trait::async_trait;
use tokio::sync::RwLock;

use common::{PerformanceReport, ReportSink, Result};

/// Keeps reports in memory. Used in backtest-only runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryReportSink {
    reports: RwLock<Vec<PerformanceReport>>,
}

impl InMemoryReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reports(&self) -> Vec<PerformanceReport> {
        self.reports.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.reports.read().await.len()
    }
}

#[async_trait]
impl ReportSink for InMemoryReportSink {
    async fn record(&self, report: &PerformanceReport) -> Result<()> {
        self.reports.write().await.push(report.clone());
        Ok(())
    }
}
