use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use common::{
    EntryId, Error, LifecycleState, LifecycleStore, PerformanceReport, PersistedEntry, RegimeKind,
    ReportSink, Result,
};

/// Apply the schema in `migrations/`.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|e| Error::Other(format!("migration failed: {e}")))
}

/// `strategy_lifecycle` table backing the strategy registry.
#[derive(Clone)]
pub struct SqliteLifecycleStore {
    pool: SqlitePool,
}

impl SqliteLifecycleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn entry_id(raw: &str) -> Result<EntryId> {
    Uuid::parse_str(raw)
        .map(EntryId)
        .map_err(|e| Error::Other(format!("corrupt entry id '{raw}': {e}")))
}

#[async_trait]
impl LifecycleStore for SqliteLifecycleStore {
    async fn insert(&self, entry: &PersistedEntry) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO strategy_lifecycle (id, strategy, regime, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        )
        .bind(entry.id.to_string())
        .bind(&entry.strategy)
        .bind(entry.regime.as_str())
        .bind(entry.state.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Compare-and-set on the stored state inside one transaction.
    async fn move_entry(
        &self,
        id: EntryId,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE strategy_lifecycle SET state = ?1, updated_at = ?2
             WHERE id = ?3 AND state = ?4",
        )
        .bind(to.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let row = sqlx::query("SELECT strategy, regime, state FROM strategy_lifecycle WHERE id = ?1")
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;
            let Some(row) = row else {
                return Err(Error::UnknownEntry(id));
            };
            return Err(Error::RegistryConflict {
                strategy: row.try_get("strategy")?,
                regime: row.try_get::<String, _>("regime")?.parse()?,
                expected: from,
                found: Some(row.try_get::<String, _>("state")?.parse()?),
            });
        }

        tx.commit().await?;
        debug!(entry = %id, %from, %to, "Lifecycle row moved");
        Ok(())
    }

    async fn remove(&self, id: EntryId) -> Result<()> {
        let removed = sqlx::query("DELETE FROM strategy_lifecycle WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if removed == 0 {
            return Err(Error::UnknownEntry(id));
        }
        Ok(())
    }

    async fn load(&self) -> Result<Vec<PersistedEntry>> {
        let rows = sqlx::query(
            "SELECT id, strategy, regime, state FROM strategy_lifecycle ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<PersistedEntry> {
                Ok(PersistedEntry {
                    id: entry_id(&row.try_get::<String, _>("id")?)?,
                    strategy: row.try_get("strategy")?,
                    regime: row.try_get::<String, _>("regime")?.parse()?,
                    state: row.try_get::<String, _>("state")?.parse()?,
                })
            })
            .collect()
    }
}

/// Append-only `performance_reports` table.
#[derive(Clone)]
pub struct SqliteReportSink {
    pool: SqlitePool,
}

impl SqliteReportSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Most recent report for a strategy in a regime.
    pub async fn latest(&self, strategy: &str, regime: RegimeKind) -> Result<Option<PerformanceReport>> {
        let row = sqlx::query(
            "SELECT report_json FROM performance_reports
             WHERE strategy = ?1 AND regime = ?2
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(strategy)
        .bind(regime.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(serde_json::from_str(&row.try_get::<String, _>("report_json")?)?)),
            None => Ok(None),
        }
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM performance_reports")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

#[async_trait]
impl ReportSink for SqliteReportSink {
    async fn record(&self, report: &PerformanceReport) -> Result<()> {
        sqlx::query(
            "INSERT INTO performance_reports (
                id, strategy, regime, range_start, range_end, sharpe_ratio, max_drawdown,
                win_rate, trade_count, total_return, bars_in_regime, total_bars,
                partial_fills, signal_errors, report_json, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        )
        .bind(report.id.to_string())
        .bind(&report.strategy)
        .bind(report.regime.as_str())
        .bind(report.range.start.to_rfc3339())
        .bind(report.range.end.to_rfc3339())
        .bind(report.sharpe_ratio)
        .bind(report.max_drawdown)
        .bind(report.win_rate)
        .bind(report.trade_count as i64)
        .bind(report.total_return)
        .bind(report.bars_in_regime as i64)
        .bind(report.total_bars as i64)
        .bind(report.partial_fills as i64)
        .bind(report.signal_errors as i64)
        .bind(serde_json::to_string(report)?)
        .bind(report.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        debug!(strategy = %report.strategy, regime = %report.regime, "Performance report stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use common::TimeRange;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        // One connection: every handle must see the same in-memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate(&pool).await.unwrap();
        pool
    }

    fn entry(strategy: &str, state: LifecycleState) -> PersistedEntry {
        PersistedEntry {
            id: EntryId::new(),
            strategy: strategy.into(),
            regime: RegimeKind::Bull,
            state,
        }
    }

    #[tokio::test]
    async fn insert_move_and_load() {
        let store = SqliteLifecycleStore::new(pool().await);
        let e = entry("ema", LifecycleState::ToTest);
        store.insert(&e).await.unwrap();
        store
            .move_entry(e.id, LifecycleState::ToTest, LifecycleState::Approved)
            .await
            .unwrap();

        let rows = store.load().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, e.id);
        assert_eq!(rows[0].state, LifecycleState::Approved);
    }

    #[tokio::test]
    async fn stale_move_is_a_conflict() {
        let store = SqliteLifecycleStore::new(pool().await);
        let e = entry("ema", LifecycleState::ToTest);
        store.insert(&e).await.unwrap();
        store
            .move_entry(e.id, LifecycleState::ToTest, LifecycleState::Trash)
            .await
            .unwrap();

        let err = store
            .move_entry(e.id, LifecycleState::ToTest, LifecycleState::Approved)
            .await
            .unwrap_err();
        match err {
            Error::RegistryConflict { expected, found, regime, .. } => {
                assert_eq!(expected, LifecycleState::ToTest);
                assert_eq!(found, Some(LifecycleState::Trash));
                assert_eq!(regime, RegimeKind::Bull);
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(store.load().await.unwrap()[0].state, LifecycleState::Trash);
    }

    #[tokio::test]
    async fn missing_entry_is_unknown() {
        let store = SqliteLifecycleStore::new(pool().await);
        let id = EntryId::new();
        assert!(matches!(
            store.move_entry(id, LifecycleState::ToTest, LifecycleState::Trash).await,
            Err(Error::UnknownEntry(found)) if found == id
        ));
        assert!(matches!(store.remove(id).await, Err(Error::UnknownEntry(_))));
    }

    #[tokio::test]
    async fn removed_entry_is_not_loaded() {
        let store = SqliteLifecycleStore::new(pool().await);
        let keep = entry("keep", LifecycleState::ToTest);
        let gone = entry("gone", LifecycleState::ToTest);
        store.insert(&keep).await.unwrap();
        store.insert(&gone).await.unwrap();
        store.remove(gone.id).await.unwrap();

        let rows = store.load().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].strategy, "keep");
    }

    #[tokio::test]
    async fn reports_are_appended_and_readable() {
        let sink = SqliteReportSink::new(pool().await);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut report = PerformanceReport {
            id: Uuid::new_v4(),
            strategy: "ema".into(),
            regime: RegimeKind::Bull,
            range: TimeRange { start, end: start + Duration::days(30) },
            sharpe_ratio: 1.4,
            max_drawdown: 0.12,
            win_rate: 0.55,
            trade_count: 9,
            total_return: 0.08,
            bars_in_regime: 20,
            total_bars: 30,
            partial_fills: 1,
            signal_errors: 0,
            equity_curve: Vec::new(),
            created_at: start,
        };
        sink.record(&report).await.unwrap();

        report.id = Uuid::new_v4();
        report.sharpe_ratio = 0.3;
        report.created_at = start + Duration::days(1);
        sink.record(&report).await.unwrap();

        assert_eq!(sink.count().await.unwrap(), 2);
        let latest = sink.latest("ema", RegimeKind::Bull).await.unwrap().unwrap();
        assert_eq!(latest.sharpe_ratio, 0.3);
        assert!(sink.latest("ema", RegimeKind::Bear).await.unwrap().is_none());
    }
}
