use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use common::{
    EntryId, Error, LifecycleState, LifecycleStore, PersistedEntry, RegimeKind, Result,
};

use crate::Strategy;

/// Raised when a candidate is withdrawn; polled by in-flight backtests.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    raised: Arc<AtomicBool>,
    parent: Option<Box<CancelFlag>>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// A flag that is cancelled when either it or `self` is. Cancelling the
    /// child leaves `self` untouched.
    pub fn child(&self) -> Self {
        Self {
            raised: Arc::new(AtomicBool::new(false)),
            parent: Some(Box::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
            || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }
}

/// A registry entry handed out for evaluation (backtest or re-test).
#[derive(Clone)]
pub struct Candidate {
    pub id: EntryId,
    pub regime: RegimeKind,
    pub strategy: Arc<dyn Strategy>,
    pub cancel: CancelFlag,
}

impl std::fmt::Debug for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candidate")
            .field("id", &self.id)
            .field("regime", &self.regime)
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

/// Read-only view of an entry for logs and audits.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySummary {
    pub id: EntryId,
    pub strategy: String,
    pub state: LifecycleState,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub restored: usize,
    pub submitted: usize,
    pub kept_in_trash: usize,
}

struct Entry {
    id: EntryId,
    strategy: Arc<dyn Strategy>,
    state: LifecycleState,
    updated_at: DateTime<Utc>,
    cancel: CancelFlag,
}

impl Entry {
    fn candidate(&self, regime: RegimeKind) -> Candidate {
        Candidate {
            id: self.id,
            regime,
            strategy: self.strategy.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

#[derive(Default)]
struct Partition {
    /// Submission order; trashed entries stay for audit.
    entries: Vec<Entry>,
}

impl Partition {
    fn find_mut(&mut self, id: EntryId) -> Result<&mut Entry> {
        self.entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(Error::UnknownEntry(id))
    }

    fn live_entry_named(&self, name: &str) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|e| e.state != LifecycleState::Trash && e.strategy.name() == name)
    }
}

/// Authoritative lifecycle state of every strategy, partitioned by regime.
///
/// Each regime partition sits behind its own lock: reads that build an
/// active set and lifecycle writes on the same regime are mutually
/// exclusive, while different regimes never contend. When a store is
/// attached, it is written first and memory changes only if the write
/// succeeded.
pub struct StrategyRegistry {
    partitions: [Mutex<Partition>; RegimeKind::COUNT],
    store: Option<Arc<dyn LifecycleStore>>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            partitions: std::array::from_fn(|_| Mutex::new(Partition::default())),
            store: None,
        }
    }

    pub fn with_store(store: Arc<dyn LifecycleStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new()
        }
    }

    fn partition(&self, regime: RegimeKind) -> &Mutex<Partition> {
        &self.partitions[regime.index()]
    }

    /// Add a new `to_test` entry. A name that is already `to_test` or
    /// `approved` in the regime is rejected; a trashed name may be resubmitted
    /// and gets a fresh entry.
    pub async fn submit(&self, strategy: Arc<dyn Strategy>, regime: RegimeKind) -> Result<EntryId> {
        let mut partition = self.partition(regime).lock().await;
        if let Some(existing) = partition.live_entry_named(strategy.name()) {
            return Err(Error::AlreadyRegistered {
                strategy: strategy.name().to_string(),
                regime,
                state: existing.state,
            });
        }

        let id = EntryId::new();
        if let Some(store) = &self.store {
            store
                .insert(&PersistedEntry {
                    id,
                    strategy: strategy.name().to_string(),
                    regime,
                    state: LifecycleState::ToTest,
                })
                .await?;
        }

        info!(strategy = %strategy.name(), %regime, entry = %id, "Strategy submitted to to_test");
        partition.entries.push(Entry {
            id,
            strategy,
            state: LifecycleState::ToTest,
            updated_at: Utc::now(),
            cancel: CancelFlag::new(),
        });
        Ok(id)
    }

    /// Move an entry from `from` to `to`.
    ///
    /// The stored state must equal `from`; anything else means another writer
    /// got there first and is reported as `RegistryConflict`.
    pub async fn transition(
        &self,
        id: EntryId,
        regime: RegimeKind,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Result<()> {
        let mut partition = self.partition(regime).lock().await;
        let entry = partition.find_mut(id)?;

        if entry.state != from {
            return Err(Error::RegistryConflict {
                strategy: entry.strategy.name().to_string(),
                regime,
                expected: from,
                found: Some(entry.state),
            });
        }
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }

        if let Some(store) = &self.store {
            store.move_entry(id, from, to).await?;
        }

        entry.state = to;
        entry.updated_at = Utc::now();
        info!(strategy = %entry.strategy.name(), %regime, %from, %to, "Lifecycle transition");
        Ok(())
    }

    /// Withdraw a candidate that has not been decided yet. Any backtest in
    /// flight for it observes the raised cancel flag.
    pub async fn withdraw(&self, id: EntryId, regime: RegimeKind) -> Result<()> {
        let mut partition = self.partition(regime).lock().await;
        let idx = partition
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or(Error::UnknownEntry(id))?;

        let entry = &partition.entries[idx];
        if entry.state != LifecycleState::ToTest {
            return Err(Error::RegistryConflict {
                strategy: entry.strategy.name().to_string(),
                regime,
                expected: LifecycleState::ToTest,
                found: Some(entry.state),
            });
        }

        if let Some(store) = &self.store {
            store.remove(id).await?;
        }

        let entry = partition.entries.remove(idx);
        entry.cancel.cancel();
        info!(strategy = %entry.strategy.name(), %regime, "Candidate withdrawn");
        Ok(())
    }

    /// Approved strategies for `regime` in submission order.
    pub async fn approved(&self, regime: RegimeKind) -> Vec<Arc<dyn Strategy>> {
        let partition = self.partition(regime).lock().await;
        partition
            .entries
            .iter()
            .filter(|e| e.state == LifecycleState::Approved)
            .map(|e| e.strategy.clone())
            .collect()
    }

    /// Entries in `state` for `regime`, as evaluation candidates.
    pub async fn in_state(&self, regime: RegimeKind, state: LifecycleState) -> Vec<Candidate> {
        let partition = self.partition(regime).lock().await;
        partition
            .entries
            .iter()
            .filter(|e| e.state == state)
            .map(|e| e.candidate(regime))
            .collect()
    }

    pub async fn candidates(&self, regime: RegimeKind) -> Vec<Candidate> {
        self.in_state(regime, LifecycleState::ToTest).await
    }

    /// `None` once the entry has been withdrawn.
    pub async fn state_of(&self, id: EntryId, regime: RegimeKind) -> Option<LifecycleState> {
        let partition = self.partition(regime).lock().await;
        partition.entries.iter().find(|e| e.id == id).map(|e| e.state)
    }

    pub async fn entries(&self, regime: RegimeKind) -> Vec<EntrySummary> {
        let partition = self.partition(regime).lock().await;
        partition
            .entries
            .iter()
            .map(|e| EntrySummary {
                id: e.id,
                strategy: e.strategy.name().to_string(),
                state: e.state,
                updated_at: e.updated_at,
            })
            .collect()
    }

    /// Rebuild entries for configured strategies from the attached store.
    ///
    /// A strategy with a live persisted row resumes in that state under its
    /// old id. One whose only rows are trashed stays trashed: it is never
    /// silently resubmitted. Anything else is submitted fresh.
    pub async fn restore(
        &self,
        strategies: Vec<(Arc<dyn Strategy>, RegimeKind)>,
    ) -> Result<RestoreSummary> {
        let persisted = match &self.store {
            Some(store) => store.load().await?,
            None => Vec::new(),
        };
        let mut summary = RestoreSummary::default();
        let mut seen: HashSet<(String, RegimeKind)> = HashSet::new();

        for (strategy, regime) in strategies {
            let key = (strategy.name().to_string(), regime);
            if !seen.insert(key) {
                warn!(strategy = %strategy.name(), %regime, "Duplicate strategy in config, skipping");
                continue;
            }

            let rows: Vec<&PersistedEntry> = persisted
                .iter()
                .filter(|p| p.regime == regime && p.strategy == strategy.name())
                .collect();

            if let Some(row) = rows.iter().find(|p| p.state != LifecycleState::Trash) {
                let mut partition = self.partition(regime).lock().await;
                partition.entries.push(Entry {
                    id: row.id,
                    strategy,
                    state: row.state,
                    updated_at: Utc::now(),
                    cancel: CancelFlag::new(),
                });
                summary.restored += 1;
            } else if let Some(row) = rows.first() {
                let mut partition = self.partition(regime).lock().await;
                partition.entries.push(Entry {
                    id: row.id,
                    strategy,
                    state: LifecycleState::Trash,
                    updated_at: Utc::now(),
                    cancel: CancelFlag::new(),
                });
                summary.kept_in_trash += 1;
            } else {
                self.submit(strategy, regime).await?;
                summary.submitted += 1;
            }
        }

        info!(
            restored = summary.restored,
            submitted = summary.submitted,
            trashed = summary.kept_in_trash,
            "Strategy registry restored"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StrategyParams;
    use async_trait::async_trait;
    use common::{MarketState, OrderIntent};
    use std::sync::Mutex as StdMutex;

    struct Named(String, StrategyParams);

    impl Strategy for Named {
        fn name(&self) -> &str {
            &self.0
        }
        fn symbol(&self) -> &str {
            "BTCUSDT"
        }
        fn required_parameters(&self) -> &'static [&'static str] {
            &[]
        }
        fn parameters(&self) -> &StrategyParams {
            &self.1
        }
        fn regime_affinity(&self) -> RegimeKind {
            RegimeKind::Bull
        }
        fn generate_signal(&self, _state: &MarketState) -> Result<Option<OrderIntent>> {
            Ok(None)
        }
    }

    fn named(name: &str) -> Arc<dyn Strategy> {
        Arc::new(Named(name.into(), StrategyParams::new()))
    }

    #[derive(Default)]
    struct MemoryStore {
        rows: StdMutex<Vec<PersistedEntry>>,
        fail_moves: bool,
    }

    #[async_trait]
    impl LifecycleStore for MemoryStore {
        async fn insert(&self, entry: &PersistedEntry) -> Result<()> {
            self.rows.lock().unwrap().push(entry.clone());
            Ok(())
        }

        async fn move_entry(&self, id: EntryId, from: LifecycleState, to: LifecycleState) -> Result<()> {
            if self.fail_moves {
                return Err(Error::Other("store offline".into()));
            }
            let mut rows = self.rows.lock().unwrap();
            let row = rows.iter_mut().find(|r| r.id == id && r.state == from).unwrap();
            row.state = to;
            Ok(())
        }

        async fn remove(&self, id: EntryId) -> Result<()> {
            self.rows.lock().unwrap().retain(|r| r.id != id);
            Ok(())
        }

        async fn load(&self) -> Result<Vec<PersistedEntry>> {
            Ok(self.rows.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn submit_then_approve_shows_in_approved_set() {
        let registry = StrategyRegistry::new();
        let id = registry.submit(named("ema"), RegimeKind::Bull).await.unwrap();
        assert!(registry.approved(RegimeKind::Bull).await.is_empty());

        registry
            .transition(id, RegimeKind::Bull, LifecycleState::ToTest, LifecycleState::Approved)
            .await
            .unwrap();

        let approved = registry.approved(RegimeKind::Bull).await;
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].name(), "ema");
        assert!(registry.approved(RegimeKind::Bear).await.is_empty());
    }

    #[tokio::test]
    async fn stale_expected_state_is_a_conflict() {
        let registry = StrategyRegistry::new();
        let id = registry.submit(named("ema"), RegimeKind::Bull).await.unwrap();
        registry
            .transition(id, RegimeKind::Bull, LifecycleState::ToTest, LifecycleState::Trash)
            .await
            .unwrap();

        let err = registry
            .transition(id, RegimeKind::Bull, LifecycleState::ToTest, LifecycleState::Approved)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::RegistryConflict { found: Some(LifecycleState::Trash), .. }
        ));
    }

    #[tokio::test]
    async fn trash_cannot_be_revived() {
        let registry = StrategyRegistry::new();
        let id = registry.submit(named("ema"), RegimeKind::Bull).await.unwrap();
        registry
            .transition(id, RegimeKind::Bull, LifecycleState::ToTest, LifecycleState::Trash)
            .await
            .unwrap();

        let err = registry
            .transition(id, RegimeKind::Bull, LifecycleState::Trash, LifecycleState::Approved)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert!(registry.approved(RegimeKind::Bull).await.is_empty());
    }

    #[tokio::test]
    async fn resubmission_after_trash_creates_new_entry() {
        let registry = StrategyRegistry::new();
        let first = registry.submit(named("ema"), RegimeKind::Bull).await.unwrap();

        let dup = registry.submit(named("ema"), RegimeKind::Bull).await.unwrap_err();
        assert!(matches!(dup, Error::AlreadyRegistered { .. }));

        registry
            .transition(first, RegimeKind::Bull, LifecycleState::ToTest, LifecycleState::Trash)
            .await
            .unwrap();
        let second = registry.submit(named("ema"), RegimeKind::Bull).await.unwrap();
        assert_ne!(first, second);

        let entries = registry.entries(RegimeKind::Bull).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].state, LifecycleState::Trash);
        assert_eq!(entries[1].state, LifecycleState::ToTest);
    }

    #[tokio::test]
    async fn same_name_in_other_regime_is_independent() {
        let registry = StrategyRegistry::new();
        registry.submit(named("ema"), RegimeKind::Bull).await.unwrap();
        assert!(registry.submit(named("ema"), RegimeKind::Sideways).await.is_ok());
    }

    #[tokio::test]
    async fn withdraw_raises_cancel_flag_and_removes_entry() {
        let registry = StrategyRegistry::new();
        let id = registry.submit(named("ema"), RegimeKind::Bull).await.unwrap();
        let candidate = registry.candidates(RegimeKind::Bull).await.remove(0);

        registry.withdraw(id, RegimeKind::Bull).await.unwrap();
        assert!(candidate.cancel.is_cancelled());
        assert_eq!(registry.state_of(id, RegimeKind::Bull).await, None);

        let err = registry
            .transition(id, RegimeKind::Bull, LifecycleState::ToTest, LifecycleState::Approved)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownEntry(_)));
    }

    #[tokio::test]
    async fn approved_entries_cannot_be_withdrawn() {
        let registry = StrategyRegistry::new();
        let id = registry.submit(named("ema"), RegimeKind::Bull).await.unwrap();
        registry
            .transition(id, RegimeKind::Bull, LifecycleState::ToTest, LifecycleState::Approved)
            .await
            .unwrap();
        assert!(registry.withdraw(id, RegimeKind::Bull).await.is_err());
    }

    #[tokio::test]
    async fn failed_store_write_leaves_memory_untouched() {
        let store = Arc::new(MemoryStore {
            fail_moves: true,
            ..MemoryStore::default()
        });
        let registry = StrategyRegistry::with_store(store);
        let id = registry.submit(named("ema"), RegimeKind::Bull).await.unwrap();

        assert!(registry
            .transition(id, RegimeKind::Bull, LifecycleState::ToTest, LifecycleState::Approved)
            .await
            .is_err());
        assert_eq!(
            registry.state_of(id, RegimeKind::Bull).await,
            Some(LifecycleState::ToTest)
        );
    }

    #[tokio::test]
    async fn restore_resumes_persisted_states() {
        let store = Arc::new(MemoryStore::default());
        {
            let registry = StrategyRegistry::with_store(store.clone());
            let a = registry.submit(named("a"), RegimeKind::Bull).await.unwrap();
            let b = registry.submit(named("b"), RegimeKind::Bull).await.unwrap();
            registry
                .transition(a, RegimeKind::Bull, LifecycleState::ToTest, LifecycleState::Approved)
                .await
                .unwrap();
            registry
                .transition(b, RegimeKind::Bull, LifecycleState::ToTest, LifecycleState::Trash)
                .await
                .unwrap();
        }

        let registry = StrategyRegistry::with_store(store);
        let summary = registry
            .restore(vec![
                (named("a"), RegimeKind::Bull),
                (named("b"), RegimeKind::Bull),
                (named("c"), RegimeKind::Bull),
            ])
            .await
            .unwrap();

        assert_eq!(
            summary,
            RestoreSummary { restored: 1, submitted: 1, kept_in_trash: 1 }
        );
        let approved = registry.approved(RegimeKind::Bull).await;
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].name(), "a");
        assert_eq!(registry.candidates(RegimeKind::Bull).await.len(), 1);
    }

    #[test]
    fn child_flag_sees_parent_but_not_vice_versa() {
        let parent = CancelFlag::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel();
        assert!(other.is_cancelled());
    }
}
