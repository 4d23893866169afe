//! In-memory registry of runs.

use conveyor_core::RunId;
use conveyor_core::run::Run;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

struct Entry {
    run: Run,
    cancel: CancellationToken,
}

/// Tracks in-flight and finished runs so operators can inspect or cancel them.
///
/// The orchestrator keeps each entry's snapshot current as the run advances.
/// Nothing is persisted. Finished runs stay until [`RunRegistry::remove`] or
/// [`RunRegistry::prune_finished`] drops them.
#[derive(Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<RunId, Entry>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn register(&self, run: Run, cancel: CancellationToken) {
        self.runs
            .write()
            .await
            .insert(run.id(), Entry { run, cancel });
    }

    pub(crate) async fn update(&self, run: &Run) {
        if let Some(entry) = self.runs.write().await.get_mut(&run.id()) {
            entry.run = run.clone();
        }
    }

    /// Latest snapshot of a run.
    pub async fn get(&self, id: RunId) -> Option<Run> {
        self.runs.read().await.get(&id).map(|e| e.run.clone())
    }

    /// All known runs, oldest first.
    pub async fn list(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self
            .runs
            .read()
            .await
            .values()
            .map(|e| e.run.clone())
            .collect();
        runs.sort_by_key(|r| r.created_at());
        runs
    }

    /// Runs that have not reached a terminal state.
    pub async fn active(&self) -> Vec<RunId> {
        self.runs
            .read()
            .await
            .values()
            .filter(|e| !e.run.is_terminal())
            .map(|e| e.run.id())
            .collect()
    }

    /// Request cancellation. Returns `false` if the run is unknown or already finished.
    pub async fn cancel(&self, id: RunId) -> bool {
        match self.runs.read().await.get(&id) {
            Some(entry) if !entry.run.is_terminal() => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Drop a finished run. Runs still in progress are left in place.
    pub async fn remove(&self, id: RunId) -> Option<Run> {
        let mut runs = self.runs.write().await;
        match runs.get(&id) {
            Some(entry) if entry.run.is_terminal() => runs.remove(&id).map(|e| e.run),
            _ => None,
        }
    }

    /// Drop every finished run, returning how many were removed.
    pub async fn prune_finished(&self) -> usize {
        let mut runs = self.runs.write().await;
        let before = runs.len();
        runs.retain(|_, entry| !entry.run.is_terminal());
        before - runs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::run::TriggerSummary;
    use conveyor_core::trigger::TriggerEvent;

    fn run() -> Run {
        Run::new("site", TriggerSummary::new(&TriggerEvent::branch("main"), "main"))
    }

    #[tokio::test]
    async fn test_register_update_and_list() {
        let registry = RunRegistry::new();
        let mut run = run();
        registry.register(run.clone(), CancellationToken::new()).await;

        run.start().unwrap();
        registry.update(&run).await;

        let snapshot = registry.get(run.id()).await.unwrap();
        assert!(snapshot.started_at().is_some());
        assert_eq!(registry.list().await.len(), 1);
        assert_eq!(registry.active().await, vec![run.id()]);
    }

    #[tokio::test]
    async fn test_cancel_only_active_runs() {
        let registry = RunRegistry::new();
        let mut run = run();
        let token = CancellationToken::new();
        registry.register(run.clone(), token.clone()).await;

        assert!(registry.cancel(run.id()).await);
        assert!(token.is_cancelled());

        run.cancel().unwrap();
        registry.update(&run).await;
        assert!(!registry.cancel(run.id()).await);
        assert!(!registry.cancel(RunId::new()).await);
        assert!(registry.active().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_and_prune_keep_active_runs() {
        let registry = RunRegistry::new();

        let mut done = run();
        registry.register(done.clone(), CancellationToken::new()).await;
        let mut also_done = run();
        registry.register(also_done.clone(), CancellationToken::new()).await;
        let mut active = run();
        registry.register(active.clone(), CancellationToken::new()).await;

        done.cancel().unwrap();
        registry.update(&done).await;
        also_done.cancel().unwrap();
        registry.update(&also_done).await;
        active.start().unwrap();
        registry.update(&active).await;

        assert!(registry.remove(active.id()).await.is_none());
        assert_eq!(registry.remove(done.id()).await.unwrap().id(), done.id());
        assert!(registry.get(done.id()).await.is_none());

        assert_eq!(registry.prune_finished().await, 1);
        assert_eq!(registry.list().await.len(), 1);
        assert!(registry.cancel(active.id()).await);
    }
}
