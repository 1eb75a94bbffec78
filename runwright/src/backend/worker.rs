//! Worker bindings and run placement.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

use super::ExecutionBackend;
use crate::errors::EngineError;

/// Whether a worker accepts new runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Accepts new runs.
    #[default]
    Online,
    /// Finishes its current runs but accepts no new ones.
    Draining,
    /// Accepts nothing.
    Offline,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Draining => write!(f, "draining"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// A named execution backend binding.
pub struct Worker {
    name: String,
    backend: Arc<dyn ExecutionBackend>,
    status: RwLock<WorkerStatus>,
    active_runs: AtomicUsize,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("backend", &self.backend.name())
            .field("status", &*self.status.read())
            .field("active_runs", &self.active_runs.load(Ordering::SeqCst))
            .finish()
    }
}

impl Worker {
    /// Worker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backend every run placed here uses.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> WorkerStatus {
        *self.status.read()
    }

    /// Number of runs currently bound to this worker.
    #[must_use]
    pub fn active_runs(&self) -> usize {
        self.active_runs.load(Ordering::SeqCst)
    }
}

/// Snapshot of a worker for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Worker name.
    pub name: String,
    /// Backend name.
    pub backend: String,
    /// Status.
    pub status: WorkerStatus,
    /// Runs currently bound.
    pub active_runs: usize,
}

/// A run's binding to a worker. Dropping it releases the slot.
#[derive(Debug)]
pub struct WorkerLease {
    worker: Arc<Worker>,
}

impl WorkerLease {
    /// The bound worker.
    #[must_use]
    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    /// Worker name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.worker.name()
    }

    /// The bound backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        self.worker.backend()
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.worker.active_runs.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The set of workers runs can be placed on.
#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: RwLock<Vec<Arc<Worker>>>,
}

impl WorkerPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pool with a single online worker.
    #[must_use]
    pub fn single(name: impl Into<String>, backend: Arc<dyn ExecutionBackend>) -> Self {
        let pool = Self::new();
        pool.register(name, backend);
        pool
    }

    /// Registers (or replaces) a worker. New workers start online.
    pub fn register(&self, name: impl Into<String>, backend: Arc<dyn ExecutionBackend>) {
        let name = name.into();
        let worker = Arc::new(Worker {
            name: name.clone(),
            backend,
            status: RwLock::new(WorkerStatus::Online),
            active_runs: AtomicUsize::new(0),
        });
        let mut workers = self.workers.write();
        if let Some(slot) = workers.iter_mut().find(|w| w.name == name) {
            *slot = worker;
        } else {
            workers.push(worker);
        }
        info!(worker = %name, "Worker registered");
    }

    /// Changes a worker's status. Returns false if it is unknown.
    pub fn set_status(&self, name: &str, status: WorkerStatus) -> bool {
        let workers = self.workers.read();
        let Some(worker) = workers.iter().find(|w| w.name == name) else {
            return false;
        };
        *worker.status.write() = status;
        info!(worker = %name, status = %status, "Worker status changed");
        true
    }

    /// Looks up a worker.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Worker>> {
        self.workers.read().iter().find(|w| w.name == name).cloned()
    }

    /// Snapshot of every worker, in registration order.
    #[must_use]
    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.workers
            .read()
            .iter()
            .map(|w| WorkerInfo {
                name: w.name.clone(),
                backend: w.backend.name().to_string(),
                status: w.status(),
                active_runs: w.active_runs(),
            })
            .collect()
    }

    /// Binds a new run to a worker.
    ///
    /// With `preferred`, only that worker is considered. Otherwise the
    /// online worker with the fewest active runs wins, earliest registered
    /// first on ties.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoWorkerAvailable`] if no online worker
    /// matches.
    pub fn select_for_run(&self, preferred: Option<&str>) -> Result<WorkerLease, EngineError> {
        let workers = self.workers.read();
        let mut online = workers
            .iter()
            .filter(|w| w.status() == WorkerStatus::Online);

        let chosen = match preferred {
            Some(name) => online.find(|w| w.name == name),
            None => online.min_by_key(|w| w.active_runs()),
        };

        let worker = chosen.cloned().ok_or_else(|| EngineError::NoWorkerAvailable {
            preferred: preferred.map(str::to_string),
        })?;
        worker.active_runs.fetch_add(1, Ordering::SeqCst);
        Ok(WorkerLease { worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;
    use pretty_assertions::assert_eq;

    fn pool() -> WorkerPool {
        let pool = WorkerPool::new();
        pool.register("w1", Arc::new(ScriptedBackend::new()));
        pool.register("w2", Arc::new(ScriptedBackend::new()));
        pool
    }

    #[test]
    fn test_least_loaded_selection() {
        let pool = pool();
        let first = pool.select_for_run(None).unwrap();
        assert_eq!(first.name(), "w1");
        let second = pool.select_for_run(None).unwrap();
        assert_eq!(second.name(), "w2");
        drop(first);
        let third = pool.select_for_run(None).unwrap();
        assert_eq!(third.name(), "w1");
        assert_eq!(pool.get("w1").unwrap().active_runs(), 1);
    }

    #[test]
    fn test_preferred_worker() {
        let pool = pool();
        let lease = pool.select_for_run(Some("w2")).unwrap();
        assert_eq!(lease.name(), "w2");

        let err = pool.select_for_run(Some("gpu")).unwrap_err();
        assert!(matches!(err, EngineError::NoWorkerAvailable { preferred: Some(ref p) } if p == "gpu"));
    }

    #[test]
    fn test_draining_workers_are_skipped() {
        let pool = pool();
        assert!(pool.set_status("w1", WorkerStatus::Draining));
        assert_eq!(pool.select_for_run(None).unwrap().name(), "w2");
        assert!(pool.select_for_run(Some("w1")).is_err());

        pool.set_status("w2", WorkerStatus::Offline);
        assert!(matches!(
            pool.select_for_run(None),
            Err(EngineError::NoWorkerAvailable { preferred: None })
        ));
        assert!(!pool.set_status("ghost", WorkerStatus::Online));
    }

    #[test]
    fn test_listing() {
        let pool = pool();
        let _lease = pool.select_for_run(None).unwrap();
        let infos = pool.workers();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].active_runs, 1);
        assert_eq!(infos[1].status, WorkerStatus::Online);
    }
}
