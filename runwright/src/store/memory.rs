//! In-memory run store.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::RunStore;
use crate::core::Artifact;
use crate::errors::StoreError;
use crate::pipeline::Pipeline;
use crate::state::{PipelineRun, StepRun};

#[derive(Debug, Default)]
struct Inner {
    pipelines: HashMap<Uuid, Arc<Pipeline>>,
    pipeline_order: Vec<Uuid>,
    runs: HashMap<Uuid, PipelineRun>,
    step_runs: HashMap<Uuid, StepRun>,
    run_step_runs: HashMap<Uuid, Vec<Uuid>>,
    artifacts: HashMap<Uuid, Vec<Artifact>>,
}

/// A [`RunStore`] backed by process memory.
///
/// One lock guards every table, so multi-record writes such as
/// [`RunStore::create_run`] are trivially atomic.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    inner: RwLock<Inner>,
}

impl InMemoryRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs held.
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.inner.read().runs.len()
    }
}

fn page<T>(items: impl Iterator<Item = T>, offset: usize, limit: usize) -> Vec<T> {
    items.skip(offset).take(limit).collect()
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save_pipeline(&self, pipeline: Arc<Pipeline>) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let id = pipeline.id();
        if inner.pipelines.contains_key(&id) {
            return Err(StoreError::AlreadyExists {
                entity: "pipeline",
                id,
            });
        }
        inner.pipelines.insert(id, pipeline);
        inner.pipeline_order.push(id);
        Ok(())
    }

    async fn get_pipeline(&self, id: Uuid) -> Result<Arc<Pipeline>, StoreError> {
        self.inner
            .read()
            .pipelines
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "pipeline",
                id,
            })
    }

    async fn list_pipelines(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Arc<Pipeline>>, StoreError> {
        let inner = self.inner.read();
        Ok(page(
            inner
                .pipeline_order
                .iter()
                .filter_map(|id| inner.pipelines.get(id).cloned()),
            offset,
            limit,
        ))
    }

    async fn create_run(
        &self,
        run: &PipelineRun,
        step_runs: &[StepRun],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.runs.contains_key(&run.id()) {
            return Err(StoreError::AlreadyExists {
                entity: "pipeline_run",
                id: run.id(),
            });
        }
        if let Some(existing) = step_runs.iter().find(|s| inner.step_runs.contains_key(&s.id())) {
            return Err(StoreError::AlreadyExists {
                entity: "step_run",
                id: existing.id(),
            });
        }

        inner.runs.insert(run.id(), run.clone());
        inner
            .run_step_runs
            .insert(run.id(), step_runs.iter().map(StepRun::id).collect());
        for step_run in step_runs {
            inner.step_runs.insert(step_run.id(), step_run.clone());
        }
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<PipelineRun, StoreError> {
        self.inner
            .read()
            .runs
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "pipeline_run",
                id,
            })
    }

    async fn list_runs(
        &self,
        pipeline_id: Option<Uuid>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PipelineRun>, StoreError> {
        let inner = self.inner.read();
        let mut runs: Vec<&PipelineRun> = inner
            .runs
            .values()
            .filter(|run| pipeline_id.map_or(true, |id| run.pipeline_id() == id))
            .collect();
        runs.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.id().cmp(&a.id()))
        });
        Ok(page(runs.into_iter().cloned(), offset, limit))
    }

    async fn update_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let stored = inner.runs.get_mut(&run.id()).ok_or(StoreError::NotFound {
            entity: "pipeline_run",
            id: run.id(),
        })?;
        if run.revision() <= stored.revision() {
            return Err(StoreError::StaleRevision {
                id: run.id(),
                stored: stored.revision(),
                attempted: run.revision(),
            });
        }
        *stored = run.clone();
        Ok(())
    }

    async fn get_step_run(&self, id: Uuid) -> Result<StepRun, StoreError> {
        self.inner
            .read()
            .step_runs
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "step_run",
                id,
            })
    }

    async fn list_step_runs(&self, run_id: Uuid) -> Result<Vec<StepRun>, StoreError> {
        let inner = self.inner.read();
        let ids = inner.run_step_runs.get(&run_id).ok_or(StoreError::NotFound {
            entity: "pipeline_run",
            id: run_id,
        })?;
        Ok(ids
            .iter()
            .filter_map(|id| inner.step_runs.get(id).cloned())
            .collect())
    }

    async fn update_step_run(&self, step_run: &StepRun) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let stored = inner
            .step_runs
            .get_mut(&step_run.id())
            .ok_or(StoreError::NotFound {
                entity: "step_run",
                id: step_run.id(),
            })?;
        if step_run.revision() <= stored.revision() {
            return Err(StoreError::StaleRevision {
                id: step_run.id(),
                stored: stored.revision(),
                attempted: step_run.revision(),
            });
        }
        *stored = step_run.clone();
        Ok(())
    }

    async fn save_artifact(&self, artifact: &Artifact) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let run_id = artifact.key.pipeline_run_id;
        if !inner.runs.contains_key(&run_id) {
            return Err(StoreError::NotFound {
                entity: "pipeline_run",
                id: run_id,
            });
        }
        let artifacts = inner.artifacts.entry(run_id).or_default();
        if artifacts.iter().any(|a| a.key == artifact.key) {
            return Err(StoreError::AlreadyExists {
                entity: "artifact",
                id: artifact.id,
            });
        }
        artifacts.push(artifact.clone());
        Ok(())
    }

    async fn list_artifacts(&self, run_id: Uuid) -> Result<Vec<Artifact>, StoreError> {
        Ok(self
            .inner
            .read()
            .artifacts
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ArtifactKey, ArtifactPayload};
    use crate::pipeline::{PipelineDefinition, Step};
    use crate::utils::now_utc;
    use pretty_assertions::assert_eq;

    fn pipeline() -> Arc<Pipeline> {
        PipelineDefinition::new("p")
            .step(Step::new("a", "true"))
            .step(Step::new("b", "true"))
            .dependency("b", "a")
            .build()
            .unwrap()
            .into_shared()
    }

    fn seeded(pipeline: &Pipeline) -> (PipelineRun, Vec<StepRun>) {
        let run = PipelineRun::new(pipeline.id());
        let step_runs = pipeline
            .steps()
            .iter()
            .map(|s| StepRun::new(run.id(), s.name.clone()))
            .collect();
        (run, step_runs)
    }

    #[tokio::test]
    async fn test_pipeline_round_trip() {
        let store = InMemoryRunStore::new();
        let p = pipeline();
        store.save_pipeline(Arc::clone(&p)).await.unwrap();
        assert_eq!(store.get_pipeline(p.id()).await.unwrap().name(), "p");
        assert!(store.save_pipeline(Arc::clone(&p)).await.is_err());
        assert_eq!(store.list_pipelines(0, 10).await.unwrap().len(), 1);
        assert!(store.list_pipelines(1, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_run_is_all_or_nothing() {
        let store = InMemoryRunStore::new();
        let p = pipeline();
        let (run, step_runs) = seeded(&p);
        store.create_run(&run, &step_runs).await.unwrap();

        let listed = store.list_step_runs(run.id()).await.unwrap();
        let names: Vec<&str> = listed.iter().map(StepRun::step_name).collect();
        assert_eq!(names, vec!["a", "b"]);

        // A second run reusing a step run id is rejected without a trace.
        let other = PipelineRun::new(p.id());
        let err = store.create_run(&other, &step_runs).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { entity: "step_run", .. }));
        assert!(store.get_run(other.id()).await.is_err());
        assert_eq!(store.run_count(), 1);
    }

    #[tokio::test]
    async fn test_optimistic_step_run_updates() {
        let store = InMemoryRunStore::new();
        let (run, mut step_runs) = seeded(&pipeline());
        store.create_run(&run, &step_runs).await.unwrap();

        let stale = step_runs[0].clone();
        step_runs[0].start().unwrap();
        store.update_step_run(&step_runs[0]).await.unwrap();

        let err = store.update_step_run(&stale).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::StaleRevision {
                id: stale.id(),
                stored: 1,
                attempted: 0
            }
        );
        // Re-sending the same revision is also stale.
        assert!(store.update_step_run(&step_runs[0]).await.is_err());
    }

    #[tokio::test]
    async fn test_list_runs_newest_first() {
        let store = InMemoryRunStore::new();
        let p = pipeline();
        let (first, s1) = seeded(&p);
        store.create_run(&first, &s1).await.unwrap();
        let (second, s2) = seeded(&p);
        store.create_run(&second, &s2).await.unwrap();

        let runs = store.list_runs(Some(p.id()), 0, 10).await.unwrap();
        assert_eq!(runs[0].id(), second.id());
        assert_eq!(runs[1].id(), first.id());
        assert!(store.list_runs(Some(Uuid::nil()), 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_artifacts_append_only() {
        let store = InMemoryRunStore::new();
        let (run, step_runs) = seeded(&pipeline());
        store.create_run(&run, &step_runs).await.unwrap();

        let artifact = Artifact {
            id: Uuid::now_v7(),
            key: ArtifactKey {
                pipeline_run_id: run.id(),
                step: "a".into(),
                name: "x".into(),
                version: 1,
            },
            producer_step_run_id: step_runs[0].id(),
            payload: ArtifactPayload::text("1"),
            metadata: HashMap::new(),
            created_at: now_utc(),
        };
        store.save_artifact(&artifact).await.unwrap();
        assert!(store.save_artifact(&artifact).await.is_err());
        assert_eq!(store.list_artifacts(run.id()).await.unwrap().len(), 1);
    }
}
