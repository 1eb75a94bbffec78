//! Versioned artifact registry with lineage tracking.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::core::{Artifact, ArtifactKey, ArtifactPayload, ArtifactUsage, UsageRole};
use crate::errors::ArtifactError;
use crate::pipeline::{is_valid_name, InputRef, Step};
use crate::state::StepRun;
use crate::utils::{new_id, now_utc};

/// Metadata key holding the SHA-256 of a text payload.
pub const CONTENT_SHA256: &str = "content_sha256";

/// Input declaration → resolved artifact, ordered by declaration string.
pub type ResolvedInputs = BTreeMap<String, Arc<Artifact>>;

type SeriesKey = (Uuid, String, String);

/// Tracks artifact identity, versions and producer/consumer links.
///
/// Safe to share between runs: every write is keyed by `(run, step, name)`
/// and version allocation happens under the series' map entry, so writers
/// of different series never contend and writers of the same series are
/// serialised.
#[derive(Debug, Default)]
pub struct ArtifactRegistry {
    artifacts: DashMap<ArtifactKey, Arc<Artifact>>,
    latest: DashMap<SeriesKey, u32>,
    usages: DashMap<Uuid, Vec<ArtifactUsage>>,
}

impl ArtifactRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an artifact produced by `producer` under the next version.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is not a valid artifact name.
    pub fn put(
        &self,
        producer: &StepRun,
        name: &str,
        payload: ArtifactPayload,
        mut metadata: HashMap<String, Value>,
    ) -> Result<Arc<Artifact>, ArtifactError> {
        if !is_valid_name(name) {
            return Err(ArtifactError::InvalidName {
                name: name.to_string(),
            });
        }

        if let ArtifactPayload::Text { data } = &payload {
            let digest = hex::encode(Sha256::digest(data.as_bytes()));
            metadata.insert(CONTENT_SHA256.to_string(), Value::String(digest));
        }

        let series = (
            producer.pipeline_run_id(),
            producer.step_name().to_string(),
            name.to_string(),
        );
        // Holding the series entry keeps version allocation and the insert
        // below atomic with respect to readers of `latest`.
        let mut version = self.latest.entry(series).or_insert(0);
        let key = ArtifactKey {
            pipeline_run_id: producer.pipeline_run_id(),
            step: producer.step_name().to_string(),
            name: name.to_string(),
            version: *version + 1,
        };

        let artifact = Arc::new(Artifact {
            id: new_id(),
            key: key.clone(),
            producer_step_run_id: producer.id(),
            payload,
            metadata,
            created_at: now_utc(),
        });

        match self.artifacts.entry(key) {
            Entry::Occupied(existing) => {
                return Err(ArtifactError::AlreadyExists {
                    key: existing.key().to_string(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&artifact));
            }
        }
        *version += 1;
        drop(version);

        self.record_usage(producer.id(), artifact.id, UsageRole::Output);
        debug!(
            artifact = %artifact.key,
            kind = artifact.payload.kind(),
            "Artifact recorded"
        );
        Ok(artifact)
    }

    /// Resolves every declared input of `step` against the artifacts of its
    /// dependency step runs, and links each one to `consumer`.
    ///
    /// A qualified input (`producer/name`) reads the most recent version
    /// produced by that dependency. A bare name must be produced by exactly
    /// one dependency. Calling this twice without re-execution returns the
    /// same versions and records no duplicate links.
    ///
    /// # Errors
    ///
    /// Returns the first input that is missing, ambiguous or names a
    /// non-dependency.
    pub fn resolve_inputs(
        &self,
        step: &Step,
        consumer: &StepRun,
        dependency_step_runs: &[&StepRun],
    ) -> Result<ResolvedInputs, ArtifactError> {
        let mut resolved = ResolvedInputs::new();

        for input in step.input_refs() {
            let artifact = match &input.producer {
                Some(producer) => self.resolve_qualified(step, &input, producer, dependency_step_runs)?,
                None => self.resolve_bare(step, &input, dependency_step_runs)?,
            };
            resolved.insert(input.to_string(), artifact);
        }

        for artifact in resolved.values() {
            self.record_usage(consumer.id(), artifact.id, UsageRole::Input);
        }
        Ok(resolved)
    }

    fn resolve_qualified(
        &self,
        step: &Step,
        input: &InputRef,
        producer: &str,
        dependency_step_runs: &[&StepRun],
    ) -> Result<Arc<Artifact>, ArtifactError> {
        let dependency = dependency_step_runs
            .iter()
            .find(|run| run.step_name() == producer)
            .ok_or_else(|| ArtifactError::ProducerNotDependency {
                step: step.name.clone(),
                input: input.to_string(),
                producer: producer.to_string(),
            })?;

        self.latest_from(dependency, &input.name)
            .ok_or_else(|| ArtifactError::MissingInput {
                step: step.name.clone(),
                input: input.to_string(),
            })
    }

    fn resolve_bare(
        &self,
        step: &Step,
        input: &InputRef,
        dependency_step_runs: &[&StepRun],
    ) -> Result<Arc<Artifact>, ArtifactError> {
        let mut candidates: Vec<Arc<Artifact>> = dependency_step_runs
            .iter()
            .filter_map(|dependency| self.latest_from(dependency, &input.name))
            .collect();

        match candidates.len() {
            0 => Err(ArtifactError::MissingInput {
                step: step.name.clone(),
                input: input.to_string(),
            }),
            1 => Ok(candidates.remove(0)),
            _ => Err(ArtifactError::AmbiguousInput {
                step: step.name.clone(),
                input: input.to_string(),
                producers: candidates.iter().map(|a| a.key.step.clone()).collect(),
            }),
        }
    }

    /// Latest artifact named `name` produced by exactly this step run.
    fn latest_from(&self, producer: &StepRun, name: &str) -> Option<Arc<Artifact>> {
        self.latest(producer.pipeline_run_id(), producer.step_name(), name)
            .filter(|artifact| artifact.producer_step_run_id == producer.id())
    }

    fn record_usage(&self, step_run_id: Uuid, artifact_id: Uuid, role: UsageRole) {
        let mut links = self.usages.entry(step_run_id).or_default();
        let exists = links
            .iter()
            .any(|u| u.artifact_id == artifact_id && u.role == role);
        if !exists {
            links.push(ArtifactUsage {
                step_run_id,
                artifact_id,
                role,
                recorded_at: now_utc(),
            });
        }
    }

    /// Looks up an exact artifact version.
    #[must_use]
    pub fn get(&self, key: &ArtifactKey) -> Option<Arc<Artifact>> {
        self.artifacts.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// The most recent version of `(run, step, name)`.
    #[must_use]
    pub fn latest(&self, pipeline_run_id: Uuid, step: &str, name: &str) -> Option<Arc<Artifact>> {
        let series = (pipeline_run_id, step.to_string(), name.to_string());
        let version = *self.latest.get(&series)?;
        self.get(&ArtifactKey {
            pipeline_run_id,
            step: step.to_string(),
            name: name.to_string(),
            version,
        })
    }

    /// Every artifact of a run, ordered by step, name and version.
    #[must_use]
    pub fn artifacts_for_run(&self, pipeline_run_id: Uuid) -> Vec<Arc<Artifact>> {
        let mut artifacts: Vec<Arc<Artifact>> = self
            .artifacts
            .iter()
            .filter(|entry| entry.key().pipeline_run_id == pipeline_run_id)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        artifacts.sort_by(|a, b| a.key.cmp(&b.key));
        artifacts
    }

    /// Lineage links recorded for a step run, in recording order.
    #[must_use]
    pub fn usages_for_step_run(&self, step_run_id: Uuid) -> Vec<ArtifactUsage> {
        self.usages
            .get(&step_run_id)
            .map(|links| links.clone())
            .unwrap_or_default()
    }

    /// Number of artifact versions held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    /// Returns true if no artifacts are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}
