//! Step and pipeline definitions.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use uuid::Uuid;

use super::graph::{DependencyGraph, TopologicalOrder};
use crate::errors::GraphError;
use crate::utils::{duration_from_secs_f64, new_id, now_utc, Timestamp};

static NAME_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").ok());

/// Returns true if `name` is a valid step or artifact name.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    match NAME_PATTERN.as_ref() {
        Some(re) => re.is_match(name),
        None => false,
    }
}

/// The executable part of a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    /// Shell command line.
    pub command: String,
    /// Extra environment variables for this step only.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl CommandDescriptor {
    /// Creates a command descriptor.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env: BTreeMap::new(),
        }
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// A reference to an input artifact: `name` or `producer/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputRef {
    /// The dependency that must have produced it, if qualified.
    pub producer: Option<String>,
    /// The artifact name.
    pub name: String,
}

impl InputRef {
    /// Parses an input declaration.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('/') {
            Some((producer, name)) => Self {
                producer: Some(producer.to_string()),
                name: name.to_string(),
            },
            None => Self {
                producer: None,
                name: raw.to_string(),
            },
        }
    }
}

impl fmt::Display for InputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.producer {
            Some(producer) => write!(f, "{producer}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A single unit of work in a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique name within the pipeline.
    pub name: String,
    /// Optional human description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// What to execute.
    #[serde(flatten)]
    pub command: CommandDescriptor,
    /// Declared input artifacts (`name` or `producer/name`).
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Declared output artifact names.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Per-attempt timeout; falls back to the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
    /// Overrides the engine retry budget for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl Step {
    /// Creates a new step.
    #[must_use]
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            command: CommandDescriptor::new(command),
            inputs: Vec::new(),
            outputs: Vec::new(),
            timeout_secs: None,
            max_attempts: None,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declares an input artifact.
    #[must_use]
    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.inputs.push(input.into());
        self
    }

    /// Declares an output artifact.
    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.outputs.push(output.into());
        self
    }

    /// Adds an environment variable to the command.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.command.env.insert(key.into(), value.into());
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: f64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Overrides the retry budget.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Parsed input references, in declaration order.
    #[must_use]
    pub fn input_refs(&self) -> Vec<InputRef> {
        self.inputs.iter().map(|raw| InputRef::parse(raw)).collect()
    }

    /// The timeout for one attempt of this step.
    #[must_use]
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_secs
            .map_or(default, duration_from_secs_f64)
    }

    /// Checks the step in isolation.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::InvalidStep`] describing the first problem found.
    pub fn validate(&self) -> Result<(), GraphError> {
        let invalid = |reason: String| GraphError::InvalidStep {
            step: self.name.clone(),
            reason,
        };

        if !is_valid_name(&self.name) {
            return Err(invalid(format!("'{}' is not a valid step name", self.name)));
        }
        if self.command.command.trim().is_empty() {
            return Err(invalid("command must not be empty".to_string()));
        }
        for output in &self.outputs {
            if !is_valid_name(output) {
                return Err(invalid(format!("output '{output}' is not a valid artifact name")));
            }
        }
        if let Some(dup) = first_duplicate(&self.outputs) {
            return Err(invalid(format!("output '{dup}' is declared more than once")));
        }
        for input in self.input_refs() {
            let producer_ok = input.producer.as_deref().map_or(true, is_valid_name);
            if !producer_ok || !is_valid_name(&input.name) {
                return Err(invalid(format!("input '{input}' is not a valid artifact reference")));
            }
        }
        if let Some(secs) = self.timeout_secs {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(invalid(format!("timeout_secs must be positive, got {secs}")));
            }
        }
        if self.max_attempts == Some(0) {
            return Err(invalid("max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn first_duplicate(names: &[String]) -> Option<&str> {
    let mut seen = std::collections::HashSet::new();
    names
        .iter()
        .find(|name| !seen.insert(name.as_str()))
        .map(String::as_str)
}

/// A directed edge: `step` depends on `depends_on`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepDependency {
    /// The dependent step.
    pub step: String,
    /// The step that must complete first.
    pub depends_on: String,
}

impl StepDependency {
    /// Creates a dependency edge.
    #[must_use]
    pub fn new(step: impl Into<String>, depends_on: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            depends_on: depends_on.into(),
        }
    }
}

/// The serialisable form of a pipeline, as accepted from API callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Steps in declaration order.
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Dependency edges.
    #[serde(default)]
    pub dependencies: Vec<StepDependency>,
}

impl PipelineDefinition {
    /// Creates an empty definition.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    /// Parses a definition from JSON.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the document does not match the schema.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Appends a step.
    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Appends a dependency edge.
    #[must_use]
    pub fn dependency(mut self, step: impl Into<String>, depends_on: impl Into<String>) -> Self {
        self.dependencies.push(StepDependency::new(step, depends_on));
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Validates the definition and freezes it into a [`Pipeline`].
    ///
    /// # Errors
    ///
    /// Returns the first [`GraphError`] found.
    pub fn build(self) -> Result<Pipeline, GraphError> {
        Pipeline::from_definition(self)
    }
}

/// A validated, immutable pipeline.
///
/// Every constructor runs the validator, so a `Pipeline` value always holds
/// an acyclic graph and its topological order.
#[derive(Debug, Clone)]
pub struct Pipeline {
    id: Uuid,
    name: String,
    description: Option<String>,
    steps: Vec<Step>,
    dependencies: Vec<StepDependency>,
    graph: DependencyGraph,
    execution_order: TopologicalOrder,
    created_at: Timestamp,
}

impl Pipeline {
    /// Validates steps and edges and builds a pipeline.
    ///
    /// # Errors
    ///
    /// Returns the first [`GraphError`] found.
    pub fn new(
        name: impl Into<String>,
        steps: Vec<Step>,
        dependencies: Vec<StepDependency>,
    ) -> Result<Self, GraphError> {
        let graph = DependencyGraph::build(&steps, &dependencies)?;
        check_qualified_inputs(&steps, &graph)?;
        let execution_order = graph.topological_order()?;

        Ok(Self {
            id: new_id(),
            name: name.into(),
            description: None,
            steps,
            dependencies,
            graph,
            execution_order,
            created_at: now_utc(),
        })
    }

    /// Builds a pipeline from its serialisable definition.
    ///
    /// # Errors
    ///
    /// Returns the first [`GraphError`] found.
    pub fn from_definition(definition: PipelineDefinition) -> Result<Self, GraphError> {
        let mut pipeline = Self::new(definition.name, definition.steps, definition.dependencies)?;
        pipeline.description = definition.description;
        Ok(pipeline)
    }

    /// Returns the serialisable definition this pipeline was built from.
    #[must_use]
    pub fn to_definition(&self) -> PipelineDefinition {
        PipelineDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            steps: self.steps.clone(),
            dependencies: self.dependencies.clone(),
        }
    }

    /// Wraps the pipeline for sharing with runs.
    #[must_use]
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Pipeline id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pipeline description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Steps in declaration order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Looks up a step by name.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.graph.index_of(name).map(|idx| &self.steps[idx])
    }

    /// Number of steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Dependency edges as declared.
    #[must_use]
    pub fn dependencies(&self) -> &[StepDependency] {
        &self.dependencies
    }

    /// Names of the steps `step` depends on, in declaration order.
    #[must_use]
    pub fn dependencies_of(&self, step: &str) -> Vec<&str> {
        self.graph.index_of(step).map_or_else(Vec::new, |idx| {
            self.graph
                .dependencies(idx)
                .iter()
                .map(|&dep| self.graph.name(dep))
                .collect()
        })
    }

    /// The indexed graph.
    #[must_use]
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// The order computed at definition time.
    #[must_use]
    pub fn execution_order(&self) -> &TopologicalOrder {
        &self.execution_order
    }

    /// When the pipeline was defined.
    #[must_use]
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Runs the validator again from the declared steps and edges.
    ///
    /// # Errors
    ///
    /// Returns the first [`GraphError`] found.
    pub fn revalidate(&self) -> Result<TopologicalOrder, GraphError> {
        super::graph::validate(&self.steps, &self.dependencies)
    }
}

/// A qualified input must name one of the step's own dependencies.
fn check_qualified_inputs(steps: &[Step], graph: &DependencyGraph) -> Result<(), GraphError> {
    for (idx, step) in steps.iter().enumerate() {
        for input in step.input_refs() {
            let Some(producer) = input.producer.as_deref() else {
                continue;
            };
            let is_dependency = graph
                .dependencies(idx)
                .iter()
                .any(|&dep| graph.name(dep) == producer);
            if !is_dependency {
                return Err(GraphError::InvalidStep {
                    step: step.name.clone(),
                    reason: format!("input '{input}' names '{producer}', which is not a dependency"),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("fetch"));
        assert!(is_valid_name("train.v2"));
        assert!(is_valid_name("0-prep_data"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("-lead"));
        assert!(!is_valid_name("has space"));
        assert!(!is_valid_name("a/b"));
    }

    #[test]
    fn test_input_ref_parse() {
        assert_eq!(
            InputRef::parse("train/model"),
            InputRef {
                producer: Some("train".into()),
                name: "model".into()
            }
        );
        assert_eq!(InputRef::parse("model").producer, None);
        assert_eq!(InputRef::parse("train/model").to_string(), "train/model");
    }

    #[test]
    fn test_step_validation() {
        assert!(Step::new("a", "echo hi").validate().is_ok());
        assert!(Step::new("a", "  ").validate().is_err());
        assert!(Step::new("bad name", "true").validate().is_err());
        assert!(Step::new("a", "true").with_output("x").with_output("x").validate().is_err());
        assert!(Step::new("a", "true").with_timeout_secs(0.0).validate().is_err());
        assert!(Step::new("a", "true").with_max_attempts(0).validate().is_err());
        assert!(Step::new("a", "true").with_input("b/").validate().is_err());
    }

    #[test]
    fn test_step_timeout_fallback() {
        let default = Duration::from_secs(10);
        assert_eq!(Step::new("a", "true").timeout(default), default);
        assert_eq!(
            Step::new("a", "true").with_timeout_secs(0.5).timeout(default),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_definition_from_json() {
        let json = r#"{
            "name": "etl",
            "steps": [
                {"name": "extract", "command": "./extract.sh", "outputs": ["raw"]},
                {"name": "load", "command": "./load.sh", "env": {"MODE": "fast"}, "inputs": ["extract/raw"]}
            ],
            "dependencies": [{"step": "load", "depends_on": "extract"}]
        }"#;
        let def = PipelineDefinition::from_json_str(json).unwrap();
        assert_eq!(def.steps[1].command.env.get("MODE").map(String::as_str), Some("fast"));

        let pipeline = def.build().unwrap();
        assert_eq!(pipeline.execution_order().as_slice(), ["extract", "load"]);
        assert_eq!(pipeline.dependencies_of("load"), vec!["extract"]);
        assert_eq!(pipeline.step("load").map(|s| s.inputs.len()), Some(1));
    }

    #[test]
    fn test_qualified_input_must_name_dependency() {
        let err = PipelineDefinition::new("p")
            .step(Step::new("a", "true").with_output("x"))
            .step(Step::new("b", "true"))
            .step(Step::new("c", "true").with_input("a/x"))
            .dependency("c", "b")
            .build()
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidStep { ref step, .. } if step == "c"));
    }

    #[test]
    fn test_definition_round_trips_through_pipeline() {
        let def = PipelineDefinition::new("p")
            .with_description("demo")
            .step(Step::new("a", "true"))
            .step(Step::new("b", "true"))
            .dependency("b", "a");
        let pipeline = def.clone().build().unwrap();
        assert_eq!(pipeline.to_definition(), def);
        assert_eq!(pipeline.description(), Some("demo"));
    }
}
