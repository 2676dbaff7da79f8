//! Pipeline configuration and immutable, versioned snapshots of it.

use crate::material::{Fingerprint, Material};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Label template used when a pipeline does not configure one.
pub const DEFAULT_LABEL_TEMPLATE: &str = "${COUNT}";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Duplicate pipeline name: {0}")]
    DuplicatePipeline(String),
    #[error("Pipeline name must not be empty")]
    EmptyPipelineName,
    #[error("Pipeline {0} has no materials")]
    NoMaterials(String),
    #[error("Pipeline {pipeline} declares material {material} more than once")]
    DuplicateMaterial { pipeline: String, material: String },
    #[error("Pipeline {0} has no stages")]
    NoStages(String),
    #[error("Duplicate stage {stage} in pipeline {pipeline}")]
    DuplicateStage { pipeline: String, stage: String },
    #[error("Stage {pipeline}/{stage} has no jobs")]
    NoJobs { pipeline: String, stage: String },
    #[error("Duplicate job {job} in stage {pipeline}/{stage}")]
    DuplicateJob {
        pipeline: String,
        stage: String,
        job: String,
    },
    #[error("Pipeline {pipeline} depends on unknown stage {upstream}/{stage}")]
    UnknownUpstream {
        pipeline: String,
        upstream: String,
        stage: String,
    },
    #[error("Cycle detected in pipeline dependencies")]
    CycleDetected,
    #[error("Invalid timer '{spec}' for pipeline {pipeline}: {message}")]
    InvalidTimer {
        pipeline: String,
        spec: String,
        message: String,
    },
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::InvalidTimer { spec, message, .. } => {
                Error::InvalidTimer { spec, message }
            }
            other => Error::InvalidConfig(other.to_string()),
        }
    }
}

/// The whole pipeline configuration as stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConfigDocument {
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
}

impl ConfigDocument {
    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Load a document from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn pipeline(&self, name: &str) -> Option<&PipelineConfig> {
        self.pipelines.iter().find(|p| p.name == name)
    }

    pub fn pipeline_mut(&mut self, name: &str) -> Option<&mut PipelineConfig> {
        self.pipelines.iter_mut().find(|p| p.name == name)
    }

    /// Add a pipeline, replacing any existing one with the same name.
    pub fn upsert_pipeline(&mut self, pipeline: PipelineConfig) {
        match self.pipeline_mut(&pipeline.name) {
            Some(existing) => *existing = pipeline,
            None => self.pipelines.push(pipeline),
        }
    }

    pub fn remove_pipeline(&mut self, name: &str) -> Option<PipelineConfig> {
        let index = self.pipelines.iter().position(|p| p.name == name)?;
        Some(self.pipelines.remove(index))
    }

    /// Check structural rules that a snapshot must satisfy.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let mut names = HashSet::new();
        for pipeline in &self.pipelines {
            if pipeline.name.trim().is_empty() {
                return Err(ConfigError::EmptyPipelineName);
            }
            if !names.insert(pipeline.name.as_str()) {
                return Err(ConfigError::DuplicatePipeline(pipeline.name.clone()));
            }
            pipeline.validate()?;
        }

        for pipeline in &self.pipelines {
            for dependency in pipeline.materials.iter().filter_map(Material::as_dependency) {
                let known = self
                    .pipeline(&dependency.pipeline)
                    .is_some_and(|upstream| upstream.stage(&dependency.stage).is_some());
                if !known {
                    return Err(ConfigError::UnknownUpstream {
                        pipeline: pipeline.name.clone(),
                        upstream: dependency.pipeline.clone(),
                        stage: dependency.stage.clone(),
                    });
                }
            }
        }

        self.dependency_order().map(|_| ())
    }

    /// Pipelines sorted so that every upstream comes before its dependents.
    pub fn dependency_order(&self) -> std::result::Result<Vec<&str>, ConfigError> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut name_to_index: HashMap<&str, NodeIndex> = HashMap::new();

        for pipeline in &self.pipelines {
            let idx = graph.add_node(pipeline.name.as_str());
            name_to_index.insert(pipeline.name.as_str(), idx);
        }

        for pipeline in &self.pipelines {
            let to_idx = name_to_index[pipeline.name.as_str()];
            for dependency in pipeline.materials.iter().filter_map(Material::as_dependency) {
                if let Some(&from_idx) = name_to_index.get(dependency.pipeline.as_str()) {
                    graph.add_edge(from_idx, to_idx, ());
                }
            }
        }

        toposort(&graph, None)
            .map(|indices| indices.iter().map(|&idx| graph[idx]).collect())
            .map_err(|_| ConfigError::CycleDetected)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineConfig {
    pub name: String,
    /// Supports `${COUNT}` and `${<material name>}` placeholders.
    #[serde(default = "default_label_template")]
    pub label_template: String,
    pub materials: Vec<Material>,
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub lock: LockBehavior,
    #[serde(default)]
    pub timer: Option<TimerSpec>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

fn default_label_template() -> String {
    DEFAULT_LABEL_TEMPLATE.to_string()
}

impl PipelineConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label_template: default_label_template(),
            materials: vec![],
            stages: vec![],
            lock: LockBehavior::None,
            timer: None,
            variables: BTreeMap::new(),
        }
    }

    pub fn with_material(mut self, material: Material) -> Self {
        self.materials.push(material);
        self
    }

    pub fn with_stage(mut self, stage: StageConfig) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_lock(mut self, lock: LockBehavior) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_timer(mut self, timer: TimerSpec) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn with_label_template(mut self, template: impl Into<String>) -> Self {
        self.label_template = template.into();
        self
    }

    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn first_stage(&self) -> Option<&StageConfig> {
        self.stages.first()
    }

    /// The stage after `name` in configuration order.
    pub fn next_stage(&self, name: &str) -> Option<&StageConfig> {
        let index = self.stages.iter().position(|s| s.name == name)?;
        self.stages.get(index + 1)
    }

    /// The stage before `name` in configuration order.
    pub fn previous_stage(&self, name: &str) -> Option<&StageConfig> {
        let index = self.stages.iter().position(|s| s.name == name)?;
        index.checked_sub(1).and_then(|i| self.stages.get(i))
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }

    pub fn is_last_stage(&self, name: &str) -> bool {
        self.stages.last().is_some_and(|s| s.name == name)
    }

    pub fn is_locked(&self) -> bool {
        self.lock != LockBehavior::None
    }

    pub fn material(&self, fingerprint: &Fingerprint) -> Option<&Material> {
        self.materials.iter().find(|m| &m.fingerprint() == fingerprint)
    }

    /// Whether a dependency material points at `pipeline`'s `stage`.
    pub fn depends_on(&self, pipeline: &str, stage: &str) -> bool {
        self.materials
            .iter()
            .filter_map(Material::as_dependency)
            .any(|d| d.pipeline == pipeline && d.stage == stage)
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.materials.is_empty() {
            return Err(ConfigError::NoMaterials(self.name.clone()));
        }
        let mut fingerprints = HashSet::new();
        for material in &self.materials {
            if !fingerprints.insert(material.fingerprint()) {
                return Err(ConfigError::DuplicateMaterial {
                    pipeline: self.name.clone(),
                    material: material.to_string(),
                });
            }
        }

        if self.stages.is_empty() {
            return Err(ConfigError::NoStages(self.name.clone()));
        }
        let mut stages = HashSet::new();
        for stage in &self.stages {
            if !stages.insert(stage.name.as_str()) {
                return Err(ConfigError::DuplicateStage {
                    pipeline: self.name.clone(),
                    stage: stage.name.clone(),
                });
            }
            if stage.jobs.is_empty() {
                return Err(ConfigError::NoJobs {
                    pipeline: self.name.clone(),
                    stage: stage.name.clone(),
                });
            }
            let mut jobs = HashSet::new();
            for job in &stage.jobs {
                if !jobs.insert(job.name.as_str()) {
                    return Err(ConfigError::DuplicateJob {
                        pipeline: self.name.clone(),
                        stage: stage.name.clone(),
                        job: job.name.clone(),
                    });
                }
            }
        }

        if let Some(timer) = &self.timer {
            timer.schedule().map_err(|e| ConfigError::InvalidTimer {
                pipeline: self.name.clone(),
                spec: timer.spec.clone(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }
}

/// How a pipeline restricts concurrent instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LockBehavior {
    #[default]
    None,
    /// Stay locked after a failure until the instance completes or is unlocked.
    LockOnFailure,
    /// Unlock as soon as the instance stops running, whatever the result.
    UnlockWhenFinished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StageConfig {
    pub name: String,
    #[serde(default)]
    pub approval: Approval,
    pub jobs: Vec<JobConfig>,
}

impl StageConfig {
    pub fn new(name: impl Into<String>, jobs: &[&str]) -> Self {
        Self {
            name: name.into(),
            approval: Approval::Success,
            jobs: jobs.iter().map(|j| JobConfig::new(*j)).collect(),
        }
    }

    pub fn manual(mut self) -> Self {
        self.approval = Approval::Manual;
        self
    }

    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn requires_manual_approval(&self) -> bool {
        self.approval == Approval::Manual
    }
}

/// Whether a stage runs automatically once the previous one passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Approval {
    #[default]
    Success,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobConfig {
    pub name: String,
}

impl JobConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A cron trigger. `spec` uses the seconds-first cron syntax.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TimerSpec {
    pub spec: String,
    #[serde(default)]
    pub run_only_on_new_materials: bool,
}

impl TimerSpec {
    pub fn new(spec: impl Into<String>, run_only_on_new_materials: bool) -> Self {
        Self {
            spec: spec.into(),
            run_only_on_new_materials,
        }
    }

    pub fn schedule(&self) -> Result<cron::Schedule> {
        cron::Schedule::from_str(&self.spec).map_err(|e| Error::InvalidTimer {
            spec: self.spec.clone(),
            message: e.to_string(),
        })
    }

    /// First fire time strictly after `after`.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        Ok(self.schedule()?.after(&after).next())
    }
}

/// Content hash of a config document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ConfigVersion(String);

impl ConfigVersion {
    pub fn of(document: &ConfigDocument) -> Result<Self> {
        let canonical = serde_json::to_vec(document)?;
        Ok(Self(hex::encode(Sha256::digest(&canonical))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

/// A validated, immutable config document plus its version token.
///
/// Cloning is cheap. Edits go through [`ConfigSnapshot::document`] to obtain
/// an owned copy, which must be turned into a new snapshot to take effect.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    document: Arc<ConfigDocument>,
    version: ConfigVersion,
}

impl ConfigSnapshot {
    pub fn new(document: ConfigDocument) -> Result<Self> {
        document.validate()?;
        let version = ConfigVersion::of(&document)?;
        Ok(Self {
            document: Arc::new(document),
            version,
        })
    }

    pub fn version(&self) -> &ConfigVersion {
        &self.version
    }

    pub fn document(&self) -> &ConfigDocument {
        &self.document
    }

    pub fn pipeline(&self, name: &str) -> Option<&PipelineConfig> {
        self.document.pipeline(name)
    }

    pub fn pipelines(&self) -> &[PipelineConfig] {
        &self.document.pipelines
    }

    /// Pipelines with a dependency material on `pipeline`'s `stage`.
    pub fn dependents(&self, pipeline: &str, stage: &str) -> Vec<&PipelineConfig> {
        self.document
            .pipelines
            .iter()
            .filter(|p| p.depends_on(pipeline, stage))
            .collect()
    }

    pub fn dependency_order(&self) -> Vec<&str> {
        // Validation already rejected cycles.
        self.document.dependency_order().unwrap_or_default()
    }
}
