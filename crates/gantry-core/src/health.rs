//! Server health states raised by the engine.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Info,
    Warning,
    Error,
}

/// What a health state is about. A newer state replaces an older one with the same scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthScope {
    Global,
    Pipeline {
        pipeline: String,
    },
    Stage {
        pipeline: String,
        stage: String,
    },
    Job {
        pipeline: String,
        stage: String,
        job: String,
    },
}

impl HealthScope {
    pub fn pipeline(pipeline: impl Into<String>) -> Self {
        HealthScope::Pipeline {
            pipeline: pipeline.into(),
        }
    }

    pub fn stage(pipeline: impl Into<String>, stage: impl Into<String>) -> Self {
        HealthScope::Stage {
            pipeline: pipeline.into(),
            stage: stage.into(),
        }
    }

    pub fn job(
        pipeline: impl Into<String>,
        stage: impl Into<String>,
        job: impl Into<String>,
    ) -> Self {
        HealthScope::Job {
            pipeline: pipeline.into(),
            stage: stage.into(),
            job: job.into(),
        }
    }
}

impl fmt::Display for HealthScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthScope::Global => f.write_str("global"),
            HealthScope::Pipeline { pipeline } => write!(f, "pipeline:{pipeline}"),
            HealthScope::Stage { pipeline, stage } => write!(f, "stage:{pipeline}/{stage}"),
            HealthScope::Job {
                pipeline,
                stage,
                job,
            } => write!(f, "job:{pipeline}/{stage}/{job}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HealthState {
    pub level: HealthLevel,
    pub scope: HealthScope,
    pub message: String,
    pub description: String,
    pub raised_at: DateTime<Utc>,
}

impl HealthState {
    fn new(
        level: HealthLevel,
        scope: HealthScope,
        message: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            level,
            scope,
            message: message.into(),
            description: description.into(),
            raised_at: Utc::now(),
        }
    }

    pub fn info(
        scope: HealthScope,
        message: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self::new(HealthLevel::Info, scope, message, description)
    }

    pub fn warning(
        scope: HealthScope,
        message: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self::new(HealthLevel::Warning, scope, message, description)
    }

    pub fn error(
        scope: HealthScope,
        message: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self::new(HealthLevel::Error, scope, message, description)
    }
}
