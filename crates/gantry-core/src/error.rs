//! Error types for Gantry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Lookup errors
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Pipeline instance not found: {pipeline}/{counter}")]
    PipelineInstanceNotFound { pipeline: String, counter: u32 },

    #[error("Stage not found: {pipeline}/{stage}")]
    StageNotFound { pipeline: String, stage: String },

    #[error("Stage run not found: {0}")]
    StageRunNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Material not found: {0}")]
    MaterialNotFound(String),

    #[error("Job {job} cannot be moved to state {state} by a status report")]
    InvalidJobTransition { job: String, state: String },

    // Revision errors
    #[error("Revision '{revision}' is not known for material {material}")]
    UnknownRevision { material: String, revision: String },

    #[error("Invalid dependency revision: {0}")]
    InvalidDependencyRevision(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration changed concurrently: expected version {expected}, found {actual}")]
    ConfigConflict { expected: String, actual: String },

    #[error("Gave up writing configuration after {attempts} attempts: {message}")]
    ConfigWriteExhausted { attempts: u32, message: String },

    #[error("Invalid timer specification '{spec}': {message}")]
    InvalidTimer { spec: String, message: String },

    // Persistence errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Pipeline {pipeline} is locked by instance {pipeline}/{owner}")]
    PipelineLocked { pipeline: String, owner: u32 },

    #[error("Counter for pipeline {pipeline} must increase: {counter} is not above {current}")]
    CounterRegression {
        pipeline: String,
        counter: u32,
        current: u32,
    },

    // Infrastructure errors
    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
