//! Tagged results for scheduling decisions.
//!
//! "Cannot schedule right now" is an expected outcome, so scheduling calls
//! return a [`ScheduleOutcome`] and reserve [`crate::Error`] for failures.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum ScheduleOutcome<T> {
    Scheduled(T),
    /// The request was refused; the reason is meant for the caller.
    Rejected(RejectReason),
    /// Nothing to do; not an error.
    Skipped(SkipReason),
}

impl<T> ScheduleOutcome<T> {
    pub fn is_scheduled(&self) -> bool {
        matches!(self, ScheduleOutcome::Scheduled(_))
    }

    pub fn scheduled(&self) -> Option<&T> {
        match self {
            ScheduleOutcome::Scheduled(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_scheduled(self) -> Option<T> {
        match self {
            ScheduleOutcome::Scheduled(value) => Some(value),
            _ => None,
        }
    }

    pub fn rejection(&self) -> Option<&RejectReason> {
        match self {
            ScheduleOutcome::Rejected(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match self {
            ScheduleOutcome::Skipped(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ScheduleOutcome<U> {
        match self {
            ScheduleOutcome::Scheduled(value) => ScheduleOutcome::Scheduled(f(value)),
            ScheduleOutcome::Rejected(reason) => ScheduleOutcome::Rejected(reason),
            ScheduleOutcome::Skipped(reason) => ScheduleOutcome::Skipped(reason),
        }
    }
}

/// Why a scheduling request was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    PipelineLocked {
        pipeline: String,
        locked_by: String,
    },
    AlreadyPending {
        pipeline: String,
    },
    StageActive {
        pipeline: String,
        stage: String,
        active_stage: String,
    },
    PreviousStageNotRun {
        stage: String,
        previous: String,
    },
    PreviousStageNotPassed {
        stage: String,
        previous: String,
        result: String,
    },
    StageNotInConfig {
        pipeline: String,
        stage: String,
    },
    JobConfigMissing {
        stage: String,
        job: String,
    },
    NoJobSelected,
    NoFailedJobs {
        stage: String,
    },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::PipelineLocked {
                pipeline,
                locked_by,
            } => write!(
                f,
                "Pipeline {pipeline} cannot be scheduled as it is locked by the running instance {locked_by}."
            ),
            RejectReason::AlreadyPending { pipeline } => write!(
                f,
                "Failed to trigger pipeline: {pipeline}. A build cause is already pending."
            ),
            RejectReason::StageActive {
                pipeline,
                stage,
                active_stage,
            } => write!(
                f,
                "Cannot schedule {stage} as stage {active_stage} of {pipeline} is still in progress."
            ),
            RejectReason::PreviousStageNotRun { stage, previous } => write!(
                f,
                "Cannot schedule {stage} as the previous stage {previous} has not run!"
            ),
            RejectReason::PreviousStageNotPassed {
                stage,
                previous,
                result,
            } => write!(
                f,
                "Cannot schedule {stage} as the previous stage {previous} has {result}!"
            ),
            RejectReason::StageNotInConfig { pipeline, stage } => write!(
                f,
                "Stage '{stage}' does not exist in the configuration of pipeline '{pipeline}'."
            ),
            RejectReason::JobConfigMissing { stage, job } => write!(
                f,
                "Cannot rerun job '{job}' of stage '{stage}'. Configuration for job doesn't exist."
            ),
            RejectReason::NoJobSelected => f.write_str("No job was selected to re-run."),
            RejectReason::NoFailedJobs { stage } => write!(
                f,
                "There are no failed jobs in the stage that could be re-run ({stage})."
            ),
        }
    }
}

/// Why a scheduling pass decided to do nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    NoChanges,
    NoCompatibleRevisions {
        #[serde(rename = "detail")]
        reason: String,
    },
    UpstreamNotBuilt { material: String },
    AlreadyRanWithLatestMaterials,
    AlreadyPending,
    /// The build cause was replaced or consumed before instantiation.
    Trumped,
    MaterialsChanged,
    StageAlreadyActive { stage: String },
    ManualApprovalRequired { stage: String },
    NoNextStage,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoChanges => f.write_str("no material changed"),
            SkipReason::NoCompatibleRevisions { reason } => {
                write!(f, "could not find a compatible revision: {reason}")
            }
            SkipReason::UpstreamNotBuilt { material } => {
                write!(f, "upstream material {material} has never passed")
            }
            SkipReason::AlreadyRanWithLatestMaterials => {
                f.write_str("already ran with the latest material(s)")
            }
            SkipReason::AlreadyPending => f.write_str("a build cause is already pending"),
            SkipReason::Trumped => f.write_str("build cause is no longer pending"),
            SkipReason::MaterialsChanged => {
                f.write_str("build cause materials no longer match the configuration")
            }
            SkipReason::StageAlreadyActive { stage } => {
                write!(f, "stage {stage} is already active")
            }
            SkipReason::ManualApprovalRequired { stage } => {
                write!(f, "stage {stage} requires manual approval")
            }
            SkipReason::NoNextStage => f.write_str("no further stage to run"),
        }
    }
}
