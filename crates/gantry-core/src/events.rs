//! Status events published after a unit of work commits.

use crate::build_cause::TriggerKind;
use crate::ids::*;
use crate::instance::{JobResult, JobState, StageResult, StageStatus};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// All events emitted by the scheduling engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    PipelineScheduled(PipelineScheduledPayload),
    PipelineUnlocked(PipelineUnlockedPayload),
    StageStatusChanged(StageStatusPayload),
    JobStatusChanged(JobStatusPayload),
    JobCompleted(JobCompletedPayload),
    JobRescheduled(JobRescheduledPayload),
}

impl Event {
    /// Dot-separated subject, used for subscription patterns.
    pub fn subject(&self) -> String {
        match self {
            Event::PipelineScheduled(p) => format!("pipeline.{}.scheduled", p.pipeline_name),
            Event::PipelineUnlocked(p) => format!("pipeline.{}.unlocked", p.pipeline_name),
            Event::StageStatusChanged(p) => format!(
                "stage.{}.{}.status",
                p.locator.pipeline_name, p.locator.stage_name
            ),
            Event::JobStatusChanged(p) => format!(
                "job.{}.{}.{}.status",
                p.locator.pipeline_name, p.locator.stage_name, p.job_name
            ),
            Event::JobCompleted(p) => format!(
                "job.{}.{}.{}.result",
                p.locator.pipeline_name, p.locator.stage_name, p.job_name
            ),
            Event::JobRescheduled(p) => format!(
                "job.{}.{}.{}.rescheduled",
                p.locator.pipeline_name, p.locator.stage_name, p.job_name
            ),
        }
    }
}

/// Match a subject against a pattern. `*` matches one token, `>` the rest.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineScheduledPayload {
    pub pipeline_id: PipelineId,
    pub pipeline_name: String,
    pub counter: u32,
    pub label: String,
    pub trigger: TriggerKind,
    pub approved_by: String,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineUnlockedPayload {
    pub pipeline_name: String,
    pub counter: u32,
    pub unlocked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StageStatusPayload {
    pub stage_id: StageId,
    pub locator: StageLocator,
    pub status: StageStatus,
    pub result: StageResult,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobStatusPayload {
    pub job_id: JobId,
    pub locator: StageLocator,
    pub job_name: String,
    pub state: JobState,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobCompletedPayload {
    pub job_id: JobId,
    pub locator: StageLocator,
    pub job_name: String,
    pub result: JobResult,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobRescheduledPayload {
    pub old_job_id: JobId,
    pub new_job_id: JobId,
    pub locator: StageLocator,
    pub job_name: String,
    pub rescheduled_at: DateTime<Utc>,
}
