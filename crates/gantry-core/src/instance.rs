//! Pipeline, stage and job instances and their state machines.

use crate::build_cause::BuildCause;
use crate::config::ConfigVersion;
use crate::ids::{JobId, PipelineId, StageId, StageLocator};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One execution of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Pipeline {
    pub id: PipelineId,
    pub name: String,
    pub counter: u32,
    pub label: String,
    pub build_cause: BuildCause,
    /// Stage names in configuration order when this instance was created.
    pub stage_names: Vec<String>,
    pub config_version: ConfigVersion,
    /// Every stage run of this instance, in the order they were created.
    #[serde(default)]
    pub stages: Vec<Stage>,
    pub created_at: DateTime<Utc>,
}

impl Pipeline {
    /// Latest run of the named stage.
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages
            .iter()
            .filter(|s| s.name == name)
            .max_by_key(|s| s.counter)
    }

    /// Latest run of every stage, ordered by `order_id`.
    pub fn latest_stages(&self) -> Vec<&Stage> {
        let mut latest: Vec<&Stage> = Vec::new();
        for stage in &self.stages {
            match latest.iter_mut().find(|s| s.name == stage.name) {
                Some(slot) if slot.counter < stage.counter => *slot = stage,
                Some(_) => {}
                None => latest.push(stage),
            }
        }
        latest.sort_by_key(|s| s.order_id);
        latest
    }

    pub fn active_stage(&self) -> Option<&Stage> {
        self.latest_stages().into_iter().find(|s| s.is_active())
    }

    pub fn is_active(&self) -> bool {
        self.active_stage().is_some()
    }

    /// The stage that historically ran right after `stage` in this instance.
    pub fn stage_with_order(&self, order_id: u32) -> Option<&Stage> {
        self.latest_stages()
            .into_iter()
            .find(|s| s.order_id == order_id)
    }

    /// Next stage name after `name` in the snapshot taken at creation.
    pub fn next_stage_name(&self, name: &str) -> Option<&str> {
        let index = self.stage_names.iter().position(|s| s == name)?;
        self.stage_names.get(index + 1).map(String::as_str)
    }

    pub fn next_order_id(&self) -> u32 {
        self.stages.iter().map(|s| s.order_id).max().unwrap_or(0) + 1
    }

    pub fn locator(&self) -> String {
        format!("{}/{}", self.name, self.counter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Scheduled,
    Building,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StageResult {
    Unknown,
    Passed,
    Failed,
    Cancelled,
}

impl fmt::Display for StageResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageResult::Unknown => f.write_str("unknown"),
            StageResult::Passed => f.write_str("passed"),
            StageResult::Failed => f.write_str("failed"),
            StageResult::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// One run of a stage within a pipeline instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Stage {
    pub id: StageId,
    pub pipeline_id: PipelineId,
    pub pipeline_name: String,
    pub pipeline_counter: u32,
    pub name: String,
    /// Incremented on every rerun of this stage within the same instance.
    pub counter: u32,
    /// Position in the historical run order of the instance. Reruns keep it.
    pub order_id: u32,
    pub status: StageStatus,
    pub result: StageResult,
    pub approved_by: String,
    /// For a job rerun, the counter of the first run in the chain of job
    /// reruns. `None` for full stage runs.
    #[serde(default)]
    pub rerun_of_counter: Option<u32>,
    pub jobs: Vec<JobInstance>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Stage {
    pub fn locator(&self) -> StageLocator {
        StageLocator::new(
            &self.pipeline_name,
            self.pipeline_counter,
            &self.name,
            self.counter,
        )
    }

    pub fn is_active(&self) -> bool {
        self.status != StageStatus::Completed
    }

    pub fn is_completed(&self) -> bool {
        self.status == StageStatus::Completed
    }

    pub fn passed(&self) -> bool {
        self.is_completed() && self.result == StageResult::Passed
    }

    pub fn job(&self, name: &str) -> Option<&JobInstance> {
        self.current_jobs().find(|j| j.name == name)
    }

    pub fn job_by_id(&self, id: JobId) -> Option<&JobInstance> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn job_by_id_mut(&mut self, id: JobId) -> Option<&mut JobInstance> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    /// Jobs that count towards the stage result; rescheduled ones are superseded.
    pub fn current_jobs(&self) -> impl Iterator<Item = &JobInstance> {
        self.jobs.iter().filter(|j| j.state != JobState::Rescheduled)
    }

    /// Recompute status and result from the jobs. Returns true if anything changed.
    pub fn refresh_status(&mut self, now: DateTime<Utc>) -> bool {
        let before = (self.status, self.result);
        let jobs: Vec<&JobInstance> = self
            .jobs
            .iter()
            .filter(|j| j.state != JobState::Rescheduled)
            .collect();

        if !jobs.is_empty() && jobs.iter().all(|j| j.is_completed()) {
            self.status = StageStatus::Completed;
            self.result = if jobs.iter().any(|j| j.result == JobResult::Cancelled) {
                StageResult::Cancelled
            } else if jobs.iter().any(|j| j.result == JobResult::Failed) {
                StageResult::Failed
            } else {
                StageResult::Passed
            };
            if self.completed_at.is_none() {
                self.completed_at = Some(now);
            }
        } else if jobs.iter().any(|j| j.state != JobState::Scheduled) {
            self.status = StageStatus::Building;
            self.result = StageResult::Unknown;
        } else {
            self.status = StageStatus::Scheduled;
            self.result = StageResult::Unknown;
        }

        before != (self.status, self.result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Assigned,
    Building,
    Completed,
    /// Superseded by a fresh job instance.
    Rescheduled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Rescheduled)
    }

    /// Position in the job lifecycle; a job never moves to a lower rank.
    fn rank(&self) -> u8 {
        match self {
            JobState::Scheduled => 0,
            JobState::Assigned => 1,
            JobState::Building => 2,
            JobState::Completed | JobState::Rescheduled => 3,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Scheduled => f.write_str("scheduled"),
            JobState::Assigned => f.write_str("assigned"),
            JobState::Building => f.write_str("building"),
            JobState::Completed => f.write_str("completed"),
            JobState::Rescheduled => f.write_str("rescheduled"),
        }
    }
}

/// Cancellation is `Completed` with a `Cancelled` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobResult {
    Unknown,
    Passed,
    Failed,
    Cancelled,
}

impl JobResult {
    pub fn is_failed_or_cancelled(&self) -> bool {
        matches!(self, JobResult::Failed | JobResult::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobTransition {
    pub state: JobState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobInstance {
    pub id: JobId,
    pub name: String,
    pub state: JobState,
    pub result: JobResult,
    /// Freshly re-executed as part of a partial stage rerun.
    #[serde(default)]
    pub is_rerun: bool,
    /// Carried forward unchanged from an earlier stage run.
    #[serde(default)]
    pub is_copy: bool,
    /// The job a copy was taken from, always the first execution.
    #[serde(default)]
    pub original_job_id: Option<JobId>,
    pub transitions: Vec<JobTransition>,
}

impl JobInstance {
    pub fn scheduled(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            state: JobState::Scheduled,
            result: JobResult::Unknown,
            is_rerun: false,
            is_copy: false,
            original_job_id: None,
            transitions: vec![JobTransition {
                state: JobState::Scheduled,
                at: now,
            }],
        }
    }

    /// A fresh instance re-executing this job.
    pub fn rerun(&self, now: DateTime<Utc>) -> Self {
        Self {
            is_rerun: true,
            ..Self::scheduled(&self.name, now)
        }
    }

    /// A copy carried forward into a new stage run, keeping state and result.
    pub fn copy_forward(&self) -> Self {
        let original = if self.is_copy {
            self.original_job_id.unwrap_or(self.id)
        } else {
            self.id
        };
        Self {
            id: JobId::new(),
            is_rerun: false,
            is_copy: true,
            original_job_id: Some(original),
            ..self.clone()
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == JobState::Completed
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.result == JobResult::Cancelled
    }

    pub fn last_transition_at(&self) -> Option<DateTime<Utc>> {
        self.transitions.last().map(|t| t.at)
    }

    /// Move forward to `state`. Stale or repeated reports are ignored.
    pub fn change_state(&mut self, state: JobState, now: DateTime<Utc>) -> bool {
        if self.state.is_terminal() || state.rank() <= self.state.rank() {
            return false;
        }
        self.state = state;
        self.transitions.push(JobTransition { state, at: now });
        true
    }

    pub fn complete(&mut self, result: JobResult, now: DateTime<Utc>) -> bool {
        if !self.change_state(JobState::Completed, now) {
            return false;
        }
        self.result = result;
        true
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        self.complete(JobResult::Cancelled, now)
    }

    pub fn fail(&mut self, now: DateTime<Utc>) -> bool {
        self.complete(JobResult::Failed, now)
    }

    /// Mark this job superseded and return its replacement.
    pub fn reschedule(&mut self, now: DateTime<Utc>) -> Option<Self> {
        if !self.change_state(JobState::Rescheduled, now) {
            return None;
        }
        let mut replacement = Self::scheduled(&self.name, now);
        replacement.is_rerun = self.is_rerun;
        Some(replacement)
    }
}
