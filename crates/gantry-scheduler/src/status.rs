//! Event payload builders shared by the schedulers.

use chrono::{DateTime, Utc};
use gantry_core::config::StageConfig;
use gantry_core::events::{
    Event, JobCompletedPayload, JobRescheduledPayload, JobStatusPayload, PipelineUnlockedPayload,
    StageStatusPayload,
};
use gantry_core::ids::StageId;
use gantry_core::instance::{JobInstance, Pipeline, Stage, StageResult, StageStatus};

/// A fresh stage run with one scheduled job per configured job.
pub(crate) fn new_stage(
    pipeline: &Pipeline,
    config: &StageConfig,
    counter: u32,
    order_id: u32,
    approved_by: &str,
    now: DateTime<Utc>,
) -> Stage {
    Stage {
        id: StageId::new(),
        pipeline_id: pipeline.id,
        pipeline_name: pipeline.name.clone(),
        pipeline_counter: pipeline.counter,
        name: config.name.clone(),
        counter,
        order_id,
        status: StageStatus::Scheduled,
        result: StageResult::Unknown,
        approved_by: approved_by.to_string(),
        rerun_of_counter: None,
        jobs: config
            .jobs
            .iter()
            .map(|job| JobInstance::scheduled(&job.name, now))
            .collect(),
        created_at: now,
        completed_at: None,
    }
}

pub(crate) fn stage_changed(stage: &Stage, now: DateTime<Utc>) -> Event {
    Event::StageStatusChanged(StageStatusPayload {
        stage_id: stage.id,
        locator: stage.locator(),
        status: stage.status,
        result: stage.result,
        changed_at: now,
    })
}

pub(crate) fn job_changed(stage: &Stage, job: &JobInstance, now: DateTime<Utc>) -> Event {
    Event::JobStatusChanged(JobStatusPayload {
        job_id: job.id,
        locator: stage.locator(),
        job_name: job.name.clone(),
        state: job.state,
        changed_at: now,
    })
}

pub(crate) fn job_completed(stage: &Stage, job: &JobInstance, now: DateTime<Utc>) -> Event {
    Event::JobCompleted(JobCompletedPayload {
        job_id: job.id,
        locator: stage.locator(),
        job_name: job.name.clone(),
        result: job.result,
        completed_at: now,
    })
}

pub(crate) fn job_rescheduled(
    stage: &Stage,
    old: &JobInstance,
    new: &JobInstance,
    now: DateTime<Utc>,
) -> Event {
    Event::JobRescheduled(JobRescheduledPayload {
        old_job_id: old.id,
        new_job_id: new.id,
        locator: stage.locator(),
        job_name: old.name.clone(),
        rescheduled_at: now,
    })
}

pub(crate) fn pipeline_unlocked(pipeline: &str, counter: u32, now: DateTime<Utc>) -> Event {
    Event::PipelineUnlocked(PipelineUnlockedPayload {
        pipeline_name: pipeline.to_string(),
        counter,
        unlocked_at: now,
    })
}
