//! Stage scheduling and the job state machine.
//!
//! Job reports, cancellation and the hung-job sweep serialize per stage;
//! creating a new stage run serializes per pipeline instance. Follow-up
//! triggers run after the stage lock is released, so the two never nest.

use crate::locks::KeyedLocks;
use crate::status;
use crate::transaction;
use chrono::{DateTime, Utc};
use gantry_core::build_cause::CHANGES_APPROVER;
use gantry_core::config::{LockBehavior, PipelineConfig, StageConfig};
use gantry_core::health::{HealthScope, HealthState};
use gantry_core::ids::{JobId, StageId};
use gantry_core::instance::{JobInstance, JobResult, JobState, Pipeline, Stage};
use gantry_core::outcome::{RejectReason, ScheduleOutcome, SkipReason};
use gantry_core::ports::{ConfigStore, EventBus, HealthSink, PipelineRepository, UnitOfWork};
use gantry_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Which jobs a new stage run re-executes.
enum JobSelection<'a> {
    All,
    Only(&'a [String]),
}

/// Everything a manual stage run needs once the checks have passed.
struct StageRunPlan {
    instance: Pipeline,
    stage: StageConfig,
    previous_run: Option<Stage>,
    take_lock: bool,
}

pub struct StageScheduler {
    configs: Arc<dyn ConfigStore>,
    pipelines: Arc<dyn PipelineRepository>,
    events: Arc<dyn EventBus>,
    health: Arc<dyn HealthSink>,
    locks: KeyedLocks<String>,
}

impl StageScheduler {
    pub fn new(
        configs: Arc<dyn ConfigStore>,
        pipelines: Arc<dyn PipelineRepository>,
        events: Arc<dyn EventBus>,
        health: Arc<dyn HealthSink>,
    ) -> Self {
        Self {
            configs,
            pipelines,
            events,
            health,
            locks: KeyedLocks::new(),
        }
    }

    // ------------------------------------------------------------------
    // Manual stage runs
    // ------------------------------------------------------------------

    /// Run `stage` again in an existing instance with every job fresh.
    pub async fn rerun_stage(
        &self,
        pipeline: &str,
        counter: u32,
        stage: &str,
        approver: &str,
    ) -> Result<ScheduleOutcome<Stage>> {
        self.run_stage(pipeline, counter, stage, approver, JobSelection::All)
            .await
    }

    /// Run a stage that waits for manual approval. Same checks as a rerun.
    pub async fn approve_stage(
        &self,
        pipeline: &str,
        counter: u32,
        stage: &str,
        approver: &str,
    ) -> Result<ScheduleOutcome<Stage>> {
        info!(pipeline, counter, stage, approver, "Stage approved");
        self.run_stage(pipeline, counter, stage, approver, JobSelection::All)
            .await
    }

    /// Rerun the named jobs; every other job is carried forward as a copy.
    pub async fn rerun_jobs(
        &self,
        pipeline: &str,
        counter: u32,
        stage: &str,
        jobs: &[String],
        approver: &str,
    ) -> Result<ScheduleOutcome<Stage>> {
        if jobs.is_empty() {
            return Ok(ScheduleOutcome::Rejected(RejectReason::NoJobSelected));
        }
        self.run_stage(pipeline, counter, stage, approver, JobSelection::Only(jobs))
            .await
    }

    /// Rerun every failed or cancelled job of the latest run of `stage`.
    pub async fn rerun_failed_jobs(
        &self,
        pipeline: &str,
        counter: u32,
        stage: &str,
        approver: &str,
    ) -> Result<ScheduleOutcome<Stage>> {
        let instance = self.instance(pipeline, counter).await?;
        let run = instance.stage(stage).ok_or_else(|| Error::StageNotFound {
            pipeline: instance.locator(),
            stage: stage.to_string(),
        })?;
        let failed: Vec<String> = run
            .current_jobs()
            .filter(|j| j.result.is_failed_or_cancelled())
            .map(|j| j.name.clone())
            .collect();
        if failed.is_empty() {
            return Ok(ScheduleOutcome::Rejected(RejectReason::NoFailedJobs {
                stage: run.locator().to_string(),
            }));
        }
        self.rerun_jobs(pipeline, counter, stage, &failed, approver)
            .await
    }

    async fn run_stage(
        &self,
        pipeline: &str,
        counter: u32,
        stage: &str,
        approver: &str,
        selection: JobSelection<'_>,
    ) -> Result<ScheduleOutcome<Stage>> {
        let _guard = self.locks.lock(instance_key(pipeline, counter)).await;

        let plan = match self.plan_stage_run(pipeline, counter, stage).await? {
            ScheduleOutcome::Scheduled(plan) => plan,
            ScheduleOutcome::Rejected(reason) => {
                warn!(pipeline, counter, stage, reason = %reason, "Stage run rejected");
                return Ok(ScheduleOutcome::Rejected(reason));
            }
            ScheduleOutcome::Skipped(reason) => return Ok(ScheduleOutcome::Skipped(reason)),
        };

        let now = Utc::now();
        let counter_next = plan.previous_run.as_ref().map_or(1, |s| s.counter + 1);
        let order_id = plan
            .previous_run
            .as_ref()
            .map_or_else(|| plan.instance.next_order_id(), |s| s.order_id);
        let mut run = status::new_stage(
            &plan.instance,
            &plan.stage,
            counter_next,
            order_id,
            approver,
            now,
        );

        if let JobSelection::Only(selected) = selection {
            if let Some(missing) = selected.iter().find(|name| plan.stage.job(name).is_none()) {
                return Ok(ScheduleOutcome::Rejected(RejectReason::JobConfigMissing {
                    stage: stage.to_string(),
                    job: missing.clone(),
                }));
            }
            let previous = plan.previous_run.as_ref().ok_or_else(|| {
                Error::StageRunNotFound(format!("{}/{}/{}", pipeline, counter, stage))
            })?;
            run.rerun_of_counter = Some(previous.rerun_of_counter.unwrap_or(previous.counter));
            run.jobs = plan
                .stage
                .jobs
                .iter()
                .map(|job| {
                    let earlier = previous.job(&job.name);
                    match (selected.contains(&job.name), earlier) {
                        (true, Some(earlier)) => earlier.rerun(now),
                        (true, None) => JobInstance {
                            is_rerun: true,
                            ..JobInstance::scheduled(&job.name, now)
                        },
                        (false, Some(earlier)) => earlier.copy_forward(),
                        (false, None) => JobInstance::scheduled(&job.name, now),
                    }
                })
                .collect();
        }

        let mut unit = UnitOfWork::new();
        unit.save_stage(run.clone())
            .after_commit(status::stage_changed(&run, now));
        if plan.take_lock {
            unit.lock_pipeline(pipeline, counter);
        }
        transaction::commit(self.pipelines.as_ref(), self.events.as_ref(), unit).await?;

        info!(
            pipeline,
            counter,
            stage,
            stage_counter = run.counter,
            approver,
            "Stage scheduled"
        );
        Ok(ScheduleOutcome::Scheduled(run))
    }

    async fn plan_stage_run(
        &self,
        pipeline: &str,
        counter: u32,
        stage: &str,
    ) -> Result<ScheduleOutcome<StageRunPlan>> {
        let snapshot = self.configs.current().await?;
        let config = snapshot
            .pipeline(pipeline)
            .ok_or_else(|| Error::PipelineNotFound(pipeline.to_string()))?;
        let Some(stage_config) = config.stage(stage) else {
            return Ok(ScheduleOutcome::Rejected(RejectReason::StageNotInConfig {
                pipeline: pipeline.to_string(),
                stage: stage.to_string(),
            }));
        };
        let instance = self.instance(pipeline, counter).await?;

        if let Some(active) = instance.active_stage() {
            return Ok(ScheduleOutcome::Rejected(RejectReason::StageActive {
                pipeline: instance.locator(),
                stage: stage.to_string(),
                active_stage: active.name.clone(),
            }));
        }
        if let Some(elsewhere) = self.active_run_of(pipeline, stage).await? {
            return Ok(ScheduleOutcome::Rejected(RejectReason::StageActive {
                pipeline: pipeline.to_string(),
                stage: stage.to_string(),
                active_stage: elsewhere.locator().to_string(),
            }));
        }

        if let Some(previous) = config.previous_stage(stage) {
            match instance.stage(&previous.name) {
                None => {
                    return Ok(ScheduleOutcome::Rejected(
                        RejectReason::PreviousStageNotRun {
                            stage: stage.to_string(),
                            previous: previous.name.clone(),
                        },
                    ));
                }
                Some(run) if !run.passed() => {
                    return Ok(ScheduleOutcome::Rejected(
                        RejectReason::PreviousStageNotPassed {
                            stage: stage.to_string(),
                            previous: previous.name.clone(),
                            result: run.result.to_string(),
                        },
                    ));
                }
                Some(_) => {}
            }
        }

        let take_lock = match self.lock_check(config, &instance).await? {
            Ok(take_lock) => take_lock,
            Err(reason) => return Ok(ScheduleOutcome::Rejected(reason)),
        };

        Ok(ScheduleOutcome::Scheduled(StageRunPlan {
            previous_run: instance.stage(stage).cloned(),
            stage: stage_config.clone(),
            instance,
            take_lock,
        }))
    }

    /// `Ok(true)` if the instance must take the lock, `Err` if another instance holds it.
    async fn lock_check(
        &self,
        config: &PipelineConfig,
        instance: &Pipeline,
    ) -> Result<std::result::Result<bool, RejectReason>> {
        if !config.is_locked() {
            return Ok(Ok(false));
        }
        match self.pipelines.lock_owner(&instance.name).await? {
            None => Ok(Ok(true)),
            Some(owner) if owner == instance.counter => Ok(Ok(false)),
            Some(owner) => Ok(Err(RejectReason::PipelineLocked {
                pipeline: instance.name.clone(),
                locked_by: format!("{}/{}", instance.name, owner),
            })),
        }
    }

    // ------------------------------------------------------------------
    // Automatic triggers after a stage completes
    // ------------------------------------------------------------------

    /// Trigger what follows a completed stage. Returns the stage runs created.
    pub async fn stage_completed(&self, completed: &Stage) -> Result<Vec<Stage>> {
        let mut triggered = Vec::new();
        let Some(instance) = self.pipelines.pipeline_by_id(completed.pipeline_id).await? else {
            return Ok(triggered);
        };
        let snapshot = self.configs.current().await?;
        let Some(config) = snapshot.pipeline(&completed.pipeline_name) else {
            debug!(pipeline = %completed.pipeline_name, "Pipeline no longer configured");
            return Ok(triggered);
        };

        if completed.passed()
            && let Some(next) = historical_next(&instance, completed)
        {
            match self.trigger_stage(config, &instance, &next).await? {
                ScheduleOutcome::Scheduled(stage) => triggered.push(stage),
                ScheduleOutcome::Rejected(reason) => {
                    warn!(
                        pipeline = %instance.locator(),
                        stage = %next,
                        reason = %reason,
                        "Next stage not triggered"
                    );
                }
                ScheduleOutcome::Skipped(reason) => {
                    debug!(
                        pipeline = %instance.locator(),
                        stage = %next,
                        reason = %reason,
                        "Next stage not triggered"
                    );
                }
            }
        }

        if let Some(newer) = self.newer_waiting_instance(&instance, &completed.name).await?
            && let ScheduleOutcome::Scheduled(stage) =
                self.trigger_stage(config, &newer, &completed.name).await?
        {
            info!(
                pipeline = %newer.locator(),
                stage = %completed.name,
                "Triggered stage in newer pipeline"
            );
            triggered.push(stage);
        }
        Ok(triggered)
    }

    /// Newest later instance whose historical predecessor of `stage` passed and which never ran it.
    async fn newer_waiting_instance(
        &self,
        instance: &Pipeline,
        stage: &str,
    ) -> Result<Option<Pipeline>> {
        let newer = self
            .pipelines
            .pipelines_after(&instance.name, instance.counter)
            .await?;
        Ok(newer.into_iter().rev().find(|candidate| {
            if candidate.stage(stage).is_some() || candidate.is_active() {
                return false;
            }
            let Some(index) = candidate.stage_names.iter().position(|s| s == stage) else {
                return false;
            };
            index
                .checked_sub(1)
                .and_then(|i| candidate.stage_names.get(i))
                .and_then(|previous| candidate.stage(previous))
                .is_some_and(Stage::passed)
        }))
    }

    /// Schedule `stage` in `instance` on behalf of the system.
    async fn trigger_stage(
        &self,
        config: &PipelineConfig,
        instance: &Pipeline,
        stage: &str,
    ) -> Result<ScheduleOutcome<Stage>> {
        let _guard = self.locks.lock(instance_key(&instance.name, instance.counter)).await;

        let Some(stage_config) = config.stage(stage) else {
            return Ok(ScheduleOutcome::Rejected(RejectReason::StageNotInConfig {
                pipeline: instance.name.clone(),
                stage: stage.to_string(),
            }));
        };
        if stage_config.requires_manual_approval() {
            return Ok(ScheduleOutcome::Skipped(SkipReason::ManualApprovalRequired {
                stage: stage.to_string(),
            }));
        }

        let instance = self.instance(&instance.name, instance.counter).await?;
        if instance.is_active() || self.active_run_of(&instance.name, stage).await?.is_some() {
            return Ok(ScheduleOutcome::Skipped(SkipReason::StageAlreadyActive {
                stage: stage.to_string(),
            }));
        }
        let take_lock = match self.lock_check(config, &instance).await? {
            Ok(take_lock) => take_lock,
            Err(reason) => return Ok(ScheduleOutcome::Rejected(reason)),
        };

        let now = Utc::now();
        let previous = instance.stage(stage);
        let run = status::new_stage(
            &instance,
            stage_config,
            previous.map_or(1, |s| s.counter + 1),
            previous.map_or_else(|| instance.next_order_id(), |s| s.order_id),
            CHANGES_APPROVER,
            now,
        );

        let mut unit = UnitOfWork::new();
        unit.save_stage(run.clone())
            .after_commit(status::stage_changed(&run, now));
        if take_lock {
            unit.lock_pipeline(&instance.name, instance.counter);
        }
        transaction::commit(self.pipelines.as_ref(), self.events.as_ref(), unit).await?;

        info!(pipeline = %instance.locator(), stage, "Stage triggered");
        Ok(ScheduleOutcome::Scheduled(run))
    }

    /// Add the unlock writes owed once `stage` reached a terminal state.
    async fn unlock_on_completion(
        &self,
        stage: &Stage,
        unit: &mut UnitOfWork,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.pipelines.lock_owner(&stage.pipeline_name).await? != Some(stage.pipeline_counter) {
            return Ok(());
        }
        let Some(instance) = self.pipelines.pipeline_by_id(stage.pipeline_id).await? else {
            return Ok(());
        };
        let snapshot = self.configs.current().await?;
        let config = snapshot.pipeline(&stage.pipeline_name);

        let unlock = match config {
            None => true,
            Some(config) if config.lock == LockBehavior::None => true,
            Some(config) if stage.passed() => match historical_next(&instance, stage) {
                None => true,
                Some(next) => config
                    .stage(&next)
                    .is_none_or(StageConfig::requires_manual_approval),
            },
            Some(config) => config.lock == LockBehavior::UnlockWhenFinished,
        };

        if unlock {
            unit.unlock_pipeline(&stage.pipeline_name).after_commit(status::pipeline_unlocked(
                &stage.pipeline_name,
                stage.pipeline_counter,
                now,
            ));
        }
        Ok(())
    }

    /// Release a pipeline lock regardless of instance state.
    pub async fn unlock_pipeline(&self, pipeline: &str) -> Result<bool> {
        let Some(owner) = self.pipelines.lock_owner(pipeline).await? else {
            return Ok(false);
        };
        let mut unit = UnitOfWork::new();
        unit.unlock_pipeline(pipeline)
            .after_commit(status::pipeline_unlocked(pipeline, owner, Utc::now()));
        transaction::commit(self.pipelines.as_ref(), self.events.as_ref(), unit).await?;
        info!(pipeline, counter = owner, "Pipeline unlocked");
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Job reports and cancellation
    // ------------------------------------------------------------------

    /// Record an agent's progress report. Only `Assigned` and `Building` are accepted.
    ///
    /// Returns false when the report was ignored because the job already finished.
    pub async fn update_job_status(&self, job: JobId, state: JobState) -> Result<bool> {
        if !matches!(state, JobState::Assigned | JobState::Building) {
            return Err(Error::InvalidJobTransition {
                job: job.to_string(),
                state: state.to_string(),
            });
        }
        let stage = self.stage_of(job).await?;
        let _guard = self.locks.lock(stage_key(&stage)).await;
        let mut stage = self.reload(stage.id).await?;

        let now = Utc::now();
        let Some(instance) = stage.job_by_id_mut(job) else {
            return Err(Error::JobNotFound(job.to_string()));
        };
        if !instance.change_state(state, now) {
            debug!(
                job = %job,
                current = %instance.state,
                reported = %state,
                "Ignoring job status report"
            );
            return Ok(false);
        }
        let instance = instance.clone();
        let stage_changed = stage.refresh_status(now);

        let mut unit = UnitOfWork::new();
        unit.save_stage(stage.clone())
            .after_commit(status::job_changed(&stage, &instance, now));
        if stage_changed {
            unit.after_commit(status::stage_changed(&stage, now));
        }
        transaction::commit(self.pipelines.as_ref(), self.events.as_ref(), unit).await?;
        Ok(true)
    }

    /// Record a job's final result. Returns the stage if this completed it.
    ///
    /// Stages that follow a completed stage are triggered before returning.
    /// A failed trigger is logged; the recorded completion stands.
    pub async fn job_completing(&self, job: JobId, result: JobResult) -> Result<Option<Stage>> {
        let completed = self.complete_job(job, result).await?;
        if let Some(stage) = &completed {
            self.trigger_following(stage).await;
        }
        Ok(completed)
    }

    async fn trigger_following(&self, completed: &Stage) {
        if let Err(e) = self.stage_completed(completed).await {
            error!(
                stage = %completed.locator(),
                error = %e,
                "Failed to trigger stages after completion"
            );
        }
    }

    /// Cancel a single job. Returns the stage if this completed it.
    pub async fn cancel_job(&self, job: JobId) -> Result<Option<Stage>> {
        self.job_completing(job, JobResult::Cancelled).await
    }

    async fn complete_job(&self, job: JobId, result: JobResult) -> Result<Option<Stage>> {
        let stage = self.stage_of(job).await?;
        let _guard = self.locks.lock(stage_key(&stage)).await;
        let mut stage = self.reload(stage.id).await?;

        let now = Utc::now();
        let Some(instance) = stage.job_by_id_mut(job) else {
            return Err(Error::JobNotFound(job.to_string()));
        };
        if !instance.complete(result, now) {
            debug!(job = %job, current = %instance.state, "Ignoring completion of finished job");
            return Ok(None);
        }
        let instance = instance.clone();
        let stage_changed = stage.refresh_status(now);

        let mut unit = UnitOfWork::new();
        unit.save_stage(stage.clone())
            .after_commit(status::job_completed(&stage, &instance, now));
        if stage_changed {
            unit.after_commit(status::stage_changed(&stage, now));
        }
        if stage.is_completed() {
            self.unlock_on_completion(&stage, &mut unit, now).await?;
        }
        transaction::commit(self.pipelines.as_ref(), self.events.as_ref(), unit).await?;

        info!(
            stage = %stage.locator(),
            job = %instance.name,
            result = ?result,
            "Job completed"
        );
        if stage.is_completed() {
            info!(stage = %stage.locator(), result = %stage.result, "Stage completed");
            return Ok(Some(stage));
        }
        Ok(None)
    }

    /// Cancel every unfinished job of a stage run in one unit of work.
    ///
    /// Returns `None` if the stage had already completed.
    pub async fn cancel_stage(&self, stage: StageId) -> Result<Option<Stage>> {
        let guard = {
            let current = self.reload(stage).await?;
            self.locks.lock(stage_key(&current)).await
        };
        let mut stage = self.reload(stage).await?;
        if stage.is_completed() {
            return Ok(None);
        }

        let now = Utc::now();
        let mut unit = UnitOfWork::new();
        let mut cancelled = Vec::new();
        for job in stage.jobs.iter_mut().filter(|j| j.is_active()) {
            if job.cancel(now) {
                cancelled.push(job.clone());
            }
        }
        stage.refresh_status(now);

        unit.save_stage(stage.clone());
        for job in &cancelled {
            unit.after_commit(status::job_completed(&stage, job, now));
        }
        unit.after_commit(status::stage_changed(&stage, now));
        self.unlock_on_completion(&stage, &mut unit, now).await?;
        transaction::commit(self.pipelines.as_ref(), self.events.as_ref(), unit).await?;

        info!(stage = %stage.locator(), jobs = cancelled.len(), "Stage cancelled");
        drop(guard);
        self.trigger_following(&stage).await;
        Ok(Some(stage))
    }

    // ------------------------------------------------------------------
    // Sweeps and checks
    // ------------------------------------------------------------------

    /// Reschedule building jobs with no transition for longer than `threshold`.
    pub async fn reschedule_hung_jobs(
        &self,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> Result<Vec<JobId>> {
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| Error::Internal(format!("hung job threshold: {}", e)))?;
        let cutoff = now - threshold;
        let is_hung = |job: &JobInstance| {
            job.state == JobState::Building
                && job.last_transition_at().is_some_and(|at| at < cutoff)
        };

        let mut rescheduled = Vec::new();
        for candidate in self.pipelines.active_stages().await? {
            if !candidate.jobs.iter().any(is_hung) {
                continue;
            }
            let _guard = self.locks.lock(stage_key(&candidate)).await;
            // A job cancelled since the scan is no longer hung.
            let mut stage = self.reload(candidate.id).await?;
            let hung: Vec<JobId> = stage
                .jobs
                .iter()
                .filter(|&j| is_hung(j))
                .map(|j| j.id)
                .collect();
            if hung.is_empty() {
                continue;
            }

            let mut replacements = Vec::new();
            for id in &hung {
                if let Some(job) = stage.job_by_id_mut(*id)
                    && let Some(replacement) = job.reschedule(now)
                {
                    replacements.push((job.clone(), replacement));
                }
            }
            stage
                .jobs
                .extend(replacements.iter().map(|(_, replacement)| replacement.clone()));
            let stage_changed = stage.refresh_status(now);

            let mut unit = UnitOfWork::new();
            unit.save_stage(stage.clone());
            for (old, replacement) in &replacements {
                warn!(
                    stage = %stage.locator(),
                    job = %old.name,
                    old_job = %old.id,
                    new_job = %replacement.id,
                    "Rescheduling hung job"
                );
                unit.after_commit(status::job_rescheduled(&stage, old, replacement, now));
            }
            if stage_changed {
                unit.after_commit(status::stage_changed(&stage, now));
            }
            transaction::commit(self.pipelines.as_ref(), self.events.as_ref(), unit).await?;
            rescheduled.extend(replacements.into_iter().map(|(old, _)| old.id));
        }
        Ok(rescheduled)
    }

    /// Check that every material of the job's build cause is still configured.
    ///
    /// If one is missing the job is failed and a job-scoped health error raised.
    pub async fn verify_job_materials(&self, job: JobId) -> Result<bool> {
        let stage = self.stage_of(job).await?;
        let instance = stage
            .job_by_id(job)
            .ok_or_else(|| Error::JobNotFound(job.to_string()))?
            .clone();
        let pipeline = self
            .pipelines
            .pipeline_by_id(stage.pipeline_id)
            .await?
            .ok_or_else(|| Error::PipelineInstanceNotFound {
                pipeline: stage.pipeline_name.clone(),
                counter: stage.pipeline_counter,
            })?;
        let snapshot = self.configs.current().await?;
        let config = snapshot.pipeline(&pipeline.name);

        let missing = pipeline
            .build_cause
            .revisions()
            .materials()
            .into_iter()
            .find(|m| config.is_none_or(|c| c.material(&m.fingerprint()).is_none()))
            .cloned();
        let Some(missing) = missing else {
            return Ok(true);
        };

        let message = format!(
            "Cannot run job {}/{}: material {} is no longer in the configuration",
            stage.locator(),
            instance.name,
            missing
        );
        warn!(job = %job, material = %missing, "Failing job with unconfigured material");
        self.health
            .update(HealthState::error(
                HealthScope::job(&stage.pipeline_name, &stage.name, &instance.name),
                message,
                format!(
                    "Material {} was removed after {} was scheduled.",
                    missing,
                    pipeline.locator()
                ),
            ))
            .await?;
        self.job_completing(job, JobResult::Failed).await?;
        Ok(false)
    }

    // ------------------------------------------------------------------

    async fn instance(&self, pipeline: &str, counter: u32) -> Result<Pipeline> {
        self.pipelines
            .pipeline_by_counter(pipeline, counter)
            .await?
            .ok_or_else(|| Error::PipelineInstanceNotFound {
                pipeline: pipeline.to_string(),
                counter,
            })
    }

    async fn stage_of(&self, job: JobId) -> Result<Stage> {
        self.pipelines
            .stage_for_job(job)
            .await?
            .ok_or_else(|| Error::JobNotFound(job.to_string()))
    }

    async fn reload(&self, stage: StageId) -> Result<Stage> {
        self.pipelines
            .stage_by_id(stage)
            .await?
            .ok_or_else(|| Error::StageRunNotFound(stage.to_string()))
    }

    async fn active_run_of(&self, pipeline: &str, stage: &str) -> Result<Option<Stage>> {
        Ok(self
            .pipelines
            .active_stages()
            .await?
            .into_iter()
            .find(|s| s.pipeline_name == pipeline && s.name == stage))
    }
}

/// The stage that ran after `stage` in this instance, else the next name in its
/// creation-time order.
fn historical_next(instance: &Pipeline, stage: &Stage) -> Option<String> {
    instance
        .stage_with_order(stage.order_id + 1)
        .map(|s| s.name.clone())
        .or_else(|| instance.next_stage_name(&stage.name).map(String::from))
}

fn instance_key(pipeline: &str, counter: u32) -> String {
    format!("{}/{}", pipeline, counter)
}

fn stage_key(stage: &Stage) -> String {
    format!("{}/{}/{}", stage.pipeline_name, stage.pipeline_counter, stage.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instantiator::PipelineInstantiator;
    use crate::queue::ScheduleQueue;
    use gantry_core::build_cause::BuildCause;
    use gantry_core::config::{ConfigDocument, StageConfig};
    use gantry_core::events::Event;
    use gantry_core::instance::{StageResult, StageStatus};
    use gantry_core::material::{Material, MaterialRevision, MaterialRevisions, Modification};
    use gantry_memory::{
        InMemoryConfigStore, InMemoryEventBus, InMemoryHealthRegistry, InMemoryPipelineRepository,
    };

    struct Harness {
        configs: Arc<InMemoryConfigStore>,
        repo: Arc<InMemoryPipelineRepository>,
        bus: Arc<InMemoryEventBus>,
        health: Arc<InMemoryHealthRegistry>,
        instantiator: PipelineInstantiator,
        queue: Arc<ScheduleQueue>,
        stages: StageScheduler,
    }

    fn git() -> Material {
        Material::scm("https://git/g1").named("g1")
    }

    fn pipeline(lock: LockBehavior) -> PipelineConfig {
        PipelineConfig::new("p")
            .with_material(git())
            .with_lock(lock)
            .with_stage(StageConfig::new("build", &["compile"]))
            .with_stage(StageConfig::new("ft", &["foo", "foo2", "foo3"]))
            .with_stage(StageConfig::new("deploy", &["ship"]).manual())
    }

    fn harness(config: PipelineConfig) -> Harness {
        let configs = Arc::new(
            InMemoryConfigStore::new(ConfigDocument {
                pipelines: vec![config],
            })
            .unwrap(),
        );
        let repo = Arc::new(InMemoryPipelineRepository::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let health = Arc::new(InMemoryHealthRegistry::new());
        let queue = Arc::new(ScheduleQueue::new(repo.clone()));
        let instantiator = PipelineInstantiator::new(queue.clone(), repo.clone(), bus.clone());
        let stages =
            StageScheduler::new(configs.clone(), repo.clone(), bus.clone(), health.clone());
        Harness {
            configs,
            repo,
            bus,
            health,
            instantiator,
            queue,
            stages,
        }
    }

    impl Harness {
        async fn start(&self) -> Pipeline {
            let snapshot = self.configs.current().await.unwrap();
            let config = snapshot.pipeline("p").unwrap();
            let cause = BuildCause::from_changes(MaterialRevisions::new(vec![
                MaterialRevision::new(git(), vec![Modification::new("g_1", Utc::now())]),
            ]));
            self.queue.schedule("p", cause.clone()).await;
            self.instantiator
                .create_pipeline(&cause, config, snapshot.version())
                .await
                .unwrap()
                .into_scheduled()
                .unwrap()
        }

        async fn latest(&self, counter: u32, stage: &str) -> Stage {
            self.repo
                .pipeline_by_counter("p", counter)
                .await
                .unwrap()
                .unwrap()
                .stage(stage)
                .unwrap()
                .clone()
        }

        /// Complete every job of the latest run of `stage` with the given results, in job order.
        async fn finish(&self, counter: u32, stage: &str, results: &[JobResult]) -> Option<Stage> {
            let run = self.latest(counter, stage).await;
            let mut completed = None;
            for (job, result) in run.current_jobs().zip(results) {
                if let Some(stage) = self.stages.job_completing(job.id, *result).await.unwrap() {
                    completed = Some(stage);
                }
            }
            completed
        }
    }

    #[tokio::test]
    async fn test_passing_stage_triggers_next() {
        let h = harness(pipeline(LockBehavior::None));
        h.start().await;

        let completed = h.finish(1, "build", &[JobResult::Passed]).await.unwrap();
        assert_eq!(completed.result, StageResult::Passed);

        let ft = h.latest(1, "ft").await;
        assert_eq!(ft.status, StageStatus::Scheduled);
        assert_eq!(ft.order_id, 2);
        assert_eq!(ft.approved_by, "changes");
    }

    #[tokio::test]
    async fn test_manual_stage_waits_for_approval() {
        let h = harness(pipeline(LockBehavior::None));
        h.start().await;
        h.finish(1, "build", &[JobResult::Passed]).await;
        h.finish(1, "ft", &[JobResult::Passed; 3]).await;

        let instance = h.repo.pipeline_by_counter("p", 1).await.unwrap().unwrap();
        assert!(instance.stage("deploy").is_none());

        let approved = h.stages.approve_stage("p", 1, "deploy", "alice").await.unwrap();
        let deploy = approved.into_scheduled().unwrap();
        assert_eq!(deploy.approved_by, "alice");
        assert_eq!(deploy.order_id, 3);
    }

    #[tokio::test]
    async fn test_rerun_rejected_while_stage_active() {
        let h = harness(pipeline(LockBehavior::None));
        h.start().await;

        let outcome = h.stages.rerun_stage("p", 1, "build", "alice").await.unwrap();
        assert_eq!(
            outcome.rejection(),
            Some(&RejectReason::StageActive {
                pipeline: "p/1".into(),
                stage: "build".into(),
                active_stage: "build".into(),
            })
        );
    }

    #[tokio::test]
    async fn test_rerun_names_previous_stage() {
        let h = harness(pipeline(LockBehavior::None));
        h.start().await;
        h.finish(1, "build", &[JobResult::Failed]).await;

        let outcome = h.stages.approve_stage("p", 1, "ft", "alice").await.unwrap();
        assert_eq!(
            outcome.rejection().unwrap().to_string(),
            "Cannot schedule ft as the previous stage build has failed!"
        );
        let outcome = h.stages.approve_stage("p", 1, "deploy", "alice").await.unwrap();
        assert_eq!(
            outcome.rejection().unwrap().to_string(),
            "Cannot schedule deploy as the previous stage ft has not run!"
        );
    }

    #[tokio::test]
    async fn test_rerun_selected_jobs_copies_the_rest() {
        let h = harness(pipeline(LockBehavior::None));
        h.start().await;
        h.finish(1, "build", &[JobResult::Passed]).await;
        h.finish(1, "ft", &[JobResult::Passed; 3]).await;
        let before = h.latest(1, "ft").await;

        let selected = vec!["foo".to_string(), "foo3".to_string()];
        let rerun = h
            .stages
            .rerun_jobs("p", 1, "ft", &selected, "alice")
            .await
            .unwrap()
            .into_scheduled()
            .unwrap();

        assert_eq!(rerun.counter, before.counter + 1);
        assert_eq!(rerun.rerun_of_counter, Some(before.counter));
        let foo2 = rerun.job("foo2").unwrap();
        assert!(foo2.is_copy && !foo2.is_rerun);
        assert_eq!(foo2.result, JobResult::Passed);
        assert_eq!(foo2.original_job_id, Some(before.job("foo2").unwrap().id));
        for name in ["foo", "foo3"] {
            let job = rerun.job(name).unwrap();
            assert!(job.is_rerun && !job.is_copy);
            assert_eq!(job.state, JobState::Scheduled);
            assert_eq!(job.original_job_id, None);
        }
    }

    #[tokio::test]
    async fn test_rerun_jobs_rejects_unconfigured_job() {
        let h = harness(pipeline(LockBehavior::None));
        h.start().await;
        h.finish(1, "build", &[JobResult::Passed]).await;

        let outcome = h
            .stages
            .rerun_jobs("p", 1, "build", &["gone".to_string()], "alice")
            .await
            .unwrap();
        assert_eq!(
            outcome.rejection().unwrap().to_string(),
            "Cannot rerun job 'gone' of stage 'build'. Configuration for job doesn't exist."
        );
        let empty = h.stages.rerun_jobs("p", 1, "build", &[], "alice").await.unwrap();
        assert_eq!(empty.rejection(), Some(&RejectReason::NoJobSelected));
    }

    #[tokio::test]
    async fn test_rerun_failed_jobs() {
        let h = harness(pipeline(LockBehavior::None));
        h.start().await;
        h.finish(1, "build", &[JobResult::Passed]).await;

        let none = h.stages.rerun_failed_jobs("p", 1, "build", "alice").await.unwrap();
        assert!(matches!(none.rejection(), Some(RejectReason::NoFailedJobs { .. })));

        h.finish(1, "ft", &[JobResult::Passed, JobResult::Failed, JobResult::Passed])
            .await;
        let rerun = h
            .stages
            .rerun_failed_jobs("p", 1, "ft", "alice")
            .await
            .unwrap()
            .into_scheduled()
            .unwrap();
        assert!(rerun.job("foo2").unwrap().is_rerun);
        assert!(rerun.job("foo").unwrap().is_copy);
    }

    #[tokio::test]
    async fn test_late_report_for_completed_job_is_ignored() {
        let h = harness(pipeline(LockBehavior::None));
        h.start().await;
        let job = h.latest(1, "build").await.jobs[0].id;
        h.stages.job_completing(job, JobResult::Passed).await.unwrap();

        assert!(!h.stages.update_job_status(job, JobState::Building).await.unwrap());
        assert!(h.stages.job_completing(job, JobResult::Failed).await.unwrap().is_none());
        assert!(matches!(
            h.stages.update_job_status(job, JobState::Completed).await,
            Err(Error::InvalidJobTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_out_of_order_assignment_report_is_ignored() {
        let h = harness(pipeline(LockBehavior::None));
        h.start().await;
        let job = h.latest(1, "build").await.jobs[0].id;
        assert!(h.stages.update_job_status(job, JobState::Building).await.unwrap());
        let published = h.bus.published().await.len();

        assert!(!h.stages.update_job_status(job, JobState::Assigned).await.unwrap());
        assert_eq!(h.latest(1, "build").await.jobs[0].state, JobState::Building);
        assert_eq!(h.bus.published().await.len(), published);
    }

    #[tokio::test]
    async fn test_cancel_stage_publishes_after_commit() {
        let h = harness(pipeline(LockBehavior::None));
        h.start().await;
        let build = h.latest(1, "build").await;
        h.stages
            .update_job_status(build.jobs[0].id, JobState::Building)
            .await
            .unwrap();
        let published = h.bus.published().await.len();

        let cancelled = h.stages.cancel_stage(build.id).await.unwrap().unwrap();
        assert_eq!(cancelled.result, StageResult::Cancelled);
        assert!(cancelled.jobs.iter().all(JobInstance::is_cancelled));

        let events = h.bus.published().await;
        let new: Vec<String> = events[published..].iter().map(Event::subject).collect();
        assert_eq!(new, vec!["job.p.build.compile.result", "stage.p.build.status"]);
        assert!(h.stages.cancel_stage(build.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_cancel_leaves_no_trace() {
        let h = harness(pipeline(LockBehavior::None));
        h.start().await;
        let build = h.latest(1, "build").await;
        let published = h.bus.published().await.len();

        h.repo.fail_next_commit().await;
        assert!(h.stages.cancel_stage(build.id).await.is_err());

        assert_eq!(h.bus.published().await.len(), published);
        let stored = h.latest(1, "build").await;
        assert_eq!(stored.status, StageStatus::Scheduled);
        assert!(stored.jobs.iter().all(|j| j.state == JobState::Scheduled));
    }

    #[tokio::test]
    async fn test_lock_released_by_rules() {
        let h = harness(pipeline(LockBehavior::LockOnFailure));
        h.start().await;
        assert_eq!(h.repo.lock_owner("p").await.unwrap(), Some(1));

        h.finish(1, "build", &[JobResult::Failed]).await;
        assert_eq!(h.repo.lock_owner("p").await.unwrap(), Some(1));
        assert!(h.stages.unlock_pipeline("p").await.unwrap());
        assert!(!h.stages.unlock_pipeline("p").await.unwrap());

        let h = harness(pipeline(LockBehavior::UnlockWhenFinished));
        h.start().await;
        h.finish(1, "build", &[JobResult::Failed]).await;
        assert_eq!(h.repo.lock_owner("p").await.unwrap(), None);

        let h = harness(pipeline(LockBehavior::LockOnFailure));
        h.start().await;
        h.finish(1, "build", &[JobResult::Passed]).await;
        assert_eq!(h.repo.lock_owner("p").await.unwrap(), Some(1));
        h.finish(1, "ft", &[JobResult::Passed; 3]).await;
        // deploy needs approval
        assert_eq!(h.repo.lock_owner("p").await.unwrap(), None);
        assert!(
            h.bus
                .published()
                .await
                .iter()
                .any(|e| e.subject() == "pipeline.p.unlocked")
        );
    }

    #[tokio::test]
    async fn test_hung_job_rescheduled_but_cancelled_job_left_alone() {
        let h = harness(pipeline(LockBehavior::None));
        h.start().await;
        h.finish(1, "build", &[JobResult::Passed]).await;
        let ft = h.latest(1, "ft").await;
        for job in &ft.jobs {
            h.stages
                .update_job_status(job.id, JobState::Building)
                .await
                .unwrap();
        }
        h.stages.cancel_job(ft.jobs[1].id).await.unwrap();

        let later = Utc::now() + chrono::Duration::minutes(10);
        let rescheduled = h
            .stages
            .reschedule_hung_jobs(later, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(rescheduled, vec![ft.jobs[0].id, ft.jobs[2].id]);

        let stage = h.latest(1, "ft").await;
        assert_eq!(stage.jobs.len(), 5);
        assert_eq!(stage.job("foo").unwrap().state, JobState::Scheduled);
        assert!(stage.job("foo2").unwrap().is_cancelled());

        let again = h
            .stages
            .reschedule_hung_jobs(Utc::now(), Duration::from_secs(300))
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_assigned_job_is_not_hung() {
        let h = harness(pipeline(LockBehavior::None));
        h.start().await;
        let job = h.latest(1, "build").await.jobs[0].id;
        h.stages
            .update_job_status(job, JobState::Assigned)
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::minutes(10);
        let rescheduled = h
            .stages
            .reschedule_hung_jobs(later, Duration::from_secs(300))
            .await
            .unwrap();
        assert!(rescheduled.is_empty());
        assert_eq!(h.latest(1, "build").await.jobs[0].state, JobState::Assigned);
    }

    #[tokio::test]
    async fn test_job_with_removed_material_fails() {
        let h = harness(pipeline(LockBehavior::None));
        h.start().await;
        let job = h.latest(1, "build").await.jobs[0].id;
        assert!(h.stages.verify_job_materials(job).await.unwrap());

        h.configs
            .update(&|doc: &mut ConfigDocument| {
                let p = doc.pipeline_mut("p").expect("configured");
                p.materials = vec![Material::scm("https://git/other")];
                Ok(())
            })
            .await
            .unwrap();

        assert!(!h.stages.verify_job_materials(job).await.unwrap());
        let stage = h.latest(1, "build").await;
        assert_eq!(stage.result, StageResult::Failed);
        let states = h.health.states().await;
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].scope, HealthScope::job("p", "build", "compile"));
    }
}
