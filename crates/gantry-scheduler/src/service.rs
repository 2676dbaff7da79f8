//! Top-level scheduling service.
//!
//! Owns one instance of every engine component and drives them from a
//! periodic tick: poll materials, resolve build causes, fire timers,
//! instantiate pending causes and sweep hung jobs.

use crate::fanin::DependencyResolver;
use crate::instantiator::PipelineInstantiator;
use crate::queue::ScheduleQueue;
use crate::resolver::BuildCauseResolver;
use crate::revisions::MaterialRevisionStore;
use crate::settings::SchedulerSettings;
use crate::stage::StageScheduler;
use crate::timer::TimerSchedule;
use chrono::{DateTime, Utc};
use gantry_core::build_cause::{BuildCause, ScheduleOptions};
use gantry_core::config::{ConfigSnapshot, PipelineConfig};
use gantry_core::ids::{BuildCauseId, JobId, StageId};
use gantry_core::instance::{JobResult, JobState, Pipeline, Stage};
use gantry_core::material::Material;
use gantry_core::outcome::ScheduleOutcome;
use gantry_core::ports::{ConfigStore, EventBus, HealthSink, MaterialSource, PipelineRepository};
use gantry_core::{Error, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{RwLock, watch};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// What one scheduling tick did.
#[derive(Debug, Default, Serialize)]
pub struct TickReport {
    pub new_modifications: usize,
    pub build_causes: Vec<String>,
    pub pipelines: Vec<Pipeline>,
    pub rescheduled_jobs: Vec<JobId>,
}

/// The scheduling engine, wired to its collaborators.
pub struct SchedulingService {
    settings: SchedulerSettings,
    configs: Arc<dyn ConfigStore>,
    store: Arc<MaterialRevisionStore>,
    queue: Arc<ScheduleQueue>,
    resolver: BuildCauseResolver,
    instantiator: PipelineInstantiator,
    stages: StageScheduler,
    timers: TimerSchedule,
    /// Config each pending cause was resolved against.
    snapshots: RwLock<HashMap<BuildCauseId, ConfigSnapshot>>,
}

impl SchedulingService {
    pub fn new(
        settings: SchedulerSettings,
        configs: Arc<dyn ConfigStore>,
        pipelines: Arc<dyn PipelineRepository>,
        materials: Arc<dyn MaterialSource>,
        events: Arc<dyn EventBus>,
        health: Arc<dyn HealthSink>,
    ) -> Self {
        let store = Arc::new(MaterialRevisionStore::new(materials));
        let queue = Arc::new(ScheduleQueue::new(pipelines.clone()));
        let fanin = DependencyResolver::new(
            store.clone(),
            pipelines.clone(),
            settings.fanin_backtrack_limit,
        );
        let resolver = BuildCauseResolver::new(
            fanin,
            store.clone(),
            queue.clone(),
            pipelines.clone(),
            health.clone(),
        );
        let instantiator =
            PipelineInstantiator::new(queue.clone(), pipelines.clone(), events.clone());
        let stages = StageScheduler::new(configs.clone(), pipelines, events, health);

        Self {
            settings,
            configs,
            store,
            queue,
            resolver,
            instantiator,
            stages,
            timers: TimerSchedule::new(),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    pub fn queue(&self) -> &ScheduleQueue {
        &self.queue
    }

    pub fn stages(&self) -> &StageScheduler {
        &self.stages
    }

    pub fn revisions(&self) -> &MaterialRevisionStore {
        &self.store
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    pub async fn auto_schedule(&self, pipeline: &str) -> Result<ScheduleOutcome<BuildCause>> {
        let snapshot = self.configs.current().await?;
        let config = pipeline_config(&snapshot, pipeline)?;
        let outcome = self.resolver.auto(config).await?;
        self.remember(&outcome, &snapshot).await;
        Ok(outcome)
    }

    pub async fn manual_schedule(
        &self,
        pipeline: &str,
        approver: &str,
        options: &ScheduleOptions,
    ) -> Result<ScheduleOutcome<BuildCause>> {
        let snapshot = self.configs.current().await?;
        let config = pipeline_config(&snapshot, pipeline)?;
        for material in config.materials.iter().filter(|m| is_polled(m)) {
            self.store.refresh(material).await?;
        }
        let outcome = self.resolver.manual(config, approver, options).await?;
        self.remember(&outcome, &snapshot).await;
        Ok(outcome)
    }

    pub async fn timer_schedule(&self, pipeline: &str) -> Result<ScheduleOutcome<BuildCause>> {
        let snapshot = self.configs.current().await?;
        let config = pipeline_config(&snapshot, pipeline)?;
        let outcome = self.resolver.timer(config).await?;
        self.remember(&outcome, &snapshot).await;
        Ok(outcome)
    }

    async fn remember(&self, outcome: &ScheduleOutcome<BuildCause>, snapshot: &ConfigSnapshot) {
        if let Some(cause) = outcome.scheduled() {
            self.snapshots
                .write()
                .await
                .insert(cause.id(), snapshot.clone());
        }
    }

    // ------------------------------------------------------------------
    // Passes
    // ------------------------------------------------------------------

    /// Refresh every configured source material. Returns how many modifications were new.
    pub async fn poll_materials(&self) -> Result<usize> {
        let snapshot = self.configs.current().await?;
        let mut seen = HashSet::new();
        let mut added = 0;
        for material in snapshot.pipelines().iter().flat_map(|p| &p.materials) {
            if is_polled(material) && seen.insert(material.fingerprint()) {
                match self.store.refresh(material).await {
                    Ok(count) => added += count,
                    Err(e) => warn!(material = %material, error = %e, "Material poll failed"),
                }
            }
        }
        Ok(added)
    }

    /// Resolve build causes for every pipeline, upstream pipelines first.
    pub async fn auto_schedule_all(&self) -> Result<Vec<String>> {
        let snapshot = self.configs.current().await?;
        let mut scheduled = Vec::new();
        for name in snapshot.dependency_order() {
            match self.auto_schedule(name).await {
                Ok(outcome) if outcome.is_scheduled() => scheduled.push(name.to_string()),
                Ok(outcome) => {
                    if let Some(reason) = outcome.rejection() {
                        debug!(pipeline = name, reason = %reason, "Not scheduled");
                    }
                }
                Err(e) => error!(pipeline = name, error = %e, "Build cause resolution failed"),
            }
        }
        Ok(scheduled)
    }

    /// Resolve build causes for timer pipelines due at `now`.
    pub async fn fire_due_timers(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let snapshot = self.configs.current().await?;
        let mut scheduled = Vec::new();
        for name in self.timers.due_timers(&snapshot, now).await {
            info!(pipeline = %name, "Timer fired");
            match self.timer_schedule(&name).await {
                Ok(outcome) if outcome.is_scheduled() => scheduled.push(name),
                Ok(_) => {}
                Err(e) => error!(pipeline = %name, error = %e, "Timer scheduling failed"),
            }
        }
        Ok(scheduled)
    }

    /// Create instances for every pending build cause.
    pub async fn schedule_pending(&self) -> Result<Vec<Pipeline>> {
        let mut pending: Vec<(String, BuildCause)> =
            self.queue.to_be_scheduled().await.into_iter().collect();
        pending.sort_by(|a, b| a.0.cmp(&b.0));
        {
            let ids: HashSet<BuildCauseId> = pending.iter().map(|(_, c)| c.id()).collect();
            self.snapshots.write().await.retain(|id, _| ids.contains(id));
        }

        let mut created = Vec::new();
        for (name, cause) in pending {
            let remembered = self.snapshots.write().await.remove(&cause.id());
            let snapshot = match remembered {
                Some(snapshot) => snapshot,
                None => self.configs.current().await?,
            };
            let Some(config) = snapshot.pipeline(&name) else {
                warn!(
                    pipeline = %name,
                    "Pipeline removed from configuration, dropping build cause"
                );
                self.queue.clear_pipeline(&name).await;
                continue;
            };
            match self
                .instantiator
                .create_pipeline(&cause, config, snapshot.version())
                .await
            {
                Ok(ScheduleOutcome::Scheduled(pipeline)) => created.push(pipeline),
                Ok(ScheduleOutcome::Rejected(reason)) => {
                    warn!(pipeline = %name, reason = %reason, "Instance not created");
                }
                Ok(ScheduleOutcome::Skipped(reason)) => {
                    debug!(pipeline = %name, reason = %reason, "Instance not created");
                }
                Err(e) => error!(pipeline = %name, error = %e, "Instance creation failed"),
            }
        }
        Ok(created)
    }

    /// Reschedule jobs hung for longer than the configured threshold.
    pub async fn reschedule_hung_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        self.stages
            .reschedule_hung_jobs(now, self.settings.hung_job_threshold())
            .await
    }

    // ------------------------------------------------------------------
    // Job reports
    // ------------------------------------------------------------------

    pub async fn update_job_status(&self, job: JobId, state: JobState) -> Result<bool> {
        self.stages.update_job_status(job, state).await
    }

    /// Record a job result; a passing stage also triggers dependent pipelines.
    pub async fn job_completing(&self, job: JobId, result: JobResult) -> Result<Option<Stage>> {
        let completed = self.stages.job_completing(job, result).await?;
        if let Some(stage) = completed.as_ref().filter(|s| s.passed()) {
            self.trigger_dependents(stage).await?;
        }
        Ok(completed)
    }

    pub async fn cancel_stage(&self, stage: StageId) -> Result<Option<Stage>> {
        self.stages.cancel_stage(stage).await
    }

    async fn trigger_dependents(&self, stage: &Stage) -> Result<()> {
        let snapshot = self.configs.current().await?;
        let dependents: Vec<String> = snapshot
            .dependents(&stage.pipeline_name, &stage.name)
            .into_iter()
            .map(|p| p.name.clone())
            .collect();
        for name in dependents {
            match self.auto_schedule(&name).await {
                Ok(outcome) if outcome.is_scheduled() => {
                    info!(
                        pipeline = %name,
                        upstream = %stage.locator(),
                        "Triggered by upstream stage"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(pipeline = %name, error = %e, "Dependent scheduling failed"),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Loop
    // ------------------------------------------------------------------

    /// Run one full scheduling pass.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let new_modifications = self.poll_materials().await?;
        let mut build_causes = self.auto_schedule_all().await?;
        build_causes.extend(self.fire_due_timers(now).await?);
        let pipelines = self.schedule_pending().await?;
        let rescheduled_jobs = self.reschedule_hung_jobs(now).await?;
        Ok(TickReport {
            new_modifications,
            build_causes,
            pipelines,
            rescheduled_jobs,
        })
    }

    /// Tick until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.tick_interval());

        info!(
            interval_secs = self.settings.tick_interval_secs,
            "Starting scheduling service"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) => debug!(
                            modifications = report.new_modifications,
                            causes = report.build_causes.len(),
                            pipelines = report.pipelines.len(),
                            rescheduled = report.rescheduled_jobs.len(),
                            "Scheduling tick"
                        ),
                        Err(e) => error!(error = %e, "Scheduling tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduling service shutting down");
                        break;
                    }
                }
            }
        }
    }
}

fn pipeline_config<'a>(snapshot: &'a ConfigSnapshot, name: &str) -> Result<&'a PipelineConfig> {
    snapshot
        .pipeline(name)
        .ok_or_else(|| Error::PipelineNotFound(name.to_string()))
}

/// Dependency materials are fed by stage completions, not polling.
fn is_polled(material: &Material) -> bool {
    matches!(material, Material::Scm(_))
}
