//! Turns a pending build cause into a persisted pipeline instance.

use crate::locks::KeyedLocks;
use crate::queue::ScheduleQueue;
use crate::status;
use crate::transaction;
use chrono::Utc;
use gantry_core::build_cause::BuildCause;
use gantry_core::config::{ConfigVersion, PipelineConfig};
use gantry_core::events::{Event, PipelineScheduledPayload};
use gantry_core::ids::PipelineId;
use gantry_core::instance::Pipeline;
use gantry_core::label;
use gantry_core::outcome::{RejectReason, ScheduleOutcome, SkipReason};
use gantry_core::ports::{EventBus, PipelineRepository, UnitOfWork};
use gantry_core::{Error, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct PipelineInstantiator {
    queue: Arc<ScheduleQueue>,
    pipelines: Arc<dyn PipelineRepository>,
    events: Arc<dyn EventBus>,
    /// One instantiation per pipeline at a time.
    creating: KeyedLocks<String>,
}

impl PipelineInstantiator {
    pub fn new(
        queue: Arc<ScheduleQueue>,
        pipelines: Arc<dyn PipelineRepository>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            queue,
            pipelines,
            events,
            creating: KeyedLocks::new(),
        }
    }

    /// Create the instance for `cause` with its first stage scheduled.
    ///
    /// `config` must be the snapshot the cause was resolved against.
    pub async fn create_pipeline(
        &self,
        cause: &BuildCause,
        config: &PipelineConfig,
        config_version: &ConfigVersion,
    ) -> Result<ScheduleOutcome<Pipeline>> {
        let name = config.name.as_str();
        let _guard = self.creating.lock(name.to_string()).await;

        if !self.queue.is_pending(name, cause.id()).await {
            return Ok(ScheduleOutcome::Skipped(SkipReason::Trumped));
        }

        if !cause.materials_match(&config.materials) {
            warn!(
                pipeline = name,
                cause = %cause,
                "Materials changed since the build cause was resolved, dropping it"
            );
            self.queue.clear_pipeline(name).await;
            return Ok(ScheduleOutcome::Skipped(SkipReason::MaterialsChanged));
        }

        if config.is_locked()
            && let Some(owner) = self.pipelines.lock_owner(name).await?
        {
            self.queue.clear_pipeline(name).await;
            return Ok(ScheduleOutcome::Rejected(RejectReason::PipelineLocked {
                pipeline: name.to_string(),
                locked_by: format!("{}/{}", name, owner),
            }));
        }

        let first = config
            .first_stage()
            .ok_or_else(|| Error::InvalidConfig(format!("pipeline {} has no stages", name)))?;

        let counter = match self.pipelines.next_counter(name).await {
            Ok(counter) => counter,
            Err(e) => {
                self.queue.clear_pipeline(name).await;
                return Err(e);
            }
        };
        let now = Utc::now();
        let mut pipeline = Pipeline {
            id: PipelineId::new(),
            name: name.to_string(),
            counter,
            label: label::render(&config.label_template, counter, cause.revisions()),
            build_cause: cause.clone(),
            stage_names: config.stage_names(),
            config_version: config_version.clone(),
            stages: Vec::new(),
            created_at: now,
        };
        let stage = status::new_stage(&pipeline, first, 1, 1, cause.approver(), now);

        let mut unit = UnitOfWork::new();
        unit.after_commit(Event::PipelineScheduled(PipelineScheduledPayload {
            pipeline_id: pipeline.id,
            pipeline_name: pipeline.name.clone(),
            counter,
            label: pipeline.label.clone(),
            trigger: cause.trigger(),
            approved_by: cause.approver().to_string(),
            scheduled_at: now,
        }))
        .after_commit(status::stage_changed(&stage, now));
        pipeline.stages.push(stage);
        unit.save_pipeline(pipeline.clone());
        if config.is_locked() {
            unit.lock_pipeline(name, counter);
        }

        let committed =
            transaction::commit(self.pipelines.as_ref(), self.events.as_ref(), unit).await;
        if let Err(Error::PipelineLocked { owner, .. }) = committed {
            warn!(pipeline = name, counter, owner, "Lock taken before instance was created");
            self.queue.clear_pipeline(name).await;
            return Ok(ScheduleOutcome::Rejected(RejectReason::PipelineLocked {
                pipeline: name.to_string(),
                locked_by: format!("{}/{}", name, owner),
            }));
        }
        if let Err(e) = committed {
            error!(pipeline = name, counter, error = %e, "Failed to create pipeline instance");
            self.queue.clear_pipeline(name).await;
            return Err(e);
        }

        info!(
            pipeline = name,
            counter,
            label = %pipeline.label,
            trigger = %cause.trigger(),
            "Pipeline scheduled"
        );
        self.queue
            .finish_schedule(name, cause, pipeline.build_cause.clone())
            .await;
        Ok(ScheduleOutcome::Scheduled(pipeline))
    }
}
