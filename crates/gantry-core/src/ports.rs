//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the scheduling engine and the
//! collaborators it does not own: persistence, configuration, material
//! polling, event delivery and health reporting.

use crate::config::{ConfigDocument, ConfigSnapshot, ConfigVersion};
use crate::events::Event;
use crate::health::{HealthScope, HealthState};
use crate::ids::*;
use crate::instance::{JobInstance, Pipeline, Stage};
use crate::material::{Material, Modification};
use crate::Result;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Event bus for publishing and subscribing to events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to events matching a pattern.
    /// Pattern supports wildcards: `stage.*.*.status`, `job.>`
    async fn subscribe(&self, pattern: &str) -> Result<EventStream>;
}

/// One write applied as part of a [`UnitOfWork`].
#[derive(Debug, Clone)]
pub enum Write {
    /// Insert a pipeline instance together with its initial stages.
    SavePipeline(Pipeline),
    /// Insert or replace a stage run, jobs included.
    SaveStage(Stage),
    /// Insert or replace one job of an existing stage run.
    SaveJob { stage_id: StageId, job: JobInstance },
    LockPipeline { pipeline: String, counter: u32 },
    UnlockPipeline { pipeline: String },
}

/// Writes that commit together, plus the events to publish once they have.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    writes: Vec<Write>,
    after_commit: Vec<Event>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_pipeline(&mut self, pipeline: Pipeline) -> &mut Self {
        self.writes.push(Write::SavePipeline(pipeline));
        self
    }

    pub fn save_stage(&mut self, stage: Stage) -> &mut Self {
        self.writes.push(Write::SaveStage(stage));
        self
    }

    pub fn save_job(&mut self, stage_id: StageId, job: JobInstance) -> &mut Self {
        self.writes.push(Write::SaveJob { stage_id, job });
        self
    }

    pub fn lock_pipeline(&mut self, pipeline: impl Into<String>, counter: u32) -> &mut Self {
        self.writes.push(Write::LockPipeline {
            pipeline: pipeline.into(),
            counter,
        });
        self
    }

    pub fn unlock_pipeline(&mut self, pipeline: impl Into<String>) -> &mut Self {
        self.writes.push(Write::UnlockPipeline {
            pipeline: pipeline.into(),
        });
        self
    }

    /// Queue an event; it is published only if the writes commit.
    pub fn after_commit(&mut self, event: Event) -> &mut Self {
        self.after_commit.push(event);
        self
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    pub fn events(&self) -> &[Event] {
        &self.after_commit
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn into_parts(self) -> (Vec<Write>, Vec<Event>) {
        (self.writes, self.after_commit)
    }
}

/// Durable storage of pipeline, stage and job instances.
#[async_trait]
pub trait PipelineRepository: Send + Sync {
    /// Allocate the next counter for a pipeline name. Never hands out the same value twice.
    async fn next_counter(&self, pipeline: &str) -> Result<u32>;

    /// Apply all writes atomically. On error none of them took effect.
    async fn commit(&self, writes: Vec<Write>) -> Result<()>;

    async fn pipeline_by_id(&self, id: PipelineId) -> Result<Option<Pipeline>>;

    async fn pipeline_by_counter(&self, pipeline: &str, counter: u32) -> Result<Option<Pipeline>>;

    /// Instance with the highest counter.
    async fn latest_pipeline(&self, pipeline: &str) -> Result<Option<Pipeline>>;

    /// Instances with a counter above `counter`, oldest first.
    async fn pipelines_after(&self, pipeline: &str, counter: u32) -> Result<Vec<Pipeline>>;

    async fn stage_by_id(&self, id: StageId) -> Result<Option<Stage>>;

    async fn stage_by_locator(&self, locator: &StageLocator) -> Result<Option<Stage>>;

    /// The stage run that owns a job.
    async fn stage_for_job(&self, job: JobId) -> Result<Option<Stage>>;

    /// Latest run of a stage across all instances of the pipeline.
    async fn most_recent_stage(&self, pipeline: &str, stage: &str) -> Result<Option<Stage>>;

    /// Passed runs of a stage, most recently completed first.
    async fn passed_stages(&self, pipeline: &str, stage: &str, limit: usize) -> Result<Vec<Stage>>;

    /// Every stage run that has not completed.
    async fn active_stages(&self) -> Result<Vec<Stage>>;

    /// Counter of the instance holding the pipeline lock.
    async fn lock_owner(&self, pipeline: &str) -> Result<Option<u32>>;
}

/// Holder of the current configuration snapshot.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn current(&self) -> Result<ConfigSnapshot>;

    /// Apply a pure update to the latest document, retrying on concurrent changes.
    async fn update(
        &self,
        update: &(dyn for<'d> Fn(&'d mut ConfigDocument) -> Result<()> + Send + Sync),
    ) -> Result<ConfigSnapshot>;

    /// Replace the document if it is still at `expected`; otherwise `Error::ConfigConflict`.
    async fn replace(
        &self,
        expected: &ConfigVersion,
        document: ConfigDocument,
    ) -> Result<ConfigSnapshot>;
}

/// Results of polling a material, already deduplicated per revision.
#[async_trait]
pub trait MaterialSource: Send + Sync {
    /// Known modifications, newest last.
    async fn latest_modifications(&self, material: &Material) -> Result<Vec<Modification>>;
}

/// Receiver of scoped health states.
#[async_trait]
pub trait HealthSink: Send + Sync {
    async fn update(&self, state: HealthState) -> Result<()>;

    async fn remove_by_scope(&self, scope: &HealthScope) -> Result<()>;
}
