//! Test context wiring the scheduling service to in-memory adapters.

use anyhow::anyhow;
use gantry_core::config::ConfigDocument;
use gantry_core::instance::{JobResult, Pipeline, Stage};
use gantry_core::material::{Material, Modification};
use gantry_core::ports::{ConfigStore, PipelineRepository};
use gantry_memory::{
    InMemoryConfigStore, InMemoryEventBus, InMemoryHealthRegistry, InMemoryPipelineRepository,
    StaticMaterialSource,
};
use gantry_scheduler::{SchedulerSettings, SchedulingService};
use std::sync::Arc;

/// A scheduling service plus handles on every adapter behind it.
pub struct TestContext {
    pub configs: Arc<InMemoryConfigStore>,
    pub repo: Arc<InMemoryPipelineRepository>,
    pub events: Arc<InMemoryEventBus>,
    pub health: Arc<InMemoryHealthRegistry>,
    pub source: Arc<StaticMaterialSource>,
    pub service: Arc<SchedulingService>,
}

impl TestContext {
    pub fn new(document: ConfigDocument) -> anyhow::Result<Self> {
        Self::with_settings(document, SchedulerSettings::default())
    }

    pub fn with_settings(
        document: ConfigDocument,
        settings: SchedulerSettings,
    ) -> anyhow::Result<Self> {
        crate::init_test_logging();

        let configs = Arc::new(InMemoryConfigStore::new(document)?);
        let repo = Arc::new(InMemoryPipelineRepository::new());
        let events = Arc::new(InMemoryEventBus::new());
        let health = Arc::new(InMemoryHealthRegistry::new());
        let source = Arc::new(StaticMaterialSource::new());
        let service = Arc::new(SchedulingService::new(
            settings,
            configs.clone(),
            repo.clone(),
            source.clone(),
            events.clone(),
            health.clone(),
        ));

        Ok(Self {
            configs,
            repo,
            events,
            health,
            source,
            service,
        })
    }

    /// Check in a revision and make the engine see it.
    pub async fn checkin(
        &self,
        material: &Material,
        revision: &str,
    ) -> anyhow::Result<Modification> {
        let modification = self.source.checkin(material, revision).await;
        self.service.revisions().refresh(material).await?;
        Ok(modification)
    }

    /// Auto-schedule `pipeline` and create the instance if a cause was produced.
    pub async fn schedule(&self, pipeline: &str) -> anyhow::Result<Option<Pipeline>> {
        if !self.service.auto_schedule(pipeline).await?.is_scheduled() {
            return Ok(None);
        }
        self.create_pending(pipeline).await
    }

    /// Instantiate every pending cause and return the instance created for `pipeline`.
    pub async fn create_pending(&self, pipeline: &str) -> anyhow::Result<Option<Pipeline>> {
        let created = self.service.schedule_pending().await?;
        Ok(created.into_iter().find(|p| p.name == pipeline))
    }

    pub async fn instance(&self, pipeline: &str, counter: u32) -> anyhow::Result<Pipeline> {
        self.repo
            .pipeline_by_counter(pipeline, counter)
            .await?
            .ok_or_else(|| anyhow!("no instance {}/{}", pipeline, counter))
    }

    /// Latest run of `stage` in `pipeline/counter`.
    pub async fn stage(&self, pipeline: &str, counter: u32, stage: &str) -> anyhow::Result<Stage> {
        self.instance(pipeline, counter)
            .await?
            .stage(stage)
            .cloned()
            .ok_or_else(|| anyhow!("{}/{} has not run {}", pipeline, counter, stage))
    }

    /// Complete the current jobs of a stage with `results`, in job order.
    ///
    /// Returns the stage if the last report completed it.
    pub async fn finish_stage(
        &self,
        pipeline: &str,
        counter: u32,
        stage: &str,
        results: &[JobResult],
    ) -> anyhow::Result<Option<Stage>> {
        let run = self.stage(pipeline, counter, stage).await?;
        let jobs: Vec<_> = run.current_jobs().map(|j| j.id).collect();
        if jobs.len() != results.len() {
            return Err(anyhow!(
                "{} has {} jobs, got {} results",
                run.locator(),
                jobs.len(),
                results.len()
            ));
        }
        let mut completed = None;
        for (job, result) in jobs.into_iter().zip(results) {
            if let Some(stage) = self.service.job_completing(job, *result).await? {
                completed = Some(stage);
            }
        }
        Ok(completed)
    }

    /// Pass every current job of a stage.
    pub async fn pass_stage(
        &self,
        pipeline: &str,
        counter: u32,
        stage: &str,
    ) -> anyhow::Result<Stage> {
        let run = self.stage(pipeline, counter, stage).await?;
        let results = vec![JobResult::Passed; run.current_jobs().count()];
        self.finish_stage(pipeline, counter, stage, &results)
            .await?
            .ok_or_else(|| anyhow!("{} did not complete", run.locator()))
    }

    pub async fn update_config(
        &self,
        update: impl Fn(&mut ConfigDocument) + Send + Sync,
    ) -> anyhow::Result<()> {
        self.configs
            .update(&|doc: &mut ConfigDocument| {
                update(doc);
                Ok(())
            })
            .await?;
        Ok(())
    }
}
