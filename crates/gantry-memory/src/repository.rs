//! In-memory implementation of PipelineRepository.

use async_trait::async_trait;
use gantry_core::ids::{JobId, PipelineId, StageId, StageLocator};
use gantry_core::instance::{JobInstance, Pipeline, Stage};
use gantry_core::ports::{PipelineRepository, Write};
use gantry_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
struct Tables {
    /// Instances without their stages.
    pipelines: HashMap<PipelineId, Pipeline>,
    by_name: HashMap<String, BTreeMap<u32, PipelineId>>,
    stages: HashMap<StageId, Stage>,
    /// Stage runs per instance, in insertion order.
    stage_ids: HashMap<PipelineId, Vec<StageId>>,
    job_index: HashMap<JobId, StageId>,
    locks: HashMap<String, u32>,
}

impl Tables {
    fn apply(&mut self, write: Write) -> Result<()> {
        match write {
            Write::SavePipeline(mut pipeline) => {
                let current = self
                    .by_name
                    .get(&pipeline.name)
                    .and_then(|counters| counters.keys().next_back().copied());
                if let Some(current) = current
                    && pipeline.counter <= current
                {
                    return Err(Error::CounterRegression {
                        pipeline: pipeline.name.clone(),
                        counter: pipeline.counter,
                        current,
                    });
                }
                let stages = std::mem::take(&mut pipeline.stages);
                self.by_name
                    .entry(pipeline.name.clone())
                    .or_default()
                    .insert(pipeline.counter, pipeline.id);
                self.stage_ids.entry(pipeline.id).or_default();
                self.pipelines.insert(pipeline.id, pipeline);
                for stage in stages {
                    self.save_stage(stage)?;
                }
                Ok(())
            }
            Write::SaveStage(stage) => self.save_stage(stage),
            Write::SaveJob { stage_id, job } => self.save_job(stage_id, job),
            Write::LockPipeline { pipeline, counter } => {
                match self.locks.get(&pipeline) {
                    Some(&owner) if owner != counter => {
                        Err(Error::PipelineLocked { pipeline, owner })
                    }
                    _ => {
                        self.locks.insert(pipeline, counter);
                        Ok(())
                    }
                }
            }
            Write::UnlockPipeline { pipeline } => {
                self.locks.remove(&pipeline);
                Ok(())
            }
        }
    }

    fn save_stage(&mut self, stage: Stage) -> Result<()> {
        if !self.pipelines.contains_key(&stage.pipeline_id) {
            return Err(Error::PipelineInstanceNotFound {
                pipeline: stage.pipeline_name.clone(),
                counter: stage.pipeline_counter,
            });
        }
        for job in &stage.jobs {
            self.job_index.insert(job.id, stage.id);
        }
        if !self.stages.contains_key(&stage.id) {
            self.stage_ids
                .entry(stage.pipeline_id)
                .or_default()
                .push(stage.id);
        }
        self.stages.insert(stage.id, stage);
        Ok(())
    }

    fn save_job(&mut self, stage_id: StageId, job: JobInstance) -> Result<()> {
        let stage = self
            .stages
            .get_mut(&stage_id)
            .ok_or_else(|| Error::StageRunNotFound(stage_id.to_string()))?;
        self.job_index.insert(job.id, stage_id);
        match stage.job_by_id_mut(job.id) {
            Some(existing) => *existing = job,
            None => stage.jobs.push(job),
        }
        Ok(())
    }

    fn assemble(&self, id: PipelineId) -> Option<Pipeline> {
        let mut pipeline = self.pipelines.get(&id)?.clone();
        pipeline.stages = self
            .stage_ids
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|stage_id| self.stages.get(stage_id).cloned())
            .collect();
        Some(pipeline)
    }

    fn stages_of<'a>(
        &'a self,
        pipeline: &'a str,
        stage: &'a str,
    ) -> impl Iterator<Item = &'a Stage> {
        self.stages
            .values()
            .filter(move |s| s.pipeline_name == pipeline && s.name == stage)
    }
}

/// Pipeline persistence held in memory.
///
/// Every commit is applied to a copy of the tables and swapped in only if all
/// writes succeeded, so a failed commit leaves no partial state behind.
#[derive(Default)]
pub struct InMemoryPipelineRepository {
    tables: RwLock<Tables>,
    counters: Mutex<HashMap<String, u32>>,
    /// Successful commits left before an injected failure.
    fail_countdown: Mutex<Option<usize>>,
}

impl InMemoryPipelineRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail without applying anything.
    pub async fn fail_next_commit(&self) {
        self.fail_commit_after(0).await;
    }

    /// Let `successes` commits through, then fail the one after.
    pub async fn fail_commit_after(&self, successes: usize) {
        *self.fail_countdown.lock().await = Some(successes);
    }

    /// Number of stored pipeline instances.
    pub async fn pipeline_count(&self) -> usize {
        self.tables.read().await.pipelines.len()
    }
}

#[async_trait]
impl PipelineRepository for InMemoryPipelineRepository {
    async fn next_counter(&self, pipeline: &str) -> Result<u32> {
        let mut counters = self.counters.lock().await;
        let counter = counters.entry(pipeline.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<()> {
        {
            let mut countdown = self.fail_countdown.lock().await;
            match countdown.as_mut() {
                Some(0) => {
                    *countdown = None;
                    warn!(writes = writes.len(), "Injected commit failure");
                    return Err(Error::Persistence("injected commit failure".to_string()));
                }
                Some(left) => *left -= 1,
                None => {}
            }
        }

        let mut tables = self.tables.write().await;
        let mut staged = tables.clone();
        let count = writes.len();
        for write in writes {
            staged.apply(write)?;
        }
        *tables = staged;
        debug!(writes = count, "Committed");
        Ok(())
    }

    async fn pipeline_by_id(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        Ok(self.tables.read().await.assemble(id))
    }

    async fn pipeline_by_counter(&self, pipeline: &str, counter: u32) -> Result<Option<Pipeline>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_name
            .get(pipeline)
            .and_then(|counters| counters.get(&counter))
            .and_then(|id| tables.assemble(*id)))
    }

    async fn latest_pipeline(&self, pipeline: &str) -> Result<Option<Pipeline>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_name
            .get(pipeline)
            .and_then(|counters| counters.values().next_back())
            .and_then(|id| tables.assemble(*id)))
    }

    async fn pipelines_after(&self, pipeline: &str, counter: u32) -> Result<Vec<Pipeline>> {
        let tables = self.tables.read().await;
        let Some(counters) = tables.by_name.get(pipeline) else {
            return Ok(Vec::new());
        };
        Ok(counters
            .range(counter.saturating_add(1)..)
            .filter_map(|(_, id)| tables.assemble(*id))
            .collect())
    }

    async fn stage_by_id(&self, id: StageId) -> Result<Option<Stage>> {
        Ok(self.tables.read().await.stages.get(&id).cloned())
    }

    async fn stage_by_locator(&self, locator: &StageLocator) -> Result<Option<Stage>> {
        let tables = self.tables.read().await;
        Ok(tables
            .stages_of(&locator.pipeline_name, &locator.stage_name)
            .find(|s| {
                s.pipeline_counter == locator.pipeline_counter && s.counter == locator.stage_counter
            })
            .cloned())
    }

    async fn stage_for_job(&self, job: JobId) -> Result<Option<Stage>> {
        let tables = self.tables.read().await;
        Ok(tables
            .job_index
            .get(&job)
            .and_then(|stage_id| tables.stages.get(stage_id))
            .cloned())
    }

    async fn most_recent_stage(&self, pipeline: &str, stage: &str) -> Result<Option<Stage>> {
        let tables = self.tables.read().await;
        Ok(tables
            .stages_of(pipeline, stage)
            .max_by_key(|s| (s.pipeline_counter, s.counter))
            .cloned())
    }

    async fn passed_stages(&self, pipeline: &str, stage: &str, limit: usize) -> Result<Vec<Stage>> {
        let tables = self.tables.read().await;
        let mut passed: Vec<Stage> = tables
            .stages_of(pipeline, stage)
            .filter(|s| s.passed())
            .cloned()
            .collect();
        passed.sort_by(|a, b| {
            (b.completed_at, b.pipeline_counter, b.counter).cmp(&(
                a.completed_at,
                a.pipeline_counter,
                a.counter,
            ))
        });
        passed.truncate(limit);
        Ok(passed)
    }

    async fn active_stages(&self) -> Result<Vec<Stage>> {
        let tables = self.tables.read().await;
        let mut active: Vec<Stage> = tables
            .stages
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            (&a.pipeline_name, a.pipeline_counter, a.order_id, a.counter).cmp(&(
                &b.pipeline_name,
                b.pipeline_counter,
                b.order_id,
                b.counter,
            ))
        });
        Ok(active)
    }

    async fn lock_owner(&self, pipeline: &str) -> Result<Option<u32>> {
        Ok(self.tables.read().await.locks.get(pipeline).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gantry_core::build_cause::BuildCause;
    use gantry_core::config::{ConfigDocument, ConfigSnapshot};
    use gantry_core::instance::{JobResult, StageResult, StageStatus};
    use gantry_core::material::MaterialRevisions;
    use gantry_core::ports::UnitOfWork;

    fn pipeline(name: &str, counter: u32) -> Pipeline {
        let version = ConfigSnapshot::new(ConfigDocument::default())
            .unwrap()
            .version()
            .clone();
        Pipeline {
            id: PipelineId::new(),
            name: name.to_string(),
            counter,
            label: counter.to_string(),
            build_cause: BuildCause::from_changes(MaterialRevisions::default()),
            stage_names: vec!["dev".into()],
            config_version: version,
            stages: Vec::new(),
            created_at: Utc::now(),
        }
    }

    fn stage(pipeline: &Pipeline) -> Stage {
        Stage {
            id: StageId::new(),
            pipeline_id: pipeline.id,
            pipeline_name: pipeline.name.clone(),
            pipeline_counter: pipeline.counter,
            name: "dev".into(),
            counter: 1,
            order_id: 1,
            status: StageStatus::Scheduled,
            result: StageResult::Unknown,
            approved_by: "changes".into(),
            rerun_of_counter: None,
            jobs: vec![JobInstance::scheduled("unit", Utc::now())],
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_counters_never_repeat() {
        let repo = InMemoryPipelineRepository::new();
        assert_eq!(repo.next_counter("p").await.unwrap(), 1);
        assert_eq!(repo.next_counter("p").await.unwrap(), 2);
        assert_eq!(repo.next_counter("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back_whole_commit() {
        let repo = InMemoryPipelineRepository::new();
        let first = pipeline("p", 2);
        let mut unit = UnitOfWork::new();
        unit.save_pipeline(first.clone());
        repo.commit(unit.into_parts().0).await.unwrap();

        let mut unit = UnitOfWork::new();
        unit.lock_pipeline("p", 2).save_pipeline(pipeline("p", 1));
        let err = repo.commit(unit.into_parts().0).await.unwrap_err();
        assert!(matches!(err, Error::CounterRegression { current: 2, .. }));
        assert_eq!(repo.lock_owner("p").await.unwrap(), None);
        assert_eq!(repo.pipeline_count().await, 1);
    }

    #[tokio::test]
    async fn test_injected_failure_applies_nothing() {
        let repo = InMemoryPipelineRepository::new();
        repo.fail_next_commit().await;
        let mut unit = UnitOfWork::new();
        unit.save_pipeline(pipeline("p", 1));
        assert!(repo.commit(unit.into_parts().0).await.is_err());
        assert!(repo.latest_pipeline("p").await.unwrap().is_none());

        let mut unit = UnitOfWork::new();
        unit.save_pipeline(pipeline("p", 1));
        repo.commit(unit.into_parts().0).await.unwrap();
        assert!(repo.latest_pipeline("p").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_conflicting_lock_applies_nothing() {
        let repo = InMemoryPipelineRepository::new();
        let mut unit = UnitOfWork::new();
        unit.save_pipeline(pipeline("p", 1)).lock_pipeline("p", 1);
        repo.commit(unit.into_parts().0).await.unwrap();

        let mut unit = UnitOfWork::new();
        unit.save_pipeline(pipeline("p", 2)).lock_pipeline("p", 2);
        let err = repo.commit(unit.into_parts().0).await.unwrap_err();
        assert!(matches!(err, Error::PipelineLocked { owner: 1, .. }));
        assert_eq!(repo.lock_owner("p").await.unwrap(), Some(1));
        assert_eq!(repo.pipeline_count().await, 1);

        // Re-locking by the owner is fine.
        let mut unit = UnitOfWork::new();
        unit.lock_pipeline("p", 1);
        repo.commit(unit.into_parts().0).await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_after_countdown() {
        let repo = InMemoryPipelineRepository::new();
        repo.fail_commit_after(1).await;
        let mut unit = UnitOfWork::new();
        unit.save_pipeline(pipeline("p", 1));
        repo.commit(unit.into_parts().0).await.unwrap();
        let mut unit = UnitOfWork::new();
        unit.save_pipeline(pipeline("p", 2));
        assert!(repo.commit(unit.into_parts().0).await.is_err());
        let mut unit = UnitOfWork::new();
        unit.save_pipeline(pipeline("p", 3));
        repo.commit(unit.into_parts().0).await.unwrap();
        assert_eq!(repo.pipeline_count().await, 2);
    }

    #[tokio::test]
    async fn test_stage_and_job_lookups() {
        let repo = InMemoryPipelineRepository::new();
        let mut instance = pipeline("p", 1);
        let mut run = stage(&instance);
        instance.stages.push(run.clone());
        let mut unit = UnitOfWork::new();
        unit.save_pipeline(instance.clone());
        repo.commit(unit.into_parts().0).await.unwrap();

        let job = run.jobs[0].id;
        assert_eq!(repo.stage_for_job(job).await.unwrap().unwrap().id, run.id);
        assert_eq!(repo.active_stages().await.unwrap().len(), 1);

        run.jobs[0].complete(JobResult::Passed, Utc::now());
        run.refresh_status(Utc::now());
        let mut unit = UnitOfWork::new();
        unit.save_stage(run.clone());
        repo.commit(unit.into_parts().0).await.unwrap();

        assert!(repo.active_stages().await.unwrap().is_empty());
        let passed = repo.passed_stages("p", "dev", 10).await.unwrap();
        assert_eq!(passed.len(), 1);
        let found = repo
            .stage_by_locator(&"p/1/dev/1".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, run.id);
        let stored = repo.pipeline_by_counter("p", 1).await.unwrap().unwrap();
        assert_eq!(stored.stages.len(), 1);
    }
}
