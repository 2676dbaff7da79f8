//! Build-cause resolution: should a pipeline run, and with which revisions.

use crate::fanin::{DependencyResolver, FanInResult};
use crate::queue::ScheduleQueue;
use crate::revisions::MaterialRevisionStore;
use gantry_core::Result;
use gantry_core::build_cause::{
    BuildCause, CHANGES_APPROVER, ScheduleOptions, TIMER_APPROVER, TriggerKind,
};
use gantry_core::config::PipelineConfig;
use gantry_core::health::{HealthScope, HealthState};
use gantry_core::material::{MaterialKind, MaterialRevisions};
use gantry_core::outcome::{RejectReason, ScheduleOutcome, SkipReason};
use gantry_core::ports::{HealthSink, PipelineRepository};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Decides, per trigger opportunity, whether a pipeline gets a new [`BuildCause`].
pub struct BuildCauseResolver {
    fanin: DependencyResolver,
    store: Arc<MaterialRevisionStore>,
    queue: Arc<ScheduleQueue>,
    pipelines: Arc<dyn PipelineRepository>,
    health: Arc<dyn HealthSink>,
}

impl BuildCauseResolver {
    pub fn new(
        fanin: DependencyResolver,
        store: Arc<MaterialRevisionStore>,
        queue: Arc<ScheduleQueue>,
        pipelines: Arc<dyn PipelineRepository>,
        health: Arc<dyn HealthSink>,
    ) -> Self {
        Self {
            fanin,
            store,
            queue,
            pipelines,
            health,
        }
    }

    /// Poll-driven trigger: only schedules when a schedulable material changed.
    pub async fn auto(&self, config: &PipelineConfig) -> Result<ScheduleOutcome<BuildCause>> {
        self.resolve(
            config,
            TriggerKind::Modification,
            CHANGES_APPROVER,
            &ScheduleOptions::default(),
        )
        .await
    }

    /// User trigger: bypasses the change check, still subject to fan-in consistency.
    pub async fn manual(
        &self,
        config: &PipelineConfig,
        approver: &str,
        options: &ScheduleOptions,
    ) -> Result<ScheduleOutcome<BuildCause>> {
        self.resolve(config, TriggerKind::Manual, approver, options)
            .await
    }

    /// Timer trigger. Honors the timer's `run_only_on_new_materials` flag.
    pub async fn timer(&self, config: &PipelineConfig) -> Result<ScheduleOutcome<BuildCause>> {
        self.resolve(
            config,
            TriggerKind::Timer,
            TIMER_APPROVER,
            &ScheduleOptions::default(),
        )
        .await
    }

    async fn resolve(
        &self,
        config: &PipelineConfig,
        trigger: TriggerKind,
        approver: &str,
        options: &ScheduleOptions,
    ) -> Result<ScheduleOutcome<BuildCause>> {
        let name = config.name.as_str();

        if config.is_locked()
            && let Some(owner) = self.pipelines.lock_owner(name).await?
        {
            warn!(pipeline = name, locked_by = owner, "Pipeline is locked");
            return Ok(ScheduleOutcome::Rejected(RejectReason::PipelineLocked {
                pipeline: name.to_string(),
                locked_by: format!("{}/{}", name, owner),
            }));
        }

        if self.queue.has_build_cause(name).await {
            return Ok(already_pending(name, trigger));
        }

        let candidate = match self.fanin.resolve(config, &options.revisions).await? {
            FanInResult::Resolved(revisions) => revisions,
            FanInResult::Incompatible { reason } => {
                warn!(pipeline = name, reason = %reason, "could not find a compatible revision");
                self.health
                    .update(HealthState::info(
                        HealthScope::pipeline(name),
                        format!(
                            "Error while scheduling pipeline: {} as no compatible revisions were identified.",
                            name
                        ),
                        reason.clone(),
                    ))
                    .await?;
                return Ok(ScheduleOutcome::Skipped(
                    SkipReason::NoCompatibleRevisions { reason },
                ));
            }
            FanInResult::Missing { material } => {
                debug!(
                    pipeline = name,
                    material = %material,
                    "Material has no usable revision yet"
                );
                return Ok(ScheduleOutcome::Skipped(SkipReason::UpstreamNotBuilt {
                    material,
                }));
            }
        };
        self.health.remove_by_scope(&HealthScope::pipeline(name)).await?;

        let previous = self.queue.most_recent_scheduled(name).await?;
        let revisions = self
            .mark_changes(candidate, previous.as_ref().map(BuildCause::revisions))
            .await;
        let materials_changed = previous
            .as_ref()
            .is_some_and(|p| !p.materials_match(&config.materials));

        match trigger {
            TriggerKind::Manual => {}
            TriggerKind::Modification => {
                if previous.is_some() && !materials_changed && !revisions.has_schedulable_change() {
                    debug!(pipeline = name, "No schedulable material changed");
                    return Ok(ScheduleOutcome::Skipped(SkipReason::NoChanges));
                }
            }
            TriggerKind::Timer => {
                let only_on_new = config
                    .timer
                    .as_ref()
                    .is_some_and(|t| t.run_only_on_new_materials);
                if only_on_new
                    && previous
                        .as_ref()
                        .is_some_and(|p| p.revisions().same_revisions_as(&revisions))
                {
                    info!(
                        "Skipping scheduling of timer-triggered pipeline '{}' as it has previously run with the latest material(s).",
                        name
                    );
                    return Ok(ScheduleOutcome::Skipped(
                        SkipReason::AlreadyRanWithLatestMaterials,
                    ));
                }
            }
        }

        if materials_changed {
            info!(pipeline = name, "Material configuration changed since the last run");
        }

        let cause = BuildCause::new(revisions, trigger, approver)
            .with_variables(options.variables.clone());

        if !self.queue.schedule(name, cause.clone()).await {
            return Ok(already_pending(name, trigger));
        }
        Ok(ScheduleOutcome::Scheduled(cause))
    }

    /// Flag each revision that differs from the previous cause and expand source history.
    async fn mark_changes(
        &self,
        candidate: MaterialRevisions,
        previous: Option<&MaterialRevisions>,
    ) -> MaterialRevisions {
        let mut marked = Vec::with_capacity(candidate.len());
        for mut revision in candidate.into_inner() {
            let before = previous.and_then(|p| p.find(&revision.fingerprint()));
            match before {
                None => revision.changed = true,
                Some(before) if before.latest_revision() != revision.latest_revision() => {
                    revision.changed = true;
                    if revision.material.kind() == MaterialKind::Scm
                        && let Some(known) = before.latest_revision()
                        && let Some(latest) = revision.latest_revision()
                    {
                        let since = self.store.revisions_since(&revision.material, known).await;
                        // Keep the pinned revision as the newest entry.
                        if since.last().is_some_and(|m| m.revision == latest) {
                            revision.modifications = since;
                        }
                    }
                }
                Some(_) => revision.changed = false,
            }
            marked.push(revision);
        }
        MaterialRevisions::new(marked)
    }
}

fn already_pending(pipeline: &str, trigger: TriggerKind) -> ScheduleOutcome<BuildCause> {
    match trigger {
        TriggerKind::Manual => ScheduleOutcome::Rejected(RejectReason::AlreadyPending {
            pipeline: pipeline.to_string(),
        }),
        _ => ScheduleOutcome::Skipped(SkipReason::AlreadyPending),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::config::{LockBehavior, StageConfig, TimerSpec};
    use gantry_core::material::Material;
    use gantry_core::ports::PipelineRepository;
    use gantry_memory::{InMemoryHealthRegistry, InMemoryPipelineRepository, StaticMaterialSource};

    struct Harness {
        source: Arc<StaticMaterialSource>,
        store: Arc<MaterialRevisionStore>,
        queue: Arc<ScheduleQueue>,
        repo: Arc<InMemoryPipelineRepository>,
        health: Arc<InMemoryHealthRegistry>,
        resolver: BuildCauseResolver,
    }

    impl Harness {
        fn new() -> Self {
            let source = Arc::new(StaticMaterialSource::new());
            let repo = Arc::new(InMemoryPipelineRepository::new());
            let store = Arc::new(MaterialRevisionStore::new(source.clone()));
            let queue = Arc::new(ScheduleQueue::new(repo.clone()));
            let health = Arc::new(InMemoryHealthRegistry::new());
            let resolver = BuildCauseResolver::new(
                DependencyResolver::new(store.clone(), repo.clone(), 10),
                store.clone(),
                queue.clone(),
                repo.clone(),
                health.clone(),
            );
            Self {
                source,
                store,
                queue,
                repo,
                health,
                resolver,
            }
        }

        async fn checkin(&self, revision: &str) {
            self.source.checkin(&git(), revision).await;
            self.store.refresh(&git()).await.unwrap();
        }

        /// Pretend the pending cause became an instance.
        async fn consume(&self, name: &str) {
            let pending = self.queue.to_be_scheduled().await;
            let cause = pending[name].clone();
            self.queue.finish_schedule(name, &cause, cause.clone()).await;
        }
    }

    fn git() -> Material {
        Material::scm("https://git/g1").named("g1")
    }

    fn p1() -> PipelineConfig {
        PipelineConfig::new("p1")
            .with_material(git())
            .with_stage(StageConfig::new("build", &["compile"]))
    }

    fn revision_of(cause: &BuildCause) -> (String, bool) {
        let revision = cause.revisions().iter().next().unwrap();
        (
            revision.latest_revision().unwrap().to_string(),
            revision.changed,
        )
    }

    #[tokio::test]
    async fn test_auto_schedules_only_on_change() {
        let h = Harness::new();
        h.checkin("g_1").await;

        let first = h.resolver.auto(&p1()).await.unwrap();
        assert_eq!(revision_of(first.scheduled().unwrap()), ("g_1".into(), true));
        h.consume("p1").await;

        let again = h.resolver.auto(&p1()).await.unwrap();
        assert_eq!(again.skip_reason(), Some(&SkipReason::NoChanges));

        h.checkin("g_2").await;
        let second = h.resolver.auto(&p1()).await.unwrap();
        assert_eq!(revision_of(second.scheduled().unwrap()), ("g_2".into(), true));
    }

    #[tokio::test]
    async fn test_manual_ignores_change_check() {
        let h = Harness::new();
        h.checkin("g_1").await;
        h.resolver.auto(&p1()).await.unwrap();
        h.consume("p1").await;

        let options = ScheduleOptions::default().with_variable("ENV", "qa");
        let manual = h.resolver.manual(&p1(), "alice", &options).await.unwrap();
        let cause = manual.scheduled().unwrap();
        assert!(cause.is_forced());
        assert_eq!(cause.approver(), "alice");
        assert_eq!(revision_of(cause), ("g_1".into(), false));
        assert_eq!(cause.variables()["ENV"], "qa");
    }

    #[tokio::test]
    async fn test_second_manual_while_pending_is_rejected() {
        let h = Harness::new();
        h.checkin("g_1").await;
        let options = ScheduleOptions::default();
        assert!(h.resolver.manual(&p1(), "alice", &options).await.unwrap().is_scheduled());

        let second = h.resolver.manual(&p1(), "bob", &options).await.unwrap();
        assert_eq!(
            second.rejection(),
            Some(&RejectReason::AlreadyPending {
                pipeline: "p1".into()
            })
        );
        let auto = h.resolver.auto(&p1()).await.unwrap();
        assert_eq!(auto.skip_reason(), Some(&SkipReason::AlreadyPending));
    }

    #[tokio::test]
    async fn test_timer_flag_controls_rerun_on_same_materials() {
        let h = Harness::new();
        h.checkin("g_1").await;
        let strict = p1().with_timer(TimerSpec::new("0 0 22 * * *", true));
        let lenient = p1().with_timer(TimerSpec::new("0 0 22 * * *", false));

        assert!(h.resolver.timer(&strict).await.unwrap().is_scheduled());
        h.consume("p1").await;

        let skipped = h.resolver.timer(&strict).await.unwrap();
        assert_eq!(
            skipped.skip_reason(),
            Some(&SkipReason::AlreadyRanWithLatestMaterials)
        );

        let rerun = h.resolver.timer(&lenient).await.unwrap();
        assert_eq!(revision_of(rerun.scheduled().unwrap()), ("g_1".into(), false));
    }

    #[tokio::test]
    async fn test_locked_pipeline_rejected() {
        let h = Harness::new();
        h.checkin("g_1").await;
        let config = p1().with_lock(LockBehavior::LockOnFailure);
        let mut unit = gantry_core::ports::UnitOfWork::new();
        unit.lock_pipeline("p1", 3);
        h.repo.commit(unit.into_parts().0).await.unwrap();

        let outcome = h.resolver.auto(&config).await.unwrap();
        assert_eq!(
            outcome.rejection().unwrap().to_string(),
            "Pipeline p1 cannot be scheduled as it is locked by the running instance p1/3."
        );
    }

    #[tokio::test]
    async fn test_material_config_change_is_schedulable() {
        let h = Harness::new();
        h.checkin("g_1").await;
        h.resolver.auto(&p1()).await.unwrap();
        h.consume("p1").await;

        let other = Material::scm("https://git/g2").named("g2");
        h.source.checkin(&other, "h_1").await;
        h.store.refresh(&other).await.unwrap();
        let changed = p1().with_material(other);

        let outcome = h.resolver.auto(&changed).await.unwrap();
        let cause = outcome.scheduled().unwrap();
        assert_eq!(cause.revisions().len(), 2);
    }

    #[tokio::test]
    async fn test_unbuilt_upstream_clears_nothing_and_skips() {
        let h = Harness::new();
        let config = PipelineConfig::new("down")
            .with_material(Material::dependency("up", "dev"))
            .with_stage(StageConfig::new("deploy", &["ship"]));
        let outcome = h.resolver.auto(&config).await.unwrap();
        assert_eq!(
            outcome.skip_reason(),
            Some(&SkipReason::UpstreamNotBuilt {
                material: "up".into()
            })
        );
        assert!(h.health.states().await.is_empty());
    }
}
