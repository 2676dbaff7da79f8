//! Pending build causes, at most one per pipeline.

use gantry_core::Result;
use gantry_core::build_cause::BuildCause;
use gantry_core::ids::BuildCauseId;
use gantry_core::ports::PipelineRepository;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Holds the single pending [`BuildCause`] per pipeline name.
///
/// `schedule` is an insert-if-absent: a concurrent second writer loses and
/// the entry already pending wins, whether or not the newcomer was forced.
pub struct ScheduleQueue {
    pending: RwLock<HashMap<String, BuildCause>>,
    scheduled: RwLock<HashMap<String, BuildCause>>,
    pipelines: Arc<dyn PipelineRepository>,
}

impl ScheduleQueue {
    pub fn new(pipelines: Arc<dyn PipelineRepository>) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            scheduled: RwLock::new(HashMap::new()),
            pipelines,
        }
    }

    /// Queue a cause. Returns false if one is already pending for the pipeline.
    pub async fn schedule(&self, pipeline: &str, cause: BuildCause) -> bool {
        let mut pending = self.pending.write().await;
        match pending.entry(pipeline.to_string()) {
            Entry::Occupied(existing) => {
                debug!(
                    pipeline,
                    pending = %existing.get().id(),
                    rejected = %cause.id(),
                    "Build cause already pending"
                );
                false
            }
            Entry::Vacant(slot) => {
                info!(pipeline, cause = %cause, "Build cause queued");
                slot.insert(cause);
                true
            }
        }
    }

    /// Snapshot of everything pending.
    pub async fn to_be_scheduled(&self) -> HashMap<String, BuildCause> {
        self.pending.read().await.clone()
    }

    /// Record that `old` produced an instance whose cause is `new`.
    ///
    /// The pending entry is dropped only if it is still `old`.
    pub async fn finish_schedule(&self, pipeline: &str, old: &BuildCause, new: BuildCause) {
        {
            let mut pending = self.pending.write().await;
            if pending.get(pipeline).is_some_and(|c| c.id() == old.id()) {
                pending.remove(pipeline);
            }
        }
        self.scheduled
            .write()
            .await
            .insert(pipeline.to_string(), new);
    }

    /// Cause of the most recently created instance, from memory or persistence.
    pub async fn most_recent_scheduled(&self, pipeline: &str) -> Result<Option<BuildCause>> {
        if let Some(cause) = self.scheduled.read().await.get(pipeline) {
            return Ok(Some(cause.clone()));
        }
        let Some(latest) = self.pipelines.latest_pipeline(pipeline).await? else {
            return Ok(None);
        };
        let mut scheduled = self.scheduled.write().await;
        let cause = scheduled
            .entry(pipeline.to_string())
            .or_insert(latest.build_cause);
        Ok(Some(cause.clone()))
    }

    pub async fn clear(&self) {
        self.pending.write().await.clear();
        self.scheduled.write().await.clear();
    }

    pub async fn clear_pipeline(&self, pipeline: &str) {
        if self.pending.write().await.remove(pipeline).is_some() {
            debug!(pipeline, "Pending build cause dropped");
        }
    }

    pub async fn has_build_cause(&self, pipeline: &str) -> bool {
        self.pending.read().await.contains_key(pipeline)
    }

    pub async fn has_forced_build_cause(&self, pipeline: &str) -> bool {
        self.pending
            .read()
            .await
            .get(pipeline)
            .is_some_and(BuildCause::is_forced)
    }

    /// Whether `cause` is still the pending entry for the pipeline.
    pub async fn is_pending(&self, pipeline: &str, cause: BuildCauseId) -> bool {
        self.pending
            .read()
            .await
            .get(pipeline)
            .is_some_and(|c| c.id() == cause)
    }

    pub async fn len(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.read().await.is_empty()
    }
}
