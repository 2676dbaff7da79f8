//! Cron timer evaluation.

use chrono::{DateTime, Utc};
use gantry_core::config::ConfigSnapshot;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Tracks when each timer pipeline was last evaluated.
///
/// A timer fires when its next occurrence after the previous evaluation has
/// passed. The first evaluation of a pipeline only records the time, so a
/// restart never fires timers that elapsed while the engine was down.
#[derive(Default)]
pub struct TimerSchedule {
    last_checked: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl TimerSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of timer pipelines due at `now`, in configuration order.
    pub async fn due_timers(&self, snapshot: &ConfigSnapshot, now: DateTime<Utc>) -> Vec<String> {
        let mut last_checked = self.last_checked.lock().await;
        last_checked.retain(|name, _| {
            snapshot
                .pipeline(name)
                .is_some_and(|p| p.timer.is_some())
        });

        let mut due = Vec::new();
        for pipeline in snapshot.pipelines() {
            let Some(timer) = &pipeline.timer else {
                continue;
            };
            let Some(previous) = last_checked.insert(pipeline.name.clone(), now) else {
                debug!(pipeline = %pipeline.name, spec = %timer.spec, "Timer registered");
                continue;
            };
            match timer.next_fire_after(previous) {
                Ok(Some(next)) if next <= now => {
                    debug!(pipeline = %pipeline.name, fire_at = %next, "Timer due");
                    due.push(pipeline.name.clone());
                }
                Ok(_) => {}
                Err(e) => warn!(pipeline = %pipeline.name, error = %e, "Invalid timer"),
            }
        }
        due
    }

    /// Forget all evaluation history.
    pub async fn reset(&self) {
        self.last_checked.lock().await.clear();
    }
}
