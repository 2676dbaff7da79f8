//! Health registry.

use async_trait::async_trait;
use gantry_core::Result;
use gantry_core::health::{HealthScope, HealthState};
use gantry_core::ports::HealthSink;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Current health states, one per scope.
#[derive(Default)]
pub struct InMemoryHealthRegistry {
    states: RwLock<HashMap<HealthScope, HealthState>>,
}

impl InMemoryHealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All states, most severe first.
    pub async fn states(&self) -> Vec<HealthState> {
        let mut states: Vec<HealthState> = self.states.read().await.values().cloned().collect();
        states.sort_by(|a, b| {
            b.level
                .cmp(&a.level)
                .then_with(|| a.scope.to_string().cmp(&b.scope.to_string()))
        });
        states
    }

    pub async fn get(&self, scope: &HealthScope) -> Option<HealthState> {
        self.states.read().await.get(scope).cloned()
    }
}

#[async_trait]
impl HealthSink for InMemoryHealthRegistry {
    async fn update(&self, state: HealthState) -> Result<()> {
        warn!(
            scope = %state.scope,
            level = ?state.level,
            message = %state.message,
            "Health state raised"
        );
        self.states.write().await.insert(state.scope.clone(), state);
        Ok(())
    }

    async fn remove_by_scope(&self, scope: &HealthScope) -> Result<()> {
        if self.states.write().await.remove(scope).is_some() {
            info!(scope = %scope, "Health state cleared");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_newer_state_replaces_older_and_clears() {
        let registry = InMemoryHealthRegistry::new();
        let scope = HealthScope::pipeline("p1");
        registry
            .update(HealthState::info(scope.clone(), "first", ""))
            .await
            .unwrap();
        registry
            .update(HealthState::error(scope.clone(), "second", ""))
            .await
            .unwrap();
        registry
            .update(HealthState::warning(HealthScope::Global, "disk", ""))
            .await
            .unwrap();

        let states = registry.states().await;
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].message, "second");

        registry.remove_by_scope(&scope).await.unwrap();
        assert!(registry.get(&scope).await.is_none());
        assert_eq!(registry.states().await.len(), 1);
    }
}
