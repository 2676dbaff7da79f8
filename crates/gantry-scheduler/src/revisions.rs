//! Append-only store of observed material modifications.

use gantry_core::Result;
use gantry_core::material::{Fingerprint, Material, Modification};
use gantry_core::ports::MaterialSource;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Modifications per material, newest last. Recording is idempotent per revision.
pub struct MaterialRevisionStore {
    source: Arc<dyn MaterialSource>,
    modifications: RwLock<HashMap<Fingerprint, Vec<Modification>>>,
}

impl MaterialRevisionStore {
    pub fn new(source: Arc<dyn MaterialSource>) -> Self {
        Self {
            source,
            modifications: RwLock::new(HashMap::new()),
        }
    }

    /// Pull the latest modifications from the material source and record them.
    pub async fn refresh(&self, material: &Material) -> Result<usize> {
        let modifications = self.source.latest_modifications(material).await?;
        Ok(self.record(material, modifications).await)
    }

    /// Append modifications, skipping revisions already known. Returns how many were new.
    pub async fn record(&self, material: &Material, modifications: Vec<Modification>) -> usize {
        let mut store = self.modifications.write().await;
        let known = store.entry(material.fingerprint()).or_default();
        let mut added = 0;
        for modification in modifications {
            if known.iter().any(|m| m.revision == modification.revision) {
                continue;
            }
            known.push(modification);
            added += 1;
        }
        if added > 0 {
            debug!(material = %material, added, "Recorded modifications");
        }
        added
    }

    pub async fn latest(&self, material: &Material) -> Option<Modification> {
        let store = self.modifications.read().await;
        store
            .get(&material.fingerprint())
            .and_then(|mods| mods.last().cloned())
    }

    pub async fn modification(&self, material: &Material, revision: &str) -> Option<Modification> {
        let store = self.modifications.read().await;
        store
            .get(&material.fingerprint())
            .and_then(|mods| mods.iter().find(|m| m.revision == revision).cloned())
    }

    /// Modifications recorded after `known`, newest last.
    ///
    /// If `known` was never recorded only the latest modification is returned.
    pub async fn revisions_since(&self, material: &Material, known: &str) -> Vec<Modification> {
        let store = self.modifications.read().await;
        let Some(mods) = store.get(&material.fingerprint()) else {
            return vec![];
        };
        match mods.iter().position(|m| m.revision == known) {
            Some(index) => mods[index + 1..].to_vec(),
            None => mods.last().cloned().into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gantry_memory::StaticMaterialSource;

    fn git() -> Material {
        Material::scm("https://git/g1").named("g1")
    }

    #[tokio::test]
    async fn test_record_is_idempotent() {
        let store = MaterialRevisionStore::new(Arc::new(StaticMaterialSource::new()));
        let now = Utc::now();
        let first = store
            .record(&git(), vec![Modification::new("g_1", now)])
            .await;
        let again = store
            .record(
                &git(),
                vec![Modification::new("g_1", now), Modification::new("g_2", now)],
            )
            .await;

        assert_eq!(first, 1);
        assert_eq!(again, 1);
        assert_eq!(store.latest(&git()).await.unwrap().revision, "g_2");
    }

    #[tokio::test]
    async fn test_refresh_pulls_from_source() {
        let source = Arc::new(StaticMaterialSource::new());
        source.checkin(&git(), "g_1").await;
        let store = MaterialRevisionStore::new(source.clone());

        assert_eq!(store.refresh(&git()).await.unwrap(), 1);
        assert_eq!(store.refresh(&git()).await.unwrap(), 0);

        source.checkin(&git(), "g_2").await;
        source.checkin(&git(), "g_3").await;
        assert_eq!(store.refresh(&git()).await.unwrap(), 2);

        let since: Vec<_> = store
            .revisions_since(&git(), "g_1")
            .await
            .into_iter()
            .map(|m| m.revision)
            .collect();
        assert_eq!(since, vec!["g_2", "g_3"]);
    }
}
