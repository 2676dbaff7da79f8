//! Scripted material source.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use gantry_core::Result;
use gantry_core::material::{Fingerprint, Material, Modification};
use gantry_core::ports::MaterialSource;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Material source whose modifications are checked in by hand.
#[derive(Default)]
pub struct StaticMaterialSource {
    modifications: RwLock<HashMap<Fingerprint, Vec<Modification>>>,
}

impl StaticMaterialSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new revision, timestamped after every earlier one of the material.
    pub async fn checkin(&self, material: &Material, revision: &str) -> Modification {
        let mut modifications = self.modifications.write().await;
        let known = modifications.entry(material.fingerprint()).or_default();
        let mut at = Utc::now();
        if let Some(last) = known.last()
            && at <= last.modified_at
        {
            at = last.modified_at + Duration::milliseconds(1);
        }
        let modification = Modification::new(revision, at);
        known.push(modification.clone());
        modification
    }

    /// Record a revision with an explicit timestamp.
    pub async fn checkin_at(
        &self,
        material: &Material,
        revision: &str,
        at: DateTime<Utc>,
    ) -> Modification {
        self.record(material, Modification::new(revision, at)).await
    }

    pub async fn record(&self, material: &Material, modification: Modification) -> Modification {
        self.modifications
            .write()
            .await
            .entry(material.fingerprint())
            .or_default()
            .push(modification.clone());
        modification
    }
}

#[async_trait]
impl MaterialSource for StaticMaterialSource {
    async fn latest_modifications(&self, material: &Material) -> Result<Vec<Modification>> {
        Ok(self
            .modifications
            .read()
            .await
            .get(&material.fingerprint())
            .cloned()
            .unwrap_or_default())
    }
}
