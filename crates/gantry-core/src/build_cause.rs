//! Build causes: the immutable record of why a pipeline instance exists.

use crate::ids::BuildCauseId;
use crate::material::{Material, MaterialRevisions};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Approver recorded for runs started by material changes.
pub const CHANGES_APPROVER: &str = "changes";

/// Approver recorded for runs started by a timer.
pub const TIMER_APPROVER: &str = "timer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Modification,
    Manual,
    Timer,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Modification => f.write_str("modification"),
            TriggerKind::Manual => f.write_str("manual"),
            TriggerKind::Timer => f.write_str("timer"),
        }
    }
}

/// Caller choices for a manual trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ScheduleOptions {
    /// Specific revisions keyed by material name. Unlisted materials use the latest.
    #[serde(default)]
    pub revisions: BTreeMap<String, String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl ScheduleOptions {
    pub fn with_revision(
        mut self,
        material: impl Into<String>,
        revision: impl Into<String>,
    ) -> Self {
        self.revisions.insert(material.into(), revision.into());
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

/// Revisions plus trigger metadata. A new pipeline instance consumes exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BuildCause {
    id: BuildCauseId,
    revisions: MaterialRevisions,
    trigger: TriggerKind,
    approver: String,
    #[serde(default)]
    variables: BTreeMap<String, String>,
    created_at: DateTime<Utc>,
}

impl BuildCause {
    pub fn new(
        revisions: MaterialRevisions,
        trigger: TriggerKind,
        approver: impl Into<String>,
    ) -> Self {
        Self {
            id: BuildCauseId::new(),
            revisions,
            trigger,
            approver: approver.into(),
            variables: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn from_changes(revisions: MaterialRevisions) -> Self {
        Self::new(revisions, TriggerKind::Modification, CHANGES_APPROVER)
    }

    pub fn from_timer(revisions: MaterialRevisions) -> Self {
        Self::new(revisions, TriggerKind::Timer, TIMER_APPROVER)
    }

    pub fn manual(revisions: MaterialRevisions, approver: impl Into<String>) -> Self {
        Self::new(revisions, TriggerKind::Manual, approver)
    }

    /// Attach environment-variable overrides.
    pub fn with_variables(mut self, variables: BTreeMap<String, String>) -> Self {
        self.variables.extend(variables);
        self
    }

    pub fn id(&self) -> BuildCauseId {
        self.id
    }

    pub fn revisions(&self) -> &MaterialRevisions {
        &self.revisions
    }

    pub fn trigger(&self) -> TriggerKind {
        self.trigger
    }

    pub fn approver(&self) -> &str {
        &self.approver
    }

    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_forced(&self) -> bool {
        self.trigger == TriggerKind::Manual
    }

    pub fn has_modifications(&self) -> bool {
        !self.revisions.is_empty() && !self.revisions.is_missing_modifications()
    }

    /// Whether this cause covers exactly the given materials.
    pub fn materials_match<'a>(&self, materials: impl IntoIterator<Item = &'a Material>) -> bool {
        let configured: BTreeSet<_> = materials.into_iter().map(|m| m.fingerprint()).collect();
        configured == self.revisions.fingerprints()
    }
}

impl fmt::Display for BuildCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} by {}:", self.trigger, self.approver)?;
        for revision in self.revisions.iter() {
            write!(
                f,
                " {}={}{}",
                revision.material.name(),
                revision.latest_revision().unwrap_or("-"),
                if revision.changed { "*" } else { "" }
            )?;
        }
        f.write_str("]")
    }
}
