//! Materials, modifications and the revision sets built from them.
//!
//! A [`Material`] is anything a pipeline consumes: a source repository or the
//! output of an upstream pipeline stage. Every observed change to a material
//! is a [`Modification`]. The engine groups the modifications it picked for a
//! pipeline run into [`MaterialRevisions`].

use crate::ids::StageLocator;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

/// Stable identity of a material, independent of display names and flags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    fn of(parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MaterialKind {
    Scm,
    Dependency,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Material {
    Scm(ScmMaterial),
    Dependency(DependencyMaterial),
}

/// A source-control repository (and optional branch).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct ScmMaterial {
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
    /// Display name, also usable in label templates.
    #[serde(default)]
    pub name: Option<String>,
}

/// The output of `pipeline`'s `stage`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct DependencyMaterial {
    pub pipeline: String,
    pub stage: String,
    /// Include this material's revision in build causes, but never let a
    /// change to it trigger a run on its own.
    #[serde(default)]
    pub ignore_for_scheduling: bool,
    #[serde(default)]
    pub name: Option<String>,
}

impl Material {
    pub fn scm(url: impl Into<String>) -> Self {
        Material::Scm(ScmMaterial {
            url: url.into(),
            branch: None,
            name: None,
        })
    }

    pub fn dependency(pipeline: impl Into<String>, stage: impl Into<String>) -> Self {
        Material::Dependency(DependencyMaterial {
            pipeline: pipeline.into(),
            stage: stage.into(),
            ignore_for_scheduling: false,
            name: None,
        })
    }

    /// Set the display name.
    pub fn named(mut self, display: impl Into<String>) -> Self {
        match &mut self {
            Material::Scm(m) => m.name = Some(display.into()),
            Material::Dependency(m) => m.name = Some(display.into()),
        }
        self
    }

    /// Flag a dependency material as ignored for scheduling. No effect on SCM materials.
    pub fn ignored_for_scheduling(mut self) -> Self {
        if let Material::Dependency(m) = &mut self {
            m.ignore_for_scheduling = true;
        }
        self
    }

    pub fn kind(&self) -> MaterialKind {
        match self {
            Material::Scm(_) => MaterialKind::Scm,
            Material::Dependency(_) => MaterialKind::Dependency,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        match self {
            Material::Scm(m) => Fingerprint::of(&[
                "scm",
                m.url.as_str(),
                m.branch.as_deref().unwrap_or(""),
            ]),
            Material::Dependency(m) => {
                Fingerprint::of(&["dependency", m.pipeline.as_str(), m.stage.as_str()])
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Material::Scm(m) => m.name.as_deref().unwrap_or(&m.url),
            Material::Dependency(m) => m.name.as_deref().unwrap_or(&m.pipeline),
        }
    }

    pub fn ignore_for_scheduling(&self) -> bool {
        match self {
            Material::Scm(_) => false,
            Material::Dependency(m) => m.ignore_for_scheduling,
        }
    }

    pub fn as_dependency(&self) -> Option<&DependencyMaterial> {
        match self {
            Material::Dependency(m) => Some(m),
            Material::Scm(_) => None,
        }
    }
}

impl fmt::Display for Material {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Material::Scm(m) => match &m.branch {
                Some(branch) => write!(f, "scm:{}@{}", m.url, branch),
                None => write!(f, "scm:{}", m.url),
            },
            Material::Dependency(m) => write!(f, "dependency:{}/{}", m.pipeline, m.stage),
        }
    }
}

/// One observed change to a material. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Modification {
    pub revision: String,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub committer: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl Modification {
    pub fn new(revision: impl Into<String>, modified_at: DateTime<Utc>) -> Self {
        Self {
            revision: revision.into(),
            modified_at,
            committer: None,
            comment: None,
        }
    }

    pub fn with_committer(mut self, committer: impl Into<String>) -> Self {
        self.committer = Some(committer.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// The modification a passed upstream stage run represents.
    pub fn for_stage(locator: &StageLocator, completed_at: DateTime<Utc>) -> Self {
        Self::new(locator.to_string(), completed_at)
    }
}

/// The modifications picked for one material, newest last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MaterialRevision {
    pub material: Material,
    pub modifications: Vec<Modification>,
    /// Whether the revision differs from the one in the previous build cause.
    #[serde(default)]
    pub changed: bool,
}

impl MaterialRevision {
    pub fn new(material: Material, modifications: Vec<Modification>) -> Self {
        Self {
            material,
            modifications,
            changed: false,
        }
    }

    pub fn latest(&self) -> Option<&Modification> {
        self.modifications.last()
    }

    pub fn latest_revision(&self) -> Option<&str> {
        self.latest().map(|m| m.revision.as_str())
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.material.fingerprint()
    }

    /// The upstream stage run this revision points at, for dependency materials.
    pub fn upstream_stage(&self) -> Option<StageLocator> {
        if self.material.kind() != MaterialKind::Dependency {
            return None;
        }
        self.latest_revision().and_then(|r| r.parse().ok())
    }

    pub fn same_revision_as(&self, other: &MaterialRevision) -> bool {
        self.fingerprint() == other.fingerprint()
            && self.latest_revision() == other.latest_revision()
    }
}

/// One [`MaterialRevision`] per configured material, in configuration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct MaterialRevisions(Vec<MaterialRevision>);

impl MaterialRevisions {
    pub fn new(revisions: Vec<MaterialRevision>) -> Self {
        Self(revisions)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MaterialRevision> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn find(&self, fingerprint: &Fingerprint) -> Option<&MaterialRevision> {
        self.0.iter().find(|r| &r.fingerprint() == fingerprint)
    }

    pub fn fingerprints(&self) -> BTreeSet<Fingerprint> {
        self.0.iter().map(|r| r.fingerprint()).collect()
    }

    pub fn materials(&self) -> Vec<&Material> {
        self.0.iter().map(|r| &r.material).collect()
    }

    /// Newest modification time across all materials.
    pub fn latest_modified_at(&self) -> Option<DateTime<Utc>> {
        self.0
            .iter()
            .filter_map(|r| r.latest().map(|m| m.modified_at))
            .max()
    }

    pub fn is_missing_modifications(&self) -> bool {
        self.0.iter().any(|r| r.modifications.is_empty())
    }

    pub fn has_changed(&self) -> bool {
        self.0.iter().any(|r| r.changed)
    }

    /// Whether a material that is allowed to trigger a schedule changed.
    pub fn has_schedulable_change(&self) -> bool {
        self.0
            .iter()
            .any(|r| r.changed && !r.material.ignore_for_scheduling())
    }

    /// True when both sets hold the same materials at the same latest revisions.
    pub fn same_revisions_as(&self, other: &MaterialRevisions) -> bool {
        self.len() == other.len()
            && self.0.iter().all(|mine| {
                other
                    .find(&mine.fingerprint())
                    .is_some_and(|theirs| mine.same_revision_as(theirs))
            })
    }

    pub fn into_inner(self) -> Vec<MaterialRevision> {
        self.0
    }
}

impl FromIterator<MaterialRevision> for MaterialRevisions {
    fn from_iter<I: IntoIterator<Item = MaterialRevision>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, minute, 0).unwrap()
    }

    #[test]
    fn test_fingerprint_ignores_display_name_and_flag() {
        let plain = Material::dependency("up", "dev");
        let decorated = Material::dependency("up", "dev")
            .named("upstream")
            .ignored_for_scheduling();
        assert_eq!(plain.fingerprint(), decorated.fingerprint());
        assert_ne!(plain.fingerprint(), Material::dependency("up", "qa").fingerprint());
        assert_ne!(
            Material::scm("https://git/a").fingerprint(),
            Material::scm("https://git/b").fingerprint()
        );
    }

    #[test]
    fn test_ignore_flag_only_applies_to_dependencies() {
        assert!(!Material::scm("https://git/a").ignored_for_scheduling().ignore_for_scheduling());
        assert!(Material::dependency("up", "dev").ignored_for_scheduling().ignore_for_scheduling());
    }

    #[test]
    fn test_upstream_stage_parsed_from_dependency_revision() {
        let locator = StageLocator::new("up", 4, "dev", 1);
        let revision = MaterialRevision::new(
            Material::dependency("up", "dev"),
            vec![Modification::for_stage(&locator, at(5))],
        );
        assert_eq!(revision.upstream_stage(), Some(locator));
    }

    #[test]
    fn test_schedulable_change_skips_ignored_materials() {
        let mut ignored = MaterialRevision::new(
            Material::dependency("mingle", "dev").ignored_for_scheduling(),
            vec![Modification::new("mingle/2/dev/1", at(1))],
        );
        ignored.changed = true;
        let go = MaterialRevision::new(
            Material::dependency("go", "dev"),
            vec![Modification::new("go/1/dev/1", at(0))],
        );
        let revisions = MaterialRevisions::new(vec![ignored, go]);
        assert!(revisions.has_changed());
        assert!(!revisions.has_schedulable_change());
        assert_eq!(revisions.latest_modified_at(), Some(at(1)));
    }

    #[test]
    fn test_same_revisions_is_material_for_material() {
        let git = Material::scm("https://git/a");
        let a = MaterialRevisions::new(vec![MaterialRevision::new(
            git.clone(),
            vec![Modification::new("r1", at(0)), Modification::new("r2", at(1))],
        )]);
        let b = MaterialRevisions::new(vec![MaterialRevision::new(
            git.clone(),
            vec![Modification::new("r2", at(1))],
        )]);
        let c = MaterialRevisions::new(vec![MaterialRevision::new(
            git,
            vec![Modification::new("r3", at(2))],
        )]);
        assert!(a.same_revisions_as(&b));
        assert!(!a.same_revisions_as(&c));
    }
}
