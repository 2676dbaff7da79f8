//! Fan-in resolution.
//!
//! Picks one revision per configured material such that every dependency
//! material agrees on the revisions of the upstream pipelines and source
//! materials they share. Dependency candidates are walked newest first; on a
//! disagreement the candidate built from the newer shared ancestor steps back
//! to an older run, up to the configured back-track limit.

use crate::revisions::MaterialRevisionStore;
use chrono::{DateTime, Utc};
use gantry_core::config::PipelineConfig;
use gantry_core::ids::StageLocator;
use gantry_core::instance::Stage;
use gantry_core::material::{
    DependencyMaterial, Fingerprint, Material, MaterialKind, MaterialRevision, MaterialRevisions,
    Modification,
};
use gantry_core::ports::PipelineRepository;
use gantry_core::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum FanInResult {
    Resolved(MaterialRevisions),
    /// Dependency materials disagree on a shared ancestor and no older combination agrees.
    Incompatible { reason: String },
    /// A material has no usable revision yet.
    Missing { material: String },
}

/// The revision of a shared ancestor as seen from one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AncestorRevision {
    revision: String,
    /// Pipeline counter, or modification time in millis for source materials.
    order: i64,
}

/// Shared-ancestor key -> revision, for one upstream pipeline instance.
type Ancestry = HashMap<String, AncestorRevision>;

#[derive(Debug, Clone)]
struct Candidate {
    locator: StageLocator,
    completed_at: DateTime<Utc>,
}

impl Candidate {
    fn from_stage(stage: &Stage) -> Self {
        Self {
            locator: stage.locator(),
            completed_at: stage.completed_at.unwrap_or(stage.created_at),
        }
    }

    fn rank(&self) -> (DateTime<Utc>, u32, u32) {
        (
            self.completed_at,
            self.locator.pipeline_counter,
            self.locator.stage_counter,
        )
    }
}

struct DependencySlot {
    position: usize,
    material: Material,
    candidates: Vec<Candidate>,
    index: usize,
    pegged: bool,
}

impl DependencySlot {
    fn current(&self) -> &Candidate {
        &self.candidates[self.index]
    }
}

fn pipeline_key(name: &str) -> String {
    format!("pipeline:{}", name)
}

fn scm_key(fingerprint: &Fingerprint) -> String {
    format!("scm:{}", fingerprint.as_str())
}

/// Resolves a consistent revision set for a pipeline's materials.
pub struct DependencyResolver {
    store: Arc<MaterialRevisionStore>,
    pipelines: Arc<dyn PipelineRepository>,
    backtrack_limit: usize,
}

impl DependencyResolver {
    pub fn new(
        store: Arc<MaterialRevisionStore>,
        pipelines: Arc<dyn PipelineRepository>,
        backtrack_limit: usize,
    ) -> Self {
        Self {
            store,
            pipelines,
            backtrack_limit,
        }
    }

    /// Resolve revisions for `config`. `pegged` maps material names to required revisions.
    pub async fn resolve(
        &self,
        config: &PipelineConfig,
        pegged: &BTreeMap<String, String>,
    ) -> Result<FanInResult> {
        for name in pegged.keys() {
            if !config.materials.iter().any(|m| m.name() == name) {
                return Err(Error::MaterialNotFound(format!(
                    "{} in pipeline {}",
                    name, config.name
                )));
            }
        }

        let mut scm: Vec<(usize, Material, Modification, bool)> = Vec::new();
        let mut slots: Vec<DependencySlot> = Vec::new();

        for (position, material) in config.materials.iter().enumerate() {
            let requested = pegged.get(material.name());
            match material {
                Material::Scm(_) => {
                    let modification = match requested {
                        Some(revision) => self
                            .store
                            .modification(material, revision)
                            .await
                            .ok_or_else(|| Error::UnknownRevision {
                                material: material.name().to_string(),
                                revision: revision.clone(),
                            })?,
                        None => match self.store.latest(material).await {
                            Some(latest) => latest,
                            None => {
                                return Ok(FanInResult::Missing {
                                    material: material.name().to_string(),
                                });
                            }
                        },
                    };
                    scm.push((position, material.clone(), modification, requested.is_some()));
                }
                Material::Dependency(dependency) => {
                    let candidates = match requested {
                        Some(revision) => vec![self.pegged_candidate(dependency, revision).await?],
                        None => self.candidates(dependency).await?,
                    };
                    if candidates.is_empty() {
                        return Ok(FanInResult::Missing {
                            material: material.name().to_string(),
                        });
                    }
                    slots.push(DependencySlot {
                        position,
                        material: material.clone(),
                        candidates,
                        index: 0,
                        pegged: requested.is_some(),
                    });
                }
            }
        }

        // Pegged source revisions are constraints the dependencies must meet.
        let fixed: Ancestry = scm
            .iter()
            .filter(|(_, _, _, pegged)| *pegged)
            .map(|(_, material, modification, _)| {
                (
                    scm_key(&material.fingerprint()),
                    AncestorRevision {
                        revision: modification.revision.clone(),
                        order: modification.modified_at.timestamp_millis(),
                    },
                )
            })
            .collect();

        let mut cache: HashMap<(String, u32), Arc<Ancestry>> = HashMap::new();
        let mut backtracks = 0usize;
        let ancestries = loop {
            let mut ancestries = Vec::with_capacity(slots.len());
            for slot in &slots {
                ancestries.push(self.ancestry(&slot.current().locator, &mut cache).await?);
            }

            let Some((key, victim)) = find_conflict(&slots, &ancestries, &fixed) else {
                break ancestries;
            };

            let slot = &mut slots[victim];
            debug!(
                pipeline = %config.name,
                material = %slot.material,
                ancestor = %key,
                rejected = %slot.current().locator,
                "Stepping back to an older upstream run"
            );
            slot.index += 1;
            backtracks += 1;

            if slot.index >= slot.candidates.len() || backtracks > self.backtrack_limit {
                return Ok(FanInResult::Incompatible {
                    reason: format!(
                        "materials of pipeline {} disagree on {} after {} attempts",
                        config.name,
                        key.split_once(':').map_or(key.as_str(), |(_, k)| k),
                        backtracks
                    ),
                });
            }
        };

        let mut merged = Ancestry::new();
        for ancestry in &ancestries {
            for (key, revision) in ancestry.iter() {
                merged.entry(key.clone()).or_insert_with(|| revision.clone());
            }
        }

        let mut resolved: Vec<(usize, MaterialRevision)> = Vec::new();
        for (position, material, modification, pegged) in scm {
            let modification = match merged.get(&scm_key(&material.fingerprint())) {
                Some(shared) if !pegged && shared.revision != modification.revision => {
                    debug!(
                        pipeline = %config.name,
                        material = %material,
                        revision = %shared.revision,
                        "Using the source revision shared with upstream pipelines"
                    );
                    match self.store.modification(&material, &shared.revision).await {
                        Some(known) => known,
                        None => Modification::new(
                            shared.revision.clone(),
                            DateTime::from_timestamp_millis(shared.order)
                                .unwrap_or(modification.modified_at),
                        ),
                    }
                }
                _ => modification,
            };
            resolved.push((position, MaterialRevision::new(material, vec![modification])));
        }
        for slot in &slots {
            let candidate = slot.current();
            resolved.push((
                slot.position,
                MaterialRevision::new(
                    slot.material.clone(),
                    vec![Modification::for_stage(
                        &candidate.locator,
                        candidate.completed_at,
                    )],
                ),
            ));
        }
        resolved.sort_by_key(|(position, _)| *position);

        Ok(FanInResult::Resolved(
            resolved.into_iter().map(|(_, revision)| revision).collect(),
        ))
    }

    /// Passed runs of the upstream stage, newest first, bounded by the back-track limit.
    async fn candidates(&self, dependency: &DependencyMaterial) -> Result<Vec<Candidate>> {
        let stages = self
            .pipelines
            .passed_stages(
                &dependency.pipeline,
                &dependency.stage,
                self.backtrack_limit + 1,
            )
            .await?;
        let mut candidates: Vec<Candidate> = stages.iter().map(Candidate::from_stage).collect();
        candidates.sort_by(|a, b| b.rank().cmp(&a.rank()));
        Ok(candidates)
    }

    async fn pegged_candidate(
        &self,
        dependency: &DependencyMaterial,
        revision: &str,
    ) -> Result<Candidate> {
        let locator: StageLocator = revision.parse()?;
        if locator.pipeline_name != dependency.pipeline || locator.stage_name != dependency.stage {
            return Err(Error::InvalidDependencyRevision(format!(
                "{} does not point at {}/{}",
                revision, dependency.pipeline, dependency.stage
            )));
        }
        let unknown = || Error::UnknownRevision {
            material: format!("{}/{}", dependency.pipeline, dependency.stage),
            revision: revision.to_string(),
        };
        let stage = self
            .pipelines
            .stage_by_locator(&locator)
            .await?
            .ok_or_else(unknown)?;
        if !stage.passed() {
            return Err(unknown());
        }
        Ok(Candidate::from_stage(&stage))
    }

    /// Every pipeline instance and source revision the given upstream run was built from.
    async fn ancestry(
        &self,
        locator: &StageLocator,
        cache: &mut HashMap<(String, u32), Arc<Ancestry>>,
    ) -> Result<Arc<Ancestry>> {
        let root = (locator.pipeline_name.clone(), locator.pipeline_counter);
        if let Some(hit) = cache.get(&root) {
            return Ok(hit.clone());
        }

        let mut ancestry = Ancestry::new();
        let mut visited = HashSet::new();
        let mut stack = vec![root.clone()];

        while let Some((name, counter)) = stack.pop() {
            if !visited.insert((name.clone(), counter)) {
                continue;
            }
            ancestry
                .entry(pipeline_key(&name))
                .or_insert_with(|| AncestorRevision {
                    revision: format!("{}/{}", name, counter),
                    order: i64::from(counter),
                });

            let Some(instance) = self.pipelines.pipeline_by_counter(&name, counter).await? else {
                continue;
            };
            for revision in instance.build_cause.revisions().iter() {
                match revision.upstream_stage() {
                    Some(upstream) => {
                        stack.push((upstream.pipeline_name, upstream.pipeline_counter));
                    }
                    None if revision.material.kind() == MaterialKind::Scm => {
                        if let Some(modification) = revision.latest() {
                            ancestry
                                .entry(scm_key(&revision.fingerprint()))
                                .or_insert_with(|| AncestorRevision {
                                    revision: modification.revision.clone(),
                                    order: modification.modified_at.timestamp_millis(),
                                });
                        }
                    }
                    None => {}
                }
            }
        }

        let ancestry = Arc::new(ancestry);
        cache.insert(root, ancestry.clone());
        Ok(ancestry)
    }
}

/// First shared ancestor the current candidates disagree on, and the slot to step back.
fn find_conflict(
    slots: &[DependencySlot],
    ancestries: &[Arc<Ancestry>],
    fixed: &Ancestry,
) -> Option<(String, usize)> {
    let keys: BTreeSet<&String> = ancestries.iter().flat_map(|a| a.keys()).collect();

    for key in keys {
        let seen: Vec<(usize, &AncestorRevision)> = ancestries
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.get(key).map(|r| (i, r)))
            .collect();

        let target = fixed.get(key).map(|r| r.revision.as_str()).or_else(|| {
            seen.iter()
                .find(|(i, _)| slots[*i].pegged)
                .map(|(_, r)| r.revision.as_str())
        });

        if let Some(target) = target {
            let disagreeing: Vec<usize> = seen
                .iter()
                .filter(|(_, r)| r.revision != target)
                .map(|(i, _)| *i)
                .collect();
            if disagreeing.is_empty() {
                continue;
            }
            // Only movable slots can step back; a pegged one will exhaust immediately.
            let victim = disagreeing
                .iter()
                .copied()
                .find(|i| !slots[*i].pegged)
                .unwrap_or(disagreeing[0]);
            return Some((key.clone(), victim));
        }

        let distinct: HashSet<&str> = seen.iter().map(|(_, r)| r.revision.as_str()).collect();
        if distinct.len() < 2 {
            continue;
        }
        let victim = seen
            .iter()
            .max_by(|(a, ra), (b, rb)| {
                ra.order
                    .cmp(&rb.order)
                    .then_with(|| slots[*a].current().rank().cmp(&slots[*b].current().rank()))
            })
            .map(|(i, _)| *i)?;
        return Some((key.clone(), victim));
    }
    None
}
