//! Builders for sample configuration.

use gantry_core::config::{ConfigDocument, PipelineConfig, StageConfig, TimerSpec};
use gantry_core::material::Material;

/// A git material named `name`.
pub fn git(name: &str) -> Material {
    Material::scm(format!("https://git.example.com/{}.git", name)).named(name)
}

/// The `dev` stage output of `pipeline`.
pub fn upstream(pipeline: &str) -> Material {
    Material::dependency(pipeline, "dev")
}

pub fn document(pipelines: Vec<PipelineConfig>) -> ConfigDocument {
    ConfigDocument { pipelines }
}

/// One `dev` stage with a single `unit` job.
pub fn single_stage(name: &str, material: Material) -> PipelineConfig {
    PipelineConfig::new(name)
        .with_material(material)
        .with_stage(StageConfig::new("dev", &["unit"]))
}

/// Downstream of every named pipeline's `dev` stage, with a single `deploy` stage.
pub fn dependent(name: &str, upstreams: &[&str]) -> PipelineConfig {
    upstreams
        .iter()
        .fold(PipelineConfig::new(name), |config, up| {
            config.with_material(upstream(up))
        })
        .with_stage(StageConfig::new("deploy", &["ship"]))
}

/// `build`, `ft` with three jobs, and a manually approved `deploy`.
pub fn three_stage(name: &str, material: Material) -> PipelineConfig {
    PipelineConfig::new(name)
        .with_material(material)
        .with_stage(StageConfig::new("build", &["compile"]))
        .with_stage(StageConfig::new("ft", &["foo", "foo2", "foo3"]))
        .with_stage(StageConfig::new("deploy", &["ship"]).manual())
}

/// `build` then `ft`, both automatic.
pub fn two_stage(name: &str, material: Material) -> PipelineConfig {
    PipelineConfig::new(name)
        .with_material(material)
        .with_stage(StageConfig::new("build", &["compile"]))
        .with_stage(StageConfig::new("ft", &["foo"]))
}

/// Fires every day at 22:00.
pub fn nightly(name: &str, material: Material, run_only_on_new_materials: bool) -> PipelineConfig {
    single_stage(name, material)
        .with_timer(TimerSpec::new("0 0 22 * * *", run_only_on_new_materials))
}
