//! Command handlers.

use anyhow::Context;
use chrono::Utc;
use console::style;
use futures::StreamExt;
use gantry_core::config::{ConfigDocument, ConfigSnapshot};
use gantry_core::material::{Material, Modification};
use gantry_core::ports::EventBus;
use gantry_memory::{
    FileConfigStore, InMemoryEventBus, InMemoryHealthRegistry, InMemoryPipelineRepository,
    StaticMaterialSource,
};
use gantry_scheduler::{SchedulerSettings, SchedulingService, TickReport};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// One entry of a modifications feed file.
#[derive(Debug, Deserialize)]
struct MaterialFeed {
    material: Material,
    #[serde(default)]
    modifications: Vec<Modification>,
}

/// A scheduling service over a config file, with every other port in memory.
struct Engine {
    service: SchedulingService,
    events: Arc<InMemoryEventBus>,
    health: Arc<InMemoryHealthRegistry>,
}

fn load_snapshot(path: &Path) -> anyhow::Result<ConfigSnapshot> {
    let document = ConfigDocument::from_file(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(ConfigSnapshot::new(document)?)
}

/// Validate a pipeline configuration.
pub fn validate(path: &Path) -> anyhow::Result<()> {
    let snapshot = load_snapshot(path)?;

    println!(
        "{} {} is valid (version {})",
        style("✓").green(),
        path.display(),
        style(snapshot.version()).dim()
    );
    for pipeline in snapshot.pipelines() {
        println!(
            "  {} ({} materials, lock: {:?})",
            style(&pipeline.name).bold(),
            pipeline.materials.len(),
            pipeline.lock
        );
        for stage in &pipeline.stages {
            let approval = if stage.requires_manual_approval() {
                " [manual]"
            } else {
                ""
            };
            println!("    - {} ({} jobs){}", stage.name, stage.jobs.len(), approval);
        }
    }
    Ok(())
}

/// Print pipelines upstream first.
pub fn graph(path: &Path) -> anyhow::Result<()> {
    let snapshot = load_snapshot(path)?;
    for (position, name) in snapshot.dependency_order().iter().enumerate() {
        let upstream: Vec<String> = snapshot
            .pipeline(name)
            .map(|p| {
                p.materials
                    .iter()
                    .filter_map(|m| m.as_dependency())
                    .map(|d| format!("{}/{}", d.pipeline, d.stage))
                    .collect()
            })
            .unwrap_or_default();
        if upstream.is_empty() {
            println!("{:>3}. {}", position + 1, style(name).bold());
        } else {
            println!(
                "{:>3}. {} <- {}",
                position + 1,
                style(name).bold(),
                upstream.join(", ")
            );
        }
    }
    Ok(())
}

/// Print the configuration JSON schema.
pub fn schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(ConfigDocument);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

async fn engine(
    config: &Path,
    modifications: &Path,
    settings: Option<&Path>,
) -> anyhow::Result<Engine> {
    let settings = SchedulerSettings::load(settings)?;
    let configs = FileConfigStore::open(config)
        .await
        .with_context(|| format!("failed to open {}", config.display()))?
        .with_retry(settings.config_write_attempts, settings.config_write_backoff());

    let feed = tokio::fs::read_to_string(modifications)
        .await
        .with_context(|| format!("failed to read {}", modifications.display()))?;
    let feed: Vec<MaterialFeed> = serde_yaml::from_str(&feed)?;
    let materials = StaticMaterialSource::new();
    for entry in feed {
        for modification in entry.modifications {
            materials.record(&entry.material, modification).await;
        }
    }

    let events = Arc::new(InMemoryEventBus::new());
    let health = Arc::new(InMemoryHealthRegistry::new());
    let service = SchedulingService::new(
        settings,
        Arc::new(configs),
        Arc::new(InMemoryPipelineRepository::new()),
        Arc::new(materials),
        events.clone(),
        health.clone(),
    );
    Ok(Engine {
        service,
        events,
        health,
    })
}

async fn run_ticks(engine: &Engine, ticks: u32) -> anyhow::Result<Vec<TickReport>> {
    let mut reports = Vec::new();
    for _ in 0..ticks {
        reports.push(engine.service.tick(Utc::now()).await?);
    }
    Ok(reports)
}

/// Run a fixed number of scheduling passes and print what each did.
pub async fn tick(
    config: &Path,
    modifications: &Path,
    settings: Option<&Path>,
    ticks: u32,
) -> anyhow::Result<()> {
    let engine = engine(config, modifications, settings).await?;
    let reports = run_ticks(&engine, ticks).await?;
    println!("{}", serde_json::to_string_pretty(&reports)?);

    eprintln!(
        "{} {} events published",
        style("i").blue(),
        engine.events.published().await.len()
    );
    for state in engine.health.states().await {
        eprintln!(
            "{} [{}] {}",
            style("!").yellow(),
            state.scope,
            state.message
        );
    }
    Ok(())
}

/// Schedule on an interval until Ctrl+C.
pub async fn serve(
    config: &Path,
    modifications: &Path,
    settings: Option<&Path>,
) -> anyhow::Result<()> {
    let engine = engine(config, modifications, settings).await?;

    let mut events = engine.events.subscribe(">").await?;
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => info!(subject = %event.subject(), "Event"),
                Err(e) => warn!(error = %e, "Event stream error"),
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    engine.service.run(shutdown_rx).await;
    Ok(())
}
