//! In-process adapters for the Gantry ports.
//!
//! Transactional in-memory persistence, in-memory and file-backed config
//! stores, a scripted material source, a recording event bus and a health
//! registry. Used by the test suites and the `gantry` CLI.

mod bus;
mod config_store;
mod health;
mod materials;
mod repository;

pub use bus::InMemoryEventBus;
pub use config_store::{FileConfigStore, InMemoryConfigStore};
pub use health::InMemoryHealthRegistry;
pub use materials::StaticMaterialSource;
pub use repository::InMemoryPipelineRepository;
