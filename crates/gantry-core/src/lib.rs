//! Gantry Core
//!
//! Domain types, traits, and error handling for the Gantry scheduling engine.
//! Materials, build causes, pipeline/stage/job instances and the immutable
//! configuration snapshots live here, together with the port traits the
//! engine uses to reach persistence, configuration, events and health.

pub mod build_cause;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod ids;
pub mod instance;
pub mod label;
pub mod material;
pub mod outcome;
pub mod ports;

pub use error::{Error, Result};
pub use ids::*;
