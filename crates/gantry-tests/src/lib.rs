//! Scenario test infrastructure for Gantry.
//!
//! Every port is backed by the in-process adapters from `gantry-memory`, so
//! whole scheduling flows run without external services.
//!
//! # Usage
//!
//! ```ignore
//! use gantry_tests::{TestContext, fixtures};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let config = fixtures::single_stage("p1", fixtures::git("g1"));
//!     let ctx = TestContext::new(fixtures::document(vec![config])).unwrap();
//!     // Use ctx.service, ctx.repo, ctx.events, etc.
//! }
//! ```

pub mod context;
pub mod fixtures;

pub use context::TestContext;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,gantry_scheduler=debug")),
        )
        .with_test_writer()
        .try_init();
}
