//! Commit a unit of work, then publish its events.

use gantry_core::Result;
use gantry_core::ports::{EventBus, PipelineRepository, UnitOfWork};
use tracing::{error, warn};

/// Apply the writes atomically and publish the buffered events only if they committed.
///
/// Publishing is fire-and-forget once the writes are durable; a failed
/// publish is logged, not returned.
pub(crate) async fn commit(
    pipelines: &dyn PipelineRepository,
    events: &dyn EventBus,
    unit: UnitOfWork,
) -> Result<()> {
    let (writes, pending_events) = unit.into_parts();
    if let Err(e) = pipelines.commit(writes).await {
        error!(error = %e, dropped_events = pending_events.len(), "Transaction failed");
        return Err(e);
    }
    for event in pending_events {
        let subject = event.subject();
        if let Err(e) = events.publish(event).await {
            warn!(error = %e, subject = %subject, "Failed to publish event");
        }
    }
    Ok(())
}
