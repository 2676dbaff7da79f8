//! Build-cause resolution and stage scheduling for Gantry.

pub mod fanin;
pub mod instantiator;
pub mod locks;
pub mod queue;
pub mod resolver;
pub mod revisions;
pub mod service;
pub mod settings;
pub mod stage;
pub mod timer;

mod status;
mod transaction;

pub use fanin::{DependencyResolver, FanInResult};
pub use instantiator::PipelineInstantiator;
pub use queue::ScheduleQueue;
pub use resolver::BuildCauseResolver;
pub use revisions::MaterialRevisionStore;
pub use service::{SchedulingService, TickReport};
pub use settings::SchedulerSettings;
pub use stage::StageScheduler;
pub use timer::TimerSchedule;
