//! Service layer: the Warnet aggregate and the services it hands out.

pub mod scenarios;
pub mod scheduler;
pub mod tank;
pub mod warnet;

pub use scenarios::{ScenarioInfo, ScenarioRunner};
pub use scheduler::{ChannelOpenScheduler, OpenedChannel, ScheduleReport};
pub use tank::Tank;
pub use warnet::{NetworkInfo, Warnet};
