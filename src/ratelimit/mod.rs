//! Window tracking, backlog handling and the labeled limiter registry.

mod limiter;
mod registry;
pub mod scheduler;

pub use limiter::{Job, Limiter, LimiterStats, QueueStats, WindowStats};
pub use registry::Registry;
pub use scheduler::{ManualScheduler, Scheduler, Tick, TimerHandle, TokioScheduler};
