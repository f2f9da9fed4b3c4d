// Background jobs: the periodic scheduler and the per-tick runner.

pub mod runner;
pub mod scheduler;

pub use runner::{EnrollmentRunner, TickResult};
pub use scheduler::{EngineScheduler, TickLog};
