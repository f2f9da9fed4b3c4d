//! Campaign workflow engine for the Cadence messaging CRM.
//!
//! Enrolls contacts into multi-step sequences and advances them over
//! days or weeks: trigger, message, delay, condition and action nodes,
//! calendar-aware timing, claim-leased concurrent advancement, and
//! retry with exponential backoff against a flaky delivery channel.
//!
//! The surrounding CRM (CRUD, auth, billing, rendering) lives
//! elsewhere; it authors workflow definitions, delivers contact events
//! to [`workflows::TriggerEvaluator::handle_event`], and runs
//! [`jobs::EngineScheduler`] in one or more worker processes.

pub mod config;
pub mod database;
pub mod error;
pub mod jobs;
pub mod services;
pub mod workflows;

pub use config::Config;
pub use error::{EngineError, EngineResult, SendError};
