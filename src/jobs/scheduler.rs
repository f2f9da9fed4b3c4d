// Engine scheduler - periodic driver for the enrollment runner.
//
// Any number of worker processes can run the same loop: exclusivity
// lives in the claim lease rows, not in process state, so the scheduler
// here only has to fire ticks on an interval.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler};
use tracing::{error, info};
use uuid::Uuid;

use super::runner::EnrollmentRunner;
use crate::error::EngineResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickLog {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub claimed: usize,
    pub steps_executed: usize,
    pub completed: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub duration_ms: Option<i64>,
}

pub struct EngineScheduler {
    scheduler: TokioScheduler,
    runner: EnrollmentRunner,
    tick_interval_secs: u32,
    tick_logs: Arc<RwLock<Vec<TickLog>>>,
}

/// Six-field cron expression firing every `secs` seconds (sub-minute
/// intervals) or every `secs / 60` minutes.
fn tick_cron(secs: u32) -> String {
    if secs < 60 {
        format!("*/{} * * * * *", secs.max(1))
    } else {
        format!("0 */{} * * * *", (secs / 60).max(1))
    }
}

impl EngineScheduler {
    pub async fn new(runner: EnrollmentRunner, tick_interval_secs: u32) -> EngineResult<Self> {
        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            runner,
            tick_interval_secs,
            tick_logs: Arc::new(RwLock::new(Vec::new())),
        })
    }

    pub async fn start(&self) -> EngineResult<()> {
        info!(
            "Starting engine scheduler, tick every {}s",
            self.tick_interval_secs
        );

        let cron_expr = tick_cron(self.tick_interval_secs);
        let runner = self.runner.clone();
        let logs = self.tick_logs.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let runner = runner.clone();
            let logs = logs.clone();

            Box::pin(async move {
                let log_id = Uuid::new_v4();
                let started_at = Utc::now();

                match runner.run_tick().await {
                    Ok(result) => {
                        let completed_at = Utc::now();
                        let duration = (completed_at - started_at).num_milliseconds();

                        info!(
                            "Tick done: {} claimed, {} steps, {} completed, {} failed, {} parked, {} date-trigger enrollments",
                            result.claimed,
                            result.steps_executed,
                            result.completed,
                            result.failed,
                            result.parked,
                            result.date_trigger_enrollments
                        );
                        for err in &result.errors {
                            error!("Tick error: {}", err);
                        }

                        let mut logs = logs.write().await;
                        logs.push(TickLog {
                            id: log_id,
                            started_at,
                            completed_at: Some(completed_at),
                            claimed: result.claimed,
                            steps_executed: result.steps_executed,
                            completed: result.completed,
                            failed: result.failed,
                            errors: result.errors,
                            duration_ms: Some(duration),
                        });
                        // keep only the last 100 ticks
                        if logs.len() > 100 {
                            logs.remove(0);
                        }
                    }
                    Err(e) => {
                        error!("Tick failed: {}", e);
                    }
                }
            })
        })?;

        self.scheduler.add(job).await?;
        self.scheduler.start().await?;

        info!("Engine scheduler started");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> EngineResult<()> {
        info!("Shutting down engine scheduler");
        self.scheduler.shutdown().await?;
        Ok(())
    }

    pub async fn tick_logs(&self) -> Vec<TickLog> {
        self.tick_logs.read().await.clone()
    }

    /// Run one tick immediately, outside the cron cadence.
    pub async fn run_tick_now(&self) -> EngineResult<()> {
        let result = self.runner.run_tick().await?;
        info!(
            "Manual tick: {} claimed, {} steps executed",
            result.claimed, result.steps_executed
        );
        Ok(())
    }
}
