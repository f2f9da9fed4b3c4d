// Enrollment runner - the work of one scheduler tick.
//
// Each tick: refresh definitions, fire due date_time triggers, claim a
// bounded batch of due enrollments, and step each claimed enrollment
// until it parks or terminates. Enrollments are processed concurrently
// but never shared: the claim lease guarantees at most one in-flight
// executor call per enrollment across all workers.

use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::services::directory::ContactDirectory;
use crate::workflows::definition::DefinitionStore;
use crate::workflows::enrollment::{
    Enrollment, EnrollmentStatus, EnrollmentStore, ExecutionAttempt,
};
use crate::workflows::executor::StepExecutor;
use crate::workflows::triggers::TriggerConfig;

#[derive(Debug, Default)]
pub struct TickResult {
    pub claimed: usize,
    pub steps_executed: usize,
    pub completed: usize,
    pub failed: usize,
    pub parked: usize,
    pub date_trigger_enrollments: usize,
    pub errors: Vec<String>,
}

#[derive(Debug)]
struct EnrollmentSummary {
    steps: usize,
    final_status: Option<EnrollmentStatus>,
    errors: Vec<String>,
}

#[derive(Clone)]
pub struct EnrollmentRunner {
    definitions: Arc<DefinitionStore>,
    store: EnrollmentStore,
    executor: Arc<StepExecutor>,
    directory: Arc<dyn ContactDirectory>,
    worker_id: Uuid,
    config: EngineConfig,
}

impl EnrollmentRunner {
    pub fn new(
        definitions: Arc<DefinitionStore>,
        store: EnrollmentStore,
        executor: Arc<StepExecutor>,
        directory: Arc<dyn ContactDirectory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            definitions,
            store,
            executor,
            directory,
            worker_id: Uuid::new_v4(),
            config,
        }
    }

    pub async fn run_tick(&self) -> EngineResult<TickResult> {
        let now = Utc::now();
        let mut result = TickResult::default();

        self.definitions.reload().await?;

        self.fire_date_triggers(&mut result).await;

        let claimed = self
            .store
            .claim_due_batch(
                now,
                self.config.batch_size,
                self.config.lease_secs,
                self.worker_id,
            )
            .await?;
        result.claimed = claimed.len();

        let tasks: Vec<_> = claimed
            .into_iter()
            .map(|enrollment| {
                let runner = self.clone();
                tokio::spawn(async move { runner.process_enrollment(enrollment).await })
            })
            .collect();

        for joined in futures::future::join_all(tasks).await {
            match joined {
                Ok(summary) => {
                    result.steps_executed += summary.steps;
                    match summary.final_status {
                        Some(EnrollmentStatus::Completed) => result.completed += 1,
                        Some(EnrollmentStatus::Failed) => result.failed += 1,
                        Some(EnrollmentStatus::Waiting) => result.parked += 1,
                        _ => {}
                    }
                    result.errors.extend(summary.errors);
                }
                Err(e) => result.errors.push(format!("enrollment task panicked: {}", e)),
            }
        }

        Ok(result)
    }

    /// Advance one claimed enrollment as far as this tick allows.
    async fn process_enrollment(&self, mut enrollment: Enrollment) -> EnrollmentSummary {
        let mut summary = EnrollmentSummary {
            steps: 0,
            final_status: None,
            errors: Vec::new(),
        };

        let workflow = match self.definitions.get(enrollment.workflow_id).await {
            Some(workflow) => workflow,
            None => {
                // paused, archived or deleted since the claim: release
                // the enrollment untouched
                warn!(
                    "Workflow {} for enrollment {} is no longer active",
                    enrollment.workflow_id, enrollment.id
                );
                if let Err(e) = self.store.persist_outcome(&enrollment).await {
                    summary
                        .errors
                        .push(format!("failed to release enrollment {}: {}", enrollment.id, e));
                }
                return summary;
            }
        };

        for _ in 0..self.config.max_steps_per_tick {
            let attempt = match self
                .executor
                .execute_step(&workflow, &mut enrollment, Utc::now())
                .await
            {
                Ok(attempt) => attempt,
                Err(e) => {
                    // infrastructure error: keep the claim so the lease
                    // expires and a later tick retries this node
                    summary.errors.push(format!(
                        "enrollment {} aborted at node {:?}: {}",
                        enrollment.id, enrollment.current_node_id, e
                    ));
                    let node_id = enrollment.current_node_id.unwrap_or_else(Uuid::nil);
                    let attempt =
                        ExecutionAttempt::failure(&enrollment, node_id, &e.to_string());
                    if let Err(log_err) = self.store.insert_attempt(&attempt).await {
                        summary.errors.push(format!(
                            "failed to append attempt for enrollment {}: {}",
                            enrollment.id, log_err
                        ));
                    }
                    if let Err(log_err) = self
                        .store
                        .record_step_error(enrollment.id, &e.to_string())
                        .await
                    {
                        summary.errors.push(format!(
                            "failed to record error for enrollment {}: {}",
                            enrollment.id, log_err
                        ));
                    }
                    return summary;
                }
            };

            summary.steps += 1;

            if let Err(e) = self.store.insert_attempt(&attempt).await {
                summary.errors.push(format!(
                    "failed to append attempt for enrollment {}: {}",
                    enrollment.id, e
                ));
                return summary;
            }

            if enrollment.status != EnrollmentStatus::Running {
                break;
            }
        }

        summary.final_status = Some(enrollment.status);

        match self.store.persist_outcome(&enrollment).await {
            Ok(true) => {}
            Ok(false) => {
                // cancelled (or reclaimed) while the step ran; the write
                // was dropped and the cancellation stands
                info!(
                    "Enrollment {} outcome discarded: state changed underneath the claim",
                    enrollment.id
                );
                summary.final_status = None;
            }
            Err(e) => summary.errors.push(format!(
                "failed to persist enrollment {}: {}",
                enrollment.id, e
            )),
        }

        summary
    }

    /// Fire date_time triggers whose instant has passed. The fired flag
    /// is claimed atomically so exactly one worker enrolls the audience.
    async fn fire_date_triggers(&self, result: &mut TickResult) {
        let now = Utc::now();

        for workflow in self.definitions.active().await {
            let (at, audience_tag_id) = match workflow.trigger_config() {
                Some(TriggerConfig::DateTime {
                    at,
                    audience_tag_id,
                }) => (*at, *audience_tag_id),
                _ => continue,
            };

            if at > now || workflow.date_trigger_fired_at.is_some() {
                continue;
            }

            match self.definitions.claim_date_trigger(workflow.id).await {
                Ok(true) => {}
                Ok(false) => continue, // another worker got there first
                Err(e) => {
                    result
                        .errors
                        .push(format!("failed to claim date trigger {}: {}", workflow.id, e));
                    continue;
                }
            }

            let audience = match audience_tag_id {
                Some(tag_id) => match self
                    .directory
                    .contacts_with_tag(workflow.tenant_id, tag_id)
                    .await
                {
                    Ok(contacts) => contacts,
                    Err(e) => {
                        result.errors.push(format!(
                            "failed to resolve audience for workflow {}: {}",
                            workflow.id, e
                        ));
                        continue;
                    }
                },
                None => {
                    warn!(
                        "date_time trigger on workflow {} has no audience tag",
                        workflow.id
                    );
                    continue;
                }
            };

            info!(
                "Firing date_time trigger for workflow '{}' ({} contacts)",
                workflow.name,
                audience.len()
            );

            for contact_id in audience {
                match self.store.create(&workflow, contact_id).await {
                    Ok(Some(_)) => result.date_trigger_enrollments += 1,
                    Ok(None) => {}
                    Err(e) => {
                        error!(
                            "Failed to enroll contact {} for date trigger: {}",
                            contact_id, e
                        );
                        result.errors.push(format!(
                            "date trigger enrollment failed for contact {}: {}",
                            contact_id, e
                        ));
                    }
                }
            }
        }
    }
}
