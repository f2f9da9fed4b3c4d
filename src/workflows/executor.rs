// Step executor - evaluates exactly one node per invocation.
//
// The executor mutates a claimed enrollment in place and returns the
// audit attempt to append; the scheduler loop persists both. It must
// tolerate at-least-once invocation per node: sends are the only
// non-idempotent effect and are fenced by retry bookkeeping, everything
// else (delay math, condition reads, tag/field mutations) re-applies
// cleanly.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::conditions;
use super::definition::{ActionConfig, NodeKind, WorkflowDefinition};
use super::delay::{self, Calendar};
use super::enrollment::{Enrollment, EnrollmentStatus, ExecutionAttempt};
use crate::config::Config;
use crate::error::{EngineError, EngineResult, SendError};
use crate::services::channel::MessageChannel;
use crate::services::directory::{ContactDirectory, ContactMutation, ContactSnapshot};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_retries: i32,
    /// First retry delay; doubles per retry up to the cap.
    pub retry_base_secs: i64,
    pub retry_cap_secs: i64,
    pub send_timeout_secs: u64,
}

impl ExecutorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.engine.max_retries,
            retry_base_secs: config.engine.retry_base_secs,
            retry_cap_secs: config.engine.retry_cap_secs,
            send_timeout_secs: config.channel.send_timeout_secs,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_base_secs: 3600,
            retry_cap_secs: 24 * 3600,
            send_timeout_secs: 30,
        }
    }
}

pub struct StepExecutor {
    channel: Arc<dyn MessageChannel>,
    directory: Arc<dyn ContactDirectory>,
    config: ExecutorConfig,
}

impl StepExecutor {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        directory: Arc<dyn ContactDirectory>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            channel,
            directory,
            config,
        }
    }

    /// Exponential backoff for transient delivery failures:
    /// base * 2^retries, capped.
    fn backoff_delay(&self, retries: i32) -> chrono::Duration {
        let exp = retries.clamp(0, 20) as u32;
        let secs = self
            .config
            .retry_base_secs
            .saturating_mul(1_i64 << exp)
            .min(self.config.retry_cap_secs);
        chrono::Duration::seconds(secs)
    }

    /// Evaluate the enrollment's current node and decide the next state.
    ///
    /// Returns the attempt to append to the audit trail. `Err` is
    /// reserved for infrastructure failures; the caller leaves the claim
    /// in place so the lease expires and a later tick retries the node.
    pub async fn execute_step(
        &self,
        workflow: &WorkflowDefinition,
        enrollment: &mut Enrollment,
        now: DateTime<Utc>,
    ) -> EngineResult<ExecutionAttempt> {
        if enrollment.status != EnrollmentStatus::Running {
            enrollment.begin()?;
        }

        let node_id = match enrollment.current_node_id {
            Some(id) => id,
            None => {
                let msg = "enrollment has no current node".to_string();
                enrollment.fail(&msg)?;
                return Ok(ExecutionAttempt::failure(enrollment, Uuid::nil(), &msg));
            }
        };

        let node = match workflow.node(node_id) {
            Some(node) => node,
            None => {
                let msg = format!("node {} no longer exists in workflow", node_id);
                enrollment.fail(&msg)?;
                return Ok(ExecutionAttempt::failure(enrollment, node_id, &msg));
            }
        };

        if enrollment.path.last() != Some(&node_id) {
            enrollment.path.push(node_id);
        }

        match &node.kind {
            NodeKind::Trigger(_) => {
                // enrollments start downstream of the trigger; tolerate a
                // stale pointer by skipping forward
                self.advance(workflow, enrollment, node_id)?;
                Ok(ExecutionAttempt::skipped(enrollment, node_id))
            }

            NodeKind::Message(cfg) => {
                let snapshot = match self.contact_snapshot(enrollment).await? {
                    Ok(snapshot) => snapshot,
                    Err(attempt) => return Ok(attempt),
                };
                merge_snapshot_into_context(enrollment, &snapshot);

                let content = render_template(&cfg.template, &enrollment.context);
                let send = tokio::time::timeout(
                    Duration::from_secs(self.config.send_timeout_secs),
                    self.channel
                        .send(enrollment.tenant_id, enrollment.contact_id, &content),
                )
                .await
                .unwrap_or(Err(SendError::Timeout(self.config.send_timeout_secs)));

                match send {
                    Ok(receipt) => {
                        enrollment.retry_count = 0;
                        enrollment.last_error = None;
                        if let Some(context) = enrollment.context.as_object_mut() {
                            context.insert(
                                "last_message_id".to_string(),
                                serde_json::Value::String(receipt.external_message_id),
                            );
                        }
                        self.advance(workflow, enrollment, node_id)?;
                        Ok(ExecutionAttempt::success(enrollment, node_id))
                    }
                    Err(err) => {
                        let detail = err.to_string();
                        let exhausted = enrollment.retry_count >= self.config.max_retries;

                        if workflow.settings.stop_on_error || !err.is_retryable() || exhausted {
                            warn!(
                                "Message node {} failed permanently for enrollment {}: {}",
                                node_id, enrollment.id, detail
                            );
                            enrollment.fail(&detail)?;
                        } else {
                            let delay = self.backoff_delay(enrollment.retry_count);
                            enrollment.retry_count += 1;
                            enrollment.last_error = Some(detail.clone());
                            enrollment.park_until(now + delay)?;
                            info!(
                                "Message node {} failed for enrollment {}, retry {} at {}",
                                node_id,
                                enrollment.id,
                                enrollment.retry_count,
                                now + delay
                            );
                        }
                        Ok(ExecutionAttempt::failure(enrollment, node_id, &detail))
                    }
                }
            }

            NodeKind::Delay(spec) => {
                let calendar = Calendar::new(
                    workflow.settings.utc_offset_minutes,
                    workflow.settings.business_hours.clone(),
                );
                let due = delay::due_at(now, spec, &calendar);

                match workflow.next_after(node_id) {
                    Some(next) => {
                        enrollment.advance_to(next);
                        enrollment.park_until(due)?;
                    }
                    // a trailing delay gates nothing
                    None => enrollment.complete()?,
                }
                Ok(ExecutionAttempt::success(enrollment, node_id))
            }

            NodeKind::Condition(cfg) => {
                let snapshot = match self.contact_snapshot(enrollment).await? {
                    Ok(snapshot) => snapshot,
                    Err(attempt) => return Ok(attempt),
                };
                merge_snapshot_into_context(enrollment, &snapshot);

                let outcome = conditions::evaluate(cfg, &snapshot);
                match workflow.branch_target(node_id, outcome) {
                    Some(next) => {
                        enrollment.advance_to(next);
                        Ok(ExecutionAttempt::success(enrollment, node_id))
                    }
                    None => {
                        let msg = format!(
                            "condition node {} has no '{}' branch",
                            node_id, outcome
                        );
                        enrollment.fail(&msg)?;
                        Ok(ExecutionAttempt::failure(enrollment, node_id, &msg))
                    }
                }
            }

            NodeKind::Action(cfg) => {
                let result = match cfg {
                    ActionConfig::AddTag { tag_id } => {
                        self.directory
                            .apply_mutation(
                                enrollment.tenant_id,
                                enrollment.contact_id,
                                &ContactMutation::AddTag { tag_id: *tag_id },
                            )
                            .await
                    }
                    ActionConfig::RemoveTag { tag_id } => {
                        self.directory
                            .apply_mutation(
                                enrollment.tenant_id,
                                enrollment.contact_id,
                                &ContactMutation::RemoveTag { tag_id: *tag_id },
                            )
                            .await
                    }
                    ActionConfig::SetField { field, value } => {
                        self.directory
                            .apply_mutation(
                                enrollment.tenant_id,
                                enrollment.contact_id,
                                &ContactMutation::SetField {
                                    field: field.clone(),
                                    value: value.clone(),
                                },
                            )
                            .await
                    }
                    ActionConfig::Notify { title, message } => {
                        let rendered = render_template(message, &enrollment.context);
                        self.directory
                            .notify(
                                enrollment.tenant_id,
                                enrollment.contact_id,
                                title,
                                &rendered,
                            )
                            .await
                    }
                };

                match result {
                    Ok(()) => {
                        self.advance(workflow, enrollment, node_id)?;
                        Ok(ExecutionAttempt::success(enrollment, node_id))
                    }
                    Err(EngineError::Directory(msg)) => {
                        enrollment.fail(&msg)?;
                        Ok(ExecutionAttempt::failure(enrollment, node_id, &msg))
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Contact reads distinguish a missing contact (permanent failure of
    /// this enrollment) from an unreachable store (infrastructure error,
    /// propagated so the lease retries the node).
    async fn contact_snapshot(
        &self,
        enrollment: &mut Enrollment,
    ) -> EngineResult<Result<ContactSnapshot, ExecutionAttempt>> {
        match self
            .directory
            .contact_context(enrollment.tenant_id, enrollment.contact_id)
            .await
        {
            Ok(snapshot) => Ok(Ok(snapshot)),
            Err(EngineError::Directory(msg)) => {
                let node_id = enrollment.current_node_id.unwrap_or_else(Uuid::nil);
                enrollment.fail(&msg)?;
                Ok(Err(ExecutionAttempt::failure(enrollment, node_id, &msg)))
            }
            Err(e) => Err(e),
        }
    }

    fn advance(
        &self,
        workflow: &WorkflowDefinition,
        enrollment: &mut Enrollment,
        node_id: Uuid,
    ) -> EngineResult<()> {
        match workflow.next_after(node_id) {
            Some(next) => {
                enrollment.advance_to(next);
                Ok(())
            }
            None => enrollment.complete(),
        }
    }
}

/// Fold contact values into the enrollment context so later nodes and
/// templates can reference them.
fn merge_snapshot_into_context(enrollment: &mut Enrollment, snapshot: &ContactSnapshot) {
    if let Some(context) = enrollment.context.as_object_mut() {
        context.insert(
            "status".to_string(),
            serde_json::Value::String(snapshot.status.clone()),
        );
        context.insert(
            "source".to_string(),
            serde_json::Value::String(snapshot.source.clone()),
        );
        context.insert(
            "last_message_at".to_string(),
            snapshot
                .last_message_at
                .map(|t| serde_json::Value::String(t.to_rfc3339()))
                .unwrap_or(serde_json::Value::Null),
        );
        context.insert("fields".to_string(), snapshot.custom_fields.clone());
    }
}

/// Replace `{{path}}` placeholders with values from the context map.
/// Unresolvable references are left as-is.
fn render_template(template: &str, context: &serde_json::Value) -> String {
    let re = match Regex::new(r"\{\{([^}]+)\}\}") {
        Ok(re) => re,
        Err(_) => return template.to_string(),
    };

    let mut result = template.to_string();
    for cap in re.captures_iter(template) {
        let path = cap[1].trim();
        if let Some(value) = get_nested_value(context, path) {
            let replacement = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                other => other.to_string(),
            };
            result = result.replace(&cap[0], &replacement);
        }
    }

    result
}

fn get_nested_value(json: &serde_json::Value, path: &str) -> Option<serde_json::Value> {
    let mut current = json;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::channel::{MessageReceipt, MockMessageChannel};
    use crate::services::directory::MockContactDirectory;
    use crate::workflows::conditions::{
        ConditionClause, ConditionConfig, ConditionOperator, FieldRef,
    };
    use crate::workflows::definition::test_support::linear_workflow;
    use crate::workflows::definition::{Edge, MessageConfig};
    use crate::workflows::delay::{DelaySpec, DelayUnit};
    use crate::workflows::enrollment::test_support::enrollment_at;
    use crate::workflows::enrollment::{AttemptOutcome, EnrollmentStatus};
    use crate::workflows::triggers::TriggerConfig;
    use chrono::TimeZone;
    use serde_json::json;

    fn quiet_directory() -> MockContactDirectory {
        let mut directory = MockContactDirectory::new();
        directory
            .expect_contact_context()
            .returning(|_, _| Ok(ContactSnapshot::default()));
        directory
    }

    fn executor_with(
        channel: MockMessageChannel,
        directory: MockContactDirectory,
    ) -> StepExecutor {
        StepExecutor::new(
            Arc::new(channel),
            Arc::new(directory),
            ExecutorConfig::default(),
        )
    }

    fn message_workflow() -> crate::workflows::definition::WorkflowDefinition {
        linear_workflow(
            TriggerConfig::ContactCreated { source: None },
            vec![
                NodeKind::Message(MessageConfig {
                    template: "Welcome, {{fields.first_name}}!".to_string(),
                }),
                NodeKind::Action(ActionConfig::AddTag {
                    tag_id: Uuid::new_v4(),
                }),
            ],
        )
    }

    #[tokio::test]
    async fn test_message_success_renders_and_advances() {
        let workflow = message_workflow();
        let message_node = workflow.nodes[1].id;
        let action_node = workflow.nodes[2].id;

        let mut channel = MockMessageChannel::new();
        channel
            .expect_send()
            .withf(|_, _, content| content == "Welcome, Ada!")
            .times(1)
            .returning(|_, _, _| {
                Ok(MessageReceipt {
                    external_message_id: "ext-1".to_string(),
                })
            });

        let mut directory = MockContactDirectory::new();
        directory.expect_contact_context().returning(|_, _| {
            Ok(ContactSnapshot {
                custom_fields: json!({ "first_name": "Ada" }),
                ..ContactSnapshot::default()
            })
        });

        let executor = executor_with(channel, directory);
        let mut enrollment = enrollment_at(&workflow, message_node);

        let attempt = executor
            .execute_step(&workflow, &mut enrollment, Utc::now())
            .await
            .unwrap();

        assert_eq!(attempt.outcome, AttemptOutcome::Success);
        assert_eq!(enrollment.status, EnrollmentStatus::Running);
        assert_eq!(enrollment.current_node_id, Some(action_node));
        assert_eq!(enrollment.path, vec![message_node]);
        assert_eq!(
            enrollment.context.get("last_message_id"),
            Some(&json!("ext-1"))
        );
    }

    #[tokio::test]
    async fn test_transient_failures_follow_backoff_schedule_then_fail() {
        let workflow = message_workflow();
        let message_node = workflow.nodes[1].id;

        let mut channel = MockMessageChannel::new();
        channel.expect_send().returning(|_, _, _| {
            Err(SendError::Transient {
                status: 503,
                message: "gateway busy".to_string(),
            })
        });

        let executor = StepExecutor::new(
            Arc::new(channel),
            Arc::new(quiet_directory()),
            ExecutorConfig {
                max_retries: 3,
                retry_base_secs: 3600,
                retry_cap_secs: 24 * 3600,
                send_timeout_secs: 30,
            },
        );

        let mut enrollment = enrollment_at(&workflow, message_node);
        let now = Utc.with_ymd_and_hms(2026, 8, 3, 12, 0, 0).unwrap();

        // 1h -> 2h -> 4h, then failed exactly at the retry boundary
        for expected_hours in [1, 2, 4] {
            let attempt = executor
                .execute_step(&workflow, &mut enrollment, now)
                .await
                .unwrap();
            assert_eq!(attempt.outcome, AttemptOutcome::Failure);
            assert_eq!(enrollment.status, EnrollmentStatus::Waiting);
            assert_eq!(
                enrollment.next_due_at,
                Some(now + chrono::Duration::hours(expected_hours))
            );
        }

        let attempt = executor
            .execute_step(&workflow, &mut enrollment, now)
            .await
            .unwrap();
        assert_eq!(attempt.outcome, AttemptOutcome::Failure);
        assert_eq!(enrollment.status, EnrollmentStatus::Failed);
        assert!(enrollment.last_error.is_some());
    }

    #[tokio::test]
    async fn test_backoff_caps_at_ceiling() {
        let executor = executor_with(MockMessageChannel::new(), MockContactDirectory::new());
        assert_eq!(executor.backoff_delay(0), chrono::Duration::hours(1));
        assert_eq!(executor.backoff_delay(3), chrono::Duration::hours(8));
        assert_eq!(executor.backoff_delay(10), chrono::Duration::hours(24));
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries() {
        let workflow = message_workflow();
        let message_node = workflow.nodes[1].id;

        let mut channel = MockMessageChannel::new();
        channel
            .expect_send()
            .times(1)
            .returning(|_, _, _| Err(SendError::Permanent("invalid recipient".to_string())));

        let executor = executor_with(channel, quiet_directory());
        let mut enrollment = enrollment_at(&workflow, message_node);

        let attempt = executor
            .execute_step(&workflow, &mut enrollment, Utc::now())
            .await
            .unwrap();

        assert_eq!(attempt.outcome, AttemptOutcome::Failure);
        assert_eq!(enrollment.status, EnrollmentStatus::Failed);
        assert_eq!(enrollment.retry_count, 0);
    }

    #[tokio::test]
    async fn test_stop_on_error_fails_on_first_transient_error() {
        let mut workflow = message_workflow();
        workflow.settings.stop_on_error = true;
        let message_node = workflow.nodes[1].id;

        let mut channel = MockMessageChannel::new();
        channel.expect_send().times(1).returning(|_, _, _| {
            Err(SendError::Transient {
                status: 500,
                message: "boom".to_string(),
            })
        });

        let executor = executor_with(channel, quiet_directory());
        let mut enrollment = enrollment_at(&workflow, message_node);

        executor
            .execute_step(&workflow, &mut enrollment, Utc::now())
            .await
            .unwrap();

        assert_eq!(enrollment.status, EnrollmentStatus::Failed);
    }

    #[tokio::test]
    async fn test_delay_node_parks_and_advances_pointer() {
        let tag = Uuid::new_v4();
        let workflow = linear_workflow(
            TriggerConfig::ContactCreated { source: None },
            vec![
                NodeKind::Delay(DelaySpec {
                    amount: 1,
                    unit: DelayUnit::Days,
                    business_hours_only: false,
                    skip_weekends: true,
                    time_of_day: None,
                }),
                NodeKind::Action(ActionConfig::AddTag { tag_id: tag }),
            ],
        );
        let delay_node = workflow.nodes[1].id;
        let action_node = workflow.nodes[2].id;

        let executor = executor_with(MockMessageChannel::new(), MockContactDirectory::new());
        let mut enrollment = enrollment_at(&workflow, delay_node);

        // 2026-08-08 is a Saturday; +1 day lands Sunday, rolled to Monday
        let saturday = Utc.with_ymd_and_hms(2026, 8, 8, 10, 0, 0).unwrap();
        let attempt = executor
            .execute_step(&workflow, &mut enrollment, saturday)
            .await
            .unwrap();

        assert_eq!(attempt.outcome, AttemptOutcome::Success);
        assert_eq!(enrollment.status, EnrollmentStatus::Waiting);
        assert_eq!(enrollment.current_node_id, Some(action_node));
        assert_eq!(
            enrollment.next_due_at,
            Some(Utc.with_ymd_and_hms(2026, 8, 10, 10, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_condition_follows_matching_branch() {
        let workflow = {
            let mut wf = linear_workflow(
                TriggerConfig::ContactCreated { source: None },
                vec![
                    NodeKind::Condition(ConditionConfig {
                        clauses: vec![ConditionClause {
                            logical_operator: None,
                            field: FieldRef::Status,
                            operator: ConditionOperator::Equals,
                            value: json!("active"),
                        }],
                    }),
                    NodeKind::Message(MessageConfig {
                        template: "yes".to_string(),
                    }),
                    NodeKind::Message(MessageConfig {
                        template: "no".to_string(),
                    }),
                ],
            );
            let cond = wf.nodes[1].id;
            wf.edges = vec![
                Edge {
                    source: wf.nodes[0].id,
                    target: cond,
                    source_handle: None,
                    label: None,
                },
                Edge {
                    source: cond,
                    target: wf.nodes[2].id,
                    source_handle: None,
                    label: Some("true".to_string()),
                },
                Edge {
                    source: cond,
                    target: wf.nodes[3].id,
                    source_handle: None,
                    label: Some("false".to_string()),
                },
            ];
            wf
        };
        let cond_node = workflow.nodes[1].id;
        let yes_node = workflow.nodes[2].id;

        let mut directory = MockContactDirectory::new();
        directory.expect_contact_context().returning(|_, _| {
            Ok(ContactSnapshot {
                status: "active".to_string(),
                ..ContactSnapshot::default()
            })
        });

        let executor = executor_with(MockMessageChannel::new(), directory);
        let mut enrollment = enrollment_at(&workflow, cond_node);

        executor
            .execute_step(&workflow, &mut enrollment, Utc::now())
            .await
            .unwrap();

        assert_eq!(enrollment.status, EnrollmentStatus::Running);
        assert_eq!(enrollment.current_node_id, Some(yes_node));
    }

    #[tokio::test]
    async fn test_condition_without_matching_branch_is_config_failure() {
        let workflow = {
            let mut wf = linear_workflow(
                TriggerConfig::ContactCreated { source: None },
                vec![
                    NodeKind::Condition(ConditionConfig { clauses: vec![] }),
                    NodeKind::Message(MessageConfig {
                        template: "yes".to_string(),
                    }),
                ],
            );
            let cond = wf.nodes[1].id;
            // only a "false" branch; empty clauses evaluate true
            wf.edges = vec![
                Edge {
                    source: wf.nodes[0].id,
                    target: cond,
                    source_handle: None,
                    label: None,
                },
                Edge {
                    source: cond,
                    target: wf.nodes[2].id,
                    source_handle: None,
                    label: Some("false".to_string()),
                },
            ];
            wf
        };
        let cond_node = workflow.nodes[1].id;

        let executor = executor_with(MockMessageChannel::new(), quiet_directory());
        let mut enrollment = enrollment_at(&workflow, cond_node);

        let attempt = executor
            .execute_step(&workflow, &mut enrollment, Utc::now())
            .await
            .unwrap();

        assert_eq!(attempt.outcome, AttemptOutcome::Failure);
        assert_eq!(enrollment.status, EnrollmentStatus::Failed);
        assert!(enrollment.last_error.as_deref().unwrap().contains("branch"));
    }

    #[tokio::test]
    async fn test_action_on_last_node_completes_enrollment() {
        let tag = Uuid::new_v4();
        let workflow = linear_workflow(
            TriggerConfig::ContactCreated { source: None },
            vec![NodeKind::Action(ActionConfig::AddTag { tag_id: tag })],
        );
        let action_node = workflow.nodes[1].id;

        let mut directory = MockContactDirectory::new();
        directory
            .expect_apply_mutation()
            .withf(move |_, _, mutation| *mutation == ContactMutation::AddTag { tag_id: tag })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let executor = executor_with(MockMessageChannel::new(), directory);
        let mut enrollment = enrollment_at(&workflow, action_node);

        let attempt = executor
            .execute_step(&workflow, &mut enrollment, Utc::now())
            .await
            .unwrap();

        assert_eq!(attempt.outcome, AttemptOutcome::Success);
        assert_eq!(enrollment.status, EnrollmentStatus::Completed);
        assert!(enrollment.current_node_id.is_none());
    }

    #[tokio::test]
    async fn test_missing_contact_fails_enrollment() {
        let workflow = message_workflow();
        let message_node = workflow.nodes[1].id;

        let mut directory = MockContactDirectory::new();
        directory
            .expect_contact_context()
            .returning(|_, contact| Err(EngineError::Directory(format!("contact {} not found", contact))));

        let executor = executor_with(MockMessageChannel::new(), directory);
        let mut enrollment = enrollment_at(&workflow, message_node);

        let attempt = executor
            .execute_step(&workflow, &mut enrollment, Utc::now())
            .await
            .unwrap();

        assert_eq!(attempt.outcome, AttemptOutcome::Failure);
        assert_eq!(enrollment.status, EnrollmentStatus::Failed);
    }

    #[test]
    fn test_render_template_leaves_unresolved_placeholders() {
        let context = json!({ "fields": { "name": "Ada" } });
        assert_eq!(
            render_template("Hi {{fields.name}}, re: {{fields.order}}", &context),
            "Hi Ada, re: {{fields.order}}"
        );
    }

    #[test]
    fn test_render_template_formats_scalars() {
        let context = json!({ "fields": { "seats": 12, "active": true } });
        assert_eq!(
            render_template("{{fields.seats}} seats, active={{fields.active}}", &context),
            "12 seats, active=true"
        );
    }
}
