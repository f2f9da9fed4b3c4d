// Enrollments - one contact's progress through one workflow.
//
// Rows are never deleted; they only transition into a terminal status so
// the execution history stays auditable. Exclusive advancement is
// enforced with a claim lease: `version` is the claim token, bumped on
// every claim and every cancellation, and outcome writes are guarded by
// it so a stale worker can never clobber newer state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::definition::WorkflowDefinition;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "enrollment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl EnrollmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "attempt_outcome", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Skipped,
}

/// Append-only audit record, one per node evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionAttempt {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub enrollment_id: Uuid,
    pub node_id: Uuid,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionAttempt {
    pub fn success(enrollment: &Enrollment, node_id: Uuid) -> Self {
        Self::record(enrollment, node_id, AttemptOutcome::Success, None)
    }

    pub fn failure(enrollment: &Enrollment, node_id: Uuid, error: &str) -> Self {
        Self::record(
            enrollment,
            node_id,
            AttemptOutcome::Failure,
            Some(error.to_string()),
        )
    }

    pub fn skipped(enrollment: &Enrollment, node_id: Uuid) -> Self {
        Self::record(enrollment, node_id, AttemptOutcome::Skipped, None)
    }

    fn record(
        enrollment: &Enrollment,
        node_id: Uuid,
        outcome: AttemptOutcome,
        error: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: enrollment.tenant_id,
            enrollment_id: enrollment.id,
            node_id,
            outcome,
            error,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Enrollment {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub contact_id: Uuid,
    pub status: EnrollmentStatus,
    pub current_node_id: Option<Uuid>,
    /// Visited node ids in execution order.
    pub path: Vec<Uuid>,
    pub next_due_at: Option<DateTime<Utc>>,
    /// Values accumulated from the contact during execution.
    pub context: serde_json::Value,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub version: i64,
    pub claimed_until: Option<DateTime<Utc>>,
    pub claimed_by: Option<Uuid>,
    pub dedup_key: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

fn can_transition(from: EnrollmentStatus, to: EnrollmentStatus) -> bool {
    use EnrollmentStatus::*;
    match (from, to) {
        (Pending, Running) => true,
        (Running, Waiting) | (Waiting, Running) => true,
        (Running, Completed) | (Running, Failed) => true,
        (from, Cancelled) => !from.is_terminal(),
        _ => false,
    }
}

impl Enrollment {
    fn transition(&mut self, to: EnrollmentStatus) -> EngineResult<()> {
        if !can_transition(self.status, to) {
            return Err(EngineError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Pick up a pending or due-waiting enrollment for execution.
    pub fn begin(&mut self) -> EngineResult<()> {
        self.transition(EnrollmentStatus::Running)?;
        self.next_due_at = None;
        Ok(())
    }

    /// Park until `due`, leaving the current node untouched (message
    /// retries re-execute the same node).
    pub fn park_until(&mut self, due: DateTime<Utc>) -> EngineResult<()> {
        self.transition(EnrollmentStatus::Waiting)?;
        self.next_due_at = Some(due);
        Ok(())
    }

    /// Move the pointer to the next node; status stays running so the
    /// current tick keeps stepping.
    pub fn advance_to(&mut self, node_id: Uuid) {
        self.current_node_id = Some(node_id);
    }

    pub fn complete(&mut self) -> EngineResult<()> {
        self.transition(EnrollmentStatus::Completed)?;
        self.current_node_id = None;
        self.next_due_at = None;
        Ok(())
    }

    pub fn fail(&mut self, error: &str) -> EngineResult<()> {
        self.transition(EnrollmentStatus::Failed)?;
        self.last_error = Some(error.to_string());
        self.next_due_at = None;
        Ok(())
    }

    pub fn cancel(&mut self) -> EngineResult<()> {
        self.transition(EnrollmentStatus::Cancelled)?;
        self.next_due_at = None;
        Ok(())
    }
}

/// Persistence for enrollments and their audit trail.
#[derive(Clone)]
pub struct EnrollmentStore {
    pool: PgPool,
}

impl EnrollmentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create an enrollment for a matched trigger.
    ///
    /// The insert is an upsert keyed by (workflow, contact) when
    /// re-entry is disallowed: the nil dedup key collides with any open
    /// enrollment on the partial unique index and the redelivered event
    /// becomes a no-op. The `max_executions_per_contact` cap is checked
    /// inside the same statement.
    pub async fn create(
        &self,
        workflow: &WorkflowDefinition,
        contact_id: Uuid,
    ) -> EngineResult<Option<Uuid>> {
        let entry_node = match workflow.entry_node() {
            Some(node) => node,
            None => {
                return Err(EngineError::Configuration(format!(
                    "workflow {} trigger has no downstream node",
                    workflow.id
                )))
            }
        };

        let id = Uuid::new_v4();
        let dedup_key = if workflow.settings.allow_reentry {
            id
        } else {
            Uuid::nil()
        };

        let created: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO enrollments
                (id, tenant_id, workflow_id, contact_id, status, current_node_id, dedup_key, created_at)
            SELECT $1, $2, $3, $4, 'pending', $5, $6, NOW()
            WHERE $7::int IS NULL
               OR (SELECT COUNT(*) FROM enrollments
                   WHERE workflow_id = $3 AND contact_id = $4) < $7
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(workflow.tenant_id)
        .bind(workflow.id)
        .bind(contact_id)
        .bind(entry_node)
        .bind(dedup_key)
        .bind(workflow.settings.max_executions_per_contact)
        .fetch_optional(&self.pool)
        .await?;

        Ok(created.map(|row| row.0))
    }

    /// Claim a batch of due enrollments for this worker.
    ///
    /// Due means pending, running (a lease that lapsed mid-flight), or
    /// waiting with `next_due_at` in the past. `FOR UPDATE SKIP LOCKED`
    /// keeps concurrent workers from selecting the same rows, and the
    /// lease keeps a claim exclusive across ticks until it expires.
    pub async fn claim_due_batch(
        &self,
        now: DateTime<Utc>,
        batch_size: i64,
        lease_secs: i64,
        worker_id: Uuid,
    ) -> EngineResult<Vec<Enrollment>> {
        let claimed: Vec<Enrollment> = sqlx::query_as(
            r#"
            WITH due AS (
                SELECT id FROM enrollments
                WHERE (status IN ('pending', 'running')
                       OR (status = 'waiting' AND next_due_at <= $1))
                  AND (claimed_until IS NULL OR claimed_until < $1)
                ORDER BY next_due_at ASC NULLS FIRST
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE enrollments e
            SET claimed_until = $1 + make_interval(secs => $3),
                claimed_by = $4,
                version = version + 1,
                updated_at = $1
            FROM due
            WHERE e.id = due.id
            RETURNING e.*
            "#,
        )
        .bind(now)
        .bind(batch_size)
        .bind(lease_secs as f64)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(claimed)
    }

    /// Write the post-execution state of a claimed enrollment and
    /// release the claim.
    ///
    /// Guarded by the claim token and by terminal-status protection: a
    /// cancellation written while this step was in flight bumps the
    /// version, the guarded update misses, and the step's state is
    /// dropped (the step itself may still have completed once, per the
    /// eventual-consistency contract). Returns whether the write landed.
    pub async fn persist_outcome(&self, enrollment: &Enrollment) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE enrollments
            SET status = $2, current_node_id = $3, path = $4, next_due_at = $5,
                context = $6, retry_count = $7, last_error = $8,
                claimed_until = NULL, claimed_by = NULL, updated_at = NOW()
            WHERE id = $1 AND version = $9 AND status <> 'cancelled'
            "#,
        )
        .bind(enrollment.id)
        .bind(enrollment.status)
        .bind(enrollment.current_node_id)
        .bind(&enrollment.path)
        .bind(enrollment.next_due_at)
        .bind(&enrollment.context)
        .bind(enrollment.retry_count)
        .bind(&enrollment.last_error)
        .bind(enrollment.version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Record the error of an aborted step without releasing the claim;
    /// the lease expires on its own and a later tick retries the node.
    pub async fn record_step_error(&self, enrollment_id: Uuid, error: &str) -> EngineResult<()> {
        sqlx::query(
            "UPDATE enrollments SET last_error = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(enrollment_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cancel one enrollment (manual operator action). The version bump
    /// invalidates any in-flight claim's outcome write.
    pub async fn cancel(&self, enrollment_id: Uuid) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE enrollments
            SET status = 'cancelled', version = version + 1, updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'running', 'waiting')
            "#,
        )
        .bind(enrollment_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Cancel all open enrollments for a contact in workflows that stop
    /// on reply. Applied lazily: the next scheduler observation honors
    /// the cancelled status.
    pub async fn cancel_on_reply(&self, tenant_id: Uuid, contact_id: Uuid) -> EngineResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE enrollments e
            SET status = 'cancelled', version = e.version + 1, updated_at = NOW()
            FROM workflows w
            WHERE e.workflow_id = w.id
              AND e.tenant_id = $1
              AND e.contact_id = $2
              AND e.status IN ('pending', 'running', 'waiting')
              AND (w.settings ->> 'stop_on_reply')::boolean IS TRUE
            "#,
        )
        .bind(tenant_id)
        .bind(contact_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn insert_attempt(&self, attempt: &ExecutionAttempt) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_attempts
                (id, tenant_id, enrollment_id, node_id, outcome, error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.tenant_id)
        .bind(attempt.enrollment_id)
        .bind(attempt.node_id)
        .bind(attempt.outcome)
        .bind(&attempt.error)
        .bind(attempt.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find(&self, enrollment_id: Uuid) -> EngineResult<Option<Enrollment>> {
        let enrollment = sqlx::query_as("SELECT * FROM enrollments WHERE id = $1")
            .bind(enrollment_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(enrollment)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::enrollment_at;
    use super::*;
    use crate::workflows::definition::test_support::linear_workflow;
    use crate::workflows::definition::{MessageConfig, NodeKind};
    use crate::workflows::triggers::TriggerConfig;

    fn sample() -> Enrollment {
        let wf = linear_workflow(
            TriggerConfig::ContactCreated { source: None },
            vec![NodeKind::Message(MessageConfig {
                template: "hi".to_string(),
            })],
        );
        let node = wf.nodes[1].id;
        enrollment_at(&wf, node)
    }

    #[test]
    fn test_lifecycle_pending_running_waiting_completed() {
        let mut e = sample();

        e.begin().unwrap();
        assert_eq!(e.status, EnrollmentStatus::Running);

        e.park_until(Utc::now()).unwrap();
        assert_eq!(e.status, EnrollmentStatus::Waiting);
        assert!(e.next_due_at.is_some());

        e.begin().unwrap();
        assert!(e.next_due_at.is_none());

        e.complete().unwrap();
        assert_eq!(e.status, EnrollmentStatus::Completed);
        assert!(e.current_node_id.is_none());
    }

    #[test]
    fn test_terminal_states_never_transition() {
        let mut e = sample();
        e.begin().unwrap();
        e.complete().unwrap();

        assert!(e.begin().is_err());
        assert!(e.cancel().is_err());
        assert!(e.fail("boom").is_err());
        assert_eq!(e.status, EnrollmentStatus::Completed);
    }

    #[test]
    fn test_cancel_reachable_from_any_open_state() {
        let mut pending = sample();
        assert!(pending.cancel().is_ok());

        let mut waiting = sample();
        waiting.begin().unwrap();
        waiting.park_until(Utc::now()).unwrap();
        assert!(waiting.cancel().is_ok());
        assert!(waiting.next_due_at.is_none());
    }

    #[test]
    fn test_pending_cannot_park_or_complete() {
        let mut e = sample();
        assert!(e.park_until(Utc::now()).is_err());
        assert!(e.complete().is_err());
        assert_eq!(e.status, EnrollmentStatus::Pending);
    }

    #[test]
    fn test_fail_records_error() {
        let mut e = sample();
        e.begin().unwrap();
        e.fail("channel rejected send").unwrap();

        assert_eq!(e.status, EnrollmentStatus::Failed);
        assert_eq!(e.last_error.as_deref(), Some("channel rejected send"));
    }
}
