// Trigger evaluation - turning external events into enrollments.
//
// Event-driven triggers match on kind plus the trigger node's filter.
// date_time triggers are not event-driven at all; the scheduler loop
// evaluates them against the wall clock on each tick.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::definition::{DefinitionStore, WorkflowDefinition};
use super::enrollment::EnrollmentStore;
use crate::error::EngineResult;

/// Kinds of directory events that can start (or stop) enrollments.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ContactCreated,
    TagApplied,
    FieldChanged,
    InboundMessage,
}

/// A typed event delivered by the directory's event source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactEvent {
    pub event_id: Uuid,
    pub tenant_id: Uuid,
    pub contact_id: Uuid,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl ContactEvent {
    pub fn new(
        tenant_id: Uuid,
        contact_id: Uuid,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            tenant_id,
            contact_id,
            kind,
            payload,
            occurred_at: Utc::now(),
        }
    }

    pub fn contact_created(tenant_id: Uuid, contact_id: Uuid, source: &str) -> Self {
        Self::new(
            tenant_id,
            contact_id,
            EventKind::ContactCreated,
            serde_json::json!({ "source": source }),
        )
    }

    pub fn tag_applied(tenant_id: Uuid, contact_id: Uuid, tag_id: Uuid) -> Self {
        Self::new(
            tenant_id,
            contact_id,
            EventKind::TagApplied,
            serde_json::json!({ "tag_id": tag_id }),
        )
    }

    pub fn field_changed(
        tenant_id: Uuid,
        contact_id: Uuid,
        field: &str,
        new_value: serde_json::Value,
    ) -> Self {
        Self::new(
            tenant_id,
            contact_id,
            EventKind::FieldChanged,
            serde_json::json!({ "field": field, "new_value": new_value }),
        )
    }

    pub fn inbound_message(tenant_id: Uuid, contact_id: Uuid, body_preview: &str) -> Self {
        Self::new(
            tenant_id,
            contact_id,
            EventKind::InboundMessage,
            serde_json::json!({ "body_preview": body_preview }),
        )
    }
}

/// Trigger-node configuration: what starts an enrollment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    ContactCreated {
        /// Only contacts from this acquisition source, when set.
        #[serde(default)]
        source: Option<String>,
    },
    TagApplied {
        /// Matching tag ids; empty matches any tag.
        #[serde(default)]
        tag_ids: Vec<Uuid>,
    },
    FieldChanged {
        field: String,
        /// Expected new value, when set.
        #[serde(default)]
        equals: Option<serde_json::Value>,
    },
    InboundMessage,
    /// Fire-once wall-clock trigger, evaluated on scheduler ticks.
    DateTime {
        at: DateTime<Utc>,
        /// Contacts carrying this tag are enrolled when the trigger fires.
        audience_tag_id: Option<Uuid>,
    },
}

impl TriggerConfig {
    /// Whether this trigger matches an external event.
    pub fn matches(&self, event: &ContactEvent) -> bool {
        match self {
            TriggerConfig::ContactCreated { source } => {
                event.kind == EventKind::ContactCreated
                    && source.as_ref().map_or(true, |wanted| {
                        event.payload.get("source").and_then(|v| v.as_str()) == Some(wanted)
                    })
            }
            TriggerConfig::TagApplied { tag_ids } => {
                event.kind == EventKind::TagApplied && {
                    let applied = event
                        .payload
                        .get("tag_id")
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse::<Uuid>().ok());
                    match applied {
                        Some(tag) => tag_ids.is_empty() || tag_ids.contains(&tag),
                        None => false,
                    }
                }
            }
            TriggerConfig::FieldChanged { field, equals } => {
                event.kind == EventKind::FieldChanged
                    && event.payload.get("field").and_then(|v| v.as_str()) == Some(field.as_str())
                    && equals
                        .as_ref()
                        .map_or(true, |wanted| event.payload.get("new_value") == Some(wanted))
            }
            TriggerConfig::InboundMessage => event.kind == EventKind::InboundMessage,
            // never event-driven
            TriggerConfig::DateTime { .. } => false,
        }
    }
}

/// Converts external events into enrollments against matching active
/// workflows, and applies the stop-on-reply rule for inbound messages.
pub struct TriggerEvaluator {
    definitions: Arc<DefinitionStore>,
    store: EnrollmentStore,
}

impl TriggerEvaluator {
    pub fn new(definitions: Arc<DefinitionStore>, store: EnrollmentStore) -> Self {
        Self { definitions, store }
    }

    /// Process one external event. Returns the ids of enrollments the
    /// event created; redelivered events create nothing because the
    /// enrollment insert is an idempotent upsert.
    pub async fn handle_event(&self, event: &ContactEvent) -> EngineResult<Vec<Uuid>> {
        if event.kind == EventKind::InboundMessage {
            let cancelled = self
                .store
                .cancel_on_reply(event.tenant_id, event.contact_id)
                .await?;
            if cancelled > 0 {
                info!(
                    "Inbound message from contact {} cancelled {} enrollment(s)",
                    event.contact_id, cancelled
                );
            }
        }

        let mut created = Vec::new();

        for workflow in self.definitions.active().await {
            if workflow.tenant_id != event.tenant_id {
                continue;
            }

            let matches = workflow
                .trigger_config()
                .map_or(false, |trigger| trigger.matches(event));
            if !matches {
                continue;
            }

            match self.enroll(&workflow, event.contact_id).await? {
                Some(id) => {
                    info!(
                        "Enrolled contact {} into workflow '{}'",
                        event.contact_id, workflow.name
                    );
                    created.push(id);
                }
                None => {
                    // open enrollment already exists or the per-contact
                    // cap is reached
                    info!(
                        "Skipped enrolling contact {} into workflow '{}'",
                        event.contact_id, workflow.name
                    );
                }
            }
        }

        Ok(created)
    }

    /// Enroll one contact, honoring re-entry and execution-cap
    /// invariants. `None` means the enrollment was suppressed.
    pub async fn enroll(
        &self,
        workflow: &WorkflowDefinition,
        contact_id: Uuid,
    ) -> EngineResult<Option<Uuid>> {
        match self.store.create(workflow, contact_id).await {
            Ok(created) => Ok(created),
            Err(e) => {
                warn!(
                    "Failed to enroll contact {} into workflow {}: {}",
                    contact_id, workflow.id, e
                );
                Err(e)
            }
        }
    }
}
