// Workflow definitions - the node/edge graph describing one campaign.
//
// Definitions are authored by the web layer and consumed read-only here.
// The engine loads active definitions into memory and refreshes the cache
// on every scheduler tick.

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use super::conditions::ConditionConfig;
use super::delay::DelaySpec;
use super::triggers::TriggerConfig;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "workflow_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

/// Weekly window of countable time for calendar-aware delays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusinessHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub days: Vec<Weekday>,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
        }
    }
}

impl BusinessHours {
    pub fn is_open_day(&self, day: Weekday) -> bool {
        self.days.contains(&day)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkflowSettings {
    pub max_executions_per_contact: Option<i32>,
    pub allow_reentry: bool,
    pub stop_on_reply: bool,
    pub stop_on_error: bool,
    /// Workflow-local timezone as a UTC offset in minutes.
    pub utc_offset_minutes: i32,
    pub business_hours: BusinessHours,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_executions_per_contact: None,
            allow_reentry: false,
            stop_on_reply: false,
            stop_on_error: false,
            utc_offset_minutes: 0,
            business_hours: BusinessHours::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageConfig {
    /// Message body with `{{path}}` placeholders resolved against the
    /// contact snapshot and accumulated enrollment context.
    pub template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionConfig {
    AddTag { tag_id: Uuid },
    RemoveTag { tag_id: Uuid },
    SetField { field: String, value: serde_json::Value },
    Notify { title: String, message: String },
}

/// Node kinds as a sum type; the step executor matches exhaustively so a
/// new kind is a compile-time-checked change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "config", rename_all = "snake_case")]
pub enum NodeKind {
    Trigger(TriggerConfig),
    Message(MessageConfig),
    Delay(DelaySpec),
    Condition(ConditionConfig),
    Action(ActionConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: Uuid,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    pub source: Uuid,
    pub target: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    /// Branch selector for condition nodes ("true" / "false").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub status: WorkflowStatus,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub settings: WorkflowSettings,
    pub date_trigger_fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl WorkflowDefinition {
    pub fn node(&self, id: Uuid) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn trigger_node(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::Trigger(_)))
    }

    pub fn trigger_config(&self) -> Option<&TriggerConfig> {
        self.trigger_node().map(|n| match &n.kind {
            NodeKind::Trigger(cfg) => cfg,
            _ => unreachable!(),
        })
    }

    /// Outgoing edges of a node, in declaration order.
    pub fn outgoing(&self, node_id: Uuid) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    /// Target of the single unlabeled outgoing edge, if any.
    pub fn next_after(&self, node_id: Uuid) -> Option<Uuid> {
        self.outgoing(node_id).next().map(|e| e.target)
    }

    /// Target of the branch whose label matches the condition outcome.
    /// First match wins when a label appears more than once.
    pub fn branch_target(&self, node_id: Uuid, outcome: bool) -> Option<Uuid> {
        let wanted = if outcome { "true" } else { "false" };
        self.outgoing(node_id)
            .find(|e| e.label.as_deref() == Some(wanted))
            .map(|e| e.target)
    }

    /// Node an enrollment starts on: the one downstream of the trigger.
    pub fn entry_node(&self) -> Option<Uuid> {
        self.trigger_node().and_then(|t| self.next_after(t.id))
    }

    /// Structural invariants: exactly one trigger with no incoming edge,
    /// every other node reachable via at least one incoming edge, edge
    /// endpoints resolve, no cycles along the forward-execution relation,
    /// and no condition node with two same-labeled branches.
    pub fn validate(&self) -> EngineResult<()> {
        let triggers: Vec<&Node> = self
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Trigger(_)))
            .collect();

        if triggers.len() != 1 {
            return Err(EngineError::Configuration(format!(
                "workflow {} must have exactly one trigger node, found {}",
                self.id,
                triggers.len()
            )));
        }
        let trigger_id = triggers[0].id;

        let node_ids: HashSet<Uuid> = self.nodes.iter().map(|n| n.id).collect();
        if node_ids.len() != self.nodes.len() {
            return Err(EngineError::Configuration(format!(
                "workflow {} has duplicate node ids",
                self.id
            )));
        }

        let mut incoming: HashMap<Uuid, usize> = HashMap::new();
        for edge in &self.edges {
            if !node_ids.contains(&edge.source) || !node_ids.contains(&edge.target) {
                return Err(EngineError::Configuration(format!(
                    "workflow {} has an edge referencing a missing node",
                    self.id
                )));
            }
            *incoming.entry(edge.target).or_insert(0) += 1;
        }

        if incoming.contains_key(&trigger_id) {
            return Err(EngineError::Configuration(format!(
                "workflow {} trigger node must not have incoming edges",
                self.id
            )));
        }

        for node in &self.nodes {
            if node.id != trigger_id && !incoming.contains_key(&node.id) {
                return Err(EngineError::Configuration(format!(
                    "workflow {} node {} is unreachable (no incoming edge)",
                    self.id, node.id
                )));
            }
        }

        for node in &self.nodes {
            if matches!(node.kind, NodeKind::Condition(_)) {
                let mut seen = HashSet::new();
                for edge in self.outgoing(node.id) {
                    if let Some(label) = &edge.label {
                        if !seen.insert(label.clone()) {
                            return Err(EngineError::Configuration(format!(
                                "workflow {} condition node {} has duplicate '{}' branches",
                                self.id, node.id, label
                            )));
                        }
                    }
                }
            }
        }

        self.check_acyclic(trigger_id)?;

        Ok(())
    }

    // Iterative DFS with a three-color marking; back-edges are not
    // permitted, loops must be modeled as new enrollments.
    fn check_acyclic(&self, start: Uuid) -> EngineResult<()> {
        #[derive(PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }

        let mut marks: HashMap<Uuid, Mark> = HashMap::new();
        let mut stack: Vec<(Uuid, Vec<Uuid>)> = vec![(
            start,
            self.outgoing(start).map(|e| e.target).collect(),
        )];
        marks.insert(start, Mark::InProgress);

        while let Some((node, children)) = stack.last_mut() {
            match children.pop() {
                Some(child) => match marks.get(&child) {
                    Some(Mark::InProgress) => {
                        return Err(EngineError::Configuration(format!(
                            "workflow {} contains a cycle through node {}",
                            self.id, child
                        )));
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(child, Mark::InProgress);
                        let grandchildren = self.outgoing(child).map(|e| e.target).collect();
                        stack.push((child, grandchildren));
                    }
                },
                None => {
                    marks.insert(*node, Mark::Done);
                    stack.pop();
                }
            }
        }

        Ok(())
    }
}

/// In-memory cache of active workflow definitions, reloaded from the
/// store on every scheduler tick.
pub struct DefinitionStore {
    pool: PgPool,
    workflows: Arc<RwLock<Vec<Arc<WorkflowDefinition>>>>,
}

impl DefinitionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            workflows: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Reload all active workflows from the database. Definitions that
    /// fail structural validation are skipped with a warning rather than
    /// poisoning the whole cache.
    pub async fn reload(&self) -> EngineResult<()> {
        type Row = (
            Uuid,
            Uuid,
            String,
            WorkflowStatus,
            serde_json::Value,
            serde_json::Value,
            serde_json::Value,
            Option<DateTime<Utc>>,
            DateTime<Utc>,
            Option<DateTime<Utc>>,
        );

        let rows: Vec<Row> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, name, status, nodes, edges, settings,
                   date_trigger_fired_at, created_at, updated_at
            FROM workflows
            WHERE status = 'active'
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let definitions: Vec<Arc<WorkflowDefinition>> = rows
            .into_iter()
            .filter_map(|row| {
                let id = row.0;
                let parsed = (|| -> Result<WorkflowDefinition, serde_json::Error> {
                    Ok(WorkflowDefinition {
                        id: row.0,
                        tenant_id: row.1,
                        name: row.2,
                        status: row.3,
                        nodes: serde_json::from_value(row.4)?,
                        edges: serde_json::from_value(row.5)?,
                        settings: serde_json::from_value(row.6)?,
                        date_trigger_fired_at: row.7,
                        created_at: row.8,
                        updated_at: row.9,
                    })
                })();

                let definition = match parsed {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("Skipping workflow {}: undecodable graph: {}", id, e);
                        return None;
                    }
                };

                if let Err(e) = definition.validate() {
                    warn!("Skipping workflow {}: {}", id, e);
                    return None;
                }

                Some(Arc::new(definition))
            })
            .collect();

        let mut workflows = self.workflows.write().await;
        *workflows = definitions;

        info!("Loaded {} active workflows", workflows.len());
        Ok(())
    }

    pub async fn active(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.workflows.read().await.clone()
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<WorkflowDefinition>> {
        self.workflows
            .read()
            .await
            .iter()
            .find(|w| w.id == id)
            .cloned()
    }

    /// Atomically claim a workflow's fire-once date trigger. Returns
    /// false when another worker already fired it.
    pub async fn claim_date_trigger(&self, workflow_id: Uuid) -> EngineResult<bool> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE workflows
            SET date_trigger_fired_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'active' AND date_trigger_fired_at IS NULL
            RETURNING id
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::workflows::triggers::TriggerConfig;

    /// Linear workflow: trigger -> rest of `nodes`, edges in order.
    pub fn linear_workflow(trigger: TriggerConfig, rest: Vec<NodeKind>) -> WorkflowDefinition {
        let mut nodes = vec![Node {
            id: Uuid::new_v4(),
            kind: NodeKind::Trigger(trigger),
        }];
        for kind in rest {
            nodes.push(Node {
                id: Uuid::new_v4(),
                kind,
            });
        }

        let edges = nodes
            .windows(2)
            .map(|pair| Edge {
                source: pair[0].id,
                target: pair[1].id,
                source_handle: None,
                label: None,
            })
            .collect();

        WorkflowDefinition {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "test workflow".to_string(),
            status: WorkflowStatus::Active,
            nodes,
            edges,
            settings: WorkflowSettings::default(),
            date_trigger_fired_at: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::linear_workflow;
    use super::*;
    use crate::workflows::triggers::TriggerConfig;

    fn message(template: &str) -> NodeKind {
        NodeKind::Message(MessageConfig {
            template: template.to_string(),
        })
    }

    #[test]
    fn test_valid_linear_workflow() {
        let wf = linear_workflow(TriggerConfig::ContactCreated { source: None }, vec![
            message("hi"),
            NodeKind::Action(ActionConfig::AddTag {
                tag_id: Uuid::new_v4(),
            }),
        ]);

        assert!(wf.validate().is_ok());
        assert_eq!(wf.entry_node(), Some(wf.nodes[1].id));
    }

    #[test]
    fn test_two_triggers_rejected() {
        let mut wf = linear_workflow(
            TriggerConfig::ContactCreated { source: None },
            vec![message("hi")],
        );
        wf.nodes.push(Node {
            id: Uuid::new_v4(),
            kind: NodeKind::Trigger(TriggerConfig::InboundMessage),
        });

        assert!(wf.validate().is_err());
    }

    #[test]
    fn test_unreachable_node_rejected() {
        let mut wf = linear_workflow(
            TriggerConfig::ContactCreated { source: None },
            vec![message("hi")],
        );
        wf.nodes.push(Node {
            id: Uuid::new_v4(),
            kind: message("orphan"),
        });

        assert!(wf.validate().is_err());
    }

    #[test]
    fn test_cycle_rejected() {
        let mut wf = linear_workflow(
            TriggerConfig::ContactCreated { source: None },
            vec![message("a"), message("b")],
        );
        // back-edge from the last node to the first non-trigger node
        wf.edges.push(Edge {
            source: wf.nodes[2].id,
            target: wf.nodes[1].id,
            source_handle: None,
            label: None,
        });

        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_duplicate_branch_labels_rejected() {
        let mut wf = linear_workflow(
            TriggerConfig::ContactCreated { source: None },
            vec![
                NodeKind::Condition(ConditionConfig { clauses: vec![] }),
                message("yes"),
                message("also yes"),
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
                label: Some("true".to_string()),
            },
        ];

        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_branch_target_matches_label() {
        let mut wf = linear_workflow(
            TriggerConfig::ContactCreated { source: None },
            vec![
                NodeKind::Condition(ConditionConfig { clauses: vec![] }),
                message("yes"),
                message("no"),
            ],
        );
        let cond = wf.nodes[1].id;
        let yes = wf.nodes[2].id;
        let no = wf.nodes[3].id;
        wf.edges = vec![
            Edge {
                source: wf.nodes[0].id,
                target: cond,
                source_handle: None,
                label: None,
            },
            Edge {
                source: cond,
                target: yes,
                source_handle: Some("out-true".to_string()),
                label: Some("true".to_string()),
            },
            Edge {
                source: cond,
                target: no,
                source_handle: Some("out-false".to_string()),
                label: Some("false".to_string()),
            },
        ];

        assert_eq!(wf.branch_target(cond, true), Some(yes));
        assert_eq!(wf.branch_target(cond, false), Some(no));
    }

    #[test]
    fn test_node_graph_deserializes_from_authoring_shape() {
        let json = serde_json::json!({
            "id": "7b1c3c0e-95aa-4f2f-9f93-0c8f0f4a6f11",
            "kind": "delay",
            "config": {
                "amount": 1,
                "unit": "days",
                "skip_weekends": true
            }
        });

        let node: Node = serde_json::from_value(json).expect("node should deserialize");
        assert!(matches!(node.kind, NodeKind::Delay(_)));
    }
}
