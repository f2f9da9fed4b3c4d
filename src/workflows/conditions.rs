// Condition evaluator.
//
// Pure: all inputs are passed in, nothing is mutated, the channel is
// never touched. Clauses combine in declaration order via each clause's
// logical operator; there is no AND-over-OR precedence.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::directory::ContactSnapshot;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    IsEmpty,
    IsNotEmpty,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    And,
    Or,
}

/// What a clause reads from the contact snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldRef {
    Tag { tag_id: Uuid },
    CustomField { name: String },
    LastMessageAt,
    Status,
    Source,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionClause {
    /// Combines this clause with the running result; ignored on the
    /// first clause.
    #[serde(default)]
    pub logical_operator: Option<LogicalOperator>,
    pub field: FieldRef,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionConfig {
    pub clauses: Vec<ConditionClause>,
}

/// Resolve a field reference against the snapshot. Absent custom fields
/// resolve to null, which `is_empty` treats as empty.
fn resolve(field: &FieldRef, snapshot: &ContactSnapshot) -> serde_json::Value {
    match field {
        FieldRef::Tag { tag_id } => serde_json::Value::Bool(snapshot.tags.contains(tag_id)),
        FieldRef::CustomField { name } => snapshot
            .custom_fields
            .get(name)
            .cloned()
            .unwrap_or(serde_json::Value::Null),
        FieldRef::LastMessageAt => snapshot
            .last_message_at
            .map(|t| serde_json::Value::String(t.to_rfc3339()))
            .unwrap_or(serde_json::Value::Null),
        FieldRef::Status => serde_json::Value::String(snapshot.status.clone()),
        FieldRef::Source => serde_json::Value::String(snapshot.source.clone()),
    }
}

fn is_empty(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.is_empty(),
        serde_json::Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

/// Ordering comparison: numbers compare numerically, strings
/// lexicographically (which covers RFC 3339 timestamps). Mixed or
/// non-comparable types yield false rather than an error.
fn compare(actual: &serde_json::Value, expected: &serde_json::Value) -> Option<std::cmp::Ordering> {
    match (actual, expected) {
        (serde_json::Value::Number(a), serde_json::Value::Number(b)) => {
            a.as_f64().zip(b.as_f64()).and_then(|(x, y)| x.partial_cmp(&y))
        }
        (serde_json::Value::String(a), serde_json::Value::String(b)) => Some(a.as_str().cmp(b)),
        _ => None,
    }
}

fn apply_operator(
    operator: ConditionOperator,
    actual: &serde_json::Value,
    expected: &serde_json::Value,
) -> bool {
    match operator {
        ConditionOperator::Equals => actual == expected,
        ConditionOperator::NotEquals => actual != expected,
        ConditionOperator::Contains => match (actual.as_str(), expected.as_str()) {
            (Some(haystack), Some(needle)) => {
                haystack.to_lowercase().contains(&needle.to_lowercase())
            }
            // contains on a non-string value is false, never an error
            _ => false,
        },
        ConditionOperator::NotContains => match (actual.as_str(), expected.as_str()) {
            (Some(haystack), Some(needle)) => {
                !haystack.to_lowercase().contains(&needle.to_lowercase())
            }
            _ => true,
        },
        ConditionOperator::GreaterThan => {
            matches!(compare(actual, expected), Some(std::cmp::Ordering::Greater))
        }
        ConditionOperator::LessThan => {
            matches!(compare(actual, expected), Some(std::cmp::Ordering::Less))
        }
        ConditionOperator::IsEmpty => is_empty(actual),
        ConditionOperator::IsNotEmpty => !is_empty(actual),
    }
}

/// Evaluate a condition node's clauses against a contact snapshot.
///
/// Clauses fold left-to-right with short-circuiting: an `and` clause is
/// skipped once the running result is false, an `or` clause once it is
/// true. An empty clause list is vacuously true.
pub fn evaluate(config: &ConditionConfig, snapshot: &ContactSnapshot) -> bool {
    let mut acc: Option<bool> = None;

    for clause in &config.clauses {
        let op = clause.logical_operator.unwrap_or(LogicalOperator::And);

        match (acc, op) {
            (Some(false), LogicalOperator::And) => continue,
            (Some(true), LogicalOperator::Or) => continue,
            _ => {}
        }

        let actual = resolve(&clause.field, snapshot);
        let outcome = apply_operator(clause.operator, &actual, &clause.value);

        acc = Some(match (acc, op) {
            (None, _) => outcome,
            (Some(a), LogicalOperator::And) => a && outcome,
            (Some(a), LogicalOperator::Or) => a || outcome,
        });
    }

    acc.unwrap_or(true)
}
