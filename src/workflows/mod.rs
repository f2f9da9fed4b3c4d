// Campaign workflow engine.
//
// Graph-based automation: a trigger enrolls a contact, the scheduler
// loop advances the enrollment through message/delay/condition/action
// nodes over days or weeks, surviving restarts and concurrent workers.

pub mod conditions;
pub mod definition;
pub mod delay;
pub mod enrollment;
pub mod executor;
pub mod triggers;

pub use conditions::{ConditionClause, ConditionConfig, ConditionOperator, FieldRef, LogicalOperator};
pub use definition::{
    ActionConfig, BusinessHours, DefinitionStore, Edge, MessageConfig, Node, NodeKind,
    WorkflowDefinition, WorkflowSettings, WorkflowStatus,
};
pub use delay::{Calendar, DelaySpec, DelayUnit};
pub use enrollment::{
    AttemptOutcome, Enrollment, EnrollmentStatus, EnrollmentStore, ExecutionAttempt,
};
pub use executor::{ExecutorConfig, StepExecutor};
pub use triggers::{ContactEvent, EventKind, TriggerConfig, TriggerEvaluator};
