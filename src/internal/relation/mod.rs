//! Relation registry and graph set: the fixed family of labelled directed
//! graphs a plan maintains over its tasks and event generators. Each relation
//! declares its scope (task or event), whether it is strong (edges carry
//! children through replacement and forbid endpoint removal), whether it must
//! stay acyclic, and which edge-info payload it stores.
//!
//! Task relations:
//! - **Dependency** — parent needs child; the edge records roles and the
//!   success/failure event policy.
//! - **PlannedBy** — a task and the planner task producing its subplan.
//! - **ExecutionAgent** — a task runs inside another; the agent's `stop`
//!   forces `aborted` on its executed children.
//! - **ErrorHandling** — links a task to the task handling its exceptions.
//!
//! Event relations:
//! - **Signal** — fire the target's command when the source emits.
//! - **Forwarding** — emit the target when the source emits.
//! - **CausalLink** — stored union of Signal and Forwarding.
//! - **Temporal** — ordering constraint consumed by the scheduler.
//! - **SchedulingConstraints** — target is schedulable only if source is.

pub mod graph;
pub mod standard;

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

pub use graph::RelationGraph;
pub use standard::{DependencyInfo, EdgeInfo, TemporalInfo};

use crate::errors::PlanError;

/// Scope of a relation: which vertex population it ranges over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelationScope {
    Task,
    Event,
}

/// The fixed registry of relation types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Dependency,
    PlannedBy,
    ExecutionAgent,
    ErrorHandling,
    Signal,
    Forwarding,
    CausalLink,
    Temporal,
    SchedulingConstraints,
}

impl Relation {
    /// All relations, in registry order. The order is stable: it defines the
    /// graph array layout and the wire ids in the event log.
    pub const ALL: [Relation; 9] = [
        Relation::Dependency,
        Relation::PlannedBy,
        Relation::ExecutionAgent,
        Relation::ErrorHandling,
        Relation::Signal,
        Relation::Forwarding,
        Relation::CausalLink,
        Relation::Temporal,
        Relation::SchedulingConstraints,
    ];

    /// Relations ranging over tasks.
    pub const TASK_RELATIONS: [Relation; 4] = [
        Relation::Dependency,
        Relation::PlannedBy,
        Relation::ExecutionAgent,
        Relation::ErrorHandling,
    ];

    /// Relations ranging over event generators.
    pub const EVENT_RELATIONS: [Relation; 5] = [
        Relation::Signal,
        Relation::Forwarding,
        Relation::CausalLink,
        Relation::Temporal,
        Relation::SchedulingConstraints,
    ];

    pub const fn scope(&self) -> RelationScope {
        match self {
            Relation::Dependency
            | Relation::PlannedBy
            | Relation::ExecutionAgent
            | Relation::ErrorHandling => RelationScope::Task,
            Relation::Signal
            | Relation::Forwarding
            | Relation::CausalLink
            | Relation::Temporal
            | Relation::SchedulingConstraints => RelationScope::Event,
        }
    }

    /// Strong relations forbid removal of the child endpoint while the edge
    /// exists and carry children through plan replacement.
    pub const fn is_strong(&self) -> bool {
        matches!(
            self,
            Relation::Dependency | Relation::PlannedBy | Relation::ExecutionAgent
        )
    }

    /// DAG relations reject cycle-creating edges.
    pub const fn is_dag(&self) -> bool {
        matches!(
            self,
            Relation::Dependency
                | Relation::PlannedBy
                | Relation::ExecutionAgent
                | Relation::Temporal
                | Relation::SchedulingConstraints
        )
    }

    /// Position in [`Relation::ALL`]; used to index the plan's graph array.
    pub fn index(&self) -> usize {
        match self {
            Relation::Dependency => 0,
            Relation::PlannedBy => 1,
            Relation::ExecutionAgent => 2,
            Relation::ErrorHandling => 3,
            Relation::Signal => 4,
            Relation::Forwarding => 5,
            Relation::CausalLink => 6,
            Relation::Temporal => 7,
            Relation::SchedulingConstraints => 8,
        }
    }

    /// Single-byte relation id used by the event log.
    pub fn wire_id(&self) -> u8 {
        self.index() as u8
    }

    /// Decode a wire id back into a relation; `None` for ids added by newer
    /// versions of the format.
    pub fn from_wire_id(id: u8) -> Option<Relation> {
        Relation::ALL.get(id as usize).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Dependency => "dependency",
            Relation::PlannedBy => "planned_by",
            Relation::ExecutionAgent => "execution_agent",
            Relation::ErrorHandling => "error_handling",
            Relation::Signal => "signal",
            Relation::Forwarding => "forwarding",
            Relation::CausalLink => "causal_link",
            Relation::Temporal => "temporal",
            Relation::SchedulingConstraints => "scheduling_constraints",
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Relation {
    type Err = PlanError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "dependency" => Ok(Relation::Dependency),
            "planned_by" => Ok(Relation::PlannedBy),
            "execution_agent" => Ok(Relation::ExecutionAgent),
            "error_handling" => Ok(Relation::ErrorHandling),
            "signal" => Ok(Relation::Signal),
            "forwarding" => Ok(Relation::Forwarding),
            "causal_link" => Ok(Relation::CausalLink),
            "temporal" => Ok(Relation::Temporal),
            "scheduling_constraints" => Ok(Relation::SchedulingConstraints),
            _ => Err(PlanError::InvalidArgument(format!(
                "unknown relation: {value}"
            ))),
        }
    }
}
