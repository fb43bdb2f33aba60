//! Edge-info payloads of the standard relations, their merge policies, and
//! the dependency structure checker that turns broken success/failure
//! policies into localized `ChildFailed` errors.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    errors::PlanError,
    ident::Digest,
    internal::{
        exception::{FailurePoint, LocalizedError},
        plan::Plan,
        relation::Relation,
        task::TaskState,
    },
};

/// Edge info of a Dependency edge: which roles the child fills for the
/// parent, and which child events count as success or failure.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyInfo {
    /// Child roles, e.g. "trajectory" or "localization".
    pub roles: BTreeSet<String>,
    /// Child event symbols whose emission fulfills the dependency.
    pub success: BTreeSet<String>,
    /// Child event symbols whose emission explicitly breaks the dependency.
    pub failure: BTreeSet<String>,
    /// Optional success-predicate model name evaluated by the application.
    pub predicate: Option<String>,
}

impl DependencyInfo {
    /// Dependency fulfilled by the child's `success` event.
    pub fn new() -> Self {
        let mut info = Self::default();
        info.success.insert("success".to_string());
        info
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.roles.insert(role.to_string());
        self
    }

    pub fn success_on(mut self, symbol: &str) -> Self {
        self.success.insert(symbol.to_string());
        self
    }

    pub fn failure_on(mut self, symbol: &str) -> Self {
        self.failure.insert(symbol.to_string());
        self
    }

    /// Merge policy used when an edge target is rewritten during plan
    /// replacement: union of roles and event policies; the newer predicate
    /// wins.
    pub fn merge(mut self, other: DependencyInfo) -> DependencyInfo {
        self.roles.extend(other.roles);
        self.success.extend(other.success);
        self.failure.extend(other.failure);
        if other.predicate.is_some() {
            self.predicate = other.predicate;
        }
        self
    }
}

/// Edge info of a Temporal edge: the source must occur before the target,
/// optionally no later than `max_delay` seconds after it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TemporalInfo {
    pub max_delay: Option<f64>,
}

impl TemporalInfo {
    /// Merge keeps the tighter bound.
    pub fn merge(self, other: TemporalInfo) -> TemporalInfo {
        let max_delay = match (self.max_delay, other.max_delay) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        TemporalInfo { max_delay }
    }
}

/// Per-edge payload stored by the relation graphs. Relations without info
/// use `None`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum EdgeInfo {
    #[default]
    None,
    Dependency(DependencyInfo),
    Temporal(TemporalInfo),
}

impl EdgeInfo {
    /// Merge an existing edge's info with the info of a re-added or
    /// rewritten edge.
    pub fn merge(old: EdgeInfo, new: EdgeInfo) -> EdgeInfo {
        match (old, new) {
            (EdgeInfo::Dependency(a), EdgeInfo::Dependency(b)) => EdgeInfo::Dependency(a.merge(b)),
            (EdgeInfo::Temporal(a), EdgeInfo::Temporal(b)) => EdgeInfo::Temporal(a.merge(b)),
            (EdgeInfo::None, b) => b,
            (a, EdgeInfo::None) => a,
            // mismatched kinds cannot happen through the plan API; keep the newer
            (_, b) => b,
        }
    }

    /// Digest of the info payload, for edge-added log records.
    pub fn digest(&self) -> Digest {
        match self {
            EdgeInfo::None => Digest::zero(),
            other => serde_json::to_value(other)
                .map(|v| Digest::of_value(&v))
                .unwrap_or_else(|_| Digest::zero()),
        }
    }

    pub fn as_dependency(&self) -> Option<&DependencyInfo> {
        match self {
            EdgeInfo::Dependency(info) => Some(info),
            _ => None,
        }
    }

    pub fn as_temporal(&self) -> Option<&TemporalInfo> {
        match self {
            EdgeInfo::Temporal(info) => Some(info),
            _ => None,
        }
    }
}

/// Structure checker of the Dependency relation, run once per cycle after
/// propagation: a child that reached a terminal state through an event
/// outside the edge's success set breaks the dependency.
///
/// An explicit failure event and an unlisted terminal event both produce
/// `ChildFailed`; a fulfilled edge (success event emitted) is removed from
/// the checked set by dropping the edge.
pub(crate) fn check_dependencies(plan: &Plan) -> Vec<LocalizedError> {
    let mut errors = Vec::new();
    let graph = plan.graph(Relation::Dependency);
    for (parent, child, info) in graph.edges() {
        let Ok(task) = plan.task(child) else {
            continue;
        };
        if task.state() != TaskState::Finished {
            continue;
        }
        let policy = info.and_then(|i| i.as_dependency());
        let success: BTreeSet<String> = policy.map(|p| p.success.clone()).unwrap_or_default();
        let terminal = task.terminal_emissions(plan);
        if terminal.iter().any(|symbol| success.contains(symbol)) {
            continue;
        }
        let through = terminal.first().cloned().unwrap_or_else(|| "stop".to_string());
        errors.push(LocalizedError::new(
            PlanError::ChildFailed(format!(
                "task {child} terminated through `{through}`, which parent {parent} does not accept"
            )),
            FailurePoint::Task(child),
        ));
    }
    errors
}
