//! Composable exception matchers: by error kind, by failure point, by
//! involved task or model. An empty matcher matches every exception;
//! constraints narrow it, `or` widens it with alternatives.

use crate::{
    errors::ErrorKind,
    ident::{Digest, ObjectId},
    internal::{exception::PlanException, plan::Plan},
};

/// A first-class, composable predicate over plan exceptions.
#[derive(Clone, Debug, Default)]
pub struct ExceptionMatcher {
    kinds: Vec<ErrorKind>,
    origin_tasks: Vec<ObjectId>,
    origin_models: Vec<String>,
    involved_tasks: Vec<ObjectId>,
    alternatives: Vec<ExceptionMatcher>,
}

impl ExceptionMatcher {
    /// Matches every exception.
    pub fn any() -> Self {
        Self::default()
    }

    /// Narrow to the given error kind; repeated calls accumulate an
    /// any-of set.
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kinds.push(kind);
        self
    }

    /// Narrow to exceptions whose failure point is the given object.
    pub fn from_point(mut self, task: ObjectId) -> Self {
        self.origin_tasks.push(task);
        self
    }

    /// Narrow to exceptions originating in instances of the named model.
    pub fn from_model(mut self, model: &str) -> Self {
        self.origin_models.push(model.to_string());
        self
    }

    /// Narrow to exceptions whose trace contains the given task.
    pub fn involving(mut self, task: ObjectId) -> Self {
        self.involved_tasks.push(task);
        self
    }

    /// Widen: matches when either side matches.
    pub fn or(mut self, other: ExceptionMatcher) -> Self {
        self.alternatives.push(other);
        self
    }

    /// Evaluate against an exception in the context of a plan (needed for
    /// the model constraint).
    pub fn matches(&self, plan: &Plan, exception: &PlanException) -> bool {
        if self.matches_constraints(plan, exception) {
            return true;
        }
        self.alternatives
            .iter()
            .any(|alt| alt.matches(plan, exception))
    }

    fn matches_constraints(&self, plan: &Plan, exception: &PlanException) -> bool {
        if !self.alternatives.is_empty() && self.is_unconstrained() {
            // a pure `or` wrapper delegates entirely to its alternatives
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&exception.origin.error.kind()) {
            return false;
        }
        if !self.origin_tasks.is_empty()
            && !self.origin_tasks.contains(&exception.origin.point.id())
        {
            return false;
        }
        if !self.origin_models.is_empty() {
            let Ok(task) = plan.task(exception.origin.point.id()) else {
                return false;
            };
            if !self
                .origin_models
                .iter()
                .any(|m| m == task.model().name())
            {
                return false;
            }
        }
        if !self.involved_tasks.is_empty()
            && !self
                .involved_tasks
                .iter()
                .any(|t| exception.involves(*t))
        {
            return false;
        }
        true
    }

    fn is_unconstrained(&self) -> bool {
        self.kinds.is_empty()
            && self.origin_tasks.is_empty()
            && self.origin_models.is_empty()
            && self.involved_tasks.is_empty()
    }

    /// Content digest of the matcher, for exception log records.
    pub fn digest(&self) -> Digest {
        let kinds: Vec<&str> = self.kinds.iter().map(|k| k.as_str()).collect();
        let alternatives: Vec<String> =
            self.alternatives.iter().map(|a| a.digest().to_string()).collect();
        Digest::of_value(&serde_json::json!({
            "kinds": kinds,
            "origin_tasks": self.origin_tasks.iter().map(|t| t.as_u64()).collect::<Vec<_>>(),
            "origin_models": self.origin_models,
            "involved_tasks": self.involved_tasks.iter().map(|t| t.as_u64()).collect::<Vec<_>>(),
            "alternatives": alternatives,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::ExceptionMatcher;
    use crate::{
        errors::{ErrorKind, PlanError},
        ident::ObjectId,
        internal::{
            exception::{FailurePoint, LocalizedError, PlanException},
            plan::Plan,
        },
    };

    fn exception_for(task: ObjectId) -> PlanException {
        PlanException::new(LocalizedError::new(
            PlanError::ChildFailed("child gone".to_string()),
            FailurePoint::Task(task),
        ))
    }

    /// The empty matcher matches everything.
    #[test]
    fn test_any_matches() {
        let plan = Plan::new();
        let exception = exception_for(ObjectId::next());
        assert!(ExceptionMatcher::any().matches(&plan, &exception));
    }

    /// Kind constraints narrow, `or` widens.
    #[test]
    fn test_kind_and_or() {
        let plan = Plan::new();
        let exception = exception_for(ObjectId::next());
        let wrong = ExceptionMatcher::any().with_kind(ErrorKind::TimedOut);
        assert!(!wrong.matches(&plan, &exception));
        let either = wrong.or(ExceptionMatcher::any().with_kind(ErrorKind::ChildFailed));
        assert!(either.matches(&plan, &exception));
    }

    /// Involved-task constraints check the trace.
    #[test]
    fn test_involving() {
        let plan = Plan::new();
        let task = ObjectId::next();
        let exception = exception_for(task);
        assert!(
            ExceptionMatcher::any()
                .involving(task)
                .matches(&plan, &exception)
        );
        assert!(
            !ExceptionMatcher::any()
                .involving(ObjectId::next())
                .matches(&plan, &exception)
        );
    }
}
