//! Task queries: composable predicates over a plan's tasks. Model and state
//! filters resolve through the plan indexes in O(1) per candidate; neighbour
//! filters cost O(degree) on the chosen relation.

use serde_json::Value;

use crate::{
    ident::ObjectId,
    internal::{
        plan::Plan,
        relation::Relation,
        task::TaskState,
    },
};

/// A composable task matcher. Build it with the chained `with_*`/state
/// methods, then run [`TaskQuery::evaluate`] or test a single candidate with
/// [`TaskQuery::matches`].
#[derive(Clone, Debug, Default)]
pub struct TaskQuery {
    model: Option<String>,
    states: Vec<TaskState>,
    not_finished: bool,
    interruptible: bool,
    arguments: Vec<(String, Value)>,
    mission: Option<bool>,
    permanent: Option<bool>,
    child_constraints: Vec<(Relation, Box<TaskQuery>)>,
    parent_constraints: Vec<(Relation, Box<TaskQuery>)>,
}

impl TaskQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep tasks of the named model.
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    /// Keep tasks in the given state; repeated calls accumulate an any-of
    /// set.
    pub fn in_state(mut self, state: TaskState) -> Self {
        self.states.push(state);
        self
    }

    pub fn pending(self) -> Self {
        self.in_state(TaskState::Pending)
    }

    pub fn running(self) -> Self {
        self.in_state(TaskState::Running)
    }

    pub fn finishing(self) -> Self {
        self.in_state(TaskState::Finishing)
    }

    pub fn finished(self) -> Self {
        self.in_state(TaskState::Finished)
    }

    /// Keep tasks that have not reached their terminal state.
    pub fn not_finished(mut self) -> Self {
        self.not_finished = true;
        self
    }

    /// Keep running tasks whose stop event is controllable.
    pub fn interruptible(mut self) -> Self {
        self.interruptible = true;
        self
    }

    /// Keep tasks whose argument `name` is set to `value`.
    pub fn with_argument(mut self, name: &str, value: Value) -> Self {
        self.arguments.push((name.to_string(), value));
        self
    }

    /// Keep (non-)mission tasks.
    pub fn mission(mut self, mission: bool) -> Self {
        self.mission = Some(mission);
        self
    }

    /// Keep (non-)permanent tasks.
    pub fn permanent(mut self, permanent: bool) -> Self {
        self.permanent = Some(permanent);
        self
    }

    /// Keep tasks with at least one child matching `query` in `relation`.
    pub fn with_child(mut self, relation: Relation, query: TaskQuery) -> Self {
        self.child_constraints.push((relation, Box::new(query)));
        self
    }

    /// Keep tasks with at least one parent matching `query` in `relation`.
    pub fn with_parent(mut self, relation: Relation, query: TaskQuery) -> Self {
        self.parent_constraints.push((relation, Box::new(query)));
        self
    }

    /// Evaluate against a plan, returning matching task ids. The candidate
    /// set comes from the most selective index available (model index, then
    /// state index), falling back to a full scan.
    pub fn evaluate(&self, plan: &Plan) -> Vec<ObjectId> {
        let candidates: Vec<ObjectId> = if let Some(model) = &self.model {
            plan.tasks_by_model(model)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default()
        } else if self.states.len() == 1 {
            plan.tasks_in_state(self.states[0]).iter().copied().collect()
        } else {
            plan.task_ids().collect()
        };
        let mut result: Vec<ObjectId> = candidates
            .into_iter()
            .filter(|id| self.matches(plan, *id))
            .collect();
        result.sort();
        result
    }

    /// Test one candidate.
    pub fn matches(&self, plan: &Plan, id: ObjectId) -> bool {
        let Ok(task) = plan.task(id) else {
            return false;
        };
        if let Some(model) = &self.model
            && task.model().name() != model
        {
            return false;
        }
        if !self.states.is_empty() && !self.states.contains(&task.state()) {
            return false;
        }
        if self.not_finished && task.state() == TaskState::Finished {
            return false;
        }
        if self.interruptible && !task.interruptible() {
            return false;
        }
        for (name, value) in &self.arguments {
            if task.arguments().get(name) != Some(value) {
                return false;
            }
        }
        if let Some(mission) = self.mission
            && plan.is_mission(id) != mission
        {
            return false;
        }
        if let Some(permanent) = self.permanent
            && plan.is_permanent_task(id) != permanent
        {
            return false;
        }
        for (relation, query) in &self.child_constraints {
            if !plan
                .graph(*relation)
                .children(id)
                .any(|child| query.matches(plan, child))
            {
                return false;
            }
        }
        for (relation, query) in &self.parent_constraints {
            if !plan
                .graph(*relation)
                .parents(id)
                .any(|parent| query.matches(plan, parent))
            {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::TaskQuery;
    use crate::internal::{
        plan::Plan,
        relation::{DependencyInfo, EdgeInfo, Relation},
        task::{Task, TaskModel, TaskState},
    };

    fn sample_plan() -> (Plan, crate::ident::ObjectId, crate::ident::ObjectId) {
        let mut plan = Plan::new();
        let move_model =
            Arc::new(TaskModel::new("MoveTo").with_argument("goal", true, None));
        let parent = plan
            .add_task(Task::with_arguments(move_model.clone(), [("goal", json!([10, 20]))]))
            .unwrap();
        let child = plan
            .add_task(Task::new(Arc::new(TaskModel::new("ComputePath"))))
            .unwrap();
        plan.add_edge(
            Relation::Dependency,
            parent,
            child,
            EdgeInfo::Dependency(DependencyInfo::new()),
        )
        .unwrap();
        (plan, parent, child)
    }

    /// Model and argument filters compose.
    #[test]
    fn test_model_and_argument_filter() {
        let (plan, parent, _) = sample_plan();
        let hits = plan
            .find_tasks()
            .with_model("MoveTo")
            .with_argument("goal", json!([10, 20]))
            .evaluate(&plan);
        assert_eq!(hits, vec![parent]);
        let misses = plan
            .find_tasks()
            .with_model("MoveTo")
            .with_argument("goal", json!([0, 0]))
            .evaluate(&plan);
        assert!(misses.is_empty());
    }

    /// State filters use the state index.
    #[test]
    fn test_state_filter() {
        let (mut plan, parent, child) = sample_plan();
        plan.set_task_state(parent, TaskState::Running);
        let running = plan.find_tasks().running().evaluate(&plan);
        assert_eq!(running, vec![parent]);
        let pending = plan.find_tasks().pending().evaluate(&plan);
        assert_eq!(pending, vec![child]);
    }

    /// Neighbour constraints check the chosen relation.
    #[test]
    fn test_child_constraint() {
        let (plan, parent, child) = sample_plan();
        let with_child = plan
            .find_tasks()
            .with_child(
                Relation::Dependency,
                TaskQuery::new().with_model("ComputePath"),
            )
            .evaluate(&plan);
        assert_eq!(with_child, vec![parent]);
        let with_parent = plan
            .find_tasks()
            .with_parent(Relation::Dependency, TaskQuery::new().with_model("MoveTo"))
            .evaluate(&plan);
        assert_eq!(with_parent, vec![child]);
    }

    /// Mission flags are part of the matcher API.
    #[test]
    fn test_mission_filter() {
        let (mut plan, parent, _) = sample_plan();
        plan.add_mission(parent).unwrap();
        let missions = plan.find_tasks().mission(true).evaluate(&plan);
        assert_eq!(missions, vec![parent]);
    }
}
