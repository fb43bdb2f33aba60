//! Breadth-first traversal of the Dependency relation that offers each
//! localized error to task-level and plan-global handlers, level by level.
//! Handled exceptions stop; fatal ones mark every ancestor for fault
//! reaction; what survives becomes plan-level and fault-reacts its trace.

use ahash::AHashSet;

use super::{
    ExceptionHandler, ExceptionMatcher, ExceptionStatus, FailurePoint, HandlerDisposition,
    LocalizedError, PlanException,
};
use crate::{
    ident::ObjectId,
    internal::{engine::propagation::Propagation, relation::Relation},
};

/// Propagate a batch of localized errors. Returns every exception with its
/// final status; fault reactions are already queued on the propagation.
pub(crate) fn propagate_exceptions(
    propagation: &mut Propagation<'_>,
    errors: Vec<LocalizedError>,
    global_handlers: &[(ExceptionMatcher, ExceptionHandler)],
) -> Vec<(PlanException, ExceptionStatus)> {
    let mut results = Vec::new();
    for error in errors {
        let mut exception = PlanException::new(error);
        let origin_task = match exception.origin.point {
            FailurePoint::Task(id) => Some(id),
            FailurePoint::Event(id) => {
                propagation.plan().get_event(id).and_then(|g| g.task())
            }
        };

        let mut status: Option<ExceptionStatus> = None;
        if let Some(origin) = origin_task {
            exception.trace = vec![origin];
            let mut visited: AHashSet<ObjectId> = AHashSet::new();
            visited.insert(origin);
            let mut level = vec![origin];
            'walk: while !level.is_empty() {
                for task_id in &level {
                    let mut handlers = match propagation.plan().get_task(*task_id) {
                        Some(task) => task.exception_handlers(),
                        None => continue,
                    };
                    // tasks delegated to through the ErrorHandling relation
                    // are consulted right after the task's own handlers
                    let delegates: Vec<ObjectId> = propagation
                        .plan()
                        .graph(Relation::ErrorHandling)
                        .children(*task_id)
                        .collect();
                    for delegate in delegates {
                        if let Some(task) = propagation.plan().get_task(delegate) {
                            handlers.extend(task.exception_handlers());
                        }
                    }
                    for (matcher, handler) in handlers {
                        if !matcher.matches(propagation.plan(), &exception) {
                            continue;
                        }
                        match handler(propagation, &mut exception) {
                            HandlerDisposition::Handled => {
                                exception.handled_by = Some(*task_id);
                                status = Some(ExceptionStatus::Handled);
                                break 'walk;
                            }
                            HandlerDisposition::Fatal => {
                                exception.fatal = true;
                                status = Some(ExceptionStatus::Fatal);
                                break 'walk;
                            }
                            HandlerDisposition::Unhandled => {}
                        }
                    }
                }
                let mut next = Vec::new();
                for task_id in &level {
                    for parent in propagation
                        .plan()
                        .graph(Relation::Dependency)
                        .parents(*task_id)
                    {
                        if visited.insert(parent) {
                            exception.trace.push(parent);
                            next.push(parent);
                        }
                    }
                }
                level = next;
            }
        }

        // plan-global handlers get the survivors
        if status.is_none() {
            for (matcher, handler) in global_handlers {
                if !matcher.matches(propagation.plan(), &exception) {
                    continue;
                }
                match handler(propagation, &mut exception) {
                    HandlerDisposition::Handled => {
                        status = Some(ExceptionStatus::Handled);
                        break;
                    }
                    HandlerDisposition::Fatal => {
                        exception.fatal = true;
                        status = Some(ExceptionStatus::Fatal);
                        break;
                    }
                    HandlerDisposition::Unhandled => {}
                }
            }
        }

        let status = match status {
            Some(ExceptionStatus::Handled) => ExceptionStatus::Handled,
            Some(ExceptionStatus::Fatal) => {
                // fatal reaches every ancestor, not just the visited levels
                if let Some(origin) = origin_task {
                    let ancestors = propagation
                        .plan()
                        .graph(Relation::Dependency)
                        .reaches(origin);
                    for task in ancestors {
                        if !exception.trace.contains(&task) {
                            exception.trace.push(task);
                        }
                    }
                }
                for task in exception.trace.clone() {
                    propagation.fault_reaction(task);
                }
                ExceptionStatus::Fatal
            }
            _ => {
                // unrecovered: the involved tasks are forcibly driven to
                // their terminal event, then fall to the garbage collector
                for task in exception.trace.clone() {
                    propagation.fault_reaction(task);
                }
                ExceptionStatus::PlanLevel
            }
        };
        results.push((exception, status));
    }
    results
}
