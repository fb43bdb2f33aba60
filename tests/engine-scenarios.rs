//! End-to-end scenarios driving a full engine: task polling, plan repair
//! through replacement, event combinators, unreachability propagation, and
//! dependency failure handling.

use std::{cell::{Cell, RefCell}, rc::Rc, sync::Arc};

use serde_json::json;
use tracing_subscriber::util::SubscriberInitExt;

use plan_kernel::{
    config::EngineConfig,
    errors::ErrorKind,
    internal::{
        engine::ExecutionEngine,
        event::{EventGenerator, and},
        exception::{ExceptionMatcher, HandlerDisposition},
        plan::Plan,
        relation::{DependencyInfo, EdgeInfo, Relation},
        task::{Task, TaskModel, TaskState},
    },
};

fn init_logger() {
    let _ = tracing_subscriber::fmt::Subscriber::builder()
        .with_target(false)
        .without_time()
        .with_level(true)
        .with_max_level(tracing::Level::DEBUG)
        .finish()
        .try_init();
}

fn engine() -> ExecutionEngine {
    ExecutionEngine::new(Plan::new(), EngineConfig::default())
}

/// A GoForward mission polls its way forward; stop! terminates it with
/// exactly one stop emission.
#[test]
fn test_go_forward() {
    init_logger();
    let position = Rc::new(RefCell::new(0.0_f64));
    let poll_position = position.clone();
    let model = Arc::new(
        TaskModel::new("GoForward")
            .with_argument("speed", true, None)
            .with_poll(Rc::new(move |propagation, task| {
                let speed = propagation
                    .plan()
                    .task(task)?
                    .arguments()
                    .get("speed")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0);
                *poll_position.borrow_mut() += speed;
                Ok(())
            })),
    );

    let mut engine = engine();
    let task = engine
        .plan_mut()
        .add_task(Task::with_arguments(model, [("speed", json!(0.1))]))
        .unwrap();
    engine.plan_mut().add_mission(task).unwrap();

    // first cycle starts the mission, the next 30 poll it forward
    engine.step().unwrap();
    assert_eq!(engine.plan().task(task).unwrap().state(), TaskState::Running);
    for _ in 0..30 {
        engine.step().unwrap();
    }
    assert!((*position.borrow() - 3.0).abs() < 1e-9);

    let stop = engine.plan().task(task).unwrap().stop_event().unwrap();
    engine.call(stop, None).unwrap();
    let history = engine.plan().event(stop).unwrap().history();
    assert_eq!(history.len(), 1);
    assert_ne!(engine.plan().task(task).unwrap().state(), TaskState::Running);
    assert_eq!(engine.plan().task(task).unwrap().state(), TaskState::Finished);
}

/// An abstract placeholder planned by a planner task is replaced by the
/// concrete subplan once planning succeeds; the placeholder and the planner
/// are collected.
#[test]
fn test_planned_move() {
    init_logger();
    let mut engine = engine();

    let placeholder_model = Arc::new(
        TaskModel::new("MoveTo")
            .with_argument("goal", true, None)
            .make_abstract(),
    );
    let placeholder = engine
        .plan_mut()
        .add_task(Task::with_arguments(placeholder_model, [("goal", json!([10, 20]))]))
        .unwrap();
    engine.plan_mut().add_mission(placeholder).unwrap();

    // the planner succeeds as soon as it runs
    let planner_model = Arc::new(TaskModel::new("PlannerTask").with_poll(Rc::new(
        |propagation, task| {
            let success = propagation.plan().task(task)?.event("success")?;
            if !propagation.plan().event(success)?.emitted() {
                propagation.emit(success, None)?;
            }
            Ok(())
        },
    )));
    let planner = engine.plan_mut().add_task(Task::new(planner_model)).unwrap();
    engine
        .plan_mut()
        .add_edge(Relation::PlannedBy, placeholder, planner, EdgeInfo::None)
        .unwrap();

    // planning result: a concrete MoveTo over ComputePath and ExecutePath
    let concrete_slot: Rc<Cell<Option<plan_kernel::ident::ObjectId>>> =
        Rc::new(Cell::new(None));
    let handler_slot = concrete_slot.clone();
    let planner_success = engine.plan().task(planner).unwrap().event("success").unwrap();
    engine
        .on_event(
            planner_success,
            Rc::new(move |propagation, _emission| {
                let plan = propagation.plan_mut();
                let concrete = plan.add_task(Task::with_arguments(
                    Arc::new(TaskModel::new("MoveTo").with_argument("goal", true, None)),
                    [("goal", json!([10, 20]))],
                ))?;
                let compute = plan.add_task(Task::with_arguments(
                    Arc::new(TaskModel::new("ComputePath").with_argument("goal", true, None)),
                    [("goal", json!([10, 20]))],
                ))?;
                let execute = plan.add_task(Task::new(Arc::new(TaskModel::new("ExecutePath"))))?;
                plan.add_edge(
                    Relation::Dependency,
                    concrete,
                    compute,
                    EdgeInfo::Dependency(DependencyInfo::new()),
                )?;
                plan.add_edge(
                    Relation::Dependency,
                    concrete,
                    execute,
                    EdgeInfo::Dependency(DependencyInfo::new()),
                )?;
                let old = handler_slot.get();
                assert!(old.is_none());
                handler_slot.set(Some(concrete));
                Ok(())
            }),
        )
        .unwrap();

    // the replacement itself happens on the success emission too, after the
    // subplan was built
    let replace_slot = concrete_slot.clone();
    engine
        .on_event(
            planner_success,
            Rc::new(move |propagation, _emission| {
                let concrete = replace_slot.get().expect("subplan built first");
                propagation.plan_mut().replace_task(placeholder, concrete)?;
                Ok(())
            }),
        )
        .unwrap();

    for _ in 0..6 {
        engine.step().unwrap();
    }

    let concrete = concrete_slot.get().expect("planner ran");
    assert!(engine.plan().task(placeholder).is_err());
    assert!(engine.plan().task(planner).is_err());
    assert_eq!(
        engine.plan().task(concrete).unwrap().state(),
        TaskState::Running
    );
    assert!(engine.plan().is_mission(concrete));
    assert!(!engine.plan().graph(Relation::Dependency).contains(placeholder));
}

/// An `and` gate over two inputs, reset from its own handler, fires once
/// per complete round.
#[test]
fn test_and_event() {
    init_logger();
    let mut engine = engine();
    let a = engine.plan_mut().add_free_event(EventGenerator::new());
    let b = engine.plan_mut().add_free_event(EventGenerator::new());
    let _c = engine.plan_mut().add_free_event(EventGenerator::new());
    let and_ev = and(engine.plan_mut(), &[a, b]).unwrap();

    engine
        .on_event(
            and_ev,
            Rc::new(move |propagation, _emission| {
                propagation.reset_combinator(and_ev)?;
                Ok(())
            }),
        )
        .unwrap();

    for event in [a, b, a, b] {
        engine.emit(event, None).unwrap();
    }
    assert_eq!(engine.plan().event(and_ev).unwrap().history().len(), 2);
}

/// Unreachability flows along forwarding: the effect's handler fires once
/// with a reason derived from the cause's.
#[test]
fn test_unreachability_propagation() {
    init_logger();
    let mut engine = engine();
    let cause = engine.plan_mut().add_free_event(EventGenerator::new());
    let effect = engine.plan_mut().add_free_event(EventGenerator::new());
    engine
        .plan_mut()
        .add_edge(Relation::Forwarding, cause, effect, EdgeInfo::None)
        .unwrap();

    let invocations = Rc::new(Cell::new(0u32));
    let seen = invocations.clone();
    engine
        .when_unreachable(
            effect,
            Rc::new(move |_propagation, _reason| {
                seen.set(seen.get() + 1);
                Ok(())
            }),
        )
        .unwrap();

    engine.unreachable(cause, json!("sensor died"));

    let effect_generator = engine.plan().event(effect).unwrap();
    assert!(effect_generator.unreachable());
    let reason = effect_generator.unreachability_reason().unwrap();
    assert_eq!(reason["reason"], json!("sensor died"));
    assert_eq!(invocations.get(), 1);

    // exactly once: marking again is a no-op
    engine.unreachable(cause, json!("again"));
    assert_eq!(invocations.get(), 1);
}

fn child_failed_setup(engine: &mut ExecutionEngine, handled: bool) -> (plan_kernel::ident::ObjectId, plan_kernel::ident::ObjectId) {
    let mut root_task = Task::new(Arc::new(TaskModel::new("Root")));
    if handled {
        root_task.on_exception(
            ExceptionMatcher::any().with_kind(ErrorKind::ChildFailed),
            Rc::new(|_propagation, _exception| HandlerDisposition::Handled),
        );
    }
    let root = engine.plan_mut().add_task(root_task).unwrap();
    let child = engine
        .plan_mut()
        .add_task(Task::new(Arc::new(
            TaskModel::new("Child").with_event("done", true, true),
        )))
        .unwrap();
    engine.plan_mut().add_mission(root).unwrap();
    engine
        .plan_mut()
        .add_edge(
            Relation::Dependency,
            root,
            child,
            EdgeInfo::Dependency(DependencyInfo::default().success_on("done")),
        )
        .unwrap();
    engine.step().unwrap();
    assert_eq!(engine.plan().task(root).unwrap().state(), TaskState::Running);
    assert_eq!(engine.plan().task(child).unwrap().state(), TaskState::Running);

    // the child terminates through aborted, which the edge does not accept
    let aborted = engine.plan().task(child).unwrap().event("aborted").unwrap();
    engine.call(aborted, None).unwrap();
    assert_eq!(engine.plan().task(child).unwrap().state(), TaskState::Finished);
    (root, child)
}

/// A handled ChildFailed stops at the handling parent.
#[test]
fn test_child_failed_handled() {
    init_logger();
    let mut engine = engine();
    let (root, _child) = child_failed_setup(&mut engine, true);
    engine.step().unwrap();
    assert_eq!(engine.plan().task(root).unwrap().state(), TaskState::Running);
}

/// An unhandled ChildFailed forcibly stops the parent, which is then
/// finalized.
#[test]
fn test_child_failed_unhandled() {
    init_logger();
    let mut engine = engine();
    let (root, _child) = child_failed_setup(&mut engine, false);
    engine.step().unwrap();
    assert_eq!(engine.plan().task(root).unwrap().state(), TaskState::Finished);
    for _ in 0..3 {
        engine.step().unwrap();
    }
    assert!(engine.plan().task(root).is_err());
}

/// A task delegated to through the ErrorHandling relation can handle its
/// delegator's exceptions.
#[test]
fn test_error_handling_delegation() {
    init_logger();
    let mut engine = engine();
    let (root, _child) = child_failed_setup(&mut engine, false);

    let mut handler_task = Task::new(Arc::new(TaskModel::new("Supervisor")));
    handler_task.on_exception(
        ExceptionMatcher::any().with_kind(ErrorKind::ChildFailed),
        Rc::new(|_propagation, _exception| HandlerDisposition::Handled),
    );
    let supervisor = engine.plan_mut().add_task(handler_task).unwrap();
    engine.plan_mut().add_permanent_task(supervisor).unwrap();
    engine
        .plan_mut()
        .add_edge(Relation::ErrorHandling, root, supervisor, EdgeInfo::None)
        .unwrap();

    engine.step().unwrap();
    assert_eq!(engine.plan().task(root).unwrap().state(), TaskState::Running);
}

/// A transaction commit applies tasks, edges, and the mission mark with no
/// cycle boundary in between.
#[test]
fn test_transaction_commit() {
    init_logger();
    let mut engine = engine();
    let cycle_before = engine.plan().cycle();

    let (parent, child) = engine
        .plan_mut()
        .in_transaction(|_, trsc| {
            let parent = trsc.add_task(Task::new(Arc::new(TaskModel::new("Patrol"))))?;
            let child = trsc.add_task(Task::new(Arc::new(TaskModel::new("Waypoint"))))?;
            trsc.add_edge(
                Relation::Dependency,
                parent,
                child,
                EdgeInfo::Dependency(DependencyInfo::new()),
            )?;
            trsc.add_mission(parent)?;
            Ok((parent, child))
        })
        .unwrap();

    assert_eq!(engine.plan().cycle(), cycle_before);
    assert_eq!(engine.plan().task_count(), 2);
    assert!(engine.plan().graph(Relation::Dependency).has_edge(parent, child));
    assert!(engine.plan().is_mission(parent));
}
