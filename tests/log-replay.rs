//! Replay law: reading the event log back must reconstruct, for any cycle,
//! the set of emitted generators and the emission-derived task lifecycle
//! states.

use std::sync::Arc;

use tracing_subscriber::util::SubscriberInitExt;

use plan_kernel::{
    config::EngineConfig,
    internal::{
        engine::ExecutionEngine,
        log::{EventLogger, LogReader, ReplayState, ReplayTaskState},
        plan::Plan,
        task::{Task, TaskModel},
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

/// Run a mission to completion with a logger attached, then replay the log
/// cycle by cycle.
#[test]
fn test_replay_reconstructs_lifecycle() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.log");

    let mut engine = ExecutionEngine::new(Plan::new(), EngineConfig::default());
    engine.set_logger(EventLogger::create(&path, 1024).unwrap());

    let task = engine
        .plan_mut()
        .add_task(Task::new(Arc::new(TaskModel::new("GoForward"))))
        .unwrap();
    engine.plan_mut().add_mission(task).unwrap();
    let task_id = task.as_u64();

    // cycle 0 starts the mission
    engine.step().unwrap();
    let start = engine.plan().task(task).unwrap().start_event().unwrap();
    let stop = engine.plan().task(task).unwrap().stop_event().unwrap();
    let start_id = start.as_u64();
    let stop_id = stop.as_u64();

    // two idle cycles, then stop inside cycle 3
    engine.step().unwrap();
    engine.step().unwrap();
    let queue = engine.external_queue();
    queue.push_call(stop, None);
    engine.step().unwrap();
    // let the collector finalize the finished mission
    engine.step().unwrap();
    engine.step().unwrap();

    drop(engine); // flushes and joins the logger thread

    let records = LogReader::open(&path).unwrap().records().unwrap();

    let at_start = ReplayState::replay_until(&records, 0);
    assert!(at_start.emitted.contains(&start_id));
    assert!(!at_start.emitted.contains(&stop_id));
    assert_eq!(
        at_start.task_states.get(&task_id),
        Some(&ReplayTaskState::Running)
    );

    let mid = ReplayState::replay_until(&records, 2);
    assert_eq!(
        mid.task_states.get(&task_id),
        Some(&ReplayTaskState::Running)
    );
    assert!(!mid.emitted.contains(&stop_id));

    let after_stop = ReplayState::replay_until(&records, 3);
    assert!(after_stop.emitted.contains(&stop_id));
    assert_eq!(
        after_stop.task_states.get(&task_id),
        Some(&ReplayTaskState::Finished)
    );
    assert_eq!(after_stop.emission_counts.get(&stop_id), Some(&1));

    let end = ReplayState::replay_until(&records, u64::MAX);
    assert!(end.finalized.contains(&task_id));
}

/// Cycle counters in the log are strictly increasing and bracketed.
#[test]
fn test_cycle_bracketing() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.log");

    let mut engine = ExecutionEngine::new(Plan::new(), EngineConfig::default());
    engine.set_logger(EventLogger::create(&path, 1024).unwrap());
    for _ in 0..4 {
        engine.step().unwrap();
    }
    drop(engine);

    let records = LogReader::open(&path).unwrap().records().unwrap();
    let mut open: Option<u64> = None;
    let mut last_closed: Option<u64> = None;
    for record in &records {
        match record {
            plan_kernel::internal::log::LogRecord::CycleStart { cycle, .. } => {
                assert!(open.is_none(), "cycle {cycle} started inside another");
                if let Some(previous) = last_closed {
                    assert_eq!(*cycle, previous + 1);
                }
                open = Some(*cycle);
            }
            plan_kernel::internal::log::LogRecord::CycleEnd { cycle, .. } => {
                assert_eq!(open, Some(*cycle));
                open = None;
                last_closed = Some(*cycle);
            }
            _ => {}
        }
    }
    assert_eq!(last_closed, Some(3));
}
