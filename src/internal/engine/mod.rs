//! The execution engine: the single-threaded, cooperative cycle loop that
//! drives a plan forward. Each cycle gathers external events, consults the
//! scheduler, processes the propagation queue to closure, runs the relation
//! structure checks, propagates errors, garbage-collects, and logs.

pub mod execution;
pub mod gc;
pub mod propagation;
pub mod scheduler;

pub use execution::{CycleReport, ExecutionEngine, ExternalEvent, ExternalQueue};
pub use propagation::{PendingCall, Propagation};
pub use scheduler::{BasicScheduler, Scheduler, TemporalScheduler};
