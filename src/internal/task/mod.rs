//! Task model: long-running activities bundling typed event generators and
//! arguments, with a lifecycle derived from the emissions of their `start`,
//! terminal, and `stop` events.

pub mod arguments;
pub mod model;
pub mod task;

pub use arguments::{ArgumentValue, Arguments, DelayedArgument};
pub use model::{ArgumentModel, EventModel, PollFn, TaskModel};
pub use task::{Task, TaskState};
