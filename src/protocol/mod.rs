//! Control/query protocol: a small transport-agnostic request/response
//! surface over length-prefixed JSON frames, plus job monitoring sessions
//! with per-subscriber back-pressure. The kernel side only ever exchanges
//! plain data (snapshots, job updates) with this layer; no plan state
//! crosses it.

pub mod core;
pub mod session;
pub mod types;
pub mod utils;

pub use core::{ActionProvider, ControlProtocol};
pub use session::{JobSessions, Subscription};
pub use types::{
    ActionArgument, ActionDescription, ControlError, ControlRequest, ControlResponse, JobId,
    JobState, JobUpdate, UpdateStream,
};
