//! Plan-Kernel is a library for plan-based supervision of autonomous
//! systems: typed task/event plans, relation graphs, a deterministic
//! single-threaded propagation engine, transactions with atomic commit,
//! binary event logs, and a control protocol.
pub mod config;
pub mod errors;
pub mod ident;
pub mod internal;
pub mod protocol;
pub mod utils;
