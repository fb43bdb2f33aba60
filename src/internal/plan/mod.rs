//! Plans: the arena owning tasks and event generators by stable id, the
//! per-relation graphs restricted to that vertex set, mission/permanent
//! marks, and the indexes backing typed queries. Transactions stage
//! modifications against a plan and apply them atomically.

pub mod plan;
pub mod query;
pub mod transaction;

pub use plan::{EdgeSnapshot, Plan, PlanChange, PlanSnapshot, TaskSnapshot};
pub use query::TaskQuery;
pub use transaction::Transaction;
