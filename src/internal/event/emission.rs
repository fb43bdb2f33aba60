//! One observed occurrence of a generator firing: when it happened, with
//! which payload, and which other emissions caused it. The source set is what
//! makes a propagation trace replayable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ident::{Digest, ObjectId};

/// Reference to one emission in some generator's history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmissionRef {
    pub generator: ObjectId,
    /// Index into the generator's history.
    pub index: u32,
}

/// A single recorded firing of a generator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Emission {
    /// Engine cycle during which the emission was observed. Strictly
    /// increasing within one generator's history.
    pub cycle: u64,
    /// Wall-clock time of the emission.
    pub time: DateTime<Utc>,
    /// Opaque payload handed to `emit`, forwarded along Forwarding edges.
    pub context: Option<Value>,
    /// Emissions that caused this one (signal/forwarding parents).
    pub sources: Vec<EmissionRef>,
}

impl Emission {
    /// Digest of the context payload for the event log; the zero digest
    /// stands for "no context".
    pub fn context_digest(&self) -> Digest {
        match &self.context {
            Some(value) => Digest::of_value(value),
            None => Digest::zero(),
        }
    }
}
