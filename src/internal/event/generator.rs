//! Event generator: the identity of a point-in-time signal. A generator is
//! either free or bound to a task event symbol; controllable generators carry
//! a command whose contract is "arranges for the generator to emit".
//!
//! # Monotone states
//!
//! `emitted` and `unreachable` are both monotone-true. A generator that is
//! unreachable and has never emitted can never emit; its history stays empty
//! forever. Unreachability handlers fire exactly once.

use std::rc::Rc;

use serde_json::Value;

use super::emission::{Emission, EmissionRef};
use crate::{
    errors::PlanError,
    ident::ObjectId,
    internal::engine::propagation::Propagation,
};

/// Command of a controllable generator. Runs inside the propagation phase;
/// user failures surface as `CommandFailed` localized errors.
pub type CommandFn = Rc<dyn Fn(&mut Propagation<'_>, Option<Value>) -> Result<(), PlanError>>;

/// Emission handler, run in registration order after the emission is
/// appended to the history.
pub type EmissionHandler = Rc<dyn Fn(&mut Propagation<'_>, &Emission) -> Result<(), PlanError>>;

/// Handler invoked exactly once with the unreachability reason.
pub type UnreachableHandler = Rc<dyn Fn(&mut Propagation<'_>, &Value) -> Result<(), PlanError>>;

/// Context transform of a Filter generator.
pub type FilterFn = Rc<dyn Fn(Option<Value>) -> Option<Value>>;

/// Gate state of an `and` combinator: which inputs emitted since the last
/// reset, and whether the combinator already fired for this round.
#[derive(Clone, Debug, Default)]
pub struct AndGate {
    pub(crate) waited: Vec<ObjectId>,
    pub(crate) seen: Vec<ObjectId>,
    pub(crate) fired: bool,
}

/// Latch state of an `or` combinator.
#[derive(Clone, Debug, Default)]
pub struct OrGate {
    pub(crate) fired: bool,
}

/// Behavioural kind of a generator; the emit path dispatches on it.
#[derive(Clone)]
pub enum GeneratorKind {
    /// Plain generator owned directly by the plan.
    Free,
    /// Generator bound to one event symbol of a task.
    TaskBound { task: ObjectId, symbol: String },
    /// Emits when all watched inputs emitted since the last reset.
    And(AndGate),
    /// Emits when any watched input emits; latches until reset.
    Or(OrGate),
    /// Forwards emissions after mapping their context.
    Filter(FilterFn),
    /// Forwards emissions after the given delay in seconds.
    Delay(f64),
}

impl std::fmt::Debug for GeneratorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeneratorKind::Free => write!(f, "Free"),
            GeneratorKind::TaskBound { task, symbol } => {
                write!(f, "TaskBound({task}/{symbol})")
            }
            GeneratorKind::And(gate) => write!(f, "And({} inputs)", gate.waited.len()),
            GeneratorKind::Or(_) => write!(f, "Or"),
            GeneratorKind::Filter(_) => write!(f, "Filter"),
            GeneratorKind::Delay(delay) => write!(f, "Delay({delay}s)"),
        }
    }
}

/// The identity of a point-in-time signal, with its command, history, and
/// reachability state.
#[derive(Clone)]
pub struct EventGenerator {
    id: ObjectId,
    kind: GeneratorKind,
    command: Option<CommandFn>,
    history: Vec<Emission>,
    pending: bool,
    unreachable: bool,
    unreachability_reason: Option<Value>,
    handlers: Vec<EmissionHandler>,
    unreachable_handlers: Vec<UnreachableHandler>,
}

impl std::fmt::Debug for EventGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventGenerator")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("controllable", &self.command.is_some())
            .field("emissions", &self.history.len())
            .field("pending", &self.pending)
            .field("unreachable", &self.unreachable)
            .finish()
    }
}

impl EventGenerator {
    /// A free, non-controllable generator; it can only be emitted directly.
    pub fn new() -> Self {
        Self::with_kind(GeneratorKind::Free)
    }

    /// A free, controllable generator with the given command.
    pub fn with_command(command: CommandFn) -> Self {
        let mut generator = Self::with_kind(GeneratorKind::Free);
        generator.command = Some(command);
        generator
    }

    pub(crate) fn with_kind(kind: GeneratorKind) -> Self {
        Self {
            id: ObjectId::next(),
            kind,
            command: None,
            history: Vec::new(),
            pending: false,
            unreachable: false,
            unreachability_reason: None,
            handlers: Vec::new(),
            unreachable_handlers: Vec::new(),
        }
    }

    pub(crate) fn set_command(&mut self, command: CommandFn) {
        self.command = Some(command);
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn kind(&self) -> &GeneratorKind {
        &self.kind
    }

    pub(crate) fn kind_mut(&mut self) -> &mut GeneratorKind {
        &mut self.kind
    }

    /// The owning task, for task-bound generators.
    pub fn task(&self) -> Option<ObjectId> {
        match &self.kind {
            GeneratorKind::TaskBound { task, .. } => Some(*task),
            _ => None,
        }
    }

    /// The bound event symbol, for task-bound generators.
    pub fn symbol(&self) -> Option<&str> {
        match &self.kind {
            GeneratorKind::TaskBound { symbol, .. } => Some(symbol),
            _ => None,
        }
    }

    /// A generator is controllable iff it has a command.
    pub fn controllable(&self) -> bool {
        self.command.is_some()
    }

    pub(crate) fn command(&self) -> Option<CommandFn> {
        self.command.clone()
    }

    pub fn emitted(&self) -> bool {
        !self.history.is_empty()
    }

    pub fn history(&self) -> &[Emission] {
        &self.history
    }

    pub fn last_emission(&self) -> Option<&Emission> {
        self.history.last()
    }

    /// A command was queued or is running, and the emission has not been
    /// observed yet.
    pub fn pending(&self) -> bool {
        self.pending
    }

    pub(crate) fn set_pending(&mut self, pending: bool) {
        self.pending = pending;
    }

    pub fn unreachable(&self) -> bool {
        self.unreachable
    }

    pub fn unreachability_reason(&self) -> Option<&Value> {
        self.unreachability_reason.as_ref()
    }

    /// Register an emission handler; handlers run in registration order.
    pub fn on(&mut self, handler: EmissionHandler) {
        self.handlers.push(handler);
    }

    pub(crate) fn handlers(&self) -> Vec<EmissionHandler> {
        self.handlers.clone()
    }

    /// Queue an unreachability handler. Use the plan/propagation-level
    /// `when_unreachable` to get the immediate-invocation behaviour when the
    /// generator is already unreachable.
    pub(crate) fn push_unreachable_handler(&mut self, handler: UnreachableHandler) {
        self.unreachable_handlers.push(handler);
    }

    /// Append an emission. The caller (the propagation kernel) has already
    /// validated the state; this only enforces the monotone invariants.
    pub(crate) fn record_emission(&mut self, emission: Emission) -> Result<EmissionRef, PlanError> {
        if self.unreachable {
            return Err(PlanError::Unreachable(self.id.to_string()));
        }
        if let Some(last) = self.history.last()
            && emission.cycle < last.cycle
        {
            return Err(PlanError::EmissionFailed(format!(
                "emission cycle {} precedes the history tail of {}",
                emission.cycle, self.id
            )));
        }
        self.pending = false;
        self.history.push(emission);
        Ok(EmissionRef {
            generator: self.id,
            index: (self.history.len() - 1) as u32,
        })
    }

    /// Monotonically mark the generator unreachable and hand back the
    /// handlers to run, exactly once. A second call is a no-op returning an
    /// empty list.
    pub(crate) fn mark_unreachable(&mut self, reason: Value) -> Vec<UnreachableHandler> {
        if self.unreachable {
            return Vec::new();
        }
        self.unreachable = true;
        self.pending = false;
        self.unreachability_reason = Some(reason);
        std::mem::take(&mut self.unreachable_handlers)
    }
}

impl Default for EventGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::{EventGenerator, GeneratorKind};
    use crate::internal::event::emission::Emission;

    fn emission(cycle: u64) -> Emission {
        Emission {
            cycle,
            time: Utc::now(),
            context: None,
            sources: vec![],
        }
    }

    /// A new free generator is neither controllable nor emitted.
    #[test]
    fn test_new_generator_state() {
        let generator = EventGenerator::new();
        assert!(!generator.controllable());
        assert!(!generator.emitted());
        assert!(!generator.pending());
        assert!(!generator.unreachable());
        assert!(matches!(generator.kind(), GeneratorKind::Free));
    }

    /// History cycles must never decrease.
    #[test]
    fn test_history_cycle_order() {
        let mut generator = EventGenerator::new();
        generator.record_emission(emission(4)).unwrap();
        generator.record_emission(emission(4)).unwrap();
        assert!(generator.record_emission(emission(3)).is_err());
        assert_eq!(generator.history().len(), 2);
    }

    /// An unreachable generator that never emitted can never emit.
    #[test]
    fn test_no_emission_after_unreachable() {
        let mut generator = EventGenerator::new();
        let handlers = generator.mark_unreachable(json!("gone"));
        assert!(handlers.is_empty());
        assert!(generator.unreachable());
        assert!(generator.record_emission(emission(1)).is_err());
        assert!(!generator.emitted());
    }

    /// Marking unreachable twice keeps the first reason.
    #[test]
    fn test_unreachable_is_monotone() {
        let mut generator = EventGenerator::new();
        generator.mark_unreachable(json!("first"));
        generator.mark_unreachable(json!("second"));
        assert_eq!(generator.unreachability_reason(), Some(&json!("first")));
    }
}
