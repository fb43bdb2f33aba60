//! Derived generators built on the Forwarding relation: `and`/`or` gates
//! over a set of inputs, context-mapping filters, and delayed forwards.
//! All of them are non-controllable; they fire from their inputs only.

use super::generator::{AndGate, EventGenerator, FilterFn, GeneratorKind, OrGate};
use crate::{
    errors::PlanError,
    ident::ObjectId,
    internal::{plan::Plan, relation::{EdgeInfo, Relation}},
};

/// Create a generator that emits once every watched input has emitted since
/// the last reset. The gate latches after firing; re-arm it with
/// [`crate::internal::engine::propagation::Propagation::reset_combinator`].
pub fn and(plan: &mut Plan, inputs: &[ObjectId]) -> Result<ObjectId, PlanError> {
    let gate = AndGate {
        waited: inputs.to_vec(),
        seen: Vec::new(),
        fired: false,
    };
    combinator(plan, GeneratorKind::And(gate), inputs)
}

/// Create a generator that emits the first time any watched input emits,
/// then latches until reset.
pub fn or(plan: &mut Plan, inputs: &[ObjectId]) -> Result<ObjectId, PlanError> {
    combinator(plan, GeneratorKind::Or(OrGate { fired: false }), inputs)
}

/// Create a generator that re-emits `source`'s emissions with the context
/// mapped through `filter`.
pub fn filter(plan: &mut Plan, source: ObjectId, filter: FilterFn) -> Result<ObjectId, PlanError> {
    combinator(plan, GeneratorKind::Filter(filter), &[source])
}

/// Create a generator that re-emits `source`'s emissions `delay` seconds
/// later, serviced by the engine's timer scan.
pub fn delay(plan: &mut Plan, source: ObjectId, delay: f64) -> Result<ObjectId, PlanError> {
    if delay < 0.0 {
        return Err(PlanError::InvalidArgument(format!(
            "negative delay: {delay}"
        )));
    }
    combinator(plan, GeneratorKind::Delay(delay), &[source])
}

fn combinator(
    plan: &mut Plan,
    kind: GeneratorKind,
    inputs: &[ObjectId],
) -> Result<ObjectId, PlanError> {
    if inputs.is_empty() {
        return Err(PlanError::InvalidArgument(
            "a combinator needs at least one input".to_string(),
        ));
    }
    for input in inputs {
        plan.event(*input)?;
    }
    let generator = EventGenerator::with_kind(kind);
    let id = plan.add_free_event(generator);
    for input in inputs {
        plan.add_edge(Relation::Forwarding, *input, id, EdgeInfo::None)?;
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::{and, or};
    use crate::internal::{
        event::generator::EventGenerator,
        plan::Plan,
        relation::Relation,
    };

    /// Combinators are wired to their inputs through Forwarding edges.
    #[test]
    fn test_combinator_wiring() {
        let mut plan = Plan::new();
        let a = plan.add_free_event(EventGenerator::new());
        let b = plan.add_free_event(EventGenerator::new());
        let gate = and(&mut plan, &[a, b]).unwrap();
        let graph = plan.graph(Relation::Forwarding);
        assert!(graph.has_edge(a, gate));
        assert!(graph.has_edge(b, gate));
        // the CausalLink union is maintained alongside
        assert!(plan.graph(Relation::CausalLink).has_edge(a, gate));
    }

    /// Combinators reject unknown inputs and empty input sets.
    #[test]
    fn test_combinator_validation() {
        let mut plan = Plan::new();
        let a = plan.add_free_event(EventGenerator::new());
        assert!(and(&mut plan, &[]).is_err());
        assert!(or(&mut plan, &[a, crate::ident::ObjectId::next()]).is_err());
    }
}
