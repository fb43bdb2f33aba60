//! Event model: generators (the identity of a point-in-time signal), the
//! emissions they accumulate, and the derived combinator generators (`and`,
//! `or`, filters, delays) built on top of the Signal/Forwarding relations.

pub mod combinator;
pub mod emission;
pub mod generator;

pub use combinator::{and, delay, filter, or};
pub use emission::{Emission, EmissionRef};
pub use generator::{
    CommandFn, EmissionHandler, EventGenerator, FilterFn, GeneratorKind, UnreachableHandler,
};
