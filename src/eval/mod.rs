//! Evaluator family over a compiled [`Tape`](crate::tape::Tape)
//!
//! Four evaluators share a tape and its register allocation: interval (with
//! tape specialization), float-array, derivative-array, and feature.  Each
//! worker owns a complete [`EvalBundle`]; evaluators never share mutable
//! state across threads.
mod array;
mod feature;
mod interval;

pub use array::{ArrayEval, DerivEval};
pub use feature::FeatureEval;
pub use interval::IntervalEval;

use crate::{error::Error, tape::Tape, types::Interval};

/// Number of sample points handled by one array evaluation
pub const ARRAY_SIZE: usize = 256;

/// Result of comparing the two sides of a `min` or `max` clause
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Choice {
    /// The left-hand side always wins
    Left,
    /// The right-hand side always wins
    Right,
    /// Neither side dominates
    Both,
}

/// A user-supplied opaque evaluator attached to a leaf clause
///
/// Implementations must be pure: the same inputs always produce the same
/// outputs, with no observable side effects, since calls may be issued from
/// any worker thread in any order.
pub trait Oracle: Send + Sync {
    /// Evaluates the oracle at a single position
    fn value(&self, p: nalgebra::Vector3<f32>) -> Result<f32, Error>;

    /// Evaluates the oracle over an axis-aligned region
    ///
    /// The result must contain every value the oracle can produce inside
    /// the region.
    fn interval(
        &self,
        lo: nalgebra::Vector3<f32>,
        hi: nalgebra::Vector3<f32>,
    ) -> Result<Interval, Error>;

    /// Evaluates the oracle's gradient at a single position
    fn grad(
        &self,
        p: nalgebra::Vector3<f32>,
    ) -> Result<nalgebra::Vector3<f32>, Error>;
}

/// A matched set of evaluators sharing one tape's register allocation
///
/// This is the per-worker evaluation state for a tree build; building one
/// does all the allocation up front, so the evaluators themselves run
/// allocation-free.
pub struct EvalBundle {
    pub interval: IntervalEval,
    pub array: ArrayEval,
    pub deriv: DerivEval,
    pub feature: FeatureEval,
}

impl EvalBundle {
    /// Builds a bundle for a tape with no free variables
    pub fn new(tape: &Tape) -> Result<Self, Error> {
        Self::with_vars(tape, vec![])
    }

    /// Builds a bundle, binding free variables by dense id
    pub fn with_vars(tape: &Tape, vars: Vec<f32>) -> Result<Self, Error> {
        if vars.len() != tape.data().var_count {
            return Err(Error::BadVarSlice(
                vars.len(),
                tape.data().var_count,
            ));
        }
        Ok(Self {
            interval: IntervalEval::new(tape, vars.clone()),
            array: ArrayEval::new(tape, vars.clone()),
            deriv: DerivEval::new(tape, vars.clone()),
            feature: FeatureEval::new(tape, vars),
        })
    }
}
