//! Kernel core for solid modeling with implicit functions
//!
//! A shape is a scalar field `f(x, y, z)` built from arithmetic,
//! transcendental, and min/max primitives; this crate compiles the field
//! into a clause [`tape`](crate::tape), evaluates it with a family of
//! [`evaluators`](crate::eval) (interval, float-array, derivative-array,
//! feature), and drives an adaptive [`simplex`](crate::simplex) tree that
//! prunes by interval arithmetic, places one QEF-minimizing vertex per
//! cell subspace, and merges cells bottom-up under an error bound.
//!
//! ```
//! use espalier::{
//!     context::Context,
//!     simplex::{BuildSettings, Region, SimplexTree},
//! };
//! use nalgebra::SVector;
//!
//! // f = x^2 + y^2 + z^2 - 0.25, a sphere of radius 0.5
//! let mut ctx = Context::new();
//! let (x, y, z) = ctx.axes();
//! let x2 = ctx.square(x).unwrap();
//! let y2 = ctx.square(y).unwrap();
//! let z2 = ctx.square(z).unwrap();
//! let s = ctx.add(x2, y2).unwrap();
//! let s = ctx.add(s, z2).unwrap();
//! let f = ctx.sub(s, 0.25).unwrap();
//!
//! let region = Region::<3>::new(
//!     SVector::from([-1.0, -1.0, -1.0]),
//!     SVector::from([1.0, 1.0, 1.0]),
//!     3,
//! );
//! let tree = SimplexTree::build(
//!     &ctx, f, region, &BuildSettings::default(),
//! ).unwrap();
//! assert!(tree.is_branch());
//!
//! // Number every distinct subspace vertex, then read them back
//! let count = tree.assign_indices();
//! assert!(count > 0);
//! ```

pub mod context;
mod error;
pub mod eval;
pub mod simplex;
pub mod tape;
pub mod types;

pub use error::Error;
