//! Infrastructure for representing math expressions as deduplicated graphs
//!
//! A [`Context`] is an arena for unique (deduplicated) math expressions,
//! which are represented as [`Node`] handles.  Each `Node` is specific to a
//! particular context, and is the input format for
//! [`Tape`](crate::tape::Tape) construction.
mod indexed;
mod op;

use indexed::{define_index, IndexMap};
pub use op::{BinaryOpcode, Op, UnaryOpcode, Var};

use crate::{error::Error, eval::Oracle};

use std::collections::HashMap;
use std::sync::Arc;

use ordered_float::OrderedFloat;

define_index!(Node, "An index in the `Context::ops` map");
define_index!(VarNode, "An index in the `Context::vars` map");

/// A `Context` holds a set of deduplicated constants, variables, and
/// operations.
///
/// It should be used like an arena allocator: it grows over time, then frees
/// all of its contents when dropped.
#[derive(Default)]
pub struct Context {
    ops: IndexMap<Op, Node>,
    vars: IndexMap<String, VarNode>,
    oracles: Vec<Arc<dyn Oracle>>,
}

impl Context {
    /// Build a new empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the context
    ///
    /// All [`Node`] handles from this context are invalidated.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.vars.clear();
        self.oracles.clear();
    }

    /// Returns the number of [`Op`] nodes in the context
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Checks whether the context is empty
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Looks up the [`Op`] associated with the given node
    pub fn get_op(&self, node: Node) -> Option<&Op> {
        self.ops.get_by_index(node)
    }

    /// Returns the number of free variables in the context
    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    /// Returns the oracles registered so far, in registration order
    pub(crate) fn oracles(&self) -> &[Arc<dyn Oracle>] {
        &self.oracles
    }

    fn check_node(&self, node: Node) -> Result<(), Error> {
        self.get_op(node).ok_or(Error::BadNode).map(|_| ())
    }

    ////////////////////////////////////////////////////////////////////////

    /// Constructs or finds the X axis node
    pub fn x(&mut self) -> Node {
        self.ops.insert(Op::Var(Var::X))
    }

    /// Constructs or finds the Y axis node
    pub fn y(&mut self) -> Node {
        self.ops.insert(Op::Var(Var::Y))
    }

    /// Constructs or finds the Z axis node
    pub fn z(&mut self) -> Node {
        self.ops.insert(Op::Var(Var::Z))
    }

    /// Returns the three spatial axes as a tuple
    pub fn axes(&mut self) -> (Node, Node, Node) {
        (self.x(), self.y(), self.z())
    }

    /// Constructs or finds a free variable with the given name
    pub fn var(&mut self, name: &str) -> Node {
        let v = self.vars.insert(name.to_owned());
        self.ops.insert(Op::Var(Var::Free(v)))
    }

    /// Constructs or finds a constant node
    pub fn constant(&mut self, f: f64) -> Node {
        self.ops.insert(Op::Const(OrderedFloat(f)))
    }

    /// Registers an oracle, returning a fresh node
    ///
    /// Oracles are never deduplicated; each registration is a distinct node.
    pub fn oracle(&mut self, o: Arc<dyn Oracle>) -> Node {
        let i = self.oracles.len();
        self.oracles.push(o);
        self.ops.insert(Op::Oracle(i))
    }

    /// Looks up the constant value of a node, if it is a constant
    pub fn const_value(&self, n: Node) -> Result<Option<f64>, Error> {
        match self.get_op(n) {
            Some(Op::Const(c)) => Ok(Some(c.0)),
            Some(_) => Ok(None),
            None => Err(Error::BadNode),
        }
    }

    fn op_unary(&mut self, op: UnaryOpcode, a: Node) -> Result<Node, Error> {
        // Constant-fold eagerly, so tapes never carry dead arithmetic
        if let Some(va) = self.const_value(a)? {
            let v = match op {
                UnaryOpcode::Neg => -va,
                UnaryOpcode::Abs => va.abs(),
                UnaryOpcode::Recip => 1.0 / va,
                UnaryOpcode::Sqrt => va.sqrt(),
                UnaryOpcode::Square => va * va,
                UnaryOpcode::Sin => va.sin(),
                UnaryOpcode::Cos => va.cos(),
                UnaryOpcode::Tan => va.tan(),
                UnaryOpcode::Exp => va.exp(),
                UnaryOpcode::Ln => va.ln(),
            };
            return Ok(self.constant(v));
        }
        Ok(self.ops.insert(Op::Unary(op, a)))
    }

    fn op_binary<A: IntoNode, B: IntoNode>(
        &mut self,
        op: BinaryOpcode,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        if let (Some(va), Some(vb)) =
            (self.const_value(a)?, self.const_value(b)?)
        {
            let v = match op {
                BinaryOpcode::Add => va + vb,
                BinaryOpcode::Sub => va - vb,
                BinaryOpcode::Mul => va * vb,
                BinaryOpcode::Div => va / vb,
                BinaryOpcode::Min => va.min(vb),
                BinaryOpcode::Max => va.max(vb),
            };
            return Ok(self.constant(v));
        }
        Ok(self.ops.insert(Op::Binary(op, a, b)))
    }

    /// Builds an addition node
    pub fn add<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        self.op_binary(BinaryOpcode::Add, a, b)
    }

    /// Builds a subtraction node
    pub fn sub<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        self.op_binary(BinaryOpcode::Sub, a, b)
    }

    /// Builds a multiplication node
    pub fn mul<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        self.op_binary(BinaryOpcode::Mul, a, b)
    }

    /// Builds a division node
    pub fn div<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        self.op_binary(BinaryOpcode::Div, a, b)
    }

    /// Builds a min node
    pub fn min<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        self.op_binary(BinaryOpcode::Min, a, b)
    }

    /// Builds a max node
    pub fn max<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        self.op_binary(BinaryOpcode::Max, a, b)
    }

    /// Builds a negation node
    pub fn neg(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(UnaryOpcode::Neg, a)
    }

    /// Builds an absolute-value node
    pub fn abs(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(UnaryOpcode::Abs, a)
    }

    /// Builds a reciprocal node
    pub fn recip(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(UnaryOpcode::Recip, a)
    }

    /// Builds a square-root node
    pub fn sqrt(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(UnaryOpcode::Sqrt, a)
    }

    /// Builds a square node
    pub fn square(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(UnaryOpcode::Square, a)
    }

    /// Builds a sine node
    pub fn sin(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(UnaryOpcode::Sin, a)
    }

    /// Builds a cosine node
    pub fn cos(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(UnaryOpcode::Cos, a)
    }

    /// Builds a tangent node
    pub fn tan(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(UnaryOpcode::Tan, a)
    }

    /// Builds an exponential node
    pub fn exp(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(UnaryOpcode::Exp, a)
    }

    /// Builds a natural-log node
    pub fn ln(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(UnaryOpcode::Ln, a)
    }

    ////////////////////////////////////////////////////////////////////////

    /// Returns the rank of the given node (depth from the leaves)
    ///
    /// Leaf nodes (variables, constants, oracles) have rank 0.
    pub fn rank(&self, node: Node) -> Result<usize, Error> {
        let mut cache = HashMap::new();
        self.rank_inner(node, &mut cache)
    }

    fn rank_inner(
        &self,
        node: Node,
        cache: &mut HashMap<Node, usize>,
    ) -> Result<usize, Error> {
        if let Some(r) = cache.get(&node) {
            return Ok(*r);
        }
        let op = *self.get_op(node).ok_or(Error::BadNode)?;
        let mut r = 0;
        for c in op.iter_children() {
            r = r.max(1 + self.rank_inner(c, cache)?);
        }
        cache.insert(node, r);
        Ok(r)
    }

    /// Returns the nodes reachable from `root` in topological order
    ///
    /// Every node appears after its children (leaves first, root last).
    pub fn ordered(&self, root: Node) -> Result<Vec<Node>, Error> {
        let mut seen = HashMap::new();
        let mut out = vec![];
        self.ordered_inner(root, &mut seen, &mut out)?;
        Ok(out)
    }

    fn ordered_inner(
        &self,
        node: Node,
        seen: &mut HashMap<Node, ()>,
        out: &mut Vec<Node>,
    ) -> Result<(), Error> {
        if seen.contains_key(&node) {
            return Ok(());
        }
        let op = *self.get_op(node).ok_or(Error::BadNode)?;
        for c in op.iter_children() {
            self.ordered_inner(c, seen, out)?;
        }
        seen.insert(node, ());
        out.push(node);
        Ok(())
    }

    /// Evaluates the expression directly (by recursive descent)
    ///
    /// This is slow and primarily useful as a reference for tests; use a
    /// [`Tape`](crate::tape::Tape) and its evaluators for real work.
    pub fn eval_xyz(
        &self,
        root: Node,
        x: f64,
        y: f64,
        z: f64,
    ) -> Result<f64, Error> {
        self.eval(root, x, y, z, &[])
    }

    /// Evaluates the expression with free variable bindings
    ///
    /// `vars` is indexed by dense free-variable id (registration order).
    pub fn eval(
        &self,
        root: Node,
        x: f64,
        y: f64,
        z: f64,
        vars: &[f64],
    ) -> Result<f64, Error> {
        let mut cache = HashMap::new();
        self.eval_inner(root, x, y, z, vars, &mut cache)
    }

    fn eval_inner(
        &self,
        node: Node,
        x: f64,
        y: f64,
        z: f64,
        vars: &[f64],
        cache: &mut HashMap<Node, f64>,
    ) -> Result<f64, Error> {
        if let Some(v) = cache.get(&node) {
            return Ok(*v);
        }
        let op = *self.get_op(node).ok_or(Error::BadNode)?;
        let v = match op {
            Op::Var(Var::X) => x,
            Op::Var(Var::Y) => y,
            Op::Var(Var::Z) => z,
            Op::Var(Var::Free(v)) => *vars
                .get(v.get())
                .ok_or(Error::BadVarSlice(vars.len(), self.vars.len()))?,
            Op::Const(c) => c.0,
            Op::Oracle(i) => f64::from(self.oracles[i].value(
                nalgebra::Vector3::new(x as f32, y as f32, z as f32),
            )?),
            Op::Unary(op, a) => {
                let a = self.eval_inner(a, x, y, z, vars, cache)?;
                match op {
                    UnaryOpcode::Neg => -a,
                    UnaryOpcode::Abs => a.abs(),
                    UnaryOpcode::Recip => 1.0 / a,
                    UnaryOpcode::Sqrt => a.sqrt(),
                    UnaryOpcode::Square => a * a,
                    UnaryOpcode::Sin => a.sin(),
                    UnaryOpcode::Cos => a.cos(),
                    UnaryOpcode::Tan => a.tan(),
                    UnaryOpcode::Exp => a.exp(),
                    UnaryOpcode::Ln => a.ln(),
                }
            }
            Op::Binary(op, a, b) => {
                let a = self.eval_inner(a, x, y, z, vars, cache)?;
                let b = self.eval_inner(b, x, y, z, vars, cache)?;
                match op {
                    BinaryOpcode::Add => a + b,
                    BinaryOpcode::Sub => a - b,
                    BinaryOpcode::Mul => a * b,
                    BinaryOpcode::Div => a / b,
                    BinaryOpcode::Min => a.min(b),
                    BinaryOpcode::Max => a.max(b),
                }
            }
        };
        cache.insert(node, v);
        Ok(v)
    }
}

/// Trait for conversion into a [`Node`] within a particular [`Context`]
///
/// This allows `f64` constants to be passed directly to builder functions.
pub trait IntoNode {
    fn into_node(self, ctx: &mut Context) -> Result<Node, Error>;
}

impl IntoNode for Node {
    fn into_node(self, ctx: &mut Context) -> Result<Node, Error> {
        ctx.check_node(self)?;
        Ok(self)
    }
}

impl IntoNode for f64 {
    fn into_node(self, ctx: &mut Context) -> Result<Node, Error> {
        Ok(ctx.constant(self))
    }
}
