//! The compiled, linearized representation of a scalar field
//!
//! A [`Tape`] flattens an expression graph into a flat list of [`Clause`]s,
//! then layers a stack of specialized [`Subtape`]s on top of it: interval
//! evaluation over a region can prove that one branch of a `min` or `max`
//! always wins, and [`Tape::push`] materializes a shorter tape with the
//! losing branches removed.  The stack is append-only (slots are reused, not
//! freed) so that nested evaluations don't churn the allocator.
mod alloc;

pub(crate) use alloc::Slots;

use crate::{
    context::{BinaryOpcode, Context, Node, Op, UnaryOpcode, Var},
    error::Error,
    eval::Oracle,
    types::Interval,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;

/// Dense clause identifier; 0 is reserved as a sentinel
pub type ClauseId = u32;

/// A primitive operation in the tape VM
///
/// `Constant`, `VarFree`, and `Oracle` are "dummy-children" ops: their `a`
/// field is an index into a secondary table rather than a clause reference.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Opcode {
    VarX,
    VarY,
    VarZ,
    VarFree,
    Constant,
    Oracle,

    Neg,
    Abs,
    Recip,
    Sqrt,
    Square,
    Sin,
    Cos,
    Tan,
    Exp,
    Ln,

    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

impl Opcode {
    /// Returns the number of clause operands (0, 1, or 2)
    pub fn arity(self) -> usize {
        match self {
            Opcode::VarX
            | Opcode::VarY
            | Opcode::VarZ
            | Opcode::VarFree
            | Opcode::Constant
            | Opcode::Oracle => 0,
            Opcode::Neg
            | Opcode::Abs
            | Opcode::Recip
            | Opcode::Sqrt
            | Opcode::Square
            | Opcode::Sin
            | Opcode::Cos
            | Opcode::Tan
            | Opcode::Exp
            | Opcode::Ln => 1,
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Min
            | Opcode::Max => 2,
        }
    }

    /// Checks whether the `a` field is a payload index instead of a clause
    pub fn has_dummy_children(self) -> bool {
        matches!(self, Opcode::Constant | Opcode::VarFree | Opcode::Oracle)
    }
}

impl From<UnaryOpcode> for Opcode {
    fn from(op: UnaryOpcode) -> Self {
        match op {
            UnaryOpcode::Neg => Opcode::Neg,
            UnaryOpcode::Abs => Opcode::Abs,
            UnaryOpcode::Recip => Opcode::Recip,
            UnaryOpcode::Sqrt => Opcode::Sqrt,
            UnaryOpcode::Square => Opcode::Square,
            UnaryOpcode::Sin => Opcode::Sin,
            UnaryOpcode::Cos => Opcode::Cos,
            UnaryOpcode::Tan => Opcode::Tan,
            UnaryOpcode::Exp => Opcode::Exp,
            UnaryOpcode::Ln => Opcode::Ln,
        }
    }
}

impl From<BinaryOpcode> for Opcode {
    fn from(op: BinaryOpcode) -> Self {
        match op {
            BinaryOpcode::Add => Opcode::Add,
            BinaryOpcode::Sub => Opcode::Sub,
            BinaryOpcode::Mul => Opcode::Mul,
            BinaryOpcode::Div => Opcode::Div,
            BinaryOpcode::Min => Opcode::Min,
            BinaryOpcode::Max => Opcode::Max,
        }
    }
}

/// One row of the tape VM
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Clause {
    pub op: Opcode,
    pub id: ClauseId,
    pub a: ClauseId,
    pub b: ClauseId,
}

/// Decision returned by a keep-classifier during [`Tape::push`]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Keep {
    /// The clause is replaced by its left operand
    A,
    /// The clause is replaced by its right operand
    B,
    /// Both operands stay live; a choice existed here
    Both,
    /// The clause is unconditionally kept
    Always,
}

/// Classification of a [`Subtape`] within the specialization stack
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TapeType {
    /// The root tape, valid everywhere
    Base,
    /// Pushed from interval evaluation; valid within its stored bounds
    Interval,
    /// Pushed from point-wise specialization (e.g. pinning tied branches)
    Specialized,
}

/// One entry on the tape's specialization stack
///
/// Clauses are stored in reverse topological order with the root first;
/// evaluation iterates in reverse (see [`Tape::rwalk`]).
#[derive(Debug)]
pub struct Subtape {
    t: Vec<Clause>,
    pub ty: TapeType,
    /// The region for which this specialization is valid
    pub bounds: [Interval; 3],
    slots: Arc<Slots>,
    dummy: u32,
}

impl Default for Subtape {
    fn default() -> Self {
        Self {
            t: vec![],
            ty: TapeType::Base,
            bounds: [Interval::new(f32::NEG_INFINITY, f32::INFINITY); 3],
            slots: Arc::new(Slots::default()),
            dummy: 0,
        }
    }
}

impl Subtape {
    /// Returns the number of clauses in this subtape
    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    /// Returns the register slot assigned to the given clause
    pub fn slot(&self, id: ClauseId) -> usize {
        self.slots.slot(id)
    }

    /// Returns the size of the register file
    pub fn reg_count(&self) -> usize {
        self.slots.count()
    }

    fn contains(&self, p: nalgebra::Vector3<f32>) -> bool {
        self.bounds[0].contains(p.x)
            && self.bounds[1].contains(p.y)
            && self.bounds[2].contains(p.z)
    }
}

/// Immutable tape data, shared between per-worker cursors
pub struct TapeData {
    /// Values for `Constant` clauses, indexed by the clause's `a` field
    pub constants: Vec<f64>,
    /// Context variable ids for `VarFree` clauses, indexed by `a`
    pub vars: Vec<u32>,
    /// Oracles for `Oracle` clauses, indexed by `a`
    pub oracles: Vec<Arc<dyn Oracle>>,
    /// Total number of clause ids, including the reserved sentinel 0
    pub num_clauses: usize,
    /// Number of free variables that must be bound for evaluation
    pub var_count: usize,

    base: Arc<Subtape>,
}

/// A compiled scalar field with a stack of specializations
///
/// The immutable parts (clauses, constants, oracles) are shared behind an
/// [`Arc`]; the cursor, stack, and scratch buffers are private to this
/// value, so each worker forks its own `Tape` and evaluates without
/// contention.
pub struct Tape {
    data: Arc<TapeData>,
    base: Arc<Subtape>,
    tapes: Vec<Subtape>,
    cursor: usize,
    disabled: Vec<bool>,
    remap: Vec<ClauseId>,
}

impl Tape {
    /// Flattens the expression rooted at `root` into a new tape
    pub fn new(ctx: &Context, root: Node) -> Result<Self, Error> {
        let flat = ctx.ordered(root)?;
        if flat.is_empty() {
            return Err(Error::EmptyContext);
        }

        let mut constants = vec![];
        let mut vars = vec![];
        let mut oracles = vec![];

        // Assign dense ids in topological order (1..=n; 0 is the sentinel),
        // then emit each clause at the front so that the final storage order
        // is root-first with leaves last.
        let mut ids = std::collections::HashMap::new();
        for (i, n) in flat.iter().enumerate() {
            ids.insert(*n, (i + 1) as ClauseId);
        }
        let mut t = std::collections::VecDeque::with_capacity(flat.len());
        for n in &flat {
            let id = ids[n];
            let c = match *ctx.get_op(*n).ok_or(Error::BadNode)? {
                Op::Var(Var::X) => Clause {
                    op: Opcode::VarX,
                    id,
                    a: 0,
                    b: 0,
                },
                Op::Var(Var::Y) => Clause {
                    op: Opcode::VarY,
                    id,
                    a: 0,
                    b: 0,
                },
                Op::Var(Var::Z) => Clause {
                    op: Opcode::VarZ,
                    id,
                    a: 0,
                    b: 0,
                },
                Op::Var(Var::Free(v)) => {
                    let a = vars.len() as ClauseId;
                    vars.push(v.get() as u32);
                    Clause {
                        op: Opcode::VarFree,
                        id,
                        a,
                        b: 0,
                    }
                }
                Op::Const(f) => {
                    let a = constants.len() as ClauseId;
                    constants.push(f.0);
                    Clause {
                        op: Opcode::Constant,
                        id,
                        a,
                        b: 0,
                    }
                }
                Op::Oracle(i) => {
                    let a = oracles.len() as ClauseId;
                    oracles.push(ctx.oracles()[i].clone());
                    Clause {
                        op: Opcode::Oracle,
                        id,
                        a,
                        b: 0,
                    }
                }
                Op::Unary(op, child) => Clause {
                    op: op.into(),
                    id,
                    a: ids[&child],
                    b: 0,
                },
                Op::Binary(op, lhs, rhs) => Clause {
                    op: op.into(),
                    id,
                    a: ids[&lhs],
                    b: ids[&rhs],
                },
            };
            t.push_front(c);
        }

        let t: Vec<Clause> = t.into();
        let num_clauses = flat.len() + 1;
        let slots = Arc::new(alloc::assign_slots(&t, num_clauses));
        debug!(
            "built tape with {} clauses over {} registers",
            t.len(),
            slots.count()
        );

        let base = Arc::new(Subtape {
            t,
            ty: TapeType::Base,
            bounds: [Interval::new(f32::NEG_INFINITY, f32::INFINITY); 3],
            slots,
            dummy: 0,
        });
        let data = Arc::new(TapeData {
            constants,
            vars,
            oracles,
            num_clauses,
            var_count: ctx.var_count(),
            base: base.clone(),
        });
        Ok(Tape {
            data,
            base,
            tapes: vec![],
            cursor: 0,
            disabled: vec![false; num_clauses],
            remap: vec![0; num_clauses],
        })
    }

    /// Returns the shared tape data
    pub fn data(&self) -> &TapeData {
        &self.data
    }

    /// Returns the current subtape
    pub fn cur(&self) -> &Subtape {
        if self.cursor == 0 {
            &self.base
        } else {
            &self.tapes[self.cursor - 1]
        }
    }

    /// Returns the size of the register file
    pub fn reg_count(&self) -> usize {
        self.data.base.reg_count()
    }

    /// Returns the total number of clause ids (including the sentinel)
    pub fn num_clauses(&self) -> usize {
        self.data.num_clauses
    }

    /// Returns the fraction of the base tape that is still active
    pub fn utilization(&self) -> f64 {
        self.cur().len() as f64 / self.data.base.len() as f64
    }

    /// Builds an independent cursor over the same clause data
    ///
    /// The fork starts at the pristine base tape with an empty stack; it is
    /// the way to hand a tape to another worker.
    pub fn fork(&self) -> Tape {
        Tape {
            data: self.data.clone(),
            base: self.data.base.clone(),
            tapes: vec![],
            cursor: 0,
            disabled: vec![false; self.data.num_clauses],
            remap: vec![0; self.data.num_clauses],
        }
    }

    /// Clones the current subtape into a shareable snapshot
    ///
    /// Snapshots are what tasks carry across worker threads; they can be
    /// re-installed with [`Tape::install`].
    pub fn snapshot(&self) -> Arc<Subtape> {
        if self.cursor == 0 {
            self.base.clone()
        } else {
            let cur = &self.tapes[self.cursor - 1];
            Arc::new(Subtape {
                t: cur.t.clone(),
                ty: cur.ty,
                bounds: cur.bounds,
                slots: cur.slots.clone(),
                dummy: 0,
            })
        }
    }

    /// Rebases this cursor on a snapshot, clearing the specialization stack
    pub fn install(&mut self, snapshot: Arc<Subtape>) {
        self.base = snapshot;
        self.cursor = 0;
    }

    /// Walks the current subtape in storage order (root first)
    ///
    /// The abort flag is polled at every clause.
    pub fn walk(
        &self,
        mut f: impl FnMut(Opcode, ClauseId, ClauseId, ClauseId),
        abort: &AtomicBool,
    ) {
        for c in &self.cur().t {
            if abort.load(Ordering::Relaxed) {
                break;
            }
            f(c.op, c.id, c.a, c.b);
        }
    }

    /// Walks the current subtape in evaluation order (leaves first),
    /// returning the root clause id
    ///
    /// The abort flag is polled at every clause.
    pub fn rwalk(
        &self,
        mut f: impl FnMut(Opcode, ClauseId, ClauseId, ClauseId),
        abort: &AtomicBool,
    ) -> ClauseId {
        let cur = self.cur();
        for c in cur.t.iter().rev() {
            if abort.load(Ordering::Relaxed) {
                break;
            }
            f(c.op, c.id, c.a, c.b);
        }
        cur.t.first().map(|c| c.id).unwrap_or(0)
    }

    /// Runs the keep-classifier over the current subtape, pushing a
    /// narrower specialization onto the stack
    ///
    /// Dummy-children ops never have their operand fields remapped or
    /// enabled.  If the classifier reports no remaining choices (nothing
    /// returned [`Keep::Both`]), the new subtape is marked as a dummy:
    /// further pushes collapse into a counter bump, since a region with all
    /// branches resolved cannot simplify further in any sub-region.
    ///
    /// The returned [`Handle`] pops the stack when dropped.
    pub fn push<F>(
        &mut self,
        mut keep: F,
        ty: TapeType,
        bounds: [Interval; 3],
    ) -> Handle<'_>
    where
        F: FnMut(Opcode, ClauseId, ClauseId, ClauseId) -> Keep,
    {
        // A dummy tape means every choice is already resolved; just count
        if self.cursor > 0 && self.tapes[self.cursor - 1].dummy > 0 {
            self.tapes[self.cursor - 1].dummy += 1;
            return Handle {
                tape: self,
                disposal: Disposal::Push,
            };
        }

        self.disabled.fill(true);
        self.remap.fill(0);

        let mut has_choices = false;
        {
            let cur = if self.cursor == 0 {
                &*self.base
            } else {
                &self.tapes[self.cursor - 1]
            };
            assert!(!cur.t.is_empty());
            self.disabled[cur.t[0].id as usize] = false;

            for c in &cur.t {
                if self.disabled[c.id as usize] {
                    continue;
                }
                match keep(c.op, c.id, c.a, c.b) {
                    Keep::A => {
                        self.disabled[c.a as usize] = false;
                        self.remap[c.id as usize] = c.a;
                    }
                    Keep::B => {
                        self.disabled[c.b as usize] = false;
                        self.remap[c.id as usize] = c.b;
                    }
                    Keep::Both => has_choices = true,
                    Keep::Always => (),
                }
                if self.remap[c.id as usize] != 0 {
                    self.disabled[c.id as usize] = true;
                } else if !c.op.has_dummy_children() {
                    self.disabled[c.a as usize] = false;
                    self.disabled[c.b as usize] = false;
                }
            }
        }

        // Reuse a stack slot if one exists from a previous push; the stack
        // never shrinks, to amortize allocation across nested evaluations.
        let slot = self.cursor;
        if self.tapes.len() == slot {
            self.tapes.push(Subtape::default());
        }
        let mut next = std::mem::take(&mut self.tapes[slot]);
        next.t.clear();
        {
            let cur = if slot == 0 {
                &*self.base
            } else {
                &self.tapes[slot - 1]
            };
            next.t.reserve(cur.t.len());
            for c in &cur.t {
                if self.disabled[c.id as usize] {
                    continue;
                }
                if c.op.has_dummy_children() {
                    next.t.push(*c);
                } else {
                    // The remap chain may be multi-hop; follow it to a fixed
                    // point
                    let mut ra = c.a;
                    while ra != 0 && self.remap[ra as usize] != 0 {
                        ra = self.remap[ra as usize];
                    }
                    let mut rb = c.b;
                    while rb != 0 && self.remap[rb as usize] != 0 {
                        rb = self.remap[rb as usize];
                    }
                    next.t.push(Clause {
                        op: c.op,
                        id: c.id,
                        a: ra,
                        b: rb,
                    });
                }
            }
            debug_assert!(next.t.len() <= cur.t.len());
            next.ty = ty;
            next.bounds = bounds;
            next.slots = cur.slots.clone();
            next.dummy = u32::from(!has_choices);
        }
        self.tapes[slot] = next;
        self.cursor = slot + 1;

        Handle {
            tape: self,
            disposal: Disposal::Push,
        }
    }

    /// Pops the top of the specialization stack
    ///
    /// Prefer letting a [`Handle`] do this on drop.
    pub fn pop(&mut self) {
        assert!(self.cursor > 0, "cannot pop the base tape");
        let cur = &mut self.tapes[self.cursor - 1];
        if cur.dummy > 1 {
            cur.dummy -= 1;
        } else {
            self.cursor -= 1;
        }
    }

    /// Returns a handle that simply restores the current cursor on drop
    ///
    /// Used when a specialization would be unsound (e.g. the interval
    /// evaluator hit a non-strict operation) but the caller still expects a
    /// scoped handle.
    pub fn hold(&mut self) -> Handle<'_> {
        let prev = self.cursor;
        Handle {
            tape: self,
            disposal: Disposal::Base { prev },
        }
    }

    /// Walks the cursor toward the base until the top-most interval-typed
    /// subtape whose stored bounds contain `p`
    ///
    /// Used to find the tightest tape that is valid at a specific point;
    /// the returned [`Handle`] restores the original cursor on drop.
    pub fn get_base(&mut self, p: nalgebra::Vector3<f32>) -> Handle<'_> {
        let prev = self.cursor;
        while self.cursor > 0 {
            let t = &self.tapes[self.cursor - 1];
            if t.ty == TapeType::Interval && t.contains(p) {
                break;
            }
            self.cursor -= 1;
        }
        Handle {
            tape: self,
            disposal: Disposal::Base { prev },
        }
    }
}

#[derive(Copy, Clone, Debug)]
enum Disposal {
    /// Call `pop` on drop
    Push,
    /// Restore a saved cursor on drop
    Base { prev: usize },
}

/// Scoped ownership of a tape specialization
///
/// Dereferences to the underlying [`Tape`], so nested evaluation and
/// further pushes go through the handle.  Dropping the handle restores the
/// tape's cursor; moving it transfers that responsibility (the source is
/// statically dead after a move, so disposal runs exactly once on every
/// exit path).
pub struct Handle<'a> {
    tape: &'a mut Tape,
    disposal: Disposal,
}

impl Drop for Handle<'_> {
    fn drop(&mut self) {
        match self.disposal {
            Disposal::Push => self.tape.pop(),
            Disposal::Base { prev } => self.tape.cursor = prev,
        }
    }
}

impl std::ops::Deref for Handle<'_> {
    type Target = Tape;
    fn deref(&self) -> &Tape {
        self.tape
    }
}

impl std::ops::DerefMut for Handle<'_> {
    fn deref_mut(&mut self) -> &mut Tape {
        self.tape
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn min_x_neg_x() -> (Context, Node) {
        let mut ctx = Context::new();
        let x = ctx.x();
        let nx = ctx.neg(x).unwrap();
        let out = ctx.min(x, nx).unwrap();
        (ctx, out)
    }

    fn abort() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn test_tape_build() {
        let (ctx, out) = min_x_neg_x();
        let tape = Tape::new(&ctx, out).unwrap();
        assert_eq!(tape.cur().len(), 3);
        assert_eq!(tape.utilization(), 1.0);
        assert_eq!(tape.num_clauses(), 4);

        // Operands must be evaluated before their users
        let mut seen = vec![false; tape.num_clauses()];
        let root = tape.rwalk(
            |op, id, a, b| {
                if !op.has_dummy_children() {
                    for operand in [a, b] {
                        if operand != 0 {
                            assert!(
                                seen[operand as usize],
                                "operand {operand} used before definition"
                            );
                        }
                    }
                }
                seen[id as usize] = true;
            },
            &abort(),
        );
        assert!(seen[root as usize]);
    }

    #[test]
    fn test_walk_order_and_abort() {
        let (ctx, out) = min_x_neg_x();
        let tape = Tape::new(&ctx, out).unwrap();

        // The forward walk visits the root first; operand references of
        // each clause point at later entries
        let mut ids = vec![];
        tape.walk(
            |op, id, a, b| {
                assert!(op.arity() <= 2);
                if op.arity() == 2 {
                    assert!(!op.has_dummy_children());
                    assert_ne!(a, 0);
                    assert_ne!(b, 0);
                }
                ids.push(id);
            },
            &abort(),
        );
        assert_eq!(ids.len(), 3);
        let root = tape.rwalk(|_, _, _, _| (), &abort());
        assert_eq!(ids[0], root);

        // A pre-set abort flag stops the walk immediately
        let stop = AtomicBool::new(true);
        let mut count = 0;
        tape.walk(|_, _, _, _| count += 1, &stop);
        assert_eq!(count, 0);
        tape.rwalk(|_, _, _, _| count += 1, &stop);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_push_keep_b() {
        let (ctx, out) = min_x_neg_x();
        let mut tape = Tape::new(&ctx, out).unwrap();

        // Specialize as if x > 0, so -x always wins the min
        let h = tape.push(
            |op, _id, _a, _b| match op {
                Opcode::Min => Keep::B,
                _ => Keep::Always,
            },
            TapeType::Interval,
            [Interval::new(0.5, 1.0); 3],
        );
        assert_eq!(h.cur().len(), 2); // Neg and VarX
        assert!(h.cur().t.iter().all(|c| c.op != Opcode::Min));
        assert!(h.utilization() < 1.0);
        assert!(h.utilization() > 0.0);
        drop(h);
        assert_eq!(tape.cur().len(), 3);
    }

    #[test]
    fn test_push_remap_chain() {
        // neg(min(min(x, y), y)): resolving the outer min to its left and
        // the inner min to its right leaves neg's operand two remap hops
        // away from y
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let inner = ctx.min(x, y).unwrap(); // id 3
        let mid = ctx.min(inner, y).unwrap(); // id 4
        let out = ctx.neg(mid).unwrap(); // id 5
        let mut tape = Tape::new(&ctx, out).unwrap();
        let h = tape.push(
            |_op, id, _a, _b| match id {
                4 => Keep::A,
                3 => Keep::B,
                _ => Keep::Always,
            },
            TapeType::Interval,
            [Interval::new(0.0, 1.0); 3],
        );
        assert_eq!(h.cur().len(), 2);
        assert_eq!(h.cur().t[0].op, Opcode::Neg);
        assert_eq!(h.cur().t[0].a, 2); // remapped 4 -> 3 -> 2 (y)
        assert_eq!(h.cur().t[1].op, Opcode::VarY);
        drop(h);
    }

    #[test]
    fn test_dummy_collapse() {
        let (ctx, out) = min_x_neg_x();
        let mut tape = Tape::new(&ctx, out).unwrap();
        let keep_b = |op: Opcode, _: ClauseId, _: ClauseId, _: ClauseId| {
            match op {
                Opcode::Min => Keep::B,
                _ => Keep::Always,
            }
        };
        let bounds = [Interval::new(0.5, 1.0); 3];

        // The first choice-free push materializes and marks itself dummy;
        // pushes below it only bump the counter, so the stack stays at one
        // entry no matter how deep we go
        let mut h = tape.push(keep_b, TapeType::Interval, bounds);
        assert_eq!(h.tapes.len(), 1);
        {
            let mut h2 = h.push(keep_b, TapeType::Interval, bounds);
            assert_eq!(h2.tapes.len(), 1);
            let h3 = h2.push(keep_b, TapeType::Interval, bounds);
            assert_eq!(h3.tapes.len(), 1);
        }
        assert_eq!(h.cur().len(), 2);
        drop(h);
        assert_eq!(tape.cursor, 0);
        assert_eq!(tape.utilization(), 1.0);
    }

    #[test]
    fn test_repeated_push_pop_does_not_grow() {
        let (ctx, out) = min_x_neg_x();
        let mut tape = Tape::new(&ctx, out).unwrap();
        for _ in 0..32 {
            let h = tape.push(
                |_, _, _, _| Keep::Both,
                TapeType::Interval,
                [Interval::new(-1.0, 1.0); 3],
            );
            drop(h);
        }
        assert_eq!(tape.tapes.len(), 1);
        assert_eq!(tape.cursor, 0);
    }

    #[test]
    fn test_handle_move() {
        let (ctx, out) = min_x_neg_x();
        let mut tape = Tape::new(&ctx, out).unwrap();
        {
            let a = tape.push(
                |_, _, _, _| Keep::Both,
                TapeType::Interval,
                [Interval::new(-1.0, 1.0); 3],
            );
            assert_eq!(a.cursor, 1);
            let b = a; // move: disposal travels with the value
            assert_eq!(b.cursor, 1);
            // dropping `b` pops exactly once; `a` is statically dead
        }
        assert_eq!(tape.cursor, 0);
    }

    #[test]
    fn test_get_base() {
        let (ctx, out) = min_x_neg_x();
        let mut tape = Tape::new(&ctx, out).unwrap();
        let mut h = tape.push(
            |_, _, _, _| Keep::Both,
            TapeType::Interval,
            [Interval::new(0.0, 1.0); 3],
        );
        {
            // Inside the box: the pushed tape remains active
            let g = h.get_base(nalgebra::Vector3::new(0.5, 0.5, 0.5));
            assert_eq!(g.cursor, 1);
        }
        {
            // Outside the box: fall back to the base tape
            let g = h.get_base(nalgebra::Vector3::new(2.0, 0.5, 0.5));
            assert_eq!(g.cursor, 0);
        }
        // The handle restored the cursor both times
        assert_eq!(h.cursor, 1);
        drop(h);
        assert_eq!(tape.cursor, 0);
    }

    #[test]
    fn test_snapshot_install() {
        let (ctx, out) = min_x_neg_x();
        let mut tape = Tape::new(&ctx, out).unwrap();
        let snap = {
            let h = tape.push(
                |op, _, _, _| match op {
                    Opcode::Min => Keep::B,
                    _ => Keep::Always,
                },
                TapeType::Interval,
                [Interval::new(0.5, 1.0); 3],
            );
            h.snapshot()
        };
        let mut fork = tape.fork();
        assert_eq!(fork.cur().len(), 3);
        fork.install(snap);
        assert_eq!(fork.cur().len(), 2);
        assert!(fork.utilization() < 1.0);
    }
}
