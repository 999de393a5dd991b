//! Adaptive simplex-cell tree construction
//!
//! Each cell of the tree either resolves by interval pruning (wholly empty
//! or filled), terminates as a sampled leaf, or subdivides into 2^N
//! children under a specialized tape.  Leaves carry one vertex per
//! subspace, placed by bounded QEF minimization; completed sibling sets
//! merge bottom-up when the re-solved error stays below threshold.
use crate::{
    error::Error,
    eval::EvalBundle,
    simplex::{
        neighbors::SimplexNeighbors,
        pool::WorkerPools,
        qef::Qef,
        region::Region,
        subspace::{corner_count, subspace_count, SubspaceIndex},
        BuildSettings,
    },
    tape::{Handle, Subtape, Tape},
};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arrayvec::ArrayVec;
use nalgebra::{SVector, Vector3};

/// Classification of a cell against the isosurface
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CellType {
    /// Not yet evaluated (only seen in cancelled builds)
    Unknown,
    /// The field is strictly positive over the cell
    Empty,
    /// The field is strictly negative over the cell
    Filled,
    /// The cell may cross the isosurface
    Ambiguous,
}

/// One vertex record per subspace of a leaf cell
///
/// A record may be shared by up to 2^k cells (k = number of floating axes
/// of the subspace); the `Arc` strong count is the reference count, and the
/// record returns to its pool when the last owner releases it.  `index` is
/// the globally-unique vertex id assigned after construction (0 means
/// unassigned).
pub struct SimplexLeafSubspace<const N: usize> {
    pub qef: Qef,
    pub vert: SVector<f64, N>,
    pub inside: bool,
    pub index: AtomicU64,
}

impl<const N: usize> SimplexLeafSubspace<N> {
    pub fn new() -> Self {
        Self {
            qef: Qef::default(),
            vert: SVector::zeros(),
            inside: false,
            index: AtomicU64::new(0),
        }
    }

    pub fn reset(&mut self) {
        self.qef.reset();
        self.vert = SVector::zeros();
        self.inside = false;
        self.index.store(0, Ordering::Relaxed);
    }
}

impl<const N: usize> Default for SimplexLeafSubspace<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-leaf data: recursion level, the tape the leaf was evaluated under,
/// and owning references to its 3^N subspace records
pub struct SimplexLeaf<const N: usize> {
    pub level: usize,
    pub tape: Option<Arc<Subtape>>,
    pub sub: ArrayVec<Arc<SimplexLeafSubspace<N>>, 27>,
}

impl<const N: usize> SimplexLeaf<N> {
    pub fn new() -> Self {
        Self {
            level: 0,
            tape: None,
            sub: ArrayVec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.level = 0;
        self.tape = None;
        self.sub.clear();
    }
}

impl<const N: usize> Default for SimplexLeaf<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A node of the simplex-cell tree: either a branch with 2^N children or a
/// leaf
pub struct SimplexTree<const N: usize> {
    pub ty: CellType,
    children: Vec<SimplexTree<N>>,
    leaf: Option<Box<SimplexLeaf<N>>>,
}

impl<const N: usize> SimplexTree<N> {
    pub(crate) fn unknown() -> Self {
        Self {
            ty: CellType::Unknown,
            children: vec![],
            leaf: None,
        }
    }

    pub(crate) fn leaf_node(ty: CellType, leaf: Box<SimplexLeaf<N>>) -> Self {
        Self {
            ty,
            children: vec![],
            leaf: Some(leaf),
        }
    }

    pub(crate) fn branch(children: Vec<SimplexTree<N>>) -> Self {
        debug_assert_eq!(children.len(), corner_count(N));
        Self {
            ty: CellType::Ambiguous,
            children,
            leaf: None,
        }
    }

    /// Checks whether this cell has children
    pub fn is_branch(&self) -> bool {
        !self.children.is_empty()
    }

    /// Returns the cell's children (empty unless this is a branch)
    pub fn children(&self) -> &[SimplexTree<N>] {
        &self.children
    }

    /// Returns the cell's leaf record, if it has one
    pub fn leaf(&self) -> Option<&SimplexLeaf<N>> {
        self.leaf.as_deref()
    }

    /// Calls `f` on every leaf record in the tree
    pub fn for_each_leaf<F: FnMut(&SimplexLeaf<N>)>(&self, f: &mut F) {
        if let Some(leaf) = &self.leaf {
            f(leaf);
        }
        for c in &self.children {
            c.for_each_leaf(f);
        }
    }

    /// Counts the leaf records in the tree
    pub fn leaf_count(&self) -> usize {
        let mut n = 0;
        self.for_each_leaf(&mut |_| n += 1);
        n
    }

    /// Releases the whole tree's nodes and leaves back to a pool
    pub fn release_to(self, pools: &mut WorkerPools<N>) {
        for c in self.children {
            c.release_to(pools);
        }
        if let Some(mut leaf) = self.leaf {
            for s in leaf.sub.drain(..) {
                pools.put_sub(s);
            }
            leaf.tape = None;
            pools.put_leaf(leaf);
        }
    }

    /// Assigns a dense, globally unique index to every distinct subspace
    /// vertex, returning the number assigned
    ///
    /// Runs single-threaded over the finished tree.  Indices start at 1 (0
    /// is reserved for unassigned) and are stable for a given tree shape,
    /// since the walk order is deterministic.
    pub fn assign_indices(&self) -> u64 {
        let mut index = 1;
        let mut stack = vec![SimplexNeighbors::empty()];
        let mut path = vec![];
        self.assign_indices_inner(&mut index, &mut stack, &mut path);
        index - 1
    }

    fn assign_indices_inner<'a>(
        &'a self,
        index: &mut u64,
        stack: &mut Vec<SimplexNeighbors<'a, N>>,
        path: &mut Vec<usize>,
    ) {
        if self.is_branch() {
            for (i, c) in self.children.iter().enumerate() {
                // Build the child's neighbors from ours and its siblings;
                // the stack is re-resolved at each level rather than held
                // by reference, since it grows during the walk
                let next = stack.last().unwrap().push(i, &self.children);
                stack.push(next);
                path.push(i);
                c.assign_indices_inner(index, stack, path);
                stack.pop();
                path.pop();
            }
        } else if let Some(leaf) = &self.leaf {
            let neighbors = stack.last().unwrap();
            for i in 0..subspace_count(N) {
                let sub = &leaf.sub[i];
                if sub.index.load(Ordering::Relaxed) != 0 {
                    continue; // shared record, assigned through another cell
                }
                let s = SubspaceIndex(i as u8);

                // A same-level neighbor may have assigned this vertex
                let n = neighbors.get_index(s);
                if n != 0 {
                    sub.index.store(n, Ordering::Relaxed);
                    continue;
                }

                // A corner may also be a corner of an ancestor: climb while
                // the child-index chain keeps the corner on the boundary,
                // checking each ancestor's neighbors
                if s.is_corner() {
                    let mut found = 0;
                    let mut k = path.len();
                    while k >= 1 && path[k - 1] == s.pos() as usize {
                        let n = stack[k - 1].get_index(s);
                        if n != 0 {
                            found = n;
                            break;
                        }
                        k -= 1;
                    }
                    if found != 0 {
                        sub.index.store(found, Ordering::Relaxed);
                        continue;
                    }
                }

                sub.index.store(*index, Ordering::Relaxed);
                *index += 1;
            }
        }
    }
}

/// Converts vertex signs into a cell type
///
/// If every subspace vertex agrees, the cell can be upgraded from
/// AMBIGUOUS to EMPTY or FILLED.
fn check_vertex_signs<const N: usize>(leaf: &SimplexLeaf<N>) -> CellType {
    let all_inside = leaf.sub.iter().all(|s| s.inside);
    let all_outside = leaf.sub.iter().all(|s| !s.inside);
    if all_inside {
        CellType::Filled
    } else if all_outside {
        CellType::Empty
    } else {
        CellType::Ambiguous
    }
}

/// Positions every unsolved subspace vertex by summing the QEFs of its
/// contained subspaces and solving over the matching face of the region
///
/// Returns the maximum residual error among subspaces with at least one
/// degree of freedom (corners are pinned, so their residual says nothing
/// about how well a vertex can represent the cell).
fn solve_subspaces<const N: usize>(
    leaf: &mut SimplexLeaf<N>,
    region: &Region<N>,
    already: &[bool; 27],
) -> f64 {
    let mut max_err = 0.0f64;
    for i in 0..subspace_count(N) {
        if already[i] {
            continue;
        }
        let s = SubspaceIndex(i as u8);
        let mut qef = Qef::default();
        for j in 0..subspace_count(N) {
            if s.contains(SubspaceIndex(j as u8)) {
                qef += leaf.sub[j].qef;
            }
        }
        let (sol, err) = qef.solve_bounded(
            region.lower3(),
            region.upper3(),
            s.floating(),
            s.pos(),
        );
        let sub = Arc::get_mut(&mut leaf.sub[i]).unwrap();
        sub.vert = SVector::from_fn(|d, _| sol[d]);
        if s.dimension() > 0 {
            max_err = max_err.max(err);
        }
    }
    max_err
}

/// Result of evaluating a single cell
pub(crate) enum CellEval<'a, const N: usize> {
    /// The cell is finished (leaf, or placeholder during cancellation)
    Done(SimplexTree<N>),
    /// The cell must subdivide; the handle holds its specialized tape
    Recurse(Handle<'a>),
}

/// Per-worker construction state: evaluators, pools, and configuration
///
/// Everything here is private to one worker; the only cross-worker state
/// is the cancellation flag and the first-error slot.
pub(crate) struct CellBuilder<const N: usize> {
    eval: EvalBundle,
    pub pools: WorkerPools<N>,
    max_err: f64,
    min_feature: f64,
    cancel: Arc<AtomicBool>,
    err: Arc<Mutex<Option<Error>>>,
}

impl<const N: usize> CellBuilder<N> {
    pub fn new(
        tape: &Tape,
        settings: &BuildSettings,
        cancel: Arc<AtomicBool>,
        err: Arc<Mutex<Option<Error>>>,
        pools: WorkerPools<N>,
    ) -> Result<Self, Error> {
        Ok(Self {
            eval: EvalBundle::with_vars(tape, settings.vars.clone())?,
            pools,
            max_err: settings.max_err,
            min_feature: settings.min_feature,
            cancel,
            err,
        })
    }

    /// Records the first error and requests a cooperative drain
    fn fail(&mut self, e: Error) {
        let mut guard = self.err.lock().unwrap();
        guard.get_or_insert(e);
        self.cancel.store(true, Ordering::Relaxed);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn in_cell(e: Error, region: &Region<N>) -> Error {
        e.in_cell(region.lower3().into(), region.upper3().into())
    }

    /// Evaluates one cell: prune by interval, terminate as a leaf, or
    /// request recursion under the pushed tape
    pub fn eval_cell<'a>(
        &mut self,
        tape: &'a mut Tape,
        region: &Region<N>,
    ) -> CellEval<'a, N> {
        if self.cancelled() {
            return CellEval::Done(SimplexTree::unknown());
        }
        if region.level == 0
            || (self.min_feature > 0.0
                && region.min_side() / 2.0 < self.min_feature)
        {
            return CellEval::Done(self.eval_leaf(tape, region));
        }

        let lo = region.lower3f();
        let hi = region.upper3f();
        let (i, mut h) =
            match self.eval.interval.eval_and_push(lo, hi, tape, &self.cancel)
            {
                Ok(v) => v,
                Err(e) => {
                    self.fail(Self::in_cell(e, region));
                    return CellEval::Done(SimplexTree::unknown());
                }
            };
        let ty = if !self.eval.interval.is_safe() {
            CellType::Ambiguous
        } else if i.upper() < 0.0 {
            CellType::Filled
        } else if i.lower() > 0.0 {
            CellType::Empty
        } else {
            CellType::Ambiguous
        };

        if ty == CellType::Empty || ty == CellType::Filled {
            let mut leaf = self.pools.get_leaf();
            leaf.level = region.level;
            leaf.tape = Some(h.snapshot());
            let r = self.find_leaf_vertices(
                &mut h,
                region,
                &mut leaf,
                ty,
                &SimplexNeighbors::empty(),
            );
            CellEval::Done(match r {
                Ok(_) => SimplexTree::leaf_node(ty, leaf),
                Err(e) => {
                    self.fail(Self::in_cell(e, region));
                    self.release_leaf(leaf);
                    SimplexTree::unknown()
                }
            })
        } else {
            CellEval::Recurse(h)
        }
    }

    /// Unconditionally samples a cell at the finest level
    fn eval_leaf(
        &mut self,
        tape: &mut Tape,
        region: &Region<N>,
    ) -> SimplexTree<N> {
        let mut leaf = self.pools.get_leaf();
        leaf.level = region.level;
        leaf.tape = Some(tape.snapshot());
        let r = self.find_leaf_vertices(
            tape,
            region,
            &mut leaf,
            CellType::Ambiguous,
            &SimplexNeighbors::empty(),
        );
        match r {
            Ok(_) => {
                let ty = check_vertex_signs(&leaf);
                SimplexTree::leaf_node(ty, leaf)
            }
            Err(e) => {
                self.fail(Self::in_cell(e, region));
                self.release_leaf(leaf);
                SimplexTree::unknown()
            }
        }
    }

    /// Single-threaded recursive build
    pub fn recurse(
        &mut self,
        tape: &mut Tape,
        region: &Region<N>,
    ) -> SimplexTree<N> {
        match self.eval_cell(tape, region) {
            CellEval::Done(t) => t,
            CellEval::Recurse(mut h) => {
                let mut children = Vec::with_capacity(corner_count(N));
                for child in region.subdivide() {
                    children.push(self.recurse(&mut h, &child));
                }
                self.collect_children(&mut h, region, children)
            }
        }
    }

    /// Borrows or allocates the 3^N subspace records, populates the corner
    /// QEFs from samples (features at ambiguous corners), solves every
    /// subspace vertex, and stores inside/outside signs
    ///
    /// Returns the maximum QEF residual from the subspace solves.
    pub(crate) fn find_leaf_vertices(
        &mut self,
        tape: &mut Tape,
        region: &Region<N>,
        leaf: &mut SimplexLeaf<N>,
        ty: CellType,
        neighbors: &SimplexNeighbors<N>,
    ) -> Result<f64, Error> {
        debug_assert!(leaf.sub.is_empty());
        let mut already = [false; 27];

        // Borrow solved records from neighbors whenever possible
        for i in 0..subspace_count(N) {
            if let Some((nleaf, j)) = neighbors.check(SubspaceIndex(i as u8))
            {
                leaf.sub.push(nleaf.sub[j.index()].clone());
                already[i] = true;
            } else {
                leaf.sub.push(self.pools.get_sub());
            }
        }

        // Sample the corners that weren't borrowed, in one array call
        let mut corner_index: ArrayVec<usize, 8> = ArrayVec::new();
        for c in 0..corner_count(N) {
            let s = SubspaceIndex::from_corner(c);
            if !already[s.index()] {
                self.eval.deriv.set(region.corner3f(c), corner_index.len());
                corner_index.push(c);
            }
        }
        if !corner_index.is_empty() {
            let EvalBundle { deriv, feature, .. } = &mut self.eval;
            let (ds, ambig) =
                deriv.derivs(corner_index.len(), tape, &self.cancel)?;
            for (k, &c) in corner_index.iter().enumerate() {
                let s = SubspaceIndex::from_corner(c);
                let pos = region.corner3(c);
                let value = f64::from(ds[k].value());
                let push = |sub: &mut SimplexLeafSubspace<N>,
                            d: Vector3<f32>| {
                    let mut n = d.map(f64::from);
                    if !n.iter().all(|v| v.is_finite()) {
                        n.fill(0.0);
                    }
                    sub.qef.insert(pos, n, value);
                };
                if ambig[k] {
                    // Ambiguous corner: push one sample per feature
                    let fs = feature.features(
                        region.corner3f(c),
                        tape,
                        &self.cancel,
                    )?;
                    let sub =
                        Arc::get_mut(&mut leaf.sub[s.index()]).unwrap();
                    for f in fs {
                        push(&mut *sub, *f);
                    }
                } else {
                    let sub =
                        Arc::get_mut(&mut leaf.sub[s.index()]).unwrap();
                    push(&mut *sub, ds[k].d());
                }
            }
        }

        let err = solve_subspaces(leaf, region, &already);

        if ty == CellType::Ambiguous {
            self.save_vertex_signs(tape, region, leaf, &already)?;
        } else {
            for (i, s) in leaf.sub.iter_mut().enumerate() {
                if !already[i] {
                    Arc::get_mut(s).unwrap().inside =
                        ty == CellType::Filled;
                }
            }
        }
        Ok(err)
    }

    /// Classifies each unsolved subspace vertex as inside or outside
    ///
    /// `f < 0` is inside; an exact zero falls back to feature-based
    /// classification.
    fn save_vertex_signs(
        &mut self,
        tape: &mut Tape,
        region: &Region<N>,
        leaf: &mut SimplexLeaf<N>,
        already: &[bool; 27],
    ) -> Result<(), Error> {
        for i in 0..subspace_count(N) {
            if already[i] {
                continue;
            }
            let p = region.pad3f(leaf.sub[i].vert);
            self.eval.array.set(p, 0);
            let out = self.eval.array.values(1, tape, &self.cancel)?[0];
            let inside = if out == 0.0 {
                self.eval.feature.is_inside(p, tape, &self.cancel)?
            } else {
                out < 0.0
            };
            Arc::get_mut(&mut leaf.sub[i]).unwrap().inside = inside;
        }
        Ok(())
    }

    /// Merges a completed set of 2^N children into their parent
    ///
    /// If any child is still a branch the parent stays a branch.  An
    /// all-empty or all-full set collapses unconditionally; otherwise the
    /// children's subspace QEFs are summed into the parent (deduplicating
    /// shared faces), the parent's vertices are re-solved, and the merge
    /// commits only when the residual stays below `max_err`.
    pub(crate) fn collect_children(
        &mut self,
        tape: &mut Tape,
        region: &Region<N>,
        children: Vec<SimplexTree<N>>,
    ) -> SimplexTree<N> {
        if children
            .iter()
            .any(|c| c.is_branch() || c.ty == CellType::Unknown)
        {
            return SimplexTree::branch(children);
        }

        let mut leaf = self.pools.get_leaf();
        leaf.level = region.level;
        leaf.tape = Some(tape.snapshot());

        let all_empty = children.iter().all(|c| c.ty == CellType::Empty);
        let all_full = children.iter().all(|c| c.ty == CellType::Filled);
        if all_empty || all_full {
            let ty = if all_empty {
                CellType::Empty
            } else {
                CellType::Filled
            };
            let r = self.find_leaf_vertices(
                tape,
                region,
                &mut leaf,
                ty,
                &SimplexNeighbors::empty(),
            );
            return match r {
                Ok(_) => {
                    self.release_children(children);
                    SimplexTree::leaf_node(ty, leaf)
                }
                Err(e) => {
                    self.fail(Self::in_cell(e, region));
                    self.release_leaf(leaf);
                    SimplexTree::branch(children)
                }
            };
        }

        // Sum child subspace QEFs into the parent.  To avoid
        // double-counting records shared between siblings, a child's
        // subspace participates only if each of its fixed axes is either
        // high or the child itself is low on that axis.
        for _ in 0..subspace_count(N) {
            leaf.sub.push(self.pools.get_sub());
        }
        for (ci, child) in children.iter().enumerate() {
            let cleaf = child.leaf().unwrap();
            for j in 0..subspace_count(N) {
                let s = SubspaceIndex(j as u8);
                let fixed = s.fixed(N);
                let pos = s.pos();
                let floating = s.floating();

                let mut valid = true;
                for d in 0..N {
                    if fixed & (1 << d) != 0 {
                        valid &= (pos & (1 << d) != 0)
                            || (ci & (1 << d) == 0);
                    }
                }
                if !valid {
                    continue;
                }

                // Map the child subspace into the parent frame: floating
                // axes stay floating; a fixed axis stays fixed only where
                // it agrees with the child's corner
                let mut floating_out = 0u8;
                let mut pos_out = 0u8;
                for d in 0..N {
                    if floating & (1 << d) != 0
                        || (pos >> d) & 1 != ((ci >> d) & 1) as u8
                    {
                        floating_out |= 1 << d;
                    } else {
                        pos_out |= pos & (1 << d);
                    }
                }
                let target = SubspaceIndex::from_pos_and_floating(
                    pos_out,
                    floating_out,
                );
                let q = cleaf.sub[j].qef;
                Arc::get_mut(&mut leaf.sub[target.index()]).unwrap().qef +=
                    q;
            }
        }

        let already = [false; 27];
        let err = solve_subspaces(&mut leaf, region, &already);
        if err < self.max_err {
            if let Err(e) =
                self.save_vertex_signs(tape, region, &mut leaf, &already)
            {
                self.fail(Self::in_cell(e, region));
                self.release_leaf(leaf);
                return SimplexTree::branch(children);
            }
            let ty = check_vertex_signs(&leaf);
            self.release_children(children);
            SimplexTree::leaf_node(ty, leaf)
        } else {
            self.release_leaf(leaf);
            SimplexTree::branch(children)
        }
    }

    fn release_children(&mut self, children: Vec<SimplexTree<N>>) {
        for c in children {
            c.release_to(&mut self.pools);
        }
    }

    fn release_leaf(&mut self, mut leaf: Box<SimplexLeaf<N>>) {
        for s in leaf.sub.drain(..) {
            self.pools.put_sub(s);
        }
        leaf.tape = None;
        self.pools.put_leaf(leaf);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::Context;

    fn sphere_context(r: f64) -> (Context, crate::context::Node) {
        let mut ctx = Context::new();
        let (x, y, z) = ctx.axes();
        let x2 = ctx.square(x).unwrap();
        let y2 = ctx.square(y).unwrap();
        let z2 = ctx.square(z).unwrap();
        let s = ctx.add(x2, y2).unwrap();
        let s = ctx.add(s, z2).unwrap();
        let f = ctx.sub(s, r * r).unwrap();
        (ctx, f)
    }

    fn builder(tape: &Tape) -> CellBuilder<3> {
        CellBuilder::new(
            tape,
            &BuildSettings::default(),
            Arc::new(AtomicBool::new(false)),
            Arc::new(Mutex::new(None)),
            WorkerPools::default(),
        )
        .unwrap()
    }

    fn cube_region(level: usize) -> Region<3> {
        Region::new(
            SVector::from([-1.0, -1.0, -1.0]),
            SVector::from([1.0, 1.0, 1.0]),
            level,
        )
    }

    #[test]
    fn test_filled_leaf() {
        // f = -1 resolves to a FILLED leaf at the root without subdividing
        let mut ctx = Context::new();
        let c = ctx.constant(-1.0);
        let mut tape = Tape::new(&ctx, c).unwrap();
        let mut b = builder(&tape);
        let t = b.recurse(&mut tape, &cube_region(5));
        assert_eq!(t.ty, CellType::Filled);
        assert!(!t.is_branch());
        let leaf = t.leaf().unwrap();
        assert_eq!(leaf.sub.len(), 27);
        assert!(leaf.sub.iter().all(|s| s.inside));
        assert_eq!(t.leaf_count(), 1);
        t.release_to(&mut b.pools);
        assert_eq!(b.pools.live(), 0);
    }

    #[test]
    fn test_empty_leaf_signs() {
        let (ctx, f) = sphere_context(0.1);
        let mut tape = Tape::new(&ctx, f).unwrap();
        let mut b = builder(&tape);
        // A region away from the sphere is EMPTY
        let r = Region::new(
            SVector::from([0.5, 0.5, 0.5]),
            SVector::from([1.0, 1.0, 1.0]),
            3,
        );
        let t = b.recurse(&mut tape, &r);
        assert_eq!(t.ty, CellType::Empty);
        let leaf = t.leaf().unwrap();
        assert!(leaf.sub.iter().all(|s| !s.inside));
        t.release_to(&mut b.pools);
    }

    #[test]
    fn test_leaf_vertex_on_plane() {
        // f = x: the body vertex of a leaf cell lands on the plane x = 0
        let mut ctx = Context::new();
        let f = ctx.x();
        let mut tape = Tape::new(&ctx, f).unwrap();
        let mut b = builder(&tape);
        let t = b.recurse(&mut tape, &cube_region(0));
        assert_eq!(t.ty, CellType::Ambiguous);
        let leaf = t.leaf().unwrap();
        let body = SubspaceIndex::from_pos_and_floating(0, 0b111);
        let v = leaf.sub[body.index()].vert;
        assert!(v.x.abs() < 1e-6, "body vertex {v:?} should be on x = 0");
        // Corner vertices sit exactly on the corners, with correct signs
        for c in 0..8 {
            let s = SubspaceIndex::from_corner(c);
            let sub = &leaf.sub[s.index()];
            assert_eq!(sub.vert, cube_region(0).corner(c));
            assert_eq!(sub.inside, sub.vert.x < 0.0);
        }
        t.release_to(&mut b.pools);
    }

    #[test]
    fn test_neighbor_borrow() {
        // Fill one child cell, then fill its sibling with neighbors that
        // reference it: the shared face subspaces must be borrowed, not
        // reallocated
        let (ctx, f) = sphere_context(0.5);
        let mut tape = Tape::new(&ctx, f).unwrap();
        let mut b = builder(&tape);

        let parent = cube_region(1);
        let regions = parent.subdivide();
        let t0 = b.eval_leaf(&mut tape, &regions[0]);
        assert!(t0.leaf().is_some());

        let mut siblings: Vec<SimplexTree<3>> =
            (0..8).map(|_| SimplexTree::unknown()).collect();
        siblings[0] = t0;

        // Child 1 is child 0's neighbor across x
        let neighbors =
            SimplexNeighbors::empty().push(1, &siblings);
        let mut leaf = b.pools.get_leaf();
        let live_before = b.pools.live();
        b.find_leaf_vertices(
            &mut tape,
            &regions[1],
            &mut leaf,
            CellType::Ambiguous,
            &neighbors,
        )
        .unwrap();
        drop(neighbors);

        // The x-low face of child 1 is the x-high face of child 0
        let mine = SubspaceIndex::from_pos_and_floating(0b000, 0b110);
        let theirs = SubspaceIndex::from_pos_and_floating(0b001, 0b110);
        let t0_leaf = siblings[0].leaf().unwrap();
        assert!(Arc::ptr_eq(
            &leaf.sub[mine.index()],
            &t0_leaf.sub[theirs.index()]
        ));
        assert_eq!(
            Arc::strong_count(&leaf.sub[mine.index()]),
            2,
            "borrowed subspace must be shared by exactly two cells"
        );
        // 9 of the 27 records were borrowed rather than allocated
        assert_eq!(b.pools.live() - live_before, 27 - 9);

        b.release_leaf(leaf);
        for s in siblings {
            s.release_to(&mut b.pools);
        }
        assert_eq!(b.pools.live(), 0);
    }

    #[test]
    fn test_merge_rejects_curved_region() {
        // Cells crossing a curved surface fail the merge threshold, so the
        // tree stays subdivided near the sphere
        let (ctx, f) = sphere_context(0.5);
        let mut tape = Tape::new(&ctx, f).unwrap();
        let mut b = builder(&tape);
        let t = b.recurse(&mut tape, &cube_region(3));
        assert!(t.is_branch());
        // Every cell type is coherent: branches have no leaf, leaves have
        // full subspace arrays
        fn check(t: &SimplexTree<3>) {
            if t.is_branch() {
                assert!(t.leaf().is_none());
                assert_eq!(t.children().len(), 8);
                for c in t.children() {
                    check(c);
                }
            } else {
                let leaf = t.leaf().unwrap();
                assert_eq!(leaf.sub.len(), 27);
                match t.ty {
                    CellType::Filled => {
                        assert!(leaf.sub.iter().all(|s| s.inside))
                    }
                    CellType::Empty => {
                        assert!(leaf.sub.iter().all(|s| !s.inside))
                    }
                    _ => (),
                }
            }
        }
        check(&t);
        t.release_to(&mut b.pools);
        assert_eq!(b.pools.live(), 0);
    }
}
