//! Simplex-cell spatial tree: regions, QEF vertex placement, neighbor
//! lookup, object pools, and concurrent construction
mod neighbors;
mod pool;
mod qef;
mod region;
mod subspace;
mod tree;
mod worker;

pub use neighbors::SimplexNeighbors;
pub use pool::{ObjectPool, Pools, WorkerPools};
pub use qef::Qef;
pub use region::Region;
pub use subspace::{corner_count, subspace_count, SubspaceIndex};
pub use tree::{
    CellType, SimplexLeaf, SimplexLeafSubspace, SimplexTree,
};

use crate::{
    context::{Context, Node},
    error::Error,
    tape::Tape,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

/// Configuration for a tree build
#[derive(Clone)]
pub struct BuildSettings {
    /// Maximum QEF residual at which a set of children merges into their
    /// parent
    pub max_err: f64,

    /// Minimum region side length; cells stop subdividing when a child
    /// would drop below this (0 disables the bound and recursion is purely
    /// level-driven)
    pub min_feature: f64,

    /// Worker count; 0 runs the recursion inline on the calling thread
    pub threads: usize,

    /// Values for the expression's free variables, by dense id
    pub vars: Vec<f32>,

    /// Cooperative cancellation flag, polled at tape walks and child
    /// spawns
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            max_err: 1e-6,
            min_feature: 0.0,
            threads: 0,
            vars: vec![],
            cancel: None,
        }
    }
}

impl<const N: usize> SimplexTree<N> {
    /// Builds a simplex tree for the expression over the given region
    ///
    /// This is the whole pipeline short of index assignment: compile the
    /// tape, then recursively prune, sample, and merge.  Call
    /// [`SimplexTree::assign_indices`] on the result to number the
    /// subspace vertices.
    pub fn build(
        ctx: &Context,
        root: Node,
        region: Region<N>,
        settings: &BuildSettings,
    ) -> Result<Self, Error> {
        let mut pools = Pools::new(settings.threads);
        Self::build_with_pools(ctx, root, region, settings, &mut pools)
    }

    /// Builds a simplex tree, reusing (and growing) caller-owned pools
    ///
    /// Pools keep their allocated capacity across builds; on error or
    /// cancellation every object the build allocated is released back
    /// before returning.
    pub fn build_with_pools(
        ctx: &Context,
        root: Node,
        region: Region<N>,
        settings: &BuildSettings,
        pools: &mut Pools<N>,
    ) -> Result<Self, Error> {
        assert!(
            N >= 1 && N <= 3,
            "cell collections are sized for 1, 2, or 3 dimensions"
        );
        while pools.workers.len() < settings.threads.max(1) {
            pools.workers.push(Default::default());
        }
        let mut tape = Tape::new(ctx, root)?;
        let cancel = settings
            .cancel
            .clone()
            .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
        let err = Arc::new(Mutex::new(None));
        debug!(
            "building {}-dimensional simplex tree to level {} on {} workers",
            N,
            region.level,
            settings.threads.max(1),
        );

        let out = if settings.threads == 0 {
            let mut builder = tree::CellBuilder::new(
                &tape,
                settings,
                cancel.clone(),
                err.clone(),
                std::mem::take(&mut pools.workers[0]),
            )?;
            let t = builder.recurse(&mut tape, &region);
            pools.workers[0] = builder.pools;
            t
        } else {
            worker::build_parallel(
                &tape, &region, settings, &cancel, &err, pools,
            )?
        };

        let first_err = err.lock().unwrap().take();
        if let Some(e) = first_err {
            out.release_to(&mut pools.workers[0]);
            return Err(e);
        }
        if cancel.load(Ordering::Relaxed) {
            out.release_to(&mut pools.workers[0]);
            return Err(Error::Cancelled);
        }
        debug!("built simplex tree with {} leaves", out.leaf_count());
        Ok(out)
    }
}
