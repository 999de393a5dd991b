//! Same-level neighbor lookup for simplex cells
//!
//! Neighbors are resolved structurally while descending the tree, never
//! through owning pointers: a child's neighbor in some direction is either
//! a sibling (from the parent's children array) or a child of the parent's
//! neighbor in that direction.  Directions reuse the base-3
//! [`SubspaceIndex`] digit scheme, with 0 / 1 meaning "across our low /
//! high boundary" and 2 meaning "same position".
use crate::simplex::{
    subspace::{subspace_count, SubspaceIndex},
    tree::{SimplexLeaf, SimplexTree},
};

use std::sync::atomic::Ordering;

use arrayvec::ArrayVec;

/// References to the same-level neighbors of one cell
#[derive(Clone)]
pub struct SimplexNeighbors<'a, const N: usize> {
    cells: ArrayVec<Option<&'a SimplexTree<N>>, 27>,
}

impl<'a, const N: usize> SimplexNeighbors<'a, N> {
    /// Builds a neighbor set with every direction unresolved
    pub fn empty() -> Self {
        let mut cells = ArrayVec::new();
        for _ in 0..subspace_count(N) {
            cells.push(None);
        }
        Self { cells }
    }

    /// Builds the neighbors of child `c` from this (parent-level) neighbor
    /// set and the child's siblings
    pub fn push(
        &self,
        c: usize,
        siblings: &'a [SimplexTree<N>],
    ) -> SimplexNeighbors<'a, N> {
        let mut out = Self::empty();
        for q in 0..subspace_count(N) {
            let dir = SubspaceIndex(q as u8);
            if dir.dimension() == N {
                continue; // the all-same direction is the cell itself
            }

            // Offset the child's corner coordinates along the direction;
            // axes that stay in 0..=1 resolve within this set of siblings,
            // axes that overflow cross into the parent's neighbor
            let mut in_parent = true;
            let mut sibling = 0usize;
            let mut wrapped = 0usize;
            let mut parent_pos = 0u8;
            let mut parent_same = 0u8;
            for d in 0..N {
                let cd = ((c >> d) & 1) as i32;
                let t = cd
                    + match dir.digit(d) {
                        0 => -1,
                        1 => 1,
                        _ => 0,
                    };
                match t {
                    0 | 1 => {
                        sibling |= (t as usize) << d;
                        wrapped |= (t as usize) << d;
                        parent_same |= 1 << d;
                    }
                    -1 => {
                        in_parent = false;
                        wrapped |= 1 << d;
                    }
                    _ => {
                        in_parent = false;
                        parent_pos |= 1 << d;
                    }
                }
            }

            out.cells[q] = if in_parent {
                Some(&siblings[sibling])
            } else {
                let pq = SubspaceIndex::from_pos_and_floating(
                    parent_pos,
                    parent_same,
                );
                match self.cells[pq.index()] {
                    Some(uncle) if uncle.is_branch() => {
                        Some(&uncle.children()[wrapped])
                    }
                    _ => None,
                }
            };
        }
        out
    }

    /// Maps our subspace `s` into the frame of the neighbor in direction
    /// `dir`, if the subspace lies on the shared boundary
    fn map(dir: SubspaceIndex, s: SubspaceIndex) -> Option<SubspaceIndex> {
        let mut pos = 0u8;
        let mut floating = 0u8;
        for d in 0..N {
            let sd = s.digit(d);
            match dir.digit(d) {
                0 => {
                    // Our low boundary is the neighbor's high boundary
                    if sd != 0 {
                        return None;
                    }
                    pos |= 1 << d;
                }
                1 => {
                    if sd != 1 {
                        return None;
                    }
                }
                _ => match sd {
                    1 => pos |= 1 << d,
                    2 => floating |= 1 << d,
                    _ => (),
                },
            }
        }
        Some(SubspaceIndex::from_pos_and_floating(pos, floating))
    }

    /// Returns a neighbor leaf to borrow subspace `s` from, together with
    /// the subspace's index in that leaf's frame
    pub fn check(
        &self,
        s: SubspaceIndex,
    ) -> Option<(&'a SimplexLeaf<N>, SubspaceIndex)> {
        for q in 0..subspace_count(N) {
            let dir = SubspaceIndex(q as u8);
            if dir.dimension() == N {
                continue;
            }
            let Some(mapped) = Self::map(dir, s) else {
                continue;
            };
            let Some(cell) = self.cells[q] else {
                continue;
            };
            if cell.is_branch() {
                continue;
            }
            if let Some(leaf) = cell.leaf() {
                return Some((leaf, mapped));
            }
        }
        None
    }

    /// Looks up an already-assigned global index for subspace `s`
    ///
    /// Same-level leaf neighbors are checked directly.  A branch neighbor
    /// has been refined further, and only corner vertices survive
    /// refinement, so for corners the walk descends into the child that
    /// owns the corner until it reaches a leaf.
    pub fn get_index(&self, s: SubspaceIndex) -> u64 {
        for q in 0..subspace_count(N) {
            let dir = SubspaceIndex(q as u8);
            if dir.dimension() == N {
                continue;
            }
            let Some(mapped) = Self::map(dir, s) else {
                continue;
            };
            let Some(mut cell) = self.cells[q] else {
                continue;
            };
            loop {
                if cell.is_branch() {
                    if !mapped.is_corner() {
                        break;
                    }
                    cell = &cell.children()[mapped.pos() as usize];
                    continue;
                }
                if let Some(leaf) = cell.leaf() {
                    let idx = leaf.sub[mapped.index()]
                        .index
                        .load(Ordering::Relaxed);
                    if idx != 0 {
                        return idx;
                    }
                }
                break;
            }
        }
        0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_direction_map() {
        // Our x-low face (x fixed-low, y and z floating) seen from the
        // neighbor across x-low is its x-high face
        let dir = SubspaceIndex::from_pos_and_floating(0, 0b110); // x-low
        let s = SubspaceIndex::from_pos_and_floating(0b000, 0b110);
        let mapped = SimplexNeighbors::<3>::map(dir, s).unwrap();
        assert_eq!(
            mapped,
            SubspaceIndex::from_pos_and_floating(0b001, 0b110)
        );

        // A subspace on our x-high boundary is not shared with that
        // neighbor
        let t = SubspaceIndex::from_pos_and_floating(0b001, 0b110);
        assert!(SimplexNeighbors::<3>::map(dir, t).is_none());

        // A shared corner maps with its x bit flipped
        let c = SubspaceIndex::from_corner(0b010);
        let mapped = SimplexNeighbors::<3>::map(dir, c).unwrap();
        assert_eq!(mapped, SubspaceIndex::from_corner(0b011));
    }

    #[test]
    fn test_diagonal_map() {
        // The corner shared across an edge-diagonal direction flips on
        // both of the direction's fixed axes
        let dir = SubspaceIndex::from_pos_and_floating(0b010, 0b100); // x-low, y-high
        let c = SubspaceIndex::from_corner(0b010); // x low, y high, z low
        let mapped = SimplexNeighbors::<3>::map(dir, c).unwrap();
        assert_eq!(mapped, SubspaceIndex::from_corner(0b001));
    }
}
