//! Base-3 indexing for the subspaces of an N-cell
//!
//! An N-cell has 3^N subspaces: corners (dimension 0), edges, faces, up to
//! the cell body (dimension N).  A subspace index is a base-3 number with
//! one digit per axis:
//!
//! - digit 0: the axis is fixed at the cell's lower bound
//! - digit 1: the axis is fixed at the cell's upper bound
//! - digit 2: the axis floats across the cell
//!
//! The same digit scheme doubles as a neighbor direction, where 0 / 1 mean
//! "the neighbor across our low / high boundary on this axis" and 2 means
//! "same position".

/// Number of subspaces of an N-cell
pub const fn subspace_count(n: usize) -> usize {
    3usize.pow(n as u32)
}

/// Number of corners (and children) of an N-cell
pub const fn corner_count(n: usize) -> usize {
    1 << n
}

/// Index of one subspace of an N-cell
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SubspaceIndex(pub u8);

impl SubspaceIndex {
    /// Returns the digit for the given axis
    pub fn digit(self, axis: usize) -> u8 {
        (self.0 / 3u8.pow(axis as u32)) % 3
    }

    /// Returns the dimension of the subspace (number of floating axes)
    pub fn dimension(self) -> usize {
        (0..3).filter(|a| self.digit(*a) == 2).count()
    }

    /// Returns the floating axes as a bitmask
    pub fn floating(self) -> u8 {
        (0..3)
            .filter(|a| self.digit(*a) == 2)
            .fold(0, |acc, a| acc | (1 << a))
    }

    /// Returns the fixed-high axes as a bitmask
    pub fn pos(self) -> u8 {
        (0..3)
            .filter(|a| self.digit(*a) == 1)
            .fold(0, |acc, a| acc | (1 << a))
    }

    /// Returns the fixed axes as a bitmask, given the cell dimension
    pub fn fixed(self, n: usize) -> u8 {
        !self.floating() & ((1 << n) - 1)
    }

    /// Checks whether this is a corner (0-dimensional) subspace
    pub fn is_corner(self) -> bool {
        self.dimension() == 0
    }

    /// Checks whether `other` lies within this subspace
    ///
    /// True when every axis is either floating here or agrees exactly.
    pub fn contains(self, other: SubspaceIndex) -> bool {
        (0..3).all(|a| {
            let d = self.digit(a);
            d == 2 || d == other.digit(a)
        })
    }

    /// Builds an index from fixed-high and floating bitmasks
    pub fn from_pos_and_floating(pos: u8, floating: u8) -> Self {
        let mut i = 0u8;
        for a in (0..3).rev() {
            let d = if floating & (1 << a) != 0 {
                2
            } else {
                u8::from(pos & (1 << a) != 0)
            };
            i = i * 3 + d;
        }
        SubspaceIndex(i)
    }

    /// Returns the corner subspace for a corner index (one bit per axis)
    pub fn from_corner(c: usize) -> Self {
        Self::from_pos_and_floating(c as u8, 0)
    }

    /// Returns this index as a `usize`, for array access
    pub fn index(self) -> usize {
        self.0 as usize
    }
}
