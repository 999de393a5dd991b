//! Axis-aligned regions with subdivision
use crate::simplex::subspace::corner_count;

use arrayvec::ArrayVec;
use nalgebra::{SVector, Vector3};

/// An axis-aligned box in N dimensions
///
/// `level` is the remaining recursion depth when level-based termination is
/// in use.  For N < 3, `perp` holds the values of the ignored dimensions,
/// used to pad the 3-vectors fed to evaluators.
#[derive(Copy, Clone, Debug)]
pub struct Region<const N: usize> {
    pub lower: SVector<f64, N>,
    pub upper: SVector<f64, N>,
    pub level: usize,
    pub perp: Vector3<f64>,
}

impl<const N: usize> Region<N> {
    /// Builds a new region with zeroed `perp` padding
    pub fn new(
        lower: SVector<f64, N>,
        upper: SVector<f64, N>,
        level: usize,
    ) -> Self {
        Self {
            lower,
            upper,
            level,
            perp: Vector3::zeros(),
        }
    }

    /// Sets the values of the ignored dimensions (indexes `N..3`)
    pub fn with_perp(mut self, perp: Vector3<f64>) -> Self {
        self.perp = perp;
        self
    }

    /// Returns the midpoint of the region
    pub fn center(&self) -> SVector<f64, N> {
        (self.lower + self.upper) / 2.0
    }

    /// Returns the shortest side length
    pub fn min_side(&self) -> f64 {
        (0..N)
            .map(|i| self.upper[i] - self.lower[i])
            .fold(f64::INFINITY, f64::min)
    }

    /// Checks whether the given point is inside the region
    pub fn contains(&self, p: SVector<f64, N>) -> bool {
        (0..N).all(|i| p[i] >= self.lower[i] && p[i] <= self.upper[i])
    }

    /// Returns the given corner (one bit per axis; set = upper)
    pub fn corner(&self, c: usize) -> SVector<f64, N> {
        SVector::from_fn(|i, _| {
            if c & (1 << i) != 0 {
                self.upper[i]
            } else {
                self.lower[i]
            }
        })
    }

    /// Splits the region into 2^N children at the midpoint
    ///
    /// Children are ordered by corner bits and have `level - 1`.
    pub fn subdivide(&self) -> ArrayVec<Region<N>, 8> {
        let mid = self.center();
        let mut out = ArrayVec::new();
        for c in 0..corner_count(N) {
            let lower = SVector::from_fn(|i, _| {
                if c & (1 << i) != 0 {
                    mid[i]
                } else {
                    self.lower[i]
                }
            });
            let upper = SVector::from_fn(|i, _| {
                if c & (1 << i) != 0 {
                    self.upper[i]
                } else {
                    mid[i]
                }
            });
            out.push(Region {
                lower,
                upper,
                level: self.level.saturating_sub(1),
                perp: self.perp,
            });
        }
        out
    }

    /// Pads an N-vector out to 3D with the `perp` values
    pub fn pad3(&self, v: SVector<f64, N>) -> Vector3<f64> {
        Vector3::from_fn(|i, _| if i < N { v[i] } else { self.perp[i] })
    }

    /// Pads an N-vector out to 3D, in single precision for the evaluators
    pub fn pad3f(&self, v: SVector<f64, N>) -> Vector3<f32> {
        self.pad3(v).map(|v| v as f32)
    }

    /// Returns the lower corner as a padded 3-vector
    pub fn lower3(&self) -> Vector3<f64> {
        self.pad3(self.lower)
    }

    /// Returns the upper corner as a padded 3-vector
    pub fn upper3(&self) -> Vector3<f64> {
        self.pad3(self.upper)
    }

    /// Returns the lower corner in single precision
    pub fn lower3f(&self) -> Vector3<f32> {
        self.lower3().map(|v| v as f32)
    }

    /// Returns the upper corner in single precision
    pub fn upper3f(&self) -> Vector3<f32> {
        self.upper3().map(|v| v as f32)
    }

    /// Returns the given corner as a padded 3-vector
    pub fn corner3(&self, c: usize) -> Vector3<f64> {
        self.pad3(self.corner(c))
    }

    /// Returns the given corner in single precision
    pub fn corner3f(&self, c: usize) -> Vector3<f32> {
        self.corner3(c).map(|v| v as f32)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_subdivide() {
        let r: Region<3> = Region::new(
            SVector::from([0.0, 0.0, 0.0]),
            SVector::from([2.0, 2.0, 2.0]),
            4,
        );
        let children = r.subdivide();
        assert_eq!(children.len(), 8);
        for (c, child) in children.iter().enumerate() {
            assert_eq!(child.level, 3);
            assert_eq!(child.min_side(), 1.0);
            // Child c's corner c coincides with the parent's corner c
            assert_eq!(child.corner(c), r.corner(c));
            // And its opposite corner is the parent's center
            assert_eq!(child.corner(c ^ 0b111), r.center());
        }
    }

    #[test]
    fn test_perp_padding() {
        let r: Region<2> = Region::new(
            SVector::from([0.0, 0.0]),
            SVector::from([1.0, 1.0]),
            0,
        )
        .with_perp(Vector3::new(0.0, 0.0, 0.5));
        assert_eq!(r.corner3(3), Vector3::new(1.0, 1.0, 0.5));
        assert_eq!(r.lower3f(), Vector3::new(0.0, 0.0, 0.5));
        assert_eq!(r.subdivide().len(), 4);
    }

    #[test]
    fn test_contains() {
        let r: Region<3> = Region::new(
            SVector::from([-1.0, -1.0, -1.0]),
            SVector::from([1.0, 1.0, 1.0]),
            0,
        );
        assert!(r.contains(SVector::from([0.0, 0.0, 0.0])));
        assert!(r.contains(r.corner(7)));
        assert!(!r.contains(SVector::from([1.5, 0.0, 0.0])));
    }
}
