//! Bounded quadratic-error minimization for subspace vertex placement
use nalgebra::{Matrix3, Vector3, Vector4};

/// Relative cutoff below which singular values are treated as zero
///
/// Without this filter, near-planar sample sets produce wildly
/// out-of-plane solutions from noise in the small eigenvalues.
const EIGENVALUE_CUTOFF: f64 = 1e-8;

/// Accumulates samples `(position, normal, value)` into the quadratic error
/// function `E(x) = Σ (nᵢ·(x − pᵢ) − vᵢ)²`
///
/// Storage is always 3-dimensional; lower-dimensional subspaces are
/// expressed at solve time through a floating-axis bitmask, with the fixed
/// axes pinned to the region bounds.  Summing two accumulators is the same
/// as accumulating their combined sample sets, which is what bottom-up cell
/// merging relies on.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Qef {
    ata: Matrix3<f64>,
    atb: Vector3<f64>,
    btb: f64,

    /// Mass point of samples, stored as XYZ / W so that summing works
    mass_point: Vector4<f64>,
}

impl std::ops::AddAssign for Qef {
    fn add_assign(&mut self, rhs: Self) {
        self.ata += rhs.ata;
        self.atb += rhs.atb;
        self.btb += rhs.btb;
        self.mass_point += rhs.mass_point;
    }
}

impl Qef {
    /// Clears the accumulator
    pub fn reset(&mut self) {
        *self = Qef::default();
    }

    /// Returns the number of accumulated samples
    pub fn samples(&self) -> f64 {
        self.mass_point.w
    }

    /// Adds a sample to the accumulator
    ///
    /// `pos` is accumulated into the mass point; `norm` is the field
    /// gradient at the sample and `value` the field value there.
    pub fn insert(
        &mut self,
        pos: Vector3<f64>,
        norm: Vector3<f64>,
        value: f64,
    ) {
        self.mass_point += Vector4::new(pos.x, pos.y, pos.z, 1.0);
        let b = norm.dot(&pos) - value;
        self.ata += norm * norm.transpose();
        self.atb += norm * b;
        self.btb += b * b;
    }

    /// Evaluates the accumulated error at a position
    pub fn error(&self, pos: Vector3<f64>) -> f64 {
        let e = (pos.transpose() * self.ata * pos)[(0, 0)]
            - 2.0 * self.atb.dot(&pos)
            + self.btb;
        e.max(0.0)
    }

    /// Minimizes the error over one subspace of a region, returning the
    /// position and its residual error
    ///
    /// `floating` marks the free axes (only bits below the region dimension
    /// may be set); every other axis is pinned to the region's lower or
    /// upper bound according to `pos`.  The solve runs relative to the
    /// subspace-projected mass centroid, discards singular values below a
    /// relative cutoff to regularize under-constrained systems, and clamps
    /// the floating coordinates into the region; a fully degenerate system
    /// lands on the centroid of the region face.
    pub fn solve_bounded(
        &self,
        lower: Vector3<f64>,
        upper: Vector3<f64>,
        floating: u8,
        pos: u8,
    ) -> (Vector3<f64>, f64) {
        // Pin fixed axes and project the mass centroid onto the subspace
        let mut center = if self.mass_point.w > 0.0 {
            self.mass_point.xyz() / self.mass_point.w
        } else {
            (lower + upper) / 2.0
        };
        for d in 0..3 {
            if floating & (1 << d) == 0 {
                center[d] = if pos & (1 << d) != 0 {
                    upper[d]
                } else {
                    lower[d]
                };
            }
        }

        // Substitute the pinned coordinates and shift to the centroid,
        // then mask the fixed axes out of the system entirely
        let mut a = self.ata;
        let mut b = self.atb - self.ata * center;
        for d in 0..3 {
            if floating & (1 << d) == 0 {
                a.row_mut(d).fill(0.0);
                a.column_mut(d).fill(0.0);
                b[d] = 0.0;
            }
        }

        let svd = nalgebra::linalg::SVD::new(a, true, true);
        let max_sv = svd.singular_values.max();
        let delta = if max_sv > 0.0 {
            svd.solve(&b, max_sv * EIGENVALUE_CUTOFF)
                .unwrap_or_else(|_| Vector3::zeros())
        } else {
            Vector3::zeros()
        };

        let mut out = center + delta;
        for d in 0..3 {
            if floating & (1 << d) != 0 {
                out[d] = out[d].clamp(lower[d], upper[d]);
            } else {
                // Pinned exactly, not through SVD round-off
                out[d] = center[d];
            }
        }
        (out, self.error(out))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_qef_plane() {
        // Samples from the plane x = 0.3
        let mut q = Qef::default();
        for (y, z) in [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)] {
            q.insert(
                Vector3::new(0.0, y, z),
                Vector3::new(1.0, 0.0, 0.0),
                -0.3,
            );
        }
        let (out, err) = q.solve_bounded(
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 1.0, 1.0),
            0b111,
            0,
        );
        assert!((out.x - 0.3).abs() < 1e-9);
        // The unconstrained axes land on the mass centroid
        assert!((out.y - 0.5).abs() < 1e-9);
        assert!((out.z - 0.5).abs() < 1e-9);
        assert!(err < 1e-12);
    }

    #[test]
    fn test_qef_corner() {
        // Three orthogonal planes meeting at (0.25, 0.5, 0.75)
        let mut q = Qef::default();
        let target = Vector3::new(0.25, 0.5, 0.75);
        for d in 0..3 {
            let mut n = Vector3::zeros();
            n[d] = 1.0;
            let mut p = Vector3::new(0.1, 0.1, 0.1);
            p[d] = target[d];
            q.insert(p, n, 0.0);
        }
        let (out, err) = q.solve_bounded(
            Vector3::zeros(),
            Vector3::new(1.0, 1.0, 1.0),
            0b111,
            0,
        );
        assert!((out - target).norm() < 1e-9);
        assert!(err < 1e-12);
    }

    #[test]
    fn test_qef_degenerate_slab() {
        // f = x: every sample normal is (1, 0, 0), so two eigenvalues are
        // zero and must be clamped away
        let mut q = Qef::default();
        for c in 0..8 {
            let p = Vector3::new(
                if c & 1 != 0 { 1.0 } else { -1.0 },
                if c & 2 != 0 { 1.0 } else { -1.0 },
                if c & 4 != 0 { 1.0 } else { -1.0 },
            );
            q.insert(p, Vector3::new(1.0, 0.0, 0.0), p.x);
        }
        let (out, err) = q.solve_bounded(
            Vector3::new(-1.0, -1.0, -1.0),
            Vector3::new(1.0, 1.0, 1.0),
            0b111,
            0,
        );
        assert!(out.x.abs() < 1e-9);
        assert!(out.y.abs() < 1e-9);
        assert!(out.z.abs() < 1e-9);
        assert!(err < 1e-12);
    }

    #[test]
    fn test_qef_subspace_pinning() {
        // Solve on the z-low face: z must be pinned to the lower bound
        let mut q = Qef::default();
        for (x, y) in [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)] {
            q.insert(
                Vector3::new(x, y, 0.0),
                Vector3::new(1.0, 0.0, 0.0),
                x - 0.6,
            );
        }
        let (out, _err) = q.solve_bounded(
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 1.0, 1.0),
            0b011,
            0,
        );
        assert!((out.x - 0.6).abs() < 1e-9);
        assert_eq!(out.z, 0.0);
    }

    #[test]
    fn test_qef_out_of_cell_clamp() {
        // A plane crossing outside the region clamps onto the boundary
        let mut q = Qef::default();
        q.insert(
            Vector3::new(0.0, 0.5, 0.5),
            Vector3::new(1.0, 0.0, 0.0),
            -2.0,
        );
        let (out, err) = q.solve_bounded(
            Vector3::zeros(),
            Vector3::new(1.0, 1.0, 1.0),
            0b111,
            0,
        );
        assert_eq!(out.x, 1.0);
        assert!(err > 0.0);
    }

    #[test]
    fn test_qef_merge() {
        // Accumulating in two halves and summing matches one accumulator
        let samples = [
            (Vector3::new(0.1, 0.2, 0.3), Vector3::new(1.0, 0.0, 0.0)),
            (Vector3::new(0.4, 0.5, 0.6), Vector3::new(0.0, 1.0, 0.0)),
            (Vector3::new(0.7, 0.8, 0.9), Vector3::new(0.0, 0.0, 1.0)),
            (Vector3::new(0.2, 0.4, 0.6), Vector3::new(0.6, 0.8, 0.0)),
        ];
        let mut whole = Qef::default();
        let mut a = Qef::default();
        let mut b = Qef::default();
        for (i, (p, n)) in samples.iter().enumerate() {
            whole.insert(*p, *n, 0.1);
            if i % 2 == 0 {
                a.insert(*p, *n, 0.1);
            } else {
                b.insert(*p, *n, 0.1);
            }
        }
        a += b;
        assert_eq!(a, whole);
        assert_eq!(a.samples(), 4.0);
    }
}
