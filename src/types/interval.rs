use crate::eval::Choice;
use std::f32::consts::{FRAC_PI_2, PI, TAU};

/// Stores a range, with conservative calculations to guarantee that it
/// always contains the actual value.
///
/// # Warning
/// This implementation does not set rounding modes, so it may not be
/// _perfect_.
#[derive(Copy, Clone, PartialEq)]
#[repr(C)]
pub struct Interval {
    lower: f32,
    upper: f32,
}

impl std::fmt::Debug for Interval {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> Result<(), std::fmt::Error> {
        f.debug_tuple("")
            .field(&self.lower)
            .field(&self.upper)
            .finish()
    }
}

impl Interval {
    /// Builds a new interval
    ///
    /// There are two kinds of valid interval:
    /// - `[lower, upper]` where `lower <= upper`
    /// - `[NaN, NaN]`
    ///
    /// # Panics
    /// Panics if the resulting interval would be invalid
    #[inline]
    pub fn new(lower: f32, upper: f32) -> Self {
        assert!(
            upper >= lower || (lower.is_nan() && upper.is_nan()),
            "invalid interval [{lower}, {upper}]"
        );
        Self { lower, upper }
    }
    /// Returns the lower bound of the interval
    #[inline]
    pub fn lower(&self) -> f32 {
        self.lower
    }
    /// Returns the upper bound of the interval
    #[inline]
    pub fn upper(&self) -> f32 {
        self.upper
    }
    /// Checks whether the given value is (inclusively) contained
    #[inline]
    pub fn contains(&self, v: f32) -> bool {
        v >= self.lower && v <= self.upper
    }
    /// Returns `true` if either bound of the interval is `NaN`
    #[inline]
    pub fn has_nan(&self) -> bool {
        self.lower.is_nan() || self.upper.is_nan()
    }
    /// Returns the midpoint of the interval
    #[inline]
    pub fn midpoint(self) -> f32 {
        (self.lower + self.upper) / 2.0
    }
    /// Calculates the width of the interval
    #[inline]
    pub fn width(self) -> f32 {
        self.upper - self.lower
    }
    /// Calculates the absolute value of the interval
    pub fn abs(self) -> Self {
        if self.lower < 0.0 {
            if self.upper > 0.0 {
                Interval::new(0.0, self.upper.max(-self.lower))
            } else {
                Interval::new(-self.upper, -self.lower)
            }
        } else {
            self
        }
    }
    /// Squares the interval
    ///
    /// Note that this has tighter bounds than multiplication, because we
    /// know that both sides of the multiplication are the same value.
    pub fn square(self) -> Self {
        if self.upper < 0.0 {
            Interval::new(self.upper.powi(2), self.lower.powi(2))
        } else if self.lower > 0.0 {
            Interval::new(self.lower.powi(2), self.upper.powi(2))
        } else if self.has_nan() {
            f32::NAN.into()
        } else {
            Interval::new(0.0, self.lower.abs().max(self.upper.abs()).powi(2))
        }
    }
    /// Calculates the square root of the interval
    ///
    /// If the interval contains values below 0, returns a `NaN` interval.
    pub fn sqrt(self) -> Self {
        if self.lower < 0.0 {
            f32::NAN.into()
        } else {
            Interval::new(self.lower.sqrt(), self.upper.sqrt())
        }
    }
    /// Calculates the reciprocal of the interval
    ///
    /// If the interval includes 0, returns the `NaN` interval
    pub fn recip(self) -> Self {
        if self.lower > 0.0 || self.upper < 0.0 {
            Interval::new(1.0 / self.upper, 1.0 / self.lower)
        } else {
            f32::NAN.into()
        }
    }
    /// Checks whether `offset + k * period` lands in the interval for some
    /// integer `k`
    fn crosses(self, offset: f32, period: f32) -> bool {
        ((self.upper - offset) / period).floor()
            >= ((self.lower - offset) / period).ceil()
    }
    /// Computes the sine of the interval
    pub fn sin(self) -> Self {
        if self.has_nan() {
            return f32::NAN.into();
        }
        if self.width() >= TAU {
            return Interval::new(-1.0, 1.0);
        }
        let (a, b) = (self.lower.sin(), self.upper.sin());
        let lower = if self.crosses(-FRAC_PI_2, TAU) {
            -1.0
        } else {
            a.min(b)
        };
        let upper = if self.crosses(FRAC_PI_2, TAU) {
            1.0
        } else {
            a.max(b)
        };
        Interval::new(lower, upper)
    }
    /// Computes the cosine of the interval
    pub fn cos(self) -> Self {
        if self.has_nan() {
            return f32::NAN.into();
        }
        if self.width() >= TAU {
            return Interval::new(-1.0, 1.0);
        }
        let (a, b) = (self.lower.cos(), self.upper.cos());
        let lower = if self.crosses(PI, TAU) { -1.0 } else { a.min(b) };
        let upper = if self.crosses(0.0, TAU) { 1.0 } else { a.max(b) };
        Interval::new(lower, upper)
    }
    /// Computes the tangent of the interval
    ///
    /// Returns the `NaN` interval if the input spans an asymptote
    pub fn tan(self) -> Self {
        if self.has_nan() || self.width() >= PI {
            return f32::NAN.into();
        }
        let lower = self.lower.tan();
        let upper = self.upper.tan();
        if upper >= lower {
            Interval::new(lower, upper)
        } else {
            f32::NAN.into()
        }
    }
    /// Computes the exponent function applied to the interval
    pub fn exp(self) -> Self {
        if self.has_nan() {
            f32::NAN.into()
        } else {
            Interval::new(self.lower.exp(), self.upper.exp())
        }
    }
    /// Computes the natural log of the input interval
    ///
    /// Returns the `NaN` interval if the input reaches zero
    pub fn ln(self) -> Self {
        if self.lower <= 0.0 {
            f32::NAN.into()
        } else {
            Interval::new(self.lower.ln(), self.upper.ln())
        }
    }
    /// Calculates the minimum of two intervals
    ///
    /// Returns both the result and a [`Choice`] indicating whether one side
    /// is always less than the other.
    ///
    /// If either side is `NaN`, returns the `NaN` interval and
    /// `Choice::Both`.
    pub fn min_choice(self, rhs: Self) -> (Self, Choice) {
        if self.has_nan() || rhs.has_nan() {
            return (f32::NAN.into(), Choice::Both);
        }
        let choice = if self.upper < rhs.lower {
            Choice::Left
        } else if rhs.upper < self.lower {
            Choice::Right
        } else {
            Choice::Both
        };
        (
            Interval::new(self.lower.min(rhs.lower), self.upper.min(rhs.upper)),
            choice,
        )
    }
    /// Calculates the maximum of two intervals
    ///
    /// Returns both the result and a [`Choice`] indicating whether one side
    /// is always greater than the other.
    ///
    /// If either side is `NaN`, returns the `NaN` interval and
    /// `Choice::Both`.
    pub fn max_choice(self, rhs: Self) -> (Self, Choice) {
        if self.has_nan() || rhs.has_nan() {
            return (f32::NAN.into(), Choice::Both);
        }
        let choice = if self.lower > rhs.upper {
            Choice::Left
        } else if rhs.lower > self.upper {
            Choice::Right
        } else {
            Choice::Both
        };
        (
            Interval::new(self.lower.max(rhs.lower), self.upper.max(rhs.upper)),
            choice,
        )
    }
}

impl From<f32> for Interval {
    fn from(f: f32) -> Self {
        Interval { lower: f, upper: f }
    }
}

impl std::ops::Add<Interval> for Interval {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Interval::new(self.lower + rhs.lower, self.upper + rhs.upper)
    }
}

impl std::ops::Sub<Interval> for Interval {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Interval::new(self.lower - rhs.upper, self.upper - rhs.lower)
    }
}

impl std::ops::Neg for Interval {
    type Output = Self;
    fn neg(self) -> Self {
        Interval::new(-self.upper, -self.lower)
    }
}

impl std::ops::Mul<Interval> for Interval {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        if self.has_nan() || rhs.has_nan() {
            return f32::NAN.into();
        }
        let mut lower = f32::INFINITY;
        let mut upper = f32::NEG_INFINITY;
        for a in [self.lower, self.upper] {
            for b in [rhs.lower, rhs.upper] {
                let v = a * b;
                if v.is_nan() {
                    return f32::NAN.into();
                }
                lower = lower.min(v);
                upper = upper.max(v);
            }
        }
        Interval::new(lower, upper)
    }
}

impl std::ops::Div<Interval> for Interval {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        if rhs.contains(0.0) {
            return f32::NAN.into();
        }
        self * rhs.recip()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_interval_arith() {
        let a = Interval::new(1.0, 2.0);
        let b = Interval::new(-1.0, 3.0);
        assert_eq!(a + b, Interval::new(0.0, 5.0));
        assert_eq!(a - b, Interval::new(-2.0, 3.0));
        assert_eq!(a * b, Interval::new(-2.0, 6.0));
        assert_eq!(-a, Interval::new(-2.0, -1.0));
    }

    #[test]
    fn test_interval_div() {
        let a = Interval::new(1.0, 2.0);
        let b = Interval::new(4.0, 8.0);
        assert_eq!(a / b, Interval::new(0.125, 0.5));
        assert!((a / Interval::new(-1.0, 1.0)).has_nan());
    }

    #[test]
    fn test_interval_square() {
        let a = Interval::new(-2.0, 1.0);
        assert_eq!(a.square(), Interval::new(0.0, 4.0));
        let b = Interval::new(-3.0, -2.0);
        assert_eq!(b.square(), Interval::new(4.0, 9.0));
    }

    #[test]
    fn test_interval_sqrt() {
        let a = Interval::new(4.0, 9.0);
        assert_eq!(a.sqrt(), Interval::new(2.0, 3.0));
        assert!(Interval::new(-1.0, 1.0).sqrt().has_nan());
    }

    #[test]
    fn test_min_max_choice() {
        let a = Interval::new(0.5, 1.0);
        let b = Interval::new(-1.0, -0.5);
        assert_eq!(a.min_choice(b), (b, Choice::Right));
        assert_eq!(a.max_choice(b), (a, Choice::Left));
        let c = Interval::new(0.0, 2.0);
        assert_eq!(a.min_choice(c).1, Choice::Both);
    }

    #[test]
    fn test_interval_trig() {
        // Containment check against dense sampling
        for (lo, hi) in [
            (0.0f32, 1.0f32),
            (-1.0, 1.0),
            (1.0, 4.0),
            (-7.0, -6.0),
            (2.0, 9.0),
        ] {
            let i = Interval::new(lo, hi);
            let s = i.sin();
            let c = i.cos();
            for k in 0..=100 {
                let x = lo + (hi - lo) * (k as f32) / 100.0;
                assert!(s.contains(x.sin()), "sin({x}) not in {s:?}");
                assert!(c.contains(x.cos()), "cos({x}) not in {c:?}");
            }
        }
        // Full-period saturation
        let i = Interval::new(0.0, 100.0);
        assert_eq!(i.sin(), Interval::new(-1.0, 1.0));
        assert_eq!(i.cos(), Interval::new(-1.0, 1.0));
    }

    #[test]
    fn test_interval_tan() {
        let a = Interval::new(-0.5, 0.5);
        let t = a.tan();
        assert!(t.contains(0.0));
        assert!(Interval::new(1.0, 2.0).tan().has_nan());
    }
}
