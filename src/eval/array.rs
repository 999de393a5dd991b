//! Vectorized forward evaluation over sample arrays
use crate::{
    error::Error,
    eval::ARRAY_SIZE,
    tape::{Opcode, Tape},
    types::Grad,
};

use std::sync::atomic::AtomicBool;

/// Vectorized float evaluation over up to [`ARRAY_SIZE`] sample points
///
/// The register file is a flat array of `slot_count * ARRAY_SIZE` floats;
/// numerical infinities and NaNs propagate per IEEE 754.
pub struct ArrayEval {
    xs: Vec<f32>,
    ys: Vec<f32>,
    zs: Vec<f32>,
    slots: Vec<f32>,
    vars: Vec<f32>,
}

impl ArrayEval {
    pub(crate) fn new(tape: &Tape, vars: Vec<f32>) -> Self {
        Self {
            xs: vec![0.0; ARRAY_SIZE],
            ys: vec![0.0; ARRAY_SIZE],
            zs: vec![0.0; ARRAY_SIZE],
            slots: vec![f32::NAN; tape.reg_count() * ARRAY_SIZE],
            vars,
        }
    }

    /// Stores a sample position at the given index
    pub fn set(&mut self, p: nalgebra::Vector3<f32>, i: usize) {
        self.xs[i] = p.x;
        self.ys[i] = p.y;
        self.zs[i] = p.z;
    }

    /// Evaluates the first `count` sample points, returning their values
    pub fn values<'s>(
        &'s mut self,
        count: usize,
        tape: &Tape,
        abort: &AtomicBool,
    ) -> Result<&'s [f32], Error> {
        assert!(count <= ARRAY_SIZE);
        let data = tape.data();
        let cur = tape.cur();
        let Self {
            xs,
            ys,
            zs,
            slots,
            vars,
        } = self;
        let mut oracle_err: Option<Error> = None;

        let root = tape.rwalk(
            |op, id, a, b| {
                let o = cur.slot(id) * ARRAY_SIZE;
                let ia = cur.slot(a) * ARRAY_SIZE;
                let ib = cur.slot(b) * ARRAY_SIZE;
                match op {
                    Opcode::VarX => slots[o..o + count]
                        .copy_from_slice(&xs[..count]),
                    Opcode::VarY => slots[o..o + count]
                        .copy_from_slice(&ys[..count]),
                    Opcode::VarZ => slots[o..o + count]
                        .copy_from_slice(&zs[..count]),
                    Opcode::VarFree => {
                        let v = vars[data.vars[a as usize] as usize];
                        slots[o..o + count].fill(v);
                    }
                    Opcode::Constant => {
                        let v = data.constants[a as usize] as f32;
                        slots[o..o + count].fill(v);
                    }
                    Opcode::Oracle => {
                        let oracle = &data.oracles[a as usize];
                        for j in 0..count {
                            let p = nalgebra::Vector3::new(
                                xs[j], ys[j], zs[j],
                            );
                            slots[o + j] = match oracle.value(p) {
                                Ok(v) => v,
                                Err(e) => {
                                    oracle_err.get_or_insert(e);
                                    f32::NAN
                                }
                            };
                        }
                    }
                    Opcode::Neg => {
                        for j in 0..count {
                            slots[o + j] = -slots[ia + j];
                        }
                    }
                    Opcode::Abs => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j].abs();
                        }
                    }
                    Opcode::Recip => {
                        for j in 0..count {
                            slots[o + j] = 1.0 / slots[ia + j];
                        }
                    }
                    Opcode::Sqrt => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j].sqrt();
                        }
                    }
                    Opcode::Square => {
                        for j in 0..count {
                            let v = slots[ia + j];
                            slots[o + j] = v * v;
                        }
                    }
                    Opcode::Sin => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j].sin();
                        }
                    }
                    Opcode::Cos => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j].cos();
                        }
                    }
                    Opcode::Tan => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j].tan();
                        }
                    }
                    Opcode::Exp => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j].exp();
                        }
                    }
                    Opcode::Ln => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j].ln();
                        }
                    }
                    Opcode::Add => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j] + slots[ib + j];
                        }
                    }
                    Opcode::Sub => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j] - slots[ib + j];
                        }
                    }
                    Opcode::Mul => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j] * slots[ib + j];
                        }
                    }
                    Opcode::Div => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j] / slots[ib + j];
                        }
                    }
                    Opcode::Min => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j].min(slots[ib + j]);
                        }
                    }
                    Opcode::Max => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j].max(slots[ib + j]);
                        }
                    }
                }
            },
            abort,
        );
        if let Some(e) = oracle_err {
            return Err(e);
        }
        let o = cur.slot(root) * ARRAY_SIZE;
        Ok(&self.slots[o..o + count])
    }
}

/// Vectorized value + gradient evaluation over up to [`ARRAY_SIZE`] points
///
/// Alongside derivatives, a per-point ambiguity mask is collected during
/// the same walk: a point is ambiguous if at least one `min` or `max` saw
/// equal operands there, i.e. the derivative is not uniquely defined.
pub struct DerivEval {
    xs: Vec<f32>,
    ys: Vec<f32>,
    zs: Vec<f32>,
    slots: Vec<Grad>,
    ambig: Vec<bool>,
    vars: Vec<f32>,
}

impl DerivEval {
    pub(crate) fn new(tape: &Tape, vars: Vec<f32>) -> Self {
        Self {
            xs: vec![0.0; ARRAY_SIZE],
            ys: vec![0.0; ARRAY_SIZE],
            zs: vec![0.0; ARRAY_SIZE],
            slots: vec![Grad::default(); tape.reg_count() * ARRAY_SIZE],
            ambig: vec![false; ARRAY_SIZE],
            vars,
        }
    }

    /// Stores a sample position at the given index
    pub fn set(&mut self, p: nalgebra::Vector3<f32>, i: usize) {
        self.xs[i] = p.x;
        self.ys[i] = p.y;
        self.zs[i] = p.z;
    }

    /// Evaluates values and gradients for the first `count` points
    ///
    /// Returns the per-point results and the ambiguity mask.
    pub fn derivs<'s>(
        &'s mut self,
        count: usize,
        tape: &Tape,
        abort: &AtomicBool,
    ) -> Result<(&'s [Grad], &'s [bool]), Error> {
        assert!(count <= ARRAY_SIZE);
        let data = tape.data();
        let cur = tape.cur();
        let Self {
            xs,
            ys,
            zs,
            slots,
            ambig,
            vars,
        } = self;
        ambig[..count].fill(false);
        let mut oracle_err: Option<Error> = None;

        let root = tape.rwalk(
            |op, id, a, b| {
                let o = cur.slot(id) * ARRAY_SIZE;
                let ia = cur.slot(a) * ARRAY_SIZE;
                let ib = cur.slot(b) * ARRAY_SIZE;
                match op {
                    Opcode::VarX => {
                        for j in 0..count {
                            slots[o + j] = Grad::new(xs[j], 1.0, 0.0, 0.0);
                        }
                    }
                    Opcode::VarY => {
                        for j in 0..count {
                            slots[o + j] = Grad::new(ys[j], 0.0, 1.0, 0.0);
                        }
                    }
                    Opcode::VarZ => {
                        for j in 0..count {
                            slots[o + j] = Grad::new(zs[j], 0.0, 0.0, 1.0);
                        }
                    }
                    Opcode::VarFree => {
                        let v = vars[data.vars[a as usize] as usize];
                        slots[o..o + count].fill(v.into());
                    }
                    Opcode::Constant => {
                        let v = data.constants[a as usize] as f32;
                        slots[o..o + count].fill(v.into());
                    }
                    Opcode::Oracle => {
                        let oracle = &data.oracles[a as usize];
                        for j in 0..count {
                            let p = nalgebra::Vector3::new(
                                xs[j], ys[j], zs[j],
                            );
                            slots[o + j] = match (
                                oracle.value(p),
                                oracle.grad(p),
                            ) {
                                (Ok(v), Ok(g)) => {
                                    Grad::new(v, g.x, g.y, g.z)
                                }
                                (Err(e), _) | (_, Err(e)) => {
                                    oracle_err.get_or_insert(e);
                                    f32::NAN.into()
                                }
                            };
                        }
                    }
                    Opcode::Neg => {
                        for j in 0..count {
                            slots[o + j] = -slots[ia + j];
                        }
                    }
                    Opcode::Abs => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j].abs();
                        }
                    }
                    Opcode::Recip => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j].recip();
                        }
                    }
                    Opcode::Sqrt => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j].sqrt();
                        }
                    }
                    Opcode::Square => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j].square();
                        }
                    }
                    Opcode::Sin => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j].sin();
                        }
                    }
                    Opcode::Cos => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j].cos();
                        }
                    }
                    Opcode::Tan => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j].tan();
                        }
                    }
                    Opcode::Exp => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j].exp();
                        }
                    }
                    Opcode::Ln => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j].ln();
                        }
                    }
                    Opcode::Add => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j] + slots[ib + j];
                        }
                    }
                    Opcode::Sub => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j] - slots[ib + j];
                        }
                    }
                    Opcode::Mul => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j] * slots[ib + j];
                        }
                    }
                    Opcode::Div => {
                        for j in 0..count {
                            slots[o + j] = slots[ia + j] / slots[ib + j];
                        }
                    }
                    Opcode::Min => {
                        for j in 0..count {
                            let va = slots[ia + j];
                            let vb = slots[ib + j];
                            if va.value() == vb.value() {
                                ambig[j] = true;
                            }
                            slots[o + j] = va.min(vb);
                        }
                    }
                    Opcode::Max => {
                        for j in 0..count {
                            let va = slots[ia + j];
                            let vb = slots[ib + j];
                            if va.value() == vb.value() {
                                ambig[j] = true;
                            }
                            slots[o + j] = va.max(vb);
                        }
                    }
                }
            },
            abort,
        );
        if let Some(e) = oracle_err {
            return Err(e);
        }
        let o = cur.slot(root) * ARRAY_SIZE;
        Ok((&self.slots[o..o + count], &self.ambig[..count]))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::Context;
    use nalgebra::Vector3;

    fn abort() -> AtomicBool {
        AtomicBool::new(false)
    }

    fn sphere_tape() -> Tape {
        let mut ctx = Context::new();
        let (x, y, z) = ctx.axes();
        let x2 = ctx.square(x).unwrap();
        let y2 = ctx.square(y).unwrap();
        let z2 = ctx.square(z).unwrap();
        let s = ctx.add(x2, y2).unwrap();
        let s = ctx.add(s, z2).unwrap();
        let s = ctx.sqrt(s).unwrap();
        let f = ctx.sub(s, 1.0).unwrap();
        Tape::new(&ctx, f).unwrap()
    }

    #[test]
    fn test_array_values() {
        let tape = sphere_tape();
        let mut eval = ArrayEval::new(&tape, vec![]);
        eval.set(Vector3::new(3.0, 4.0, 0.0), 0);
        eval.set(Vector3::new(0.0, 0.0, 0.0), 1);
        eval.set(Vector3::new(1.0, 0.0, 0.0), 2);
        let out = eval.values(3, &tape, &abort()).unwrap();
        assert_eq!(out, &[4.0, -1.0, 0.0]);
    }

    #[test]
    fn test_deriv_values() {
        let tape = sphere_tape();
        let mut eval = DerivEval::new(&tape, vec![]);
        eval.set(Vector3::new(2.0, 0.0, 0.0), 0);
        eval.set(Vector3::new(0.0, -3.0, 0.0), 1);
        let (ds, ambig) = eval.derivs(2, &tape, &abort()).unwrap();
        assert_eq!(ds[0].value(), 1.0);
        assert_eq!(ds[0].d(), Vector3::new(1.0, 0.0, 0.0));
        assert_eq!(ds[1].value(), 2.0);
        assert_eq!(ds[1].d(), Vector3::new(0.0, -1.0, 0.0));
        assert!(!ambig[0]);
        assert!(!ambig[1]);
    }

    #[test]
    fn test_ambiguity_mask() {
        // f = min(x, -x) is ambiguous exactly at x == 0
        let mut ctx = Context::new();
        let x = ctx.x();
        let nx = ctx.neg(x).unwrap();
        let f = ctx.min(x, nx).unwrap();
        let tape = Tape::new(&ctx, f).unwrap();
        let mut eval = DerivEval::new(&tape, vec![]);
        eval.set(Vector3::new(0.0, 0.0, 0.0), 0);
        eval.set(Vector3::new(0.5, 0.0, 0.0), 1);
        let (ds, ambig) = eval.derivs(2, &tape, &abort()).unwrap();
        assert!(ambig[0]);
        assert!(!ambig[1]);
        assert_eq!(ds[1].value(), -0.5);
    }

    #[test]
    fn test_nan_propagation() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let f = ctx.div(1.0, x).unwrap();
        let tape = Tape::new(&ctx, f).unwrap();
        let mut eval = ArrayEval::new(&tape, vec![]);
        eval.set(Vector3::new(0.0, 0.0, 0.0), 0);
        eval.set(Vector3::new(2.0, 0.0, 0.0), 1);
        let out = eval.values(2, &tape, &abort()).unwrap();
        assert!(out[0].is_infinite());
        assert_eq!(out[1], 0.5);
    }
}
