//! Feature enumeration at points where the gradient is not unique
use crate::{
    error::Error,
    eval::Choice,
    tape::{ClauseId, Keep, Opcode, Tape, TapeType},
    types::{Grad, Interval},
};

use std::sync::atomic::AtomicBool;

use nalgebra::Vector3;

/// Ties beyond this count are left unresolved rather than enumerated;
/// 2^MAX_TIES bounds the number of candidate branch assignments explored.
const MAX_TIES: usize = 6;

/// Enumerates candidate gradient directions at a single point
///
/// Where `min` and `max` clauses see exactly equal operands, the field has
/// multiple one-sided gradients ("features").  The value pass records the
/// tied clauses; each tie assignment is then explored by pushing a
/// specialized subtape that pins the tied branches and running a forward
/// gradient pass over it.
pub struct FeatureEval {
    values: Vec<f32>,
    grads: Vec<Grad>,
    dirs: Vec<(f32, f32)>,
    choices: Vec<Choice>,
    ties: Vec<ClauseId>,
    feats: Vec<Vector3<f32>>,
    vars: Vec<f32>,
}

impl FeatureEval {
    pub(crate) fn new(tape: &Tape, vars: Vec<f32>) -> Self {
        Self {
            values: vec![f32::NAN; tape.reg_count()],
            grads: vec![Grad::default(); tape.reg_count()],
            dirs: vec![(f32::NAN, 0.0); tape.reg_count()],
            choices: vec![Choice::Both; tape.num_clauses()],
            ties: vec![],
            feats: vec![],
            vars,
        }
    }

    /// Single-point value evaluation, recording min/max choices and ties
    fn value_pass(
        &mut self,
        p: Vector3<f32>,
        tape: &Tape,
        abort: &AtomicBool,
    ) -> Result<f32, Error> {
        let data = tape.data();
        let cur = tape.cur();
        let Self {
            values,
            choices,
            ties,
            vars,
            ..
        } = self;
        ties.clear();
        let mut oracle_err: Option<Error> = None;

        let root = tape.rwalk(
            |op, id, a, b| {
                let v = match op {
                    Opcode::VarX => p.x,
                    Opcode::VarY => p.y,
                    Opcode::VarZ => p.z,
                    Opcode::VarFree => {
                        vars[data.vars[a as usize] as usize]
                    }
                    Opcode::Constant => data.constants[a as usize] as f32,
                    Opcode::Oracle => {
                        match data.oracles[a as usize].value(p) {
                            Ok(v) => v,
                            Err(e) => {
                                oracle_err.get_or_insert(e);
                                f32::NAN
                            }
                        }
                    }
                    Opcode::Neg => -values[cur.slot(a)],
                    Opcode::Abs => values[cur.slot(a)].abs(),
                    Opcode::Recip => 1.0 / values[cur.slot(a)],
                    Opcode::Sqrt => values[cur.slot(a)].sqrt(),
                    Opcode::Square => values[cur.slot(a)].powi(2),
                    Opcode::Sin => values[cur.slot(a)].sin(),
                    Opcode::Cos => values[cur.slot(a)].cos(),
                    Opcode::Tan => values[cur.slot(a)].tan(),
                    Opcode::Exp => values[cur.slot(a)].exp(),
                    Opcode::Ln => values[cur.slot(a)].ln(),
                    Opcode::Add => {
                        values[cur.slot(a)] + values[cur.slot(b)]
                    }
                    Opcode::Sub => {
                        values[cur.slot(a)] - values[cur.slot(b)]
                    }
                    Opcode::Mul => {
                        values[cur.slot(a)] * values[cur.slot(b)]
                    }
                    Opcode::Div => {
                        values[cur.slot(a)] / values[cur.slot(b)]
                    }
                    Opcode::Min | Opcode::Max => {
                        let va = values[cur.slot(a)];
                        let vb = values[cur.slot(b)];
                        choices[id as usize] = if va < vb {
                            Choice::Left
                        } else if vb < va {
                            Choice::Right
                        } else {
                            if va == vb && ties.len() < MAX_TIES {
                                ties.push(id);
                            }
                            Choice::Both
                        };
                        if op == Opcode::Min {
                            va.min(vb)
                        } else {
                            va.max(vb)
                        }
                    }
                };
                values[cur.slot(id)] = v;
            },
            abort,
        );
        if let Some(e) = oracle_err {
            return Err(e);
        }
        Ok(self.values[cur.slot(root)])
    }

    /// Single-point forward gradient pass; min/max resolve by value
    fn grad_pass(
        &mut self,
        p: Vector3<f32>,
        tape: &Tape,
        abort: &AtomicBool,
    ) -> Result<Grad, Error> {
        let data = tape.data();
        let cur = tape.cur();
        let Self { grads, vars, .. } = self;
        let mut oracle_err: Option<Error> = None;

        let root = tape.rwalk(
            |op, id, a, b| {
                let v = match op {
                    Opcode::VarX => Grad::new(p.x, 1.0, 0.0, 0.0),
                    Opcode::VarY => Grad::new(p.y, 0.0, 1.0, 0.0),
                    Opcode::VarZ => Grad::new(p.z, 0.0, 0.0, 1.0),
                    Opcode::VarFree => {
                        vars[data.vars[a as usize] as usize].into()
                    }
                    Opcode::Constant => {
                        (data.constants[a as usize] as f32).into()
                    }
                    Opcode::Oracle => {
                        let oracle = &data.oracles[a as usize];
                        match (oracle.value(p), oracle.grad(p)) {
                            (Ok(v), Ok(g)) => Grad::new(v, g.x, g.y, g.z),
                            (Err(e), _) | (_, Err(e)) => {
                                oracle_err.get_or_insert(e);
                                f32::NAN.into()
                            }
                        }
                    }
                    Opcode::Neg => -grads[cur.slot(a)],
                    Opcode::Abs => grads[cur.slot(a)].abs(),
                    Opcode::Recip => grads[cur.slot(a)].recip(),
                    Opcode::Sqrt => grads[cur.slot(a)].sqrt(),
                    Opcode::Square => grads[cur.slot(a)].square(),
                    Opcode::Sin => grads[cur.slot(a)].sin(),
                    Opcode::Cos => grads[cur.slot(a)].cos(),
                    Opcode::Tan => grads[cur.slot(a)].tan(),
                    Opcode::Exp => grads[cur.slot(a)].exp(),
                    Opcode::Ln => grads[cur.slot(a)].ln(),
                    Opcode::Add => grads[cur.slot(a)] + grads[cur.slot(b)],
                    Opcode::Sub => grads[cur.slot(a)] - grads[cur.slot(b)],
                    Opcode::Mul => grads[cur.slot(a)] * grads[cur.slot(b)],
                    Opcode::Div => grads[cur.slot(a)] / grads[cur.slot(b)],
                    Opcode::Min => {
                        grads[cur.slot(a)].min(grads[cur.slot(b)])
                    }
                    Opcode::Max => {
                        grads[cur.slot(a)].max(grads[cur.slot(b)])
                    }
                };
                grads[cur.slot(id)] = v;
            },
            abort,
        );
        if let Some(e) = oracle_err {
            return Err(e);
        }
        Ok(self.grads[cur.slot(root)])
    }

    /// One-sided directional derivative at `p` along `u`
    ///
    /// At tied min/max clauses the one-sided derivative of the combination
    /// is the min (resp. max) of the branch derivatives.
    fn dir_pass(
        &mut self,
        p: Vector3<f32>,
        u: Vector3<f32>,
        tape: &Tape,
        abort: &AtomicBool,
    ) -> Result<f32, Error> {
        let data = tape.data();
        let cur = tape.cur();
        let Self { dirs, vars, .. } = self;
        let mut oracle_err: Option<Error> = None;

        let root = tape.rwalk(
            |op, id, a, b| {
                let out = match op {
                    Opcode::VarX => (p.x, u.x),
                    Opcode::VarY => (p.y, u.y),
                    Opcode::VarZ => (p.z, u.z),
                    Opcode::VarFree => {
                        (vars[data.vars[a as usize] as usize], 0.0)
                    }
                    Opcode::Constant => {
                        (data.constants[a as usize] as f32, 0.0)
                    }
                    Opcode::Oracle => {
                        let oracle = &data.oracles[a as usize];
                        match (oracle.value(p), oracle.grad(p)) {
                            (Ok(v), Ok(g)) => (v, g.dot(&u)),
                            (Err(e), _) | (_, Err(e)) => {
                                oracle_err.get_or_insert(e);
                                (f32::NAN, f32::NAN)
                            }
                        }
                    }
                    Opcode::Neg => {
                        let (v, d) = dirs[cur.slot(a)];
                        (-v, -d)
                    }
                    Opcode::Abs => {
                        let (v, d) = dirs[cur.slot(a)];
                        if v < 0.0 {
                            (-v, -d)
                        } else if v > 0.0 {
                            (v, d)
                        } else {
                            (0.0, d.abs())
                        }
                    }
                    Opcode::Recip => {
                        let (v, d) = dirs[cur.slot(a)];
                        (1.0 / v, -d / (v * v))
                    }
                    Opcode::Sqrt => {
                        let (v, d) = dirs[cur.slot(a)];
                        let s = v.sqrt();
                        (s, d / (2.0 * s))
                    }
                    Opcode::Square => {
                        let (v, d) = dirs[cur.slot(a)];
                        (v * v, 2.0 * v * d)
                    }
                    Opcode::Sin => {
                        let (v, d) = dirs[cur.slot(a)];
                        (v.sin(), v.cos() * d)
                    }
                    Opcode::Cos => {
                        let (v, d) = dirs[cur.slot(a)];
                        (v.cos(), -v.sin() * d)
                    }
                    Opcode::Tan => {
                        let (v, d) = dirs[cur.slot(a)];
                        (v.tan(), d / v.cos().powi(2))
                    }
                    Opcode::Exp => {
                        let (v, d) = dirs[cur.slot(a)];
                        let e = v.exp();
                        (e, e * d)
                    }
                    Opcode::Ln => {
                        let (v, d) = dirs[cur.slot(a)];
                        (v.ln(), d / v)
                    }
                    Opcode::Add => {
                        let (va, da) = dirs[cur.slot(a)];
                        let (vb, db) = dirs[cur.slot(b)];
                        (va + vb, da + db)
                    }
                    Opcode::Sub => {
                        let (va, da) = dirs[cur.slot(a)];
                        let (vb, db) = dirs[cur.slot(b)];
                        (va - vb, da - db)
                    }
                    Opcode::Mul => {
                        let (va, da) = dirs[cur.slot(a)];
                        let (vb, db) = dirs[cur.slot(b)];
                        (va * vb, va * db + vb * da)
                    }
                    Opcode::Div => {
                        let (va, da) = dirs[cur.slot(a)];
                        let (vb, db) = dirs[cur.slot(b)];
                        (va / vb, (vb * da - va * db) / (vb * vb))
                    }
                    Opcode::Min => {
                        let (va, da) = dirs[cur.slot(a)];
                        let (vb, db) = dirs[cur.slot(b)];
                        if va < vb {
                            (va, da)
                        } else if vb < va {
                            (vb, db)
                        } else {
                            (va, da.min(db))
                        }
                    }
                    Opcode::Max => {
                        let (va, da) = dirs[cur.slot(a)];
                        let (vb, db) = dirs[cur.slot(b)];
                        if va > vb {
                            (va, da)
                        } else if vb > va {
                            (vb, db)
                        } else {
                            (va, da.max(db))
                        }
                    }
                };
                dirs[cur.slot(id)] = out;
            },
            abort,
        );
        if let Some(e) = oracle_err {
            return Err(e);
        }
        Ok(self.dirs[cur.slot(root)].1)
    }

    /// Returns the set of candidate gradients at `p`
    ///
    /// Rebases on the tightest tape that is valid at `p`, then explores tie
    /// assignments through SPECIALIZED pushes.  Non-finite gradients are
    /// dropped; if nothing finite remains, a single zero vector stands in.
    pub fn features<'s>(
        &'s mut self,
        p: Vector3<f32>,
        tape: &mut Tape,
        abort: &AtomicBool,
    ) -> Result<&'s [Vector3<f32>], Error> {
        let mut h = tape.get_base(p);
        self.value_pass(p, &h, abort)?;
        self.feats.clear();

        if self.ties.is_empty() {
            let g = self.grad_pass(p, &h, abort)?;
            let d = g.d();
            if d.iter().all(|v| v.is_finite()) {
                self.feats.push(d);
            }
        } else {
            let ties = std::mem::take(&mut self.ties);
            let bounds = [
                Interval::from(p.x),
                Interval::from(p.y),
                Interval::from(p.z),
            ];
            for combo in 0u32..(1 << ties.len()) {
                let choices = &self.choices;
                let h2 = h.push(
                    |op, id, _a, _b| match op {
                        Opcode::Min | Opcode::Max => {
                            if let Some(bit) =
                                ties.iter().position(|t| *t == id)
                            {
                                if combo & (1 << bit) != 0 {
                                    Keep::B
                                } else {
                                    Keep::A
                                }
                            } else {
                                match choices[id as usize] {
                                    Choice::Left => Keep::A,
                                    Choice::Right => Keep::B,
                                    Choice::Both => Keep::Both,
                                }
                            }
                        }
                        _ => Keep::Always,
                    },
                    TapeType::Specialized,
                    bounds,
                );
                let g = self.grad_pass(p, &h2, abort)?;
                drop(h2);
                let d = g.d();
                if d.iter().all(|v| v.is_finite())
                    && !self.feats.iter().any(|f| (f - d).norm() < 1e-6)
                {
                    self.feats.push(d);
                }
            }
            self.ties = ties;
        }
        if self.feats.is_empty() {
            self.feats.push(Vector3::zeros());
        }
        Ok(&self.feats)
    }

    /// Classifies a point where the field may be exactly zero
    ///
    /// Returns whether any feature direction classifies the point as
    /// inside: the field must descend along some one-sided direction, or be
    /// locally flat at zero.
    pub fn is_inside(
        &mut self,
        p: Vector3<f32>,
        tape: &mut Tape,
        abort: &AtomicBool,
    ) -> Result<bool, Error> {
        let mut h = tape.get_base(p);
        let v = self.value_pass(p, &h, abort)?;
        if v < 0.0 {
            return Ok(true);
        }
        if v > 0.0 || v.is_nan() {
            return Ok(false);
        }

        self.features(p, &mut h, abort)?;
        let feats = std::mem::take(&mut self.feats);
        let mut inside = false;
        let mut flat = true;
        for f in &feats {
            if f.norm() == 0.0 {
                continue;
            }
            for sign in [1.0f32, -1.0] {
                let d = self.dir_pass(p, f * sign, &h, abort)?;
                if d < 0.0 {
                    inside = true;
                }
                if d != 0.0 {
                    flat = false;
                }
            }
        }
        self.feats = feats;
        Ok(inside || flat)
    }
}
