//! Interval evaluation and tape specialization
use crate::{
    error::Error,
    eval::Choice,
    tape::{Handle, Keep, Opcode, Tape, TapeType},
    types::Interval,
};

use std::sync::atomic::AtomicBool;

/// Evaluates a tape one interval per clause, producing an output interval
/// that is guaranteed to contain the field's value over the input region
///
/// Evaluation records a per-clause [`Choice`] at every `min` and `max`;
/// [`IntervalEval::eval_and_push`] replays those choices as a
/// keep-classifier to push a specialized tape for the region.
pub struct IntervalEval {
    slots: Vec<Interval>,
    choices: Vec<Choice>,
    vars: Vec<f32>,
    safe: bool,
}

impl IntervalEval {
    pub(crate) fn new(tape: &Tape, vars: Vec<f32>) -> Self {
        Self {
            slots: vec![f32::NAN.into(); tape.reg_count()],
            choices: vec![Choice::Both; tape.num_clauses()],
            vars,
            safe: true,
        }
    }

    /// Returns whether the most recent evaluation was strict
    ///
    /// The flag is cleared when any clause produces a NaN-containing
    /// interval (division by a zero-spanning interval, square root of a
    /// negative-reaching interval, and so on); in that case the output
    /// interval cannot justify pruning or tape specialization.
    pub fn is_safe(&self) -> bool {
        self.safe
    }

    /// Evaluates the field over `[lo, hi]`
    pub fn eval(
        &mut self,
        lo: nalgebra::Vector3<f32>,
        hi: nalgebra::Vector3<f32>,
        tape: &Tape,
        abort: &AtomicBool,
    ) -> Result<Interval, Error> {
        let x = Interval::new(lo.x, hi.x);
        let y = Interval::new(lo.y, hi.y);
        let z = Interval::new(lo.z, hi.z);

        let data = tape.data();
        let cur = tape.cur();
        let Self {
            slots,
            choices,
            vars,
            safe,
        } = self;
        *safe = true;
        let mut oracle_err: Option<Error> = None;

        let root = tape.rwalk(
            |op, id, a, b| {
                let v = match op {
                    Opcode::VarX => x,
                    Opcode::VarY => y,
                    Opcode::VarZ => z,
                    Opcode::VarFree => {
                        vars[data.vars[a as usize] as usize].into()
                    }
                    Opcode::Constant => {
                        (data.constants[a as usize] as f32).into()
                    }
                    Opcode::Oracle => {
                        match data.oracles[a as usize].interval(lo, hi) {
                            Ok(i) => i,
                            Err(e) => {
                                oracle_err.get_or_insert(e);
                                f32::NAN.into()
                            }
                        }
                    }
                    Opcode::Neg => -slots[cur.slot(a)],
                    Opcode::Abs => slots[cur.slot(a)].abs(),
                    Opcode::Recip => slots[cur.slot(a)].recip(),
                    Opcode::Sqrt => slots[cur.slot(a)].sqrt(),
                    Opcode::Square => slots[cur.slot(a)].square(),
                    Opcode::Sin => slots[cur.slot(a)].sin(),
                    Opcode::Cos => slots[cur.slot(a)].cos(),
                    Opcode::Tan => slots[cur.slot(a)].tan(),
                    Opcode::Exp => slots[cur.slot(a)].exp(),
                    Opcode::Ln => slots[cur.slot(a)].ln(),
                    Opcode::Add => slots[cur.slot(a)] + slots[cur.slot(b)],
                    Opcode::Sub => slots[cur.slot(a)] - slots[cur.slot(b)],
                    Opcode::Mul => slots[cur.slot(a)] * slots[cur.slot(b)],
                    Opcode::Div => slots[cur.slot(a)] / slots[cur.slot(b)],
                    Opcode::Min => {
                        let (v, c) =
                            slots[cur.slot(a)].min_choice(slots[cur.slot(b)]);
                        choices[id as usize] = c;
                        v
                    }
                    Opcode::Max => {
                        let (v, c) =
                            slots[cur.slot(a)].max_choice(slots[cur.slot(b)]);
                        choices[id as usize] = c;
                        v
                    }
                };
                if v.has_nan() {
                    *safe = false;
                }
                slots[cur.slot(id)] = v;
            },
            abort,
        );
        if let Some(e) = oracle_err {
            return Err(e);
        }
        Ok(self.slots[cur.slot(root)])
    }

    /// Evaluates the field over `[lo, hi]`, then pushes a specialization
    ///
    /// The pushed subtape keeps only the winning branch of every `min` and
    /// `max` whose interval result was strictly dominated.  If evaluation
    /// was not strict (see [`IntervalEval::is_safe`]), no specialization is
    /// pushed; the returned handle restores the cursor on drop either way.
    pub fn eval_and_push<'a>(
        &mut self,
        lo: nalgebra::Vector3<f32>,
        hi: nalgebra::Vector3<f32>,
        tape: &'a mut Tape,
        abort: &AtomicBool,
    ) -> Result<(Interval, Handle<'a>), Error> {
        let i = self.eval(lo, hi, tape, abort)?;
        let h = if self.safe {
            let choices = &self.choices;
            tape.push(
                |op, id, _a, _b| match op {
                    Opcode::Min | Opcode::Max => match choices[id as usize] {
                        Choice::Left => Keep::A,
                        Choice::Right => Keep::B,
                        Choice::Both => Keep::Both,
                    },
                    _ => Keep::Always,
                },
                TapeType::Interval,
                [
                    Interval::new(lo.x, hi.x),
                    Interval::new(lo.y, hi.y),
                    Interval::new(lo.z, hi.z),
                ],
            )
        } else {
            tape.hold()
        };
        Ok((i, h))
    }
}
