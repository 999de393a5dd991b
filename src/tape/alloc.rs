//! Register allocation for tape clauses
use super::{Clause, ClauseId};

use std::collections::BTreeSet;

/// Map from clause id to register slot, shared by every specialization of a
/// tape (clause ids are stable across pushes, so live ranges only shrink and
/// the base assignment stays valid).
#[derive(Debug, Default)]
pub(crate) struct Slots {
    map: Vec<u32>,
    count: usize,
}

impl Slots {
    /// Returns the slot assigned to the given clause
    pub fn slot(&self, id: ClauseId) -> usize {
        self.map[id as usize] as usize
    }
    /// Returns the total number of slots in the register file
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Assigns a register slot to every clause by live-range reuse
///
/// Positions are counted in evaluation order (the reverse of clause storage
/// order).  Each clause is live from its definition to just past its last
/// use; a multiset of (position, DROP | LOAD) events is walked in order,
/// with drops sorting before loads at the same position so that a register
/// freed at position `i` is immediately available to the clause defined
/// there.  Loads take the smallest free slot, growing the file as needed.
pub(crate) fn assign_slots(clauses: &[Clause], num_clauses: usize) -> Slots {
    let mut ranges: Vec<Option<(u32, u32)>> = vec![None; num_clauses];
    for (i, c) in clauses.iter().rev().enumerate() {
        let i = i as u32;
        debug_assert_ne!(c.id, 0);
        ranges[c.id as usize] = Some((i, i + 1));
        if !c.op.has_dummy_children() {
            for operand in [c.a, c.b] {
                if operand != 0 {
                    if let Some(r) = ranges[operand as usize].as_mut() {
                        r.1 = i + 1;
                    }
                }
            }
        }
    }

    // (position, LOAD, id) events; DROP = 0 sorts before LOAD = 1
    const DROP: u8 = 0;
    const LOAD: u8 = 1;
    let mut events: Vec<(u32, u8, ClauseId)> = vec![];
    for (id, r) in ranges.iter().enumerate() {
        if let Some((start, end)) = r {
            events.push((*start, LOAD, id as ClauseId));
            events.push((*end, DROP, id as ClauseId));
        }
    }
    events.sort_unstable();

    let mut map = vec![0u32; num_clauses];
    let mut active: Vec<Option<u32>> = vec![None; num_clauses];
    let mut free: BTreeSet<u32> = BTreeSet::new();
    let mut count = 0u32;
    for (_pos, kind, id) in events {
        if kind == DROP {
            let slot = active[id as usize].take().unwrap();
            free.insert(slot);
        } else {
            let slot = if let Some(s) = free.iter().next().copied() {
                free.remove(&s);
                s
            } else {
                let s = count;
                count += 1;
                s
            };
            active[id as usize] = Some(slot);
            map[id as usize] = slot;
        }
    }

    Slots {
        map,
        count: count as usize,
    }
}
