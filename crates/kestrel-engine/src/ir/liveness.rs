//! Liveness analysis
//!
//! Backward dataflow over the block graph producing per-block live-in sets,
//! plus per-instruction queries used by the spill discipline and by state
//! canonicalization (only values live at a block entry participate in
//! version interning).

use rustc_hash::FxHashSet;

use super::instr::{BlockId, IRArg, IRFunction, IRInstr, ValueId};

/// Function-wide liveness facts
#[derive(Debug)]
pub struct Liveness {
    live_in: Vec<FxHashSet<ValueId>>,
    live_out: Vec<FxHashSet<ValueId>>,
}

fn uses(instr: &IRInstr, f: &mut impl FnMut(ValueId)) {
    for arg in &instr.args {
        if let IRArg::Val(v) = arg {
            f(*v);
        }
    }
}

impl Liveness {
    /// Run the analysis to a fixpoint
    pub fn compute(fun: &IRFunction) -> Self {
        let n = fun.blocks.len();
        let mut live_in: Vec<FxHashSet<ValueId>> = vec![FxHashSet::default(); n];
        let mut live_out: Vec<FxHashSet<ValueId>> = vec![FxHashSet::default(); n];

        let mut changed = true;
        while changed {
            changed = false;
            // Reverse order converges faster on forward-shaped graphs
            for bi in (0..n).rev() {
                let block = &fun.blocks[bi];

                let mut out = FxHashSet::default();
                if let Some(term) = block.instrs.last() {
                    for target in term.targets.iter().flatten() {
                        for v in &live_in[target.0 as usize] {
                            out.insert(*v);
                        }
                    }
                }

                let mut inset = out.clone();
                for instr in block.instrs.iter().rev() {
                    if let Some(def) = instr.out {
                        inset.remove(&def);
                    }
                    uses(instr, &mut |v| {
                        inset.insert(v);
                    });
                }

                if out != live_out[bi] {
                    live_out[bi] = out;
                    changed = true;
                }
                if inset != live_in[bi] {
                    live_in[bi] = inset;
                    changed = true;
                }
            }
        }

        Liveness { live_in, live_out }
    }

    /// Values live at the entry of `block`
    pub fn live_in(&self, block: BlockId) -> &FxHashSet<ValueId> {
        &self.live_in[block.0 as usize]
    }

    /// Values live at the exit of `block`
    pub fn live_out(&self, block: BlockId) -> &FxHashSet<ValueId> {
        &self.live_out[block.0 as usize]
    }

    /// Per-instruction live-after sets for one block: entry `i` holds the
    /// values live immediately after instruction `i`.
    pub fn block_live_after(&self, fun: &IRFunction, block: BlockId) -> Vec<FxHashSet<ValueId>> {
        let b = fun.block(block);
        let n = b.instrs.len();
        let mut sets = vec![FxHashSet::default(); n];
        let mut cur = self.live_out[block.0 as usize].clone();
        for i in (0..n).rev() {
            sets[i] = cur.clone();
            let instr = &b.instrs[i];
            if let Some(def) = instr.out {
                cur.remove(&def);
            }
            uses(instr, &mut |v| {
                cur.insert(v);
            });
        }
        sets
    }

    /// Whether `val` is live immediately after instruction `idx` of `block`
    pub fn live_after(
        &self,
        fun: &IRFunction,
        block: BlockId,
        idx: usize,
        val: ValueId,
    ) -> bool {
        let b = fun.block(block);
        for later in &b.instrs[idx + 1..] {
            let mut found = false;
            uses(later, &mut |v| {
                if v == val {
                    found = true;
                }
            });
            if found {
                return true;
            }
            if later.out == Some(val) {
                // redefinition shadows the value (single assignment makes
                // this unreachable, kept as a guard)
                return false;
            }
        }
        self.live_out[block.0 as usize].contains(&val)
    }

    /// Whether `val` is live immediately before instruction `idx` of `block`
    pub fn live_before(
        &self,
        fun: &IRFunction,
        block: BlockId,
        idx: usize,
        val: ValueId,
    ) -> bool {
        let instr = &fun.block(block).instrs[idx];
        let mut used = false;
        uses(instr, &mut |v| {
            if v == val {
                used = true;
            }
        });
        if used {
            return true;
        }
        if instr.out == Some(val) {
            return false;
        }
        self.live_after(fun, block, idx, val)
    }
}
