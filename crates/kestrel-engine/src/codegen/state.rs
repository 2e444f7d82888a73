//! Code-generation state
//!
//! The keystone of basic-block versioning: for one program point, tracks
//! where every live IR value is (stack home, register, or an immediate not
//! yet materialized) and which type tags are known. Block versions are
//! interned on the canonical form of this state.
//!
//! Register allocation is single-pass first-free over `ALLOC_REGS`; when
//! nothing is free the least recently touched register is spilled.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::codegen::asm::encoder::{mov, mov_abs, movzx};
use crate::codegen::asm::regs::{
    mem, reg, Gpr, Size, X86Opnd, ALLOC_REGS, SCRATCH1, TSP, WSP,
};
use crate::codegen::asm::CodeBlock;
use crate::ir::instr::{IRArg, IRConst, IRFunction, IRInstr, ValueId};
use crate::ir::types::TypeTag;
use crate::runtime::context::VmContext;
use crate::runtime::value::{Word, FALSE_WORD, NULL_WORD, TRUE_WORD, UNDEF_WORD};

/// Where a value's word currently lives
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValLoc {
    /// In its stack home slot
    Stack,
    /// In a general-purpose register
    Reg(Gpr),
    /// A constant that has not been materialized
    Imm(u64, TypeTag),
}

/// Result-type report for `set_out_type`
#[derive(Debug, Clone, Copy)]
pub enum OutTag {
    /// Statically-known tag
    Known(TypeTag),
    /// Tag computed at run time, currently in the low byte of a register
    InReg(Gpr),
}

/// The per-point code generation state
#[derive(Debug, Clone)]
pub struct CodeGenState {
    vals: FxHashMap<ValueId, ValLoc>,
    types: FxHashMap<ValueId, TypeTag>,
    owners: FxHashMap<Gpr, ValueId>,
    stamps: FxHashMap<Gpr, u64>,
    counter: u64,
    /// Registers pinned by the current instruction (idiv, shift count);
    /// excluded from allocation until released
    reserved: Vec<Gpr>,
}

/// Resolve a constant to its word and tag. Interns string literals.
pub fn const_word(vm: &mut VmContext, c: &IRConst) -> (u64, TypeTag) {
    match c {
        IRConst::Int32(i) => (Word::from_i32(*i).0, TypeTag::Int32),
        IRConst::Float64(f) => (Word::from_f64(*f).0, TypeTag::Float64),
        IRConst::True => (TRUE_WORD, TypeTag::Const),
        IRConst::False => (FALSE_WORD, TypeTag::Const),
        IRConst::Null => (NULL_WORD, TypeTag::Const),
        IRConst::Undef => (UNDEF_WORD, TypeTag::Const),
        IRConst::Str(s) => (vm.intern_str(s), TypeTag::String),
        IRConst::Fun(id) => (vm.fun_ptr(*id) as u64, TypeTag::FunPtr),
        IRConst::Link(_) => panic!("link placeholders lower through get_link/set_link"),
    }
}

fn imm_fits(word: u64, sz: Size) -> bool {
    match sz {
        Size::B64 => i32::try_from(word as i64).is_ok(),
        _ => true,
    }
}

fn word_home(fun: &IRFunction, v: ValueId) -> X86Opnd {
    mem(WSP, fun.slot_of(v) as i32 * 8)
}

fn type_home(fun: &IRFunction, v: ValueId) -> X86Opnd {
    mem(TSP, fun.slot_of(v) as i32)
}

impl CodeGenState {
    /// Empty state
    pub fn new() -> CodeGenState {
        CodeGenState {
            vals: FxHashMap::default(),
            types: FxHashMap::default(),
            owners: FxHashMap::default(),
            stamps: FxHashMap::default(),
            counter: 0,
            reserved: vec![],
        }
    }

    /// Entry state of a function: every live-in value at its stack home
    pub fn entry(live_in: &FxHashSet<ValueId>) -> CodeGenState {
        let mut state = CodeGenState::new();
        for v in live_in {
            state.vals.insert(*v, ValLoc::Stack);
        }
        state
    }

    /// Current location of a value
    pub fn loc_of(&self, v: ValueId) -> Option<ValLoc> {
        self.vals.get(&v).copied()
    }

    /// Known tag of a value, if the state tracks one
    pub fn type_of(&self, v: ValueId) -> Option<TypeTag> {
        if let Some(t) = self.types.get(&v) {
            return Some(*t);
        }
        match self.vals.get(&v) {
            Some(ValLoc::Imm(_, tag)) => Some(*tag),
            _ => None,
        }
    }

    /// Which value owns a register
    pub fn owner_of(&self, r: Gpr) -> Option<ValueId> {
        self.owners.get(&r).copied()
    }

    fn touch(&mut self, r: Gpr) {
        self.counter += 1;
        let stamp = self.counter;
        self.stamps.insert(r, stamp);
    }

    fn claim(&mut self, v: ValueId, r: Gpr) {
        debug_assert!(!self.owners.contains_key(&r), "register {:?} already owned", r);
        debug_assert!(!self.reserved.contains(&r), "register {:?} is pinned", r);
        self.owners.insert(r, v);
        self.vals.insert(v, ValLoc::Reg(r));
        self.touch(r);
    }

    fn release(&mut self, r: Gpr) {
        self.owners.remove(&r);
    }

    fn first_free(&self) -> Option<Gpr> {
        ALLOC_REGS
            .iter()
            .copied()
            .find(|r| !self.owners.contains_key(r) && !self.reserved.contains(r))
    }

    /// Pin `r` for the current instruction: spill its owner and keep the
    /// allocator away from it until `release_reg`
    pub fn reserve_reg(&mut self, cb: &mut CodeBlock, fun: &IRFunction, r: Gpr) {
        self.spill_reg(cb, fun, r);
        if !self.reserved.contains(&r) {
            self.reserved.push(r);
        }
    }

    /// Unpin a register reserved with `reserve_reg`
    pub fn release_reg(&mut self, r: Gpr) {
        self.reserved.retain(|x| *x != r);
    }

    /// Refine the known type of a value (true edge of a fused type test)
    pub fn set_type(&mut self, v: ValueId, tag: TypeTag) {
        if let Some(ValLoc::Imm(_, t)) = self.vals.get(&v) {
            debug_assert_eq!(*t, tag, "immediate tag disagrees with refinement");
        }
        self.types.insert(v, tag);
    }

    /// Record a constant-valued result without emitting anything
    pub fn set_imm(&mut self, v: ValueId, word: u64, tag: TypeTag) {
        self.vals.insert(v, ValLoc::Imm(word, tag));
        self.types.insert(v, tag);
    }

    /// Record that `v` now lives in its stack home (written by out-of-band
    /// code such as a call-return landing pad)
    pub fn define_stack(&mut self, v: ValueId) {
        if let Some(ValLoc::Reg(r)) = self.vals.get(&v) {
            let r = *r;
            self.release(r);
        }
        self.vals.insert(v, ValLoc::Stack);
    }

    // --- operand access ---

    /// Concrete operand for the word of argument `arg_idx` of `instr`,
    /// readable at `sz`. May emit a load and update the state; repeated
    /// calls within one instruction return the same operand.
    #[allow(clippy::too_many_arguments)]
    pub fn get_word_opnd(
        &mut self,
        cb: &mut CodeBlock,
        vm: &mut VmContext,
        fun: &IRFunction,
        instr: &IRInstr,
        arg_idx: usize,
        sz: Size,
        pref: Option<Gpr>,
        allow_imm: bool,
        allow_mem: bool,
    ) -> X86Opnd {
        match &instr.args[arg_idx] {
            IRArg::Const(c) => {
                let (word, _tag) = const_word(vm, c);
                if allow_imm && imm_fits(word, sz) {
                    return X86Opnd::Imm(word as i64);
                }
                let r = self.scratch_or_pref(pref);
                self.materialize(cb, r, word, sz);
                reg(r)
            }
            IRArg::Val(v) => {
                let v = *v;
                let loc = *self
                    .vals
                    .get(&v)
                    .unwrap_or_else(|| panic!("{} has no location", v));
                match loc {
                    ValLoc::Reg(r) => {
                        self.touch(r);
                        reg(r)
                    }
                    ValLoc::Imm(word, _tag) => {
                        if allow_imm && imm_fits(word, sz) {
                            return X86Opnd::Imm(word as i64);
                        }
                        let r = self.alloc_for(cb, fun, instr, v, pref);
                        self.materialize(cb, r, word, sz);
                        reg(r)
                    }
                    ValLoc::Stack => {
                        if allow_mem {
                            return word_home(fun, v);
                        }
                        let r = self.alloc_for(cb, fun, instr, v, pref);
                        mov(cb, Size::B64, reg(r), word_home(fun, v));
                        reg(r)
                    }
                }
            }
        }
    }

    /// Concrete operand for the type tag of argument `arg_idx`. When the
    /// tag is statically known it comes back as an immediate with no load.
    pub fn get_type_opnd(
        &mut self,
        cb: &mut CodeBlock,
        fun: &IRFunction,
        instr: &IRInstr,
        arg_idx: usize,
        pref: Option<Gpr>,
        allow_imm: bool,
    ) -> X86Opnd {
        let known = match &instr.args[arg_idx] {
            IRArg::Const(c) => c.tag(),
            IRArg::Val(v) => self.type_of(*v),
        };
        if let Some(tag) = known {
            if allow_imm {
                return X86Opnd::Imm(tag as i64);
            }
            let r = self.scratch_or_pref(pref);
            mov(cb, Size::B32, reg(r), X86Opnd::Imm(tag as i64));
            return reg(r);
        }
        let v = instr
            .arg_val(arg_idx)
            .expect("constants always carry a tag");
        match pref {
            None => type_home(fun, v),
            Some(r) => {
                movzx(cb, Size::B32, r, Size::B8, type_home(fun, v));
                reg(r)
            }
        }
    }

    /// Pick the operand the instruction's result will be written to.
    /// `live_after` is the liveness set immediately after `instr`.
    pub fn get_out_opnd(
        &mut self,
        cb: &mut CodeBlock,
        fun: &IRFunction,
        instr: &IRInstr,
        _sz: Size,
        allow_reuse: bool,
        live_after: &FxHashSet<ValueId>,
    ) -> X86Opnd {
        let v = instr.out.expect("instruction has no output");

        // Dead results go straight to the home slot
        if !instr.has_uses {
            self.vals.insert(v, ValLoc::Stack);
            return word_home(fun, v);
        }

        if let Some(r) = self.first_free() {
            self.claim(v, r);
            return reg(r);
        }

        if allow_reuse {
            for arg in &instr.args {
                if let IRArg::Val(a) = arg {
                    if *a == v || live_after.contains(a) {
                        continue;
                    }
                    if let Some(ValLoc::Reg(r)) = self.vals.get(a).copied() {
                        self.vals.remove(a);
                        self.release(r);
                        self.claim(v, r);
                        return reg(r);
                    }
                }
            }
        }

        let exclude = self.instr_regs(instr);
        let r = self.free_reg(cb, fun, &exclude);
        self.claim(v, r);
        reg(r)
    }

    /// Record the result's type: a known tag propagates into the type map,
    /// a runtime tag register is stored to the type-stack home and the map
    /// entry cleared. Both forms keep the frame's tag byte current.
    pub fn set_out_type(
        &mut self,
        cb: &mut CodeBlock,
        fun: &IRFunction,
        instr: &IRInstr,
        out: OutTag,
    ) {
        let v = instr.out.expect("instruction has no output");
        match out {
            OutTag::Known(tag) => {
                self.types.insert(v, tag);
                mov(cb, Size::B8, type_home(fun, v), X86Opnd::Imm(tag as i64));
            }
            OutTag::InReg(r) => {
                self.types.remove(&v);
                mov(cb, Size::B8, type_home(fun, v), reg(r));
            }
        }
    }

    // --- spilling ---

    /// Write `v`'s register or immediate to its stack home and demote it
    pub fn spill_value(&mut self, cb: &mut CodeBlock, fun: &IRFunction, v: ValueId) {
        match self.vals.get(&v).copied() {
            None | Some(ValLoc::Stack) => {}
            Some(ValLoc::Reg(r)) => {
                mov(cb, Size::B64, word_home(fun, v), reg(r));
                self.release(r);
                self.vals.insert(v, ValLoc::Stack);
            }
            Some(ValLoc::Imm(word, tag)) => {
                if i32::try_from(word as i64).is_ok() {
                    mov(cb, Size::B64, word_home(fun, v), X86Opnd::Imm(word as i64));
                } else {
                    mov_abs(cb, SCRATCH1, word);
                    mov(cb, Size::B64, word_home(fun, v), reg(SCRATCH1));
                }
                mov(cb, Size::B8, type_home(fun, v), X86Opnd::Imm(tag as i64));
                self.vals.insert(v, ValLoc::Stack);
            }
        }
    }

    /// Spill whatever value currently owns `r`
    pub fn spill_reg(&mut self, cb: &mut CodeBlock, fun: &IRFunction, r: Gpr) {
        if let Some(v) = self.owners.get(&r).copied() {
            self.spill_value(cb, fun, v);
        }
    }

    /// Spill every live value matching `pred` (host calls, GC safepoints)
    pub fn spill_values(
        &mut self,
        cb: &mut CodeBlock,
        fun: &IRFunction,
        pred: impl Fn(ValueId) -> bool,
    ) {
        let mut to_spill: Vec<ValueId> = self
            .vals
            .iter()
            .filter(|(v, loc)| !matches!(loc, ValLoc::Stack) && pred(**v))
            .map(|(v, _)| *v)
            .collect();
        to_spill.sort();
        for v in to_spill {
            self.spill_value(cb, fun, v);
        }
    }

    /// A register holding no value live across the current instruction,
    /// spilling the least recently used when all are owned
    pub fn free_reg(&mut self, cb: &mut CodeBlock, fun: &IRFunction, exclude: &[Gpr]) -> Gpr {
        if let Some(r) = self.first_free() {
            return r;
        }
        let victim = ALLOC_REGS
            .iter()
            .copied()
            .filter(|r| !exclude.contains(r) && !self.reserved.contains(r))
            .min_by_key(|r| self.stamps.get(r).copied().unwrap_or(0))
            .expect("no spillable register");
        self.spill_reg(cb, fun, victim);
        victim
    }

    /// Demote a value's location to its stack home without emitting code.
    /// Valid only when the home already holds the value (after a spill) or
    /// the value is dead to register contents (after a call clobber).
    pub fn map_to_stack(&mut self, v: ValueId) {
        if let Some(ValLoc::Reg(r)) = self.vals.get(&v).copied() {
            self.release(r);
            self.vals.insert(v, ValLoc::Stack);
        }
    }

    /// Demote every register-resident value (call boundary)
    pub fn map_all_to_stack(&mut self) {
        let regs: Vec<ValueId> = self.owners.values().copied().collect();
        for v in regs {
            self.vals.insert(v, ValLoc::Stack);
        }
        self.owners.clear();
    }

    /// Drop entries for values not in `live`
    pub fn drop_dead(&mut self, live: &FxHashSet<ValueId>) {
        let dead: Vec<ValueId> = self
            .vals
            .keys()
            .copied()
            .filter(|v| !live.contains(v))
            .collect();
        for v in dead {
            if let Some(ValLoc::Reg(r)) = self.vals.remove(&v) {
                self.release(r);
            }
            self.types.remove(&v);
        }
        self.types.retain(|v, _| live.contains(v));
    }

    // --- helpers ---

    fn scratch_or_pref(&self, pref: Option<Gpr>) -> Gpr {
        match pref {
            Some(r) if !self.owners.contains_key(&r) => r,
            _ => SCRATCH1,
        }
    }

    fn materialize(&mut self, cb: &mut CodeBlock, r: Gpr, word: u64, sz: Size) {
        match sz {
            Size::B64 if i32::try_from(word as i64).is_err() => {
                mov_abs(cb, r, word);
            }
            Size::B64 => mov(cb, Size::B64, reg(r), X86Opnd::Imm(word as i64)),
            _ => mov(cb, Size::B32, reg(r), X86Opnd::Imm(word as u32 as i64)),
        }
    }

    /// Allocate a register to promote value `v` into
    fn alloc_for(
        &mut self,
        cb: &mut CodeBlock,
        fun: &IRFunction,
        instr: &IRInstr,
        v: ValueId,
        pref: Option<Gpr>,
    ) -> Gpr {
        let r = match pref {
            Some(r) if !self.owners.contains_key(&r) && ALLOC_REGS.contains(&r) => r,
            _ => {
                let exclude = self.instr_regs(instr);
                self.free_reg(cb, fun, &exclude)
            }
        };
        self.claim(v, r);
        r
    }

    /// Registers holding operands of `instr` (spill-exclusion set)
    fn instr_regs(&self, instr: &IRInstr) -> Vec<Gpr> {
        let mut regs = vec![];
        for arg in &instr.args {
            if let IRArg::Val(v) = arg {
                if let Some(ValLoc::Reg(r)) = self.vals.get(v) {
                    regs.push(*r);
                }
            }
        }
        regs
    }

    /// Invariant check: no two live values share a register
    pub fn check_location_uniqueness(&self) -> bool {
        let mut seen = FxHashSet::default();
        for loc in self.vals.values() {
            if let ValLoc::Reg(r) = loc {
                if !seen.insert(*r) {
                    return false;
                }
            }
        }
        true
    }
}

impl Default for CodeGenState {
    fn default() -> Self {
        Self::new()
    }
}

// --- canonical form ---

/// Canonical location in a version key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonLoc {
    /// Stack home
    Stack,
    /// Register, by number
    Reg(u8),
    /// Unmaterialized constant
    Imm(u64, TypeTag),
}

/// Canonical form of a state: only values live at the block entry, sorted,
/// with scratch residue dropped. Two states that canonicalize identically
/// intern to the same block version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonState {
    vals: Vec<(ValueId, CanonLoc)>,
    types: Vec<(ValueId, TypeTag)>,
}

impl CanonState {
    /// The canonical entries
    pub fn vals(&self) -> &[(ValueId, CanonLoc)] {
        &self.vals
    }

    /// The canonical type facts
    pub fn types(&self) -> &[(ValueId, TypeTag)] {
        &self.types
    }

    /// Erase every location to the stack home and drop all type facts
    /// (generic version under the per-block version cap)
    pub fn erase(&self) -> CanonState {
        CanonState {
            vals: self
                .vals
                .iter()
                .map(|(v, _)| (*v, CanonLoc::Stack))
                .collect(),
            types: vec![],
        }
    }

    /// Whether every location is a stack home and no types are known
    pub fn is_generic(&self) -> bool {
        self.types.is_empty() && self.vals.iter().all(|(_, l)| *l == CanonLoc::Stack)
    }
}

impl CodeGenState {
    /// Canonicalize against the target block's live-in set
    pub fn canonicalize(&self, live_in: &FxHashSet<ValueId>) -> CanonState {
        let mut vals: Vec<(ValueId, CanonLoc)> = self
            .vals
            .iter()
            .filter(|(v, _)| live_in.contains(v))
            .map(|(v, loc)| {
                let canon = match loc {
                    ValLoc::Stack => CanonLoc::Stack,
                    ValLoc::Reg(r) => CanonLoc::Reg(r.0),
                    ValLoc::Imm(w, t) => CanonLoc::Imm(*w, *t),
                };
                (*v, canon)
            })
            .collect();
        vals.sort_by_key(|(v, _)| *v);

        let mut types: Vec<(ValueId, TypeTag)> = self
            .types
            .iter()
            .filter(|(v, _)| live_in.contains(v))
            .map(|(v, t)| (*v, *t))
            .collect();
        types.sort_by_key(|(v, _)| *v);

        CanonState { vals, types }
    }

    /// Rebuild a working state from a canonical entry state
    pub fn from_canon(canon: &CanonState) -> CodeGenState {
        let mut state = CodeGenState::new();
        for (v, loc) in &canon.vals {
            match loc {
                CanonLoc::Stack => {
                    state.vals.insert(*v, ValLoc::Stack);
                }
                CanonLoc::Reg(n) => {
                    state.vals.insert(*v, ValLoc::Reg(Gpr(*n)));
                    state.owners.insert(Gpr(*n), *v);
                }
                CanonLoc::Imm(w, t) => {
                    state.vals.insert(*v, ValLoc::Imm(*w, *t));
                }
            }
        }
        for (v, t) in &canon.types {
            state.types.insert(*v, *t);
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IRBuilder;
    use crate::ir::instr::Opcode;

    fn setup() -> (CodeBlock, Box<VmContext>, IRFunction) {
        let cb = CodeBlock::new(4096).unwrap();
        let vm = VmContext::new(1 << 16, 256);
        let fun = IRFunction::new("t", 2);
        (cb, vm, fun)
    }

    fn add_instr(fun: &mut IRFunction) -> IRInstr {
        let p0 = fun.param_val(0);
        let p1 = fun.param_val(1);
        let mut b = IRBuilder::new(fun);
        let out = b.emit(Opcode::AddI32, vec![b.val(p0), b.val(p1)]);
        let _ = b.emit(Opcode::Move, vec![b.val(out)]);
        fun.block(fun.entry).instrs[0].clone()
    }

    #[test]
    fn test_word_opnd_idempotent() {
        let (mut cb, mut vm, mut fun) = setup();
        let instr = add_instr(&mut fun);
        let mut state = CodeGenState::new();
        state.vals.insert(fun.param_val(0), ValLoc::Stack);

        let a = state.get_word_opnd(
            &mut cb, &mut vm, &fun, &instr, 0, Size::B32, None, true, false,
        );
        let b = state.get_word_opnd(
            &mut cb, &mut vm, &fun, &instr, 0, Size::B32, None, true, false,
        );
        assert_eq!(a, b);
        assert!(matches!(a, X86Opnd::Reg(_)));
        assert!(state.check_location_uniqueness());
    }

    #[test]
    fn test_const_returns_imm() {
        let (mut cb, mut vm, mut fun) = setup();
        let p0 = fun.param_val(0);
        let mut b = IRBuilder::new(&mut fun);
        let arg0 = b.val(p0);
        let arg1 = b.int32(7);
        let _ = b.emit(Opcode::AddI32, vec![arg0, arg1]);
        let instr = fun.block(fun.entry).instrs[0].clone();
        let mut state = CodeGenState::new();
        state.vals.insert(fun.param_val(0), ValLoc::Stack);

        let opnd = state.get_word_opnd(
            &mut cb, &mut vm, &fun, &instr, 1, Size::B32, None, true, false,
        );
        assert_eq!(opnd, X86Opnd::Imm(7));
    }

    #[test]
    fn test_type_opnd_known_is_imm_without_code() {
        let (mut cb, _vm, mut fun) = setup();
        let instr = add_instr(&mut fun);
        let mut state = CodeGenState::new();
        let p0 = fun.param_val(0);
        state.vals.insert(p0, ValLoc::Stack);
        state.set_type(p0, TypeTag::Int32);

        let before = cb.pos();
        let opnd = state.get_type_opnd(&mut cb, &fun, &instr, 0, None, true);
        assert_eq!(opnd, X86Opnd::Imm(TypeTag::Int32 as i64));
        assert_eq!(cb.pos(), before, "known tag must not emit a load");
    }

    #[test]
    fn test_spill_and_map_to_stack() {
        let (mut cb, mut vm, mut fun) = setup();
        let instr = add_instr(&mut fun);
        let p0 = fun.param_val(0);
        let mut state = CodeGenState::new();
        state.vals.insert(p0, ValLoc::Stack);

        let opnd = state.get_word_opnd(
            &mut cb, &mut vm, &fun, &instr, 0, Size::B32, None, false, false,
        );
        let r = match opnd {
            X86Opnd::Reg(r) => r,
            other => panic!("expected register, got {:?}", other),
        };
        assert_eq!(state.owner_of(r), Some(p0));

        state.spill_reg(&mut cb, &fun, r);
        assert_eq!(state.loc_of(p0), Some(ValLoc::Stack));
        assert_eq!(state.owner_of(r), None);
    }

    #[test]
    fn test_spill_imm_writes_word_and_tag() {
        let (mut cb, _vm, fun) = setup();
        let p0 = fun.param_val(0);
        let mut state = CodeGenState::new();
        state.set_imm(p0, 42, TypeTag::Int32);

        let before = cb.pos();
        state.spill_value(&mut cb, &fun, p0);
        assert!(cb.pos() > before);
        assert_eq!(state.loc_of(p0), Some(ValLoc::Stack));
        // the known type survives the spill
        assert_eq!(state.type_of(p0), Some(TypeTag::Int32));
    }

    #[test]
    fn test_free_reg_spills_lru() {
        let (mut cb, mut vm, mut fun) = setup();
        // fill all allocatable registers with live values
        let mut values = vec![];
        for _ in 0..ALLOC_REGS.len() {
            values.push(fun.alloc_value());
        }
        let instr = add_instr(&mut fun);
        let mut state = CodeGenState::new();
        for v in &values {
            state.vals.insert(*v, ValLoc::Stack);
        }
        for (i, v) in values.iter().enumerate() {
            let r = ALLOC_REGS[i];
            state.claim(*v, r);
            let _ = (v, r);
        }
        assert!(state.first_free().is_none());

        let r = state.free_reg(&mut cb, &fun, &[]);
        // the first-claimed (least recently touched) register was spilled
        assert_eq!(r, ALLOC_REGS[0]);
        assert_eq!(state.loc_of(values[0]), Some(ValLoc::Stack));
        let _ = (&mut vm, &instr);
    }

    #[test]
    fn test_canonicalize_filters_dead() {
        let (_cb, _vm, mut fun) = setup();
        let p0 = fun.param_val(0);
        let dead = fun.alloc_value();
        let mut state = CodeGenState::new();
        state.vals.insert(p0, ValLoc::Stack);
        state.vals.insert(dead, ValLoc::Reg(ALLOC_REGS[0]));
        state.owners.insert(ALLOC_REGS[0], dead);
        state.set_type(dead, TypeTag::Int32);

        let mut live = FxHashSet::default();
        live.insert(p0);
        let canon = state.canonicalize(&live);
        assert_eq!(canon.vals().len(), 1);
        assert!(canon.types().is_empty());

        // identical modulo dead residue
        let clean = CodeGenState::entry(&live);
        assert_eq!(clean.canonicalize(&live), canon);
    }

    #[test]
    fn test_canon_erase_is_generic() {
        let (_cb, _vm, mut fun) = setup();
        let p0 = fun.param_val(0);
        let mut state = CodeGenState::new();
        state.vals.insert(p0, ValLoc::Reg(ALLOC_REGS[1]));
        state.owners.insert(ALLOC_REGS[1], p0);
        state.set_type(p0, TypeTag::String);

        let mut live = FxHashSet::default();
        live.insert(p0);
        let canon = state.canonicalize(&live);
        assert!(!canon.is_generic());
        let erased = canon.erase();
        assert!(erased.is_generic());
        assert_eq!(erased.vals().len(), 1);
    }

    #[test]
    fn test_from_canon_roundtrip() {
        let (_cb, _vm, mut fun) = setup();
        let p0 = fun.param_val(0);
        let p1 = fun.param_val(1);
        let mut state = CodeGenState::new();
        state.vals.insert(p0, ValLoc::Reg(ALLOC_REGS[2]));
        state.owners.insert(ALLOC_REGS[2], p0);
        state.vals.insert(p1, ValLoc::Imm(5, TypeTag::Int32));
        state.set_type(p0, TypeTag::Object);

        let mut live = FxHashSet::default();
        live.insert(p0);
        live.insert(p1);
        let canon = state.canonicalize(&live);
        let rebuilt = CodeGenState::from_canon(&canon);
        assert_eq!(rebuilt.canonicalize(&live), canon);
        assert_eq!(rebuilt.owner_of(ALLOC_REGS[2]), Some(p0));
        let _ = fun.alloc_value();
    }
}
