//! Per-opcode code generators
//!
//! `lower_instr` dispatches on the opcode to one generator per family.
//! Generators receive the shared lowering context (`LowerCtx`): the code
//! buffer, the VM, the version registry, the current `CodeGenState`, and
//! per-instruction liveness. Terminator generators finish the block by
//! requesting successor versions through the branch helpers here.

mod arith;
mod branch;
mod call;
mod ffi;
mod float;
mod heap;
mod mem;

use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::codegen::asm::encoder::{jcc_rel32_field, jcc_to, jmp_rel32_field, jmp_to};
use crate::codegen::asm::regs::Cc;
use crate::codegen::asm::{CodeBlock, RefKind};
use crate::codegen::state::CodeGenState;
use crate::codegen::versions::{BranchShape, VersionId, VersionManager};
use crate::codegen::{CodegenError, CodegenStats, JitConfig, StubEntry};
use crate::ir::instr::{BlockId, FunId, IRFunction, IRInstr, Opcode, ValueId};
use crate::ir::liveness::Liveness;
use crate::ir::types::TypeTag;
use crate::runtime::context::VmContext;

/// Shared context for one block-version emission
pub(crate) struct LowerCtx<'a> {
    pub cb: &'a mut CodeBlock,
    pub vm: &'a mut VmContext,
    pub vers: &'a mut VersionManager,
    pub stubs: &'a mut Vec<StubEntry>,
    pub pending_entry_stubs: &'a mut Vec<FunId>,
    pub stats: &'a mut CodegenStats,
    pub config: &'a JitConfig,
    /// Static type-propagation facts for the current function, when enabled
    pub typeprop: Option<&'a FxHashMap<ValueId, TypeTag>>,
    pub live_cache: &'a mut FxHashMap<FunId, Rc<Liveness>>,
    pub fun_id: FunId,
    pub fun: &'a IRFunction,
    pub live: Rc<Liveness>,
    /// Live-after set per instruction of the current block
    pub live_after: Vec<FxHashSet<ValueId>>,
    pub block: BlockId,
    pub instr_idx: usize,
    pub state: CodeGenState,
    /// Set by terminator generators; ends the block emission loop
    pub finished: bool,
}

impl<'a> LowerCtx<'a> {
    /// Liveness of another function, computed once and cached
    pub fn liveness_of(&mut self, fun_id: FunId) -> Rc<Liveness> {
        if let Some(l) = self.live_cache.get(&fun_id) {
            return l.clone();
        }
        // Safety: function records are boxed and never move or mutate
        // during lowering.
        let fun = unsafe { &*self.vm.fun_ptr(fun_id) };
        let live = Rc::new(Liveness::compute(fun));
        self.live_cache.insert(fun_id, live.clone());
        live
    }

    /// Values live immediately before the current instruction: the
    /// live-after set plus the instruction's own value uses
    pub fn live_before_set(&self, instr: &IRInstr) -> FxHashSet<ValueId> {
        let mut set = self.live_after[self.instr_idx].clone();
        for idx in 0..instr.args.len() {
            if let Some(v) = instr.arg_val(idx) {
                set.insert(v);
            }
        }
        set
    }

    /// Spill and drop state for a host call that returns: everything live
    /// after the instruction goes to its stack home
    pub fn spill_for_call(&mut self, instr: &IRInstr) {
        // operands are re-read from their homes below the call, so the
        // live-before superset is what lands on the stack
        let live = self.live_before_set(instr);
        self.state
            .spill_values(self.cb, self.fun, |v| live.contains(&v));
        self.state.drop_dead(&live);
        self.state.map_all_to_stack();
    }

    /// The next instruction of the block, for test/branch fusion
    pub fn peek_next(&self) -> Option<&IRInstr> {
        self.fun.block(self.block).instrs.get(self.instr_idx + 1)
    }

    /// Known tag for a value: BBV state first, then the static pass
    pub fn known_type(&self, v: ValueId) -> Option<TypeTag> {
        if let Some(t) = self.state.type_of(v) {
            return Some(t);
        }
        if self.config.typeprop {
            if let Some(map) = self.typeprop {
                return map.get(&v).copied();
            }
        }
        None
    }

    /// Resolve a branch target of the current instruction
    pub fn target(&self, instr: &IRInstr, idx: usize) -> Result<BlockId, CodegenError> {
        instr.targets[idx].ok_or(CodegenError::MissingTarget(instr.op))
    }

    // --- version requests and branch emission ---

    /// Intern the version of `block` entered with `state`, emitting
    /// reconciliation spills on this edge when the registry degraded the
    /// request to a generic version. Returns the version to jump to.
    fn request_version(&mut self, block: BlockId, state: &mut CodeGenState) -> VersionId {
        let live_in = self.live.live_in(block).clone();
        state.drop_dead(&live_in);
        let canon = state.canonicalize(&live_in);
        let vid = self.vers.get_version(self.fun_id, block, canon.clone());
        if self.vers.version(vid).state != canon {
            // degraded to generic: put every live value in its home slot
            state.spill_values(self.cb, self.fun, |_| true);
        }
        vid
    }

    /// Emit an unconditional transfer to `version`: a direct jump when
    /// realized, a recorded reference otherwise. `fallthrough` elides the
    /// jump entirely and pins the version as the next one emitted.
    fn emit_jump_to_version(&mut self, vid: VersionId, allow_fallthrough: bool) {
        if let Some(start) = self.vers.version(vid).start {
            jmp_to(self.cb, start);
        } else if allow_fallthrough {
            self.vers.promote_front(vid);
        } else {
            let field = jmp_rel32_field(self.cb);
            self.cb.record_ref(vid.0, field, RefKind::Rel32);
        }
    }

    fn emit_jcc_to_version(&mut self, cc: Cc, vid: VersionId) {
        if let Some(start) = self.vers.version(vid).start {
            jcc_to(self.cb, cc, start);
        } else {
            let field = jcc_rel32_field(self.cb, cc);
            self.cb.record_ref(vid.0, field, RefKind::Rel32);
        }
    }

    /// Terminate the block with an unconditional edge to `block`
    pub fn gen_jump(&mut self, block: BlockId, state: CodeGenState) {
        self.gen_jump_opt(block, state, true);
    }

    /// Unconditional edge with explicit fall-through control. Callers that
    /// emit trailing code (edge trampolines, landing pads) must pass
    /// `false`: a fall-through target has to be the very next bytes.
    pub fn gen_jump_opt(
        &mut self,
        block: BlockId,
        mut state: CodeGenState,
        allow_fallthrough: bool,
    ) {
        let vid = self.request_version(block, &mut state);
        self.emit_jump_to_version(vid, allow_fallthrough);
        self.finished = true;
    }

    /// Terminate the block with a conditional edge: `cc` taken means
    /// `t_block` entered with `state_t`. Chooses the branch shape that
    /// minimizes emitted jumps: fall through to whichever pending target
    /// needs no edge moves.
    pub fn gen_branch(
        &mut self,
        cc: Cc,
        t_block: BlockId,
        f_block: BlockId,
        mut state_t: CodeGenState,
        mut state_f: CodeGenState,
    ) {
        // Degradation spills belong on one edge only, so they route
        // through a local trampoline instead of the shared path.
        let live_t = self.live.live_in(t_block).clone();
        state_t.drop_dead(&live_t);
        let canon_t = state_t.canonicalize(&live_t);
        let vid_t = self.vers.get_version(self.fun_id, t_block, canon_t.clone());
        let moves_t = self.vers.version(vid_t).state != canon_t;

        let live_f = self.live.live_in(f_block).clone();
        state_f.drop_dead(&live_f);
        let canon_f = state_f.canonicalize(&live_f);
        let vid_f = self.vers.get_version(self.fun_id, f_block, canon_f.clone());
        let moves_f = self.vers.version(vid_f).state != canon_f;

        let t_pending = !self.vers.version(vid_t).is_realized();
        let f_pending = !self.vers.version(vid_f).is_realized();

        // pick the layout needing the fewest jumps; an edge with
        // reconciliation moves cannot be the branched-to side of a
        // fall-through layout
        let shape = if !moves_t && f_pending {
            BranchShape::Next1
        } else if !moves_f && t_pending {
            BranchShape::Next0
        } else {
            BranchShape::Default
        };

        match shape {
            BranchShape::Next1 => {
                // branch to the true target, fall through to false
                self.emit_jcc_to_version(cc, vid_t);
                if moves_f {
                    state_f.spill_values(self.cb, self.fun, |_| true);
                }
                self.emit_jump_to_version(vid_f, true);
            }
            BranchShape::Next0 => {
                // inverted branch to false, fall through to true
                self.emit_jcc_to_version(cc.invert(), vid_f);
                if moves_t {
                    state_t.spill_values(self.cb, self.fun, |_| true);
                }
                self.emit_jump_to_version(vid_t, true);
            }
            BranchShape::Default => {
                // explicit jumps, trampoline for taken-edge moves
                if moves_t {
                    let label = self.cb.new_label();
                    crate::codegen::asm::encoder::jcc_label(self.cb, cc, label);
                    if moves_f {
                        state_f.spill_values(self.cb, self.fun, |_| true);
                    }
                    self.emit_jump_to_version(vid_f, false);
                    self.cb.bind_label(label);
                    state_t.spill_values(self.cb, self.fun, |_| true);
                    self.emit_jump_to_version(vid_t, false);
                } else {
                    self.emit_jcc_to_version(cc, vid_t);
                    if moves_f {
                        state_f.spill_values(self.cb, self.fun, |_| true);
                    }
                    self.emit_jump_to_version(vid_f, false);
                }
            }
        }
        self.finished = true;
    }
}

/// Lower one instruction, dispatching to its family generator
pub(crate) fn lower_instr(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    use Opcode::*;
    match instr.op {
        AddI32 | SubI32 | MulI32 | AndI32 | OrI32 | XorI32 => arith::gen_alu32(ctx, instr),
        NotI32 => arith::gen_not32(ctx, instr),
        AddI32Ovf | SubI32Ovf | MulI32Ovf => arith::gen_alu32_ovf(ctx, instr),
        DivI32 | ModI32 => arith::gen_div_mod(ctx, instr),
        LsftI32 | RsftI32 | UrsftI32 => arith::gen_shift(ctx, instr),

        AddF64 | SubF64 | MulF64 | DivF64 => float::gen_fp_arith(ctx, instr),
        SinF64 | CosF64 | SqrtF64 | CeilF64 | FloorF64 | LogF64 | ExpF64 => {
            float::gen_fp_host1(ctx, instr)
        }
        PowF64 | ModF64 => float::gen_fp_host2(ctx, instr),
        I32ToF64 => float::gen_i32_to_f64(ctx, instr),
        F64ToI32 => float::gen_f64_to_i32(ctx, instr),

        LoadU8 | LoadU16 | LoadU32 | LoadU64 | LoadI8 | LoadI16 | LoadF64 | LoadRefPtr
        | LoadRawPtr | LoadFunPtr | LoadShapePtr => mem::gen_load(ctx, instr),
        StoreU8 | StoreU16 | StoreU32 | StoreU64 | StoreF64 => mem::gen_store(ctx, instr),
        Move => mem::gen_move(ctx, instr),
        GetLink => mem::gen_get_link(ctx, instr),
        SetLink => mem::gen_set_link(ctx, instr),
        GetStr => mem::gen_get_str(ctx, instr),

        IsI32 | IsI64 | IsF64 | IsConst | IsRawPtr | IsRefPtr | IsObject | IsArray
        | IsClosure | IsString | IsShapePtr => branch::gen_type_test(ctx, instr),
        EqI8 | EqI32 | NeI32 | LtI32 | LeI32 | GtI32 | GeI32 | EqI64 | EqConst => {
            branch::gen_int_cmp(ctx, instr)
        }
        EqF64 | NeF64 | LtF64 | LeF64 | GtF64 | GeF64 => branch::gen_fp_cmp(ctx, instr),
        Jump => branch::gen_jump_op(ctx, instr),
        IfTrue => branch::gen_if_true(ctx, instr),

        CallPrim => call::gen_call_prim(ctx, instr),
        Call => call::gen_call(ctx, instr),
        CallApply => call::gen_call_apply(ctx, instr),
        Ret => call::gen_ret(ctx, instr),
        Throw => call::gen_throw(ctx, instr),
        LoadFile | EvalStr => call::gen_enter_unit(ctx, instr),

        AllocObject | AllocArray | AllocClosure | AllocString => heap::gen_alloc(ctx, instr),
        GcCollect => heap::gen_gc_collect(ctx, instr),
        NewClos => heap::gen_new_clos(ctx, instr),
        ClosSetCell => heap::gen_clos_set_cell(ctx, instr),
        ClosGetCell => heap::gen_clos_get_cell(ctx, instr),
        MakeCell => heap::gen_make_cell(ctx, instr),
        ShapeGetDef | ShapeSetProp | ShapeDefConst | ShapeSetAttrs | ShapeParent
        | ShapePropName | ShapeGetAttrs => heap::gen_shape_host(ctx, instr),
        ShapeGetProp => heap::gen_shape_get_prop(ctx, instr),

        GetTimeMs => float::gen_get_time_ms(ctx, instr),
        LoadLib | CloseLib | GetSym => ffi::gen_lib_op(ctx, instr),
        CallFfi => ffi::gen_call_ffi(ctx, instr),
    }
}
