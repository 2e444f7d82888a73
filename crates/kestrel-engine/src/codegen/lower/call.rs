//! Calls, returns, throws, and the unit-entry ops
//!
//! All call forms share `gen_call_branch`: it emits the return landing pad
//! (which stores the return pair into the call's output slot), the
//! exception landing pad when the call carries an exception edge, and the
//! transfer into the continuation version — directly under eager mode,
//! through a compile-on-first-use stub otherwise.

use crate::codegen::asm::encoder::{
    add, cmp, jcc_label, jmp_label, jmp_rm, lea, mov, mov_abs, movzx, sal, sub, xor,
};
use crate::codegen::asm::regs::{
    mem, mem_idx, reg, Cc, Gpr, Size, X86Opnd, ALLOC_REGS, RAX, RET_TYPE, RET_WORD, SCRATCH1,
    SCRATCH2, TSP, VM, WSP,
};
use crate::codegen::bridge::gen_host_call;
use crate::codegen::state::CodeGenState;
use crate::codegen::{CodegenError, StubEntry};
use crate::ir::instr::{
    FunId, IRInstr, Opcode, FUN_ENTRY_OFS, FUN_NUM_LOCALS_OFS, FUN_NUM_PARAMS_OFS,
};
use crate::ir::types::TypeTag;
use crate::runtime::context::{
    RetEntry, CLOS_FUN_OFS, VM_CUR_FUN_OFS, VM_RET_TAG_OFS, VM_RET_WORD_OFS,
};
use crate::runtime::value::{NULL_WORD, UNDEF_WORD};

use super::LowerCtx;

/// Store a fetched word operand into a frame slot, routing memory and wide
/// immediates through a scratch register
fn store_word(ctx: &mut LowerCtx<'_>, dst: X86Opnd, src: X86Opnd) {
    match src {
        X86Opnd::Imm(v) if i32::try_from(v).is_err() => {
            mov_abs(ctx.cb, SCRATCH1, v as u64);
            mov(ctx.cb, Size::B64, dst, reg(SCRATCH1));
        }
        X86Opnd::Mem(_) => {
            mov(ctx.cb, Size::B64, reg(SCRATCH1), src);
            mov(ctx.cb, Size::B64, dst, reg(SCRATCH1));
        }
        _ => mov(ctx.cb, Size::B64, dst, src),
    }
}

/// Like `store_word`, but with an explicit staging register so callers can
/// keep the shared scratches pinned (dynamic calls hold the function
/// record in one)
fn store_word_via(ctx: &mut LowerCtx<'_>, via: Gpr, dst: X86Opnd, src: X86Opnd) {
    match src {
        X86Opnd::Imm(v) if i32::try_from(v).is_err() => {
            mov_abs(ctx.cb, via, v as u64);
            mov(ctx.cb, Size::B64, dst, reg(via));
        }
        X86Opnd::Mem(_) => {
            mov(ctx.cb, Size::B64, reg(via), src);
            mov(ctx.cb, Size::B64, dst, reg(via));
        }
        _ => mov(ctx.cb, Size::B64, dst, src),
    }
}

/// Store a fetched tag operand into a frame tag slot
fn store_tag(ctx: &mut LowerCtx<'_>, dst: X86Opnd, src: X86Opnd) {
    match src {
        X86Opnd::Imm(_) => mov(ctx.cb, Size::B8, dst, src),
        _ => {
            movzx(ctx.cb, Size::B32, SCRATCH2, Size::B8, src);
            mov(ctx.cb, Size::B8, dst, reg(SCRATCH2));
        }
    }
}

/// Emit the out-of-line throw path: pin the current function for the
/// unwinder, raise a string exception, and jump to the returned handler.
pub(super) fn gen_throw_thunk(ctx: &mut LowerCtx<'_>, msg: &str) {
    mov(
        ctx.cb,
        Size::B32,
        mem(VM, VM_CUR_FUN_OFS),
        X86Opnd::Imm(ctx.fun_id.0 as i64),
    );
    let msg_word = ctx.vm.intern_str(msg);
    let fn_ptr = ctx.vm.host_fns.throw_exc as usize;
    gen_host_call(
        ctx.cb,
        fn_ptr,
        &[
            reg(VM),
            X86Opnd::Imm(msg_word as i64),
            X86Opnd::Imm(TypeTag::String as i64),
        ],
    );
    ctx.stats.host_calls += 1;
    jmp_rm(ctx.cb, reg(RAX));
}

/// Landing pads and continuation transfer shared by every call form.
/// Returns the pad address written as the return address, after
/// registering it with the unwinder.
fn gen_call_branch(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<usize, CodegenError> {
    let cont_block = ctx.target(instr, 0)?;
    let out = instr.out.expect("call has an output");
    let out_slot = ctx.fun.slot_of(out) as i32;

    let mut cont_state = ctx.state.clone();
    cont_state.map_all_to_stack();
    cont_state.define_stack(out);

    // return pad: the return pair rides in r12/r13
    let pad_pos = ctx.cb.pos();
    mov(ctx.cb, Size::B64, mem(WSP, out_slot * 8), reg(RET_WORD));
    mov(ctx.cb, Size::B8, mem(TSP, out_slot), reg(RET_TYPE));

    let live_in = ctx.live.live_in(cont_block).clone();
    cont_state.drop_dead(&live_in);
    let canon = cont_state.canonicalize(&live_in);

    let mut lazy_stub: Option<(crate::codegen::versions::VersionId, usize)> = None;
    if ctx.config.eager {
        let vid = ctx.vers.get_version(ctx.fun_id, cont_block, canon);
        ctx.emit_jump_to_version(vid, false);
    } else {
        let vid = ctx.vers.get_version_lazy(ctx.fun_id, cont_block, canon);
        if let Some(start) = ctx.vers.version(vid).start {
            crate::codegen::asm::encoder::jmp_to(ctx.cb, start);
        } else {
            let field = crate::codegen::asm::encoder::jmp_rel32_field(ctx.cb);
            lazy_stub = Some((vid, field));
        }
    }

    // exception pad: the unwinder leaves the pair in the VM context
    let exc_addr = match instr.targets[1] {
        Some(exc_block) => {
            let exc_pos = ctx.cb.pos();
            mov(ctx.cb, Size::B64, reg(RET_WORD), mem(VM, VM_RET_WORD_OFS));
            movzx(ctx.cb, Size::B32, RET_TYPE, Size::B8, mem(VM, VM_RET_TAG_OFS));
            mov(ctx.cb, Size::B64, mem(WSP, out_slot * 8), reg(RET_WORD));
            mov(ctx.cb, Size::B8, mem(TSP, out_slot), reg(RET_TYPE));

            let mut exc_state = ctx.state.clone();
            exc_state.map_all_to_stack();
            exc_state.define_stack(out);
            let exc_live = ctx.live.live_in(exc_block).clone();
            exc_state.drop_dead(&exc_live);
            let exc_canon = exc_state.canonicalize(&exc_live);
            let exc_vid = ctx.vers.get_version(ctx.fun_id, exc_block, exc_canon);
            ctx.emit_jump_to_version(exc_vid, false);
            Some(ctx.cb.ptr_at(exc_pos) as usize)
        }
        None => None,
    };

    // the continuation stub compiles the version, patches the pad's jump,
    // and enters the realized code
    if let Some((vid, field)) = lazy_stub {
        let stub_start = ctx.cb.pos();
        let disp = stub_start as i64 - (field as i64 + 4);
        ctx.cb.patch_i32(field, i32::try_from(disp).expect("stub displacement overflow"));
        let stub_id = ctx.stubs.len() as u32;
        ctx.stubs.push(StubEntry {
            version: vid,
            patch_field: field,
        });
        let fn_ptr = ctx.vm.host_fns.compile_stub as usize;
        gen_host_call(ctx.cb, fn_ptr, &[reg(VM), X86Opnd::Imm(stub_id as i64)]);
        jmp_rm(ctx.cb, reg(RAX));
        ctx.stats.stubs_emitted += 1;
    }

    let pad_addr = ctx.cb.ptr_at(pad_pos) as usize;
    ctx.vm.ret_addr_map.insert(
        pad_addr,
        RetEntry {
            fun: ctx.fun_id,
            exc_addr,
        },
    );
    Ok(pad_addr)
}

/// Request (and queue) the entry version of a statically-known callee
fn request_entry_version(
    ctx: &mut LowerCtx<'_>,
    fun_id: FunId,
) -> crate::codegen::versions::VersionId {
    let live = ctx.liveness_of(fun_id);
    // Safety: function records are boxed and stable.
    let callee = unsafe { &*ctx.vm.fun_ptr(fun_id) };
    let live_in = live.live_in(callee.entry);
    let entry_state = CodeGenState::entry(live_in);
    let canon = entry_state.canonicalize(live_in);
    ctx.vers.get_version(fun_id, callee.entry, canon)
}

/// `call_prim`: direct call of a named host-installed primitive with exact
/// arity, resolved at compile time
pub(super) fn gen_call_prim(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    let name = instr
        .arg_str(0)
        .ok_or_else(|| CodegenError::UnknownPrim("<missing name>".to_string()))?
        .to_string();
    let fun_id = ctx
        .vm
        .resolve_prim(&name)
        .ok_or_else(|| CodegenError::UnknownPrim(name.clone()))?;
    // Safety: function records are boxed and stable.
    let callee = unsafe { &*ctx.vm.fun_ptr(fun_id) };
    let argc = instr.args.len() - 1;
    if callee.num_params as usize != argc {
        return Err(CodegenError::ArityMismatch {
            prim: name,
            expected: callee.num_params,
            got: argc as u32,
        });
    }
    let total = callee.num_locals as i32;
    let entry_vid = request_entry_version(ctx, fun_id);

    ctx.spill_for_call(instr);

    // arguments into the callee's slots at negative offsets
    for k in 0..argc {
        let slot = 4 + k as i32;
        let src = ctx.state.get_word_opnd(
            ctx.cb, ctx.vm, ctx.fun, instr, 1 + k, Size::B64, None, true, true,
        );
        store_word(ctx, mem(WSP, -8 * (total - slot)), src);
        let tag = ctx
            .state
            .get_type_opnd(ctx.cb, ctx.fun, instr, 1 + k, None, true);
        store_tag(ctx, mem(TSP, -(total - slot)), tag);
    }

    // argc, this, closure, return address
    mov(
        ctx.cb,
        Size::B64,
        mem(WSP, -8 * (total - 3)),
        X86Opnd::Imm(argc as i64),
    );
    store_tag(ctx, mem(TSP, -(total - 3)), X86Opnd::Imm(TypeTag::Int32 as i64));
    mov(
        ctx.cb,
        Size::B64,
        mem(WSP, -8 * (total - 2)),
        X86Opnd::Imm(UNDEF_WORD as i64),
    );
    store_tag(ctx, mem(TSP, -(total - 2)), X86Opnd::Imm(TypeTag::Const as i64));
    mov(
        ctx.cb,
        Size::B64,
        mem(WSP, -8 * (total - 1)),
        X86Opnd::Imm(NULL_WORD as i64),
    );
    store_tag(ctx, mem(TSP, -(total - 1)), X86Opnd::Imm(TypeTag::Const as i64));
    let ra_field = mov_abs(ctx.cb, SCRATCH1, 0);
    mov(ctx.cb, Size::B64, mem(WSP, -8 * total), reg(SCRATCH1));
    store_tag(ctx, mem(TSP, -total), X86Opnd::Imm(TypeTag::RawPtr as i64));

    // push the frame and enter the callee
    sub(ctx.cb, Size::B64, reg(WSP), X86Opnd::Imm(8 * total as i64));
    sub(ctx.cb, Size::B64, reg(TSP), X86Opnd::Imm(total as i64));
    ctx.emit_jump_to_version(entry_vid, false);

    let pad_addr = gen_call_branch(ctx, instr)?;
    ctx.cb.patch_u64(ra_field, pad_addr as u64);
    ctx.finished = true;
    Ok(())
}

/// `call`: dynamic closure call with inline closure guard, missing-formal
/// fill, and an indirect jump through the function record's entry code
pub(super) fn gen_call(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    let argc = instr.args.len() - 2;
    let clos_type = match &instr.args[0] {
        crate::ir::instr::IRArg::Const(c) => c.tag(),
        crate::ir::instr::IRArg::Val(v) => ctx.known_type(*v),
    };

    ctx.spill_for_call(instr);

    // statically not a closure: the call always throws
    if let Some(t) = clos_type {
        if t != TypeTag::Closure {
            gen_throw_thunk(ctx, "TypeError: call of non-function");
            ctx.finished = true;
            return Ok(());
        }
    }

    // closure guard on the runtime tag
    let thunk_label = if clos_type.is_none() {
        let tag_opnd = ctx
            .state
            .get_type_opnd(ctx.cb, ctx.fun, instr, 0, None, true);
        cmp(ctx.cb, Size::B8, tag_opnd, X86Opnd::Imm(TypeTag::Closure as i64));
        let label = ctx.cb.new_label();
        jcc_label(ctx.cb, Cc::Ne, label);
        Some(label)
    } else {
        None
    };

    // rax = closure word, r10 = function record
    let clos_src = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 0, Size::B64, None, true, true);
    mov(ctx.cb, Size::B64, reg(RAX), clos_src);
    mov(ctx.cb, Size::B64, reg(SCRATCH1), mem(RAX, CLOS_FUN_OFS));

    let frame: Gpr = ALLOC_REGS[0];
    let tag_frame: Gpr = ALLOC_REGS[1];

    // extra = max(argc - num_params, 0)
    mov(ctx.cb, Size::B32, reg(SCRATCH2), X86Opnd::Imm(argc as i64));
    sub(ctx.cb, Size::B32, reg(SCRATCH2), mem(SCRATCH1, FUN_NUM_PARAMS_OFS));
    let no_clamp = ctx.cb.new_label();
    jcc_label(ctx.cb, Cc::Ge, no_clamp);
    xor(ctx.cb, Size::B32, reg(SCRATCH2), reg(SCRATCH2));
    ctx.cb.bind_label(no_clamp);

    // total slots = num_locals + extra; new frame bases
    mov(ctx.cb, Size::B32, reg(RAX), mem(SCRATCH1, FUN_NUM_LOCALS_OFS));
    add(ctx.cb, Size::B32, reg(RAX), reg(SCRATCH2));
    mov(ctx.cb, Size::B64, reg(tag_frame), reg(TSP));
    sub(ctx.cb, Size::B64, reg(tag_frame), reg(RAX));
    sal(ctx.cb, Size::B64, reg(RAX), X86Opnd::Imm(3));
    mov(ctx.cb, Size::B64, reg(frame), reg(WSP));
    sub(ctx.cb, Size::B64, reg(frame), reg(RAX));

    // provided arguments: formals at their fixed slots, extras above the
    // frame at num_locals + (k - num_params)
    for k in 0..argc {
        let l_extra = ctx.cb.new_label();
        let l_done = ctx.cb.new_label();
        cmp(ctx.cb, Size::B32, mem(SCRATCH1, FUN_NUM_PARAMS_OFS), X86Opnd::Imm(k as i64));
        jcc_label(ctx.cb, Cc::Be, l_extra);

        let slot = 4 + k as i32;
        let src = ctx.state.get_word_opnd(
            ctx.cb, ctx.vm, ctx.fun, instr, 2 + k, Size::B64, None, true, true,
        );
        store_word_via(ctx, RAX, mem(frame, 8 * slot), src);
        let tag = ctx
            .state
            .get_type_opnd(ctx.cb, ctx.fun, instr, 2 + k, None, true);
        store_tag(ctx, mem(tag_frame, slot), tag);
        jmp_label(ctx.cb, l_done);

        ctx.cb.bind_label(l_extra);
        // word base: frame + 8*(num_locals - num_params)
        mov(ctx.cb, Size::B32, reg(RAX), mem(SCRATCH1, FUN_NUM_LOCALS_OFS));
        sub(ctx.cb, Size::B32, reg(RAX), mem(SCRATCH1, FUN_NUM_PARAMS_OFS));
        lea(ctx.cb, RAX, mem_idx(frame, RAX, 8, 0));
        let src = ctx.state.get_word_opnd(
            ctx.cb, ctx.vm, ctx.fun, instr, 2 + k, Size::B64, None, true, true,
        );
        store_word_via(ctx, SCRATCH2, mem(RAX, 8 * k as i32), src);
        // tag base: tag_frame + (num_locals - num_params)
        mov(ctx.cb, Size::B32, reg(RAX), mem(SCRATCH1, FUN_NUM_LOCALS_OFS));
        sub(ctx.cb, Size::B32, reg(RAX), mem(SCRATCH1, FUN_NUM_PARAMS_OFS));
        lea(ctx.cb, RAX, mem_idx(tag_frame, RAX, 1, 0));
        let tag = ctx
            .state
            .get_type_opnd(ctx.cb, ctx.fun, instr, 2 + k, None, true);
        match tag {
            X86Opnd::Imm(_) => mov(ctx.cb, Size::B8, mem(RAX, k as i32), tag),
            _ => {
                movzx(ctx.cb, Size::B32, SCRATCH2, Size::B8, tag);
                mov(ctx.cb, Size::B8, mem(RAX, k as i32), reg(SCRATCH2));
            }
        }
        ctx.cb.bind_label(l_done);
    }

    // fill missing formals with undefined
    let l_fill = ctx.cb.new_label();
    let l_filled = ctx.cb.new_label();
    mov(ctx.cb, Size::B32, reg(RAX), X86Opnd::Imm(argc as i64));
    ctx.cb.bind_label(l_fill);
    cmp(ctx.cb, Size::B32, reg(RAX), mem(SCRATCH1, FUN_NUM_PARAMS_OFS));
    jcc_label(ctx.cb, Cc::Ae, l_filled);
    mov(
        ctx.cb,
        Size::B64,
        mem_idx(frame, RAX, 8, 8 * 4),
        X86Opnd::Imm(UNDEF_WORD as i64),
    );
    mov(
        ctx.cb,
        Size::B8,
        mem_idx(tag_frame, RAX, 1, 4),
        X86Opnd::Imm(TypeTag::Const as i64),
    );
    add(ctx.cb, Size::B32, reg(RAX), X86Opnd::Imm(1));
    jmp_label(ctx.cb, l_fill);
    ctx.cb.bind_label(l_filled);

    // argc, this, closure, return address
    mov(ctx.cb, Size::B64, mem(frame, 8 * 3), X86Opnd::Imm(argc as i64));
    mov(ctx.cb, Size::B8, mem(tag_frame, 3), X86Opnd::Imm(TypeTag::Int32 as i64));
    let this_src = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 1, Size::B64, None, true, true);
    store_word_via(ctx, RAX, mem(frame, 8 * 2), this_src);
    let this_tag = ctx
        .state
        .get_type_opnd(ctx.cb, ctx.fun, instr, 1, None, true);
    store_tag(ctx, mem(tag_frame, 2), this_tag);
    let clos_src = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 0, Size::B64, None, true, true);
    store_word_via(ctx, RAX, mem(frame, 8 * 1), clos_src);
    mov(ctx.cb, Size::B8, mem(tag_frame, 1), X86Opnd::Imm(TypeTag::Closure as i64));
    let ra_field = mov_abs(ctx.cb, RAX, 0);
    mov(ctx.cb, Size::B64, mem(frame, 0), reg(RAX));
    mov(ctx.cb, Size::B8, mem(tag_frame, 0), X86Opnd::Imm(TypeTag::RawPtr as i64));

    // switch to the callee frame and enter through the record, so a
    // not-yet-compiled callee goes through its compilation stub
    mov(ctx.cb, Size::B64, reg(WSP), reg(frame));
    mov(ctx.cb, Size::B64, reg(TSP), reg(tag_frame));
    jmp_rm(ctx.cb, mem(SCRATCH1, FUN_ENTRY_OFS));

    if let Some(label) = thunk_label {
        ctx.cb.bind_label(label);
        gen_throw_thunk(ctx, "TypeError: call of non-function");
    }

    let pad_addr = gen_call_branch(ctx, instr)?;
    ctx.cb.patch_u64(ra_field, pad_addr as u64);
    ctx.finished = true;
    Ok(())
}

/// `call_apply`: bail out to the host to unpack the argument array and
/// build the callee frame; the JIT jumps to the returned entry code
pub(super) fn gen_call_apply(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    let clos_type = match &instr.args[0] {
        crate::ir::instr::IRArg::Const(c) => c.tag(),
        crate::ir::instr::IRArg::Val(v) => ctx.known_type(*v),
    };

    ctx.spill_for_call(instr);

    if let Some(t) = clos_type {
        if t != TypeTag::Closure {
            gen_throw_thunk(ctx, "TypeError: call of non-function");
            ctx.finished = true;
            return Ok(());
        }
    }

    // pads first, jumped over, so the pad address is a plain immediate
    let l_seq = ctx.cb.new_label();
    jmp_label(ctx.cb, l_seq);
    let pad_addr = gen_call_branch(ctx, instr)?;
    ctx.cb.bind_label(l_seq);

    let thunk_label = if clos_type.is_none() {
        let tag_opnd = ctx
            .state
            .get_type_opnd(ctx.cb, ctx.fun, instr, 0, None, true);
        cmp(ctx.cb, Size::B8, tag_opnd, X86Opnd::Imm(TypeTag::Closure as i64));
        let label = ctx.cb.new_label();
        jcc_label(ctx.cb, Cc::Ne, label);
        Some(label)
    } else {
        None
    };

    mov(
        ctx.cb,
        Size::B32,
        mem(VM, VM_CUR_FUN_OFS),
        X86Opnd::Imm(ctx.fun_id.0 as i64),
    );
    let clos_w = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 0, Size::B64, None, true, true);
    let this_w = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 1, Size::B64, None, true, true);
    let this_tag = ctx
        .state
        .get_type_opnd(ctx.cb, ctx.fun, instr, 1, None, true);
    let this_tag = match this_tag {
        X86Opnd::Imm(_) => this_tag,
        _ => {
            movzx(ctx.cb, Size::B32, SCRATCH2, Size::B8, this_tag);
            reg(SCRATCH2)
        }
    };
    let arr_w = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 2, Size::B64, None, true, true);

    let fn_ptr = ctx.vm.host_fns.call_apply as usize;
    gen_host_call(
        ctx.cb,
        fn_ptr,
        &[
            reg(VM),
            X86Opnd::Imm(pad_addr as i64),
            clos_w,
            this_w,
            this_tag,
            arr_w,
        ],
    );
    ctx.stats.host_calls += 1;
    jmp_rm(ctx.cb, reg(RAX));

    if let Some(label) = thunk_label {
        ctx.cb.bind_label(label);
        gen_throw_thunk(ctx, "TypeError: call of non-function");
    }
    ctx.finished = true;
    Ok(())
}

/// `load_file` / `eval_str`: the host resolves the unit, builds its frame,
/// and returns the entry code; parse failures return the unwinder's result
pub(super) fn gen_enter_unit(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    ctx.spill_for_call(instr);

    let l_seq = ctx.cb.new_label();
    jmp_label(ctx.cb, l_seq);
    let pad_addr = gen_call_branch(ctx, instr)?;
    ctx.cb.bind_label(l_seq);

    mov(
        ctx.cb,
        Size::B32,
        mem(VM, VM_CUR_FUN_OFS),
        X86Opnd::Imm(ctx.fun_id.0 as i64),
    );
    let str_w = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 0, Size::B64, None, true, true);
    let fn_ptr = (match instr.op {
        Opcode::LoadFile => ctx.vm.host_fns.load_file,
        Opcode::EvalStr => ctx.vm.host_fns.eval_str,
        _ => unreachable!("not a unit-entry opcode"),
    }) as usize;
    gen_host_call(ctx.cb, fn_ptr, &[reg(VM), X86Opnd::Imm(pad_addr as i64), str_w]);
    ctx.stats.host_calls += 1;
    jmp_rm(ctx.cb, reg(RAX));
    ctx.finished = true;
    Ok(())
}

/// `ret`: return pair into the reserved registers, pop the frame (plus any
/// extra arguments unless the callee has fixed arity), jump through the
/// saved return address
pub(super) fn gen_ret(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    let word = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 0, Size::B64, None, true, true);
    match word {
        X86Opnd::Imm(v) if i32::try_from(v).is_err() => {
            mov_abs(ctx.cb, RET_WORD, v as u64);
        }
        _ => mov(ctx.cb, Size::B64, reg(RET_WORD), word),
    }
    let tag = ctx
        .state
        .get_type_opnd(ctx.cb, ctx.fun, instr, 0, None, true);
    match tag {
        X86Opnd::Imm(_) => mov(ctx.cb, Size::B32, reg(RET_TYPE), tag),
        _ => movzx(ctx.cb, Size::B32, RET_TYPE, Size::B8, tag),
    }

    // return address before the frame dies
    mov(ctx.cb, Size::B64, reg(SCRATCH1), mem(WSP, 8 * crate::ir::instr::RA_SLOT as i32));

    let num_locals = ctx.fun.num_locals;
    if ctx.fun.fixed_arity {
        add(ctx.cb, Size::B64, reg(WSP), X86Opnd::Imm(8 * num_locals as i64));
        add(ctx.cb, Size::B64, reg(TSP), X86Opnd::Imm(num_locals as i64));
    } else {
        // extra = max(argc - num_params, 0); pop num_locals + extra
        mov(
            ctx.cb,
            Size::B32,
            reg(RAX),
            mem(WSP, 8 * crate::ir::instr::ARGC_SLOT as i32),
        );
        sub(ctx.cb, Size::B32, reg(RAX), X86Opnd::Imm(ctx.fun.num_params as i64));
        let no_extra = ctx.cb.new_label();
        jcc_label(ctx.cb, Cc::Ge, no_extra);
        xor(ctx.cb, Size::B32, reg(RAX), reg(RAX));
        ctx.cb.bind_label(no_extra);
        add(ctx.cb, Size::B32, reg(RAX), X86Opnd::Imm(num_locals as i64));
        lea(ctx.cb, WSP, mem_idx(WSP, RAX, 8, 0));
        add(ctx.cb, Size::B64, reg(TSP), reg(RAX));
    }
    jmp_rm(ctx.cb, reg(SCRATCH1));
    ctx.finished = true;
    Ok(())
}

/// `throw`: spill, raise through the host unwinder, jump to the handler
pub(super) fn gen_throw(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    ctx.spill_for_call(instr);
    mov(
        ctx.cb,
        Size::B32,
        mem(VM, VM_CUR_FUN_OFS),
        X86Opnd::Imm(ctx.fun_id.0 as i64),
    );
    let word = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 0, Size::B64, None, true, true);
    let tag = ctx
        .state
        .get_type_opnd(ctx.cb, ctx.fun, instr, 0, None, true);
    let tag = match tag {
        X86Opnd::Imm(_) => tag,
        _ => {
            movzx(ctx.cb, Size::B32, SCRATCH2, Size::B8, tag);
            reg(SCRATCH2)
        }
    };
    let fn_ptr = ctx.vm.host_fns.throw_exc as usize;
    gen_host_call(ctx.cb, fn_ptr, &[reg(VM), word, tag]);
    ctx.stats.host_calls += 1;
    jmp_rm(ctx.cb, reg(RAX));
    ctx.finished = true;
    Ok(())
}
