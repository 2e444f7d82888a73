//! Heap allocation, shape-based property access, closures
//!
//! Allocation emits an inline bump-pointer check with a host fallback;
//! `shape_get_prop` is fully inline, selecting between the object's inline
//! slots and its overflow extension; the remaining shape operations spill
//! and call their host helpers.

use crate::codegen::asm::encoder::{
    add, and, cmp, jcc_label, jmp_label, lea, mov, movzx,
};
use crate::codegen::asm::regs::{
    mem, mem_idx, reg, Cc, Size, X86Opnd, RAX, SCRATCH1, SCRATCH2, VM,
};
use crate::codegen::bridge::gen_host_call;
use crate::codegen::state::OutTag;
use crate::codegen::CodegenError;
use crate::ir::instr::{IRConst, IRInstr, Opcode};
use crate::ir::types::TypeTag;
use crate::runtime::context::{
    CLOS_CELLS_OFS, OBJ_CAP_OFS, OBJ_NEXT_OFS, OBJ_WORDS_OFS, VM_ALLOC_PTR_OFS,
    VM_HEAP_LIMIT_OFS,
};

use super::LowerCtx;

/// `alloc_*`: bump the allocation pointer inline, aligning the new top to
/// eight bytes; on limit overrun, collect and allocate through the host.
/// Live values are spilled up front so the fallback sees a valid root set.
pub(super) fn gen_alloc(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    let tag = instr.op.out_tag().expect("alloc has a fixed output tag");
    ctx.spill_for_call(instr);

    let size = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 0, Size::B64, None, true, true);

    let l_fallback = ctx.cb.new_label();
    let l_done = ctx.cb.new_label();

    // rax = old allocation pointer, scratch = proposed new pointer
    mov(ctx.cb, Size::B64, reg(RAX), mem(VM, VM_ALLOC_PTR_OFS));
    match size {
        X86Opnd::Imm(v) => lea(ctx.cb, SCRATCH1, mem(RAX, v as i32)),
        X86Opnd::Reg(r) => lea(ctx.cb, SCRATCH1, mem_idx(RAX, r, 1, 0)),
        _ => {
            mov(ctx.cb, Size::B64, reg(SCRATCH1), size);
            add(ctx.cb, Size::B64, reg(SCRATCH1), reg(RAX));
        }
    }
    cmp(ctx.cb, Size::B64, reg(SCRATCH1), mem(VM, VM_HEAP_LIMIT_OFS));
    jcc_label(ctx.cb, Cc::A, l_fallback);

    add(ctx.cb, Size::B64, reg(SCRATCH1), X86Opnd::Imm(7));
    and(ctx.cb, Size::B64, reg(SCRATCH1), X86Opnd::Imm(-8));
    mov(ctx.cb, Size::B64, mem(VM, VM_ALLOC_PTR_OFS), reg(SCRATCH1));
    jmp_label(ctx.cb, l_done);

    ctx.cb.bind_label(l_fallback);
    let gc_ptr = ctx.vm.host_fns.gc_collect as usize;
    let alloc_ptr = ctx.vm.host_fns.heap_alloc as usize;
    gen_host_call(ctx.cb, gc_ptr, &[reg(VM), size]);
    gen_host_call(ctx.cb, alloc_ptr, &[reg(VM), size]);
    ctx.stats.host_calls += 2;

    ctx.cb.bind_label(l_done);
    let live_after = ctx.live_after[ctx.instr_idx].clone();
    let out = ctx
        .state
        .get_out_opnd(ctx.cb, ctx.fun, instr, Size::B64, false, &live_after);
    mov(ctx.cb, Size::B64, out, reg(RAX));
    ctx.state
        .set_out_type(ctx.cb, ctx.fun, instr, OutTag::Known(tag));
    Ok(())
}

/// `gc_collect`
pub(super) fn gen_gc_collect(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    ctx.spill_for_call(instr);
    let size = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 0, Size::B64, None, true, true);
    let fn_ptr = ctx.vm.host_fns.gc_collect as usize;
    gen_host_call(ctx.cb, fn_ptr, &[reg(VM), size]);
    ctx.stats.host_calls += 1;
    Ok(())
}

/// `new_clos`: closure with the function pointer and `num_captures` boxed
/// cell slots. The function's entry stub is scheduled so dynamic calls can
/// jump through the record immediately.
pub(super) fn gen_new_clos(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    let fun_id = match instr.arg_const(0) {
        Some(IRConst::Fun(id)) => *id,
        _ => return Err(CodegenError::MissingTarget(instr.op)),
    };
    let num_cells = match instr.arg_const(1) {
        Some(IRConst::Int32(n)) => *n as u32,
        _ => return Err(CodegenError::MissingTarget(instr.op)),
    };

    if ctx.vm.fun(fun_id).entry_code.get().is_null()
        && !ctx.pending_entry_stubs.contains(&fun_id)
    {
        ctx.pending_entry_stubs.push(fun_id);
    }

    ctx.spill_for_call(instr);
    let fun_ptr = ctx.vm.fun_ptr(fun_id) as usize;
    let fn_ptr = ctx.vm.host_fns.new_clos as usize;
    gen_host_call(
        ctx.cb,
        fn_ptr,
        &[
            reg(VM),
            X86Opnd::Imm(fun_ptr as i64),
            X86Opnd::Imm(num_cells as i64),
        ],
    );
    ctx.stats.host_calls += 1;

    let live_after = ctx.live_after[ctx.instr_idx].clone();
    let out = ctx
        .state
        .get_out_opnd(ctx.cb, ctx.fun, instr, Size::B64, false, &live_after);
    mov(ctx.cb, Size::B64, out, reg(RAX));
    ctx.state
        .set_out_type(ctx.cb, ctx.fun, instr, OutTag::Known(TypeTag::Closure));
    Ok(())
}

/// `clos_set_cell(clos, idx, cell)`: write a capture-cell pointer
pub(super) fn gen_clos_set_cell(
    ctx: &mut LowerCtx<'_>,
    instr: &IRInstr,
) -> Result<(), CodegenError> {
    let idx = match instr.arg_const(1) {
        Some(IRConst::Int32(n)) => *n,
        _ => return Err(CodegenError::MissingTarget(instr.op)),
    };
    let clos = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 0, Size::B64, None, false, false);
    let clos_reg = match clos {
        X86Opnd::Reg(r) => r,
        _ => unreachable!("closure forced into a register"),
    };
    let cell = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 2, Size::B64, None, false, true);
    let dst = mem(clos_reg, CLOS_CELLS_OFS + 8 * idx);
    match cell {
        X86Opnd::Mem(_) => {
            mov(ctx.cb, Size::B64, reg(SCRATCH1), cell);
            mov(ctx.cb, Size::B64, dst, reg(SCRATCH1));
        }
        _ => mov(ctx.cb, Size::B64, dst, cell),
    }
    Ok(())
}

/// `clos_get_cell(clos, idx)`: read a capture-cell pointer
pub(super) fn gen_clos_get_cell(
    ctx: &mut LowerCtx<'_>,
    instr: &IRInstr,
) -> Result<(), CodegenError> {
    let idx = match instr.arg_const(1) {
        Some(IRConst::Int32(n)) => *n,
        _ => return Err(CodegenError::MissingTarget(instr.op)),
    };
    let clos = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 0, Size::B64, None, false, false);
    let clos_reg = match clos {
        X86Opnd::Reg(r) => r,
        _ => unreachable!("closure forced into a register"),
    };
    let live_after = ctx.live_after[ctx.instr_idx].clone();
    let out = ctx
        .state
        .get_out_opnd(ctx.cb, ctx.fun, instr, Size::B64, false, &live_after);
    let src = mem(clos_reg, CLOS_CELLS_OFS + 8 * idx);
    match out {
        X86Opnd::Reg(_) => mov(ctx.cb, Size::B64, out, src),
        _ => {
            mov(ctx.cb, Size::B64, reg(SCRATCH1), src);
            mov(ctx.cb, Size::B64, out, reg(SCRATCH1));
        }
    }
    ctx.state
        .set_out_type(ctx.cb, ctx.fun, instr, OutTag::Known(TypeTag::RefPtr));
    Ok(())
}

/// `make_cell`: allocate a boxed cell through the host
pub(super) fn gen_make_cell(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    ctx.spill_for_call(instr);
    let fn_ptr = ctx.vm.host_fns.make_cell as usize;
    gen_host_call(ctx.cb, fn_ptr, &[reg(VM)]);
    ctx.stats.host_calls += 1;
    let live_after = ctx.live_after[ctx.instr_idx].clone();
    let out = ctx
        .state
        .get_out_opnd(ctx.cb, ctx.fun, instr, Size::B64, false, &live_after);
    mov(ctx.cb, Size::B64, out, reg(RAX));
    ctx.state
        .set_out_type(ctx.cb, ctx.fun, instr, OutTag::Known(TypeTag::RefPtr));
    Ok(())
}

/// Host-called shape operations: spill, call the specific helper, store
/// the result when the op produces one
pub(super) fn gen_shape_host(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    ctx.spill_for_call(instr);

    let mut args: Vec<X86Opnd> = vec![reg(VM)];
    let word_argc = match instr.op {
        Opcode::ShapeGetDef => 2,
        Opcode::ShapeSetProp | Opcode::ShapeDefConst => 2,
        Opcode::ShapeSetAttrs => 2,
        Opcode::ShapeParent | Opcode::ShapePropName | Opcode::ShapeGetAttrs => 1,
        _ => unreachable!("not a host shape opcode"),
    };
    for i in 0..word_argc {
        let w = ctx
            .state
            .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, i, Size::B64, None, true, true);
        args.push(w);
    }
    // value-writing forms append the value word and its tag
    if matches!(instr.op, Opcode::ShapeSetProp | Opcode::ShapeDefConst) {
        let val = ctx
            .state
            .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 2, Size::B64, None, true, true);
        args.push(val);
        let tag = ctx
            .state
            .get_type_opnd(ctx.cb, ctx.fun, instr, 2, None, true);
        let tag = match tag {
            X86Opnd::Imm(_) => tag,
            _ => {
                movzx(ctx.cb, Size::B32, SCRATCH2, Size::B8, tag);
                reg(SCRATCH2)
            }
        };
        args.push(tag);
    }

    let t = &ctx.vm.host_fns;
    let fn_ptr = (match instr.op {
        Opcode::ShapeGetDef => t.shape_get_def as usize,
        Opcode::ShapeSetProp => t.shape_set_prop as usize,
        Opcode::ShapeDefConst => t.shape_def_const as usize,
        Opcode::ShapeSetAttrs => t.shape_set_attrs as usize,
        Opcode::ShapeParent => t.shape_parent as usize,
        Opcode::ShapePropName => t.shape_prop_name as usize,
        Opcode::ShapeGetAttrs => t.shape_get_attrs as usize,
        _ => unreachable!("not a host shape opcode"),
    }) as usize;
    gen_host_call(ctx.cb, fn_ptr, &args);
    ctx.stats.host_calls += 1;

    if instr.out.is_some() {
        let tag = instr
            .op
            .out_tag()
            .expect("value-producing shape op has a fixed tag");
        let live_after = ctx.live_after[ctx.instr_idx].clone();
        let out = ctx
            .state
            .get_out_opnd(ctx.cb, ctx.fun, instr, Size::B64, false, &live_after);
        mov(ctx.cb, Size::B64, out, reg(RAX));
        ctx.state
            .set_out_type(ctx.cb, ctx.fun, instr, OutTag::Known(tag));
    }
    Ok(())
}

/// `shape_get_prop(obj, shape)`: fully inline. Reads the slot index from
/// the shape record and selects between the inline slot array and the
/// overflow extension on the object's capacity.
pub(super) fn gen_shape_get_prop(
    ctx: &mut LowerCtx<'_>,
    instr: &IRInstr,
) -> Result<(), CodegenError> {
    let obj = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 0, Size::B64, None, false, false);
    let obj_reg = match obj {
        X86Opnd::Reg(r) => r,
        _ => unreachable!("object forced into a register"),
    };
    let shape = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 1, Size::B64, None, false, false);
    let shape_reg = match shape {
        X86Opnd::Reg(r) => r,
        _ => unreachable!("shape forced into a register"),
    };

    let live_after = ctx.live_after[ctx.instr_idx].clone();
    let out = ctx
        .state
        .get_out_opnd(ctx.cb, ctx.fun, instr, Size::B64, false, &live_after);
    let word_reg = match out {
        X86Opnd::Reg(r) => r,
        _ => SCRATCH1,
    };

    let l_ext = ctx.cb.new_label();
    let l_done = ctx.cb.new_label();

    // rax = slot index, r11 = capacity
    mov(
        ctx.cb,
        Size::B32,
        reg(RAX),
        mem(shape_reg, crate::runtime::context::SHAPE_SLOT_OFS),
    );
    mov(ctx.cb, Size::B32, reg(SCRATCH2), mem(obj_reg, OBJ_CAP_OFS));
    cmp(ctx.cb, Size::B32, reg(RAX), reg(SCRATCH2));
    jcc_label(ctx.cb, Cc::Ae, l_ext);

    // inline slot: word at obj+24+idx*8, tag at obj+24+cap*8+idx
    mov(ctx.cb, Size::B64, reg(word_reg), mem_idx(obj_reg, RAX, 8, OBJ_WORDS_OFS));
    lea(ctx.cb, SCRATCH2, mem_idx(obj_reg, SCRATCH2, 8, 0));
    movzx(
        ctx.cb,
        Size::B32,
        SCRATCH2,
        Size::B8,
        mem_idx(SCRATCH2, RAX, 1, OBJ_WORDS_OFS),
    );
    jmp_label(ctx.cb, l_done);

    // overflow extension, same layout
    ctx.cb.bind_label(l_ext);
    mov(ctx.cb, Size::B64, reg(word_reg), mem(obj_reg, OBJ_NEXT_OFS));
    mov(ctx.cb, Size::B32, reg(SCRATCH2), mem(word_reg, OBJ_CAP_OFS));
    lea(ctx.cb, SCRATCH2, mem_idx(word_reg, SCRATCH2, 8, 0));
    mov(ctx.cb, Size::B64, reg(word_reg), mem_idx(word_reg, RAX, 8, OBJ_WORDS_OFS));
    movzx(
        ctx.cb,
        Size::B32,
        SCRATCH2,
        Size::B8,
        mem_idx(SCRATCH2, RAX, 1, OBJ_WORDS_OFS),
    );

    ctx.cb.bind_label(l_done);
    if !matches!(out, X86Opnd::Reg(_)) {
        mov(ctx.cb, Size::B64, out, reg(word_reg));
    }
    ctx.state
        .set_out_type(ctx.cb, ctx.fun, instr, OutTag::InReg(SCRATCH2));
    Ok(())
}
