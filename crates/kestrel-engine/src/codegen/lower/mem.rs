//! Memory loads and stores, moves, link-table access, interning

use crate::codegen::asm::encoder::{mov, mov_abs, movsx, movzx};
use crate::codegen::asm::regs::{mem, mem_idx, reg, Size, X86Opnd, SCRATCH1, SCRATCH2, VM};
use crate::codegen::state::{const_word, OutTag};
use crate::codegen::CodegenError;
use crate::ir::instr::{IRArg, IRConst, IRInstr, LinkIdx, Opcode};
use crate::ir::types::TypeTag;
use crate::runtime::context::{LINK_CELL_SIZE, LINK_TAG_OFS, VM_LINK_BASE_OFS};

use super::LowerCtx;

fn load_width(op: Opcode) -> (Size, bool) {
    match op {
        Opcode::LoadU8 => (Size::B8, false),
        Opcode::LoadU16 => (Size::B16, false),
        Opcode::LoadU32 => (Size::B32, false),
        Opcode::LoadI8 => (Size::B8, true),
        Opcode::LoadI16 => (Size::B16, true),
        Opcode::LoadU64
        | Opcode::LoadF64
        | Opcode::LoadRefPtr
        | Opcode::LoadRawPtr
        | Opcode::LoadFunPtr
        | Opcode::LoadShapePtr => (Size::B64, false),
        _ => unreachable!("not a load opcode"),
    }
}

fn store_width(op: Opcode) -> Size {
    match op {
        Opcode::StoreU8 => Size::B8,
        Opcode::StoreU16 => Size::B16,
        Opcode::StoreU32 => Size::B32,
        Opcode::StoreU64 | Opcode::StoreF64 => Size::B64,
        _ => unreachable!("not a store opcode"),
    }
}

/// Form the effective address `base + (constant | register)` of a memory op
fn addr_opnd(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> X86Opnd {
    let base = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 0, Size::B64, None, false, false);
    let base_reg = match base {
        X86Opnd::Reg(r) => r,
        _ => unreachable!("base address forced into a register"),
    };
    match &instr.args[1] {
        IRArg::Const(IRConst::Int32(disp)) => mem(base_reg, *disp),
        _ => {
            let idx = ctx.state.get_word_opnd(
                ctx.cb, ctx.vm, ctx.fun, instr, 1, Size::B64, None, false, false,
            );
            let idx_reg = match idx {
                X86Opnd::Reg(r) => r,
                _ => unreachable!("index forced into a register"),
            };
            mem_idx(base_reg, idx_reg, 1, 0)
        }
    }
}

/// Sized loads; the output tag is fixed by the opcode variant
pub(super) fn gen_load(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    let (width, signed) = load_width(instr.op);
    let src = addr_opnd(ctx, instr);
    let live_after = ctx.live_after[ctx.instr_idx].clone();
    let out = ctx
        .state
        .get_out_opnd(ctx.cb, ctx.fun, instr, Size::B64, false, &live_after);

    let dst_reg = match out {
        X86Opnd::Reg(r) => r,
        _ => SCRATCH1,
    };
    match (width, signed) {
        (Size::B64, _) => mov(ctx.cb, Size::B64, reg(dst_reg), src),
        (w, false) => movzx(ctx.cb, Size::B32, dst_reg, w, src),
        (w, true) => movsx(ctx.cb, Size::B32, dst_reg, w, src),
    }
    if !matches!(out, X86Opnd::Reg(_)) {
        mov(ctx.cb, Size::B64, out, reg(dst_reg));
    }

    let tag = instr.op.out_tag().expect("loads have a fixed output tag");
    ctx.state
        .set_out_type(ctx.cb, ctx.fun, instr, OutTag::Known(tag));
    Ok(())
}

/// Sized stores: `store_*(base, offset, value)`
pub(super) fn gen_store(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    let width = store_width(instr.op);
    let dst = addr_opnd(ctx, instr);
    let val = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 2, width, None, true, false);
    match val {
        X86Opnd::Imm(v) if width == Size::B64 && i32::try_from(v).is_err() => {
            mov_abs(ctx.cb, SCRATCH1, v as u64);
            mov(ctx.cb, width, dst, reg(SCRATCH1));
        }
        _ => mov(ctx.cb, width, dst, val),
    }
    Ok(())
}

/// `move`: copy a value (or constant) into the output
pub(super) fn gen_move(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    let out = instr.out.expect("move has an output");

    // constants stay unmaterialized
    if let Some(c) = instr.arg_const(0) {
        let (word, tag) = const_word(ctx.vm, c);
        ctx.state.set_imm(out, word, tag);
        return Ok(());
    }

    let src = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 0, Size::B64, None, true, true);
    let live_after = ctx.live_after[ctx.instr_idx].clone();
    let dst = ctx
        .state
        .get_out_opnd(ctx.cb, ctx.fun, instr, Size::B64, false, &live_after);
    match (&dst, &src) {
        (X86Opnd::Mem(_), X86Opnd::Mem(_)) => {
            mov(ctx.cb, Size::B64, reg(SCRATCH1), src);
            mov(ctx.cb, Size::B64, dst, reg(SCRATCH1));
        }
        _ => mov(ctx.cb, Size::B64, dst, src),
    }

    let tag_opnd = ctx
        .state
        .get_type_opnd(ctx.cb, ctx.fun, instr, 0, None, true);
    match tag_opnd {
        X86Opnd::Imm(t) => {
            let tag = crate::runtime::context::tag_from_byte(t as u8);
            ctx.state
                .set_out_type(ctx.cb, ctx.fun, instr, OutTag::Known(tag));
        }
        _ => {
            movzx(ctx.cb, Size::B32, SCRATCH2, Size::B8, tag_opnd);
            ctx.state
                .set_out_type(ctx.cb, ctx.fun, instr, OutTag::InReg(SCRATCH2));
        }
    }
    Ok(())
}

/// Link placeholder of the instruction's first argument, allocating the
/// table cell on first use
fn link_index(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<u32, CodegenError> {
    match instr.arg_const(0) {
        Some(IRConst::Link(link)) => Ok(resolve_link(ctx, link)),
        _ => Err(CodegenError::MissingTarget(instr.op)),
    }
}

pub(super) fn resolve_link(ctx: &mut LowerCtx<'_>, link: &LinkIdx) -> u32 {
    match link.get() {
        Some(idx) => idx,
        None => {
            let idx = ctx.vm.alloc_link();
            link.set(idx);
            idx
        }
    }
}

/// `get_link`: load a link-table cell's word and tag
pub(super) fn gen_get_link(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    let idx = link_index(ctx, instr)? as i32;
    mov(ctx.cb, Size::B64, reg(SCRATCH1), mem(VM, VM_LINK_BASE_OFS));
    let live_after = ctx.live_after[ctx.instr_idx].clone();
    let out = ctx
        .state
        .get_out_opnd(ctx.cb, ctx.fun, instr, Size::B64, false, &live_after);
    let cell = idx * LINK_CELL_SIZE;
    match out {
        X86Opnd::Reg(_) => mov(ctx.cb, Size::B64, out, mem(SCRATCH1, cell)),
        _ => {
            mov(ctx.cb, Size::B64, reg(SCRATCH2), mem(SCRATCH1, cell));
            mov(ctx.cb, Size::B64, out, reg(SCRATCH2));
        }
    }
    movzx(ctx.cb, Size::B32, SCRATCH2, Size::B8, mem(SCRATCH1, cell + LINK_TAG_OFS));
    ctx.state
        .set_out_type(ctx.cb, ctx.fun, instr, OutTag::InReg(SCRATCH2));
    Ok(())
}

/// `set_link`: store a word and tag into a link-table cell
pub(super) fn gen_set_link(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    let idx = link_index(ctx, instr)? as i32;
    let cell = idx * LINK_CELL_SIZE;

    let val = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 1, Size::B64, None, true, true);
    mov(ctx.cb, Size::B64, reg(SCRATCH1), mem(VM, VM_LINK_BASE_OFS));
    match val {
        X86Opnd::Imm(v) if i32::try_from(v).is_err() => {
            mov_abs(ctx.cb, SCRATCH2, v as u64);
            mov(ctx.cb, Size::B64, mem(SCRATCH1, cell), reg(SCRATCH2));
        }
        X86Opnd::Mem(_) => {
            mov(ctx.cb, Size::B64, reg(SCRATCH2), val);
            mov(ctx.cb, Size::B64, mem(SCRATCH1, cell), reg(SCRATCH2));
        }
        _ => mov(ctx.cb, Size::B64, mem(SCRATCH1, cell), val),
    }

    let tag_opnd = ctx
        .state
        .get_type_opnd(ctx.cb, ctx.fun, instr, 1, None, true);
    match tag_opnd {
        X86Opnd::Imm(_) => mov(ctx.cb, Size::B8, mem(SCRATCH1, cell + LINK_TAG_OFS), tag_opnd),
        _ => {
            movzx(ctx.cb, Size::B32, SCRATCH2, Size::B8, tag_opnd);
            mov(
                ctx.cb,
                Size::B8,
                mem(SCRATCH1, cell + LINK_TAG_OFS),
                reg(SCRATCH2),
            );
        }
    }
    Ok(())
}

/// `get_str`: intern a runtime string through the host
pub(super) fn gen_get_str(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    let fn_ptr = ctx.vm.host_fns.get_str as usize;
    ctx.spill_for_call(instr);
    let s = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 0, Size::B64, None, true, true);
    crate::codegen::bridge::gen_host_call(ctx.cb, fn_ptr, &[reg(VM), s]);
    ctx.stats.host_calls += 1;

    let live_after = ctx.live_after[ctx.instr_idx].clone();
    let out = ctx
        .state
        .get_out_opnd(ctx.cb, ctx.fun, instr, Size::B64, false, &live_after);
    mov(ctx.cb, Size::B64, out, reg(crate::codegen::asm::regs::RAX));
    ctx.state
        .set_out_type(ctx.cb, ctx.fun, instr, OutTag::Known(TypeTag::String));
    Ok(())
}
