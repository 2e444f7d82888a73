//! Integer arithmetic, logic, shifts, and division

use crate::codegen::asm::encoder::{
    add, and, cdq, idiv, imul, mov, not, or, sal, sar, shr, sub, xor,
};
use crate::codegen::asm::regs::{
    mem, reg, Cc, Size, X86Opnd, RAX, RCX, RDX, SCRATCH1, SCRATCH2, WSP,
};
use crate::codegen::state::OutTag;
use crate::codegen::CodegenError;
use crate::ir::instr::{IRConst, IRInstr, Opcode};
use crate::ir::types::TypeTag;

use super::LowerCtx;

type AluEmit = fn(&mut crate::codegen::asm::CodeBlock, Size, X86Opnd, X86Opnd);

fn alu_emitter(op: Opcode) -> (AluEmit, bool) {
    match op {
        Opcode::AddI32 | Opcode::AddI32Ovf => (add as AluEmit, true),
        Opcode::SubI32 | Opcode::SubI32Ovf => (sub as AluEmit, false),
        Opcode::AndI32 => (and as AluEmit, true),
        Opcode::OrI32 => (or as AluEmit, true),
        Opcode::XorI32 => (xor as AluEmit, true),
        _ => unreachable!("not an ALU opcode"),
    }
}

/// Emit `out = a op b` at 32 bits, handling the two-operand x86 shape.
/// Returns the register the result landed in when it went to a register.
fn emit_rmm32(
    ctx: &mut LowerCtx<'_>,
    instr: &IRInstr,
    force_reg_out: bool,
) -> Result<X86Opnd, CodegenError> {
    let is_mul = matches!(instr.op, Opcode::MulI32 | Opcode::MulI32Ovf);
    let (emit, commutative): (AluEmit, bool) = if is_mul {
        (|_, _, _, _| unreachable!(), true)
    } else {
        alu_emitter(instr.op)
    };

    let mut a = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 0, Size::B32, None, true, true);
    let mut b = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 1, Size::B32, None, true, true);

    // immediates commute into the second position
    if commutative && matches!(a, X86Opnd::Imm(_)) {
        std::mem::swap(&mut a, &mut b);
    }

    let live_after = ctx.live_after[ctx.instr_idx].clone();
    let out = ctx
        .state
        .get_out_opnd(ctx.cb, ctx.fun, instr, Size::B32, true, &live_after);

    match out {
        X86Opnd::Reg(r) => {
            // reusing b's register for the output flips the operand roles
            if b == out && a != out {
                if commutative {
                    std::mem::swap(&mut a, &mut b);
                } else {
                    mov(ctx.cb, Size::B32, reg(SCRATCH2), b);
                    b = reg(SCRATCH2);
                }
            }
            if a != out {
                mov(ctx.cb, Size::B32, out, a);
            }
            if is_mul {
                if matches!(b, X86Opnd::Imm(_)) {
                    mov(ctx.cb, Size::B32, reg(SCRATCH2), b);
                    b = reg(SCRATCH2);
                }
                imul(ctx.cb, Size::B32, r, b);
            } else {
                emit(ctx.cb, Size::B32, out, b);
            }
            Ok(out)
        }
        _ => {
            // result value is dead or homeless: compute in a scratch
            mov(ctx.cb, Size::B32, reg(SCRATCH1), a);
            if is_mul {
                if matches!(b, X86Opnd::Imm(_)) {
                    mov(ctx.cb, Size::B32, reg(SCRATCH2), b);
                    b = reg(SCRATCH2);
                }
                imul(ctx.cb, Size::B32, SCRATCH1, b);
            } else {
                emit(ctx.cb, Size::B32, reg(SCRATCH1), b);
            }
            if force_reg_out {
                Ok(reg(SCRATCH1))
            } else {
                mov(ctx.cb, Size::B32, out, reg(SCRATCH1));
                Ok(out)
            }
        }
    }
}

/// `add_i32` family without branch targets
pub(super) fn gen_alu32(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    emit_rmm32(ctx, instr, false)?;
    ctx.state
        .set_out_type(ctx.cb, ctx.fun, instr, OutTag::Known(TypeTag::Int32));
    Ok(())
}

/// Bitwise not
pub(super) fn gen_not32(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    let a = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 0, Size::B32, None, true, true);
    let live_after = ctx.live_after[ctx.instr_idx].clone();
    let out = ctx
        .state
        .get_out_opnd(ctx.cb, ctx.fun, instr, Size::B32, true, &live_after);
    match out {
        X86Opnd::Reg(_) => {
            if a != out {
                mov(ctx.cb, Size::B32, out, a);
            }
            not(ctx.cb, Size::B32, out);
        }
        _ => {
            mov(ctx.cb, Size::B32, reg(SCRATCH1), a);
            not(ctx.cb, Size::B32, reg(SCRATCH1));
            mov(ctx.cb, Size::B32, out, reg(SCRATCH1));
        }
    }
    ctx.state
        .set_out_type(ctx.cb, ctx.fun, instr, OutTag::Known(TypeTag::Int32));
    Ok(())
}

/// Overflow-branching variants: successor 0 on no overflow, successor 1 on
/// overflow with the output slot untouched. The overflow edge is taken
/// through a local trampoline so the result write and its tag stay on the
/// fall-through path.
pub(super) fn gen_alu32_ovf(
    ctx: &mut LowerCtx<'_>,
    instr: &IRInstr,
) -> Result<(), CodegenError> {
    let ok_block = ctx.target(instr, 0)?;
    let ovf_block = ctx.target(instr, 1)?;

    let ovf_state = ctx.state.clone();
    let result = emit_rmm32(ctx, instr, true)?;

    let label = ctx.cb.new_label();
    crate::codegen::asm::encoder::jcc_label(ctx.cb, Cc::O, label);

    if result == reg(SCRATCH1) {
        let out_slot = ctx.fun.slot_of(instr.out.expect("ovf op has an output")) as i32;
        mov(ctx.cb, Size::B64, mem(WSP, out_slot * 8), reg(SCRATCH1));
    }
    ctx.state
        .set_out_type(ctx.cb, ctx.fun, instr, OutTag::Known(TypeTag::Int32));
    let ok_state = ctx.state.clone();
    ctx.gen_jump_opt(ok_block, ok_state, false);

    // overflow trampoline: the pre-instruction state, output dead
    ctx.cb.bind_label(label);
    let mut s = ovf_state;
    let live_in = ctx.live.live_in(ovf_block).clone();
    s.drop_dead(&live_in);
    let canon = s.canonicalize(&live_in);
    let vid = ctx.vers.get_version(ctx.fun_id, ovf_block, canon.clone());
    if ctx.vers.version(vid).state != canon {
        s.spill_values(ctx.cb, ctx.fun, |_| true);
    }
    ctx.emit_jump_to_version(vid, false);
    ctx.finished = true;
    Ok(())
}

/// `div_i32` / `mod_i32` through the fixed `idiv` registers
pub(super) fn gen_div_mod(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    // rdx:rax are consumed by idiv
    ctx.state.reserve_reg(ctx.cb, ctx.fun, RDX);
    ctx.state.spill_reg(ctx.cb, ctx.fun, RAX);

    let a = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 0, Size::B32, None, true, true);
    let b = ctx.state.get_word_opnd(
        ctx.cb,
        ctx.vm,
        ctx.fun,
        instr,
        1,
        Size::B32,
        Some(SCRATCH2),
        false,
        true,
    );
    debug_assert!(b != reg(RDX) && b != reg(RAX));

    let live_after = ctx.live_after[ctx.instr_idx].clone();
    let out = ctx
        .state
        .get_out_opnd(ctx.cb, ctx.fun, instr, Size::B32, false, &live_after);

    mov(ctx.cb, Size::B32, reg(RAX), a);
    cdq(ctx.cb);
    idiv(ctx.cb, Size::B32, b);

    let res = if instr.op == Opcode::DivI32 { RAX } else { RDX };
    ctx.state.release_reg(RDX);
    if out != reg(res) {
        mov(ctx.cb, Size::B32, out, reg(res));
    }
    ctx.state
        .set_out_type(ctx.cb, ctx.fun, instr, OutTag::Known(TypeTag::Int32));
    Ok(())
}

fn shift_emitter(op: Opcode) -> fn(&mut crate::codegen::asm::CodeBlock, Size, X86Opnd, X86Opnd) {
    match op {
        Opcode::LsftI32 => sal,
        Opcode::RsftI32 => sar,
        Opcode::UrsftI32 => shr,
        _ => unreachable!("not a shift opcode"),
    }
}

/// Shifts: constant counts are masked to five bits at compile time,
/// dynamic counts go through `cl`
pub(super) fn gen_shift(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    let emit = shift_emitter(instr.op);

    if let Some(IRConst::Int32(n)) = instr.arg_const(1) {
        let count = (*n as u32) & 31;
        let a = ctx
            .state
            .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 0, Size::B32, None, true, true);
        let live_after = ctx.live_after[ctx.instr_idx].clone();
        let out = ctx
            .state
            .get_out_opnd(ctx.cb, ctx.fun, instr, Size::B32, true, &live_after);
        match out {
            X86Opnd::Reg(_) => {
                if a != out {
                    mov(ctx.cb, Size::B32, out, a);
                }
                emit(ctx.cb, Size::B32, out, X86Opnd::Imm(count as i64));
            }
            _ => {
                mov(ctx.cb, Size::B32, reg(SCRATCH1), a);
                emit(ctx.cb, Size::B32, reg(SCRATCH1), X86Opnd::Imm(count as i64));
                mov(ctx.cb, Size::B32, out, reg(SCRATCH1));
            }
        }
    } else {
        // dynamic count: rcx holds it, the shiftee rides in a scratch
        ctx.state.reserve_reg(ctx.cb, ctx.fun, RCX);
        let a = ctx
            .state
            .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 0, Size::B32, None, true, true);
        mov(ctx.cb, Size::B32, reg(SCRATCH1), a);
        let count = ctx
            .state
            .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 1, Size::B32, None, true, true);
        if count != reg(RCX) {
            mov(ctx.cb, Size::B32, reg(RCX), count);
        }
        emit(ctx.cb, Size::B32, reg(SCRATCH1), reg(RCX));
        ctx.state.release_reg(RCX);
        let live_after = ctx.live_after[ctx.instr_idx].clone();
        let out = ctx
            .state
            .get_out_opnd(ctx.cb, ctx.fun, instr, Size::B32, false, &live_after);
        if out != reg(SCRATCH1) {
            mov(ctx.cb, Size::B32, out, reg(SCRATCH1));
        }
    }
    ctx.state
        .set_out_type(ctx.cb, ctx.fun, instr, OutTag::Known(TypeTag::Int32));
    Ok(())
}

