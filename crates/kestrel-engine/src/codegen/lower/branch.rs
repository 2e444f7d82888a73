//! Type tests, comparisons, and control flow
//!
//! Type tests follow the four-step collapse: the BBV state first, then the
//! static type-propagation pass, then constant folding (with a direct jump
//! when an `if_true` immediately consumes the result), and only then a real
//! `cmp` against the tag byte. The true edge of a fused test carries the
//! refined state; this is the sole source of type specialization.

use crate::codegen::asm::encoder::{cmov, cmp, mov, ucomisd};
use crate::codegen::asm::regs::{reg, Cc, Size, X86Opnd, SCRATCH1, SCRATCH2, XMM0, XMM1};
use crate::codegen::state::{const_word, OutTag, ValLoc};
use crate::codegen::CodegenError;
use crate::ir::instr::{IRArg, IRInstr, Opcode};
use crate::ir::types::TypeTag;
use crate::runtime::value::{FALSE_WORD, TRUE_WORD};

use super::float::load_f64_arg;
use super::LowerCtx;

/// The immediately-following `if_true` consuming this instruction's
/// output, when the two can fuse. Fusion elides the boolean entirely, so
/// the branch must be its only use: a result live into either successor
/// keeps the materializing path.
fn fused_if_true(ctx: &LowerCtx<'_>, instr: &IRInstr) -> Option<IRInstr> {
    let out = instr.out?;
    let next = ctx.peek_next()?;
    if next.op != Opcode::IfTrue || next.arg_val(0) != Some(out) {
        return None;
    }
    for target in next.targets.iter().flatten() {
        if ctx.live.live_in(*target).contains(&out) {
            return None;
        }
    }
    Some(next.clone())
}

/// Write a flag-derived boolean into the output via `cmov`.
/// The comparison setting the flags must immediately precede.
fn materialize_bool(ctx: &mut LowerCtx<'_>, instr: &IRInstr, cc: Cc) {
    let live_after = ctx.live_after[ctx.instr_idx].clone();
    let out = ctx
        .state
        .get_out_opnd(ctx.cb, ctx.fun, instr, Size::B64, false, &live_after);
    let r = match out {
        X86Opnd::Reg(r) => r,
        _ => SCRATCH1,
    };
    mov(ctx.cb, Size::B32, reg(r), X86Opnd::Imm(FALSE_WORD as i64));
    mov(ctx.cb, Size::B32, reg(SCRATCH2), X86Opnd::Imm(TRUE_WORD as i64));
    cmov(ctx.cb, cc, Size::B32, r, reg(SCRATCH2));
    if !matches!(out, X86Opnd::Reg(_)) {
        mov(ctx.cb, Size::B64, out, reg(r));
    }
    ctx.state
        .set_out_type(ctx.cb, ctx.fun, instr, OutTag::Known(TypeTag::Const));
}

/// `is_*` type tests
pub(super) fn gen_type_test(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    let tested = instr.op.tested_tag().expect("type test has a tested tag");
    let known = match &instr.args[0] {
        IRArg::Const(c) => c.tag(),
        IRArg::Val(v) => ctx.known_type(*v),
    };
    let fused = fused_if_true(ctx, instr);

    if let Some(actual) = known {
        let result = actual == tested;
        match fused {
            Some(next) => {
                // collapse to a single unconditional jump
                let t_block = ctx.target(&next, 0)?;
                let f_block = ctx.target(&next, 1)?;
                let mut state = ctx.state.clone();
                if result {
                    if let Some(v) = instr.arg_val(0) {
                        state.set_type(v, tested);
                    }
                    ctx.gen_jump(t_block, state);
                } else {
                    ctx.gen_jump(f_block, state);
                }
            }
            None => {
                let out = instr.out.expect("type test has an output");
                let word = if result { TRUE_WORD } else { FALSE_WORD };
                ctx.state.set_imm(out, word, TypeTag::Const);
            }
        }
        return Ok(());
    }

    let type_opnd = ctx
        .state
        .get_type_opnd(ctx.cb, ctx.fun, instr, 0, None, true);
    cmp(ctx.cb, Size::B8, type_opnd, X86Opnd::Imm(tested as i64));

    match fused {
        Some(next) => {
            let t_block = ctx.target(&next, 0)?;
            let f_block = ctx.target(&next, 1)?;
            let mut state_t = ctx.state.clone();
            if let Some(v) = instr.arg_val(0) {
                state_t.set_type(v, tested);
            }
            let state_f = ctx.state.clone();
            ctx.gen_branch(Cc::E, t_block, f_block, state_t, state_f);
        }
        None => materialize_bool(ctx, instr, Cc::E),
    }
    Ok(())
}

fn int_cmp_cc(op: Opcode) -> (Cc, Size) {
    match op {
        Opcode::EqI8 => (Cc::E, Size::B8),
        Opcode::EqI32 => (Cc::E, Size::B32),
        Opcode::NeI32 => (Cc::Ne, Size::B32),
        Opcode::LtI32 => (Cc::L, Size::B32),
        Opcode::LeI32 => (Cc::Le, Size::B32),
        Opcode::GtI32 => (Cc::G, Size::B32),
        Opcode::GeI32 => (Cc::Ge, Size::B32),
        Opcode::EqI64 | Opcode::EqConst => (Cc::E, Size::B64),
        _ => unreachable!("not an integer comparison"),
    }
}

/// Integer comparisons at 8/32/64-bit widths
pub(super) fn gen_int_cmp(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    let (cc, sz) = int_cmp_cc(instr.op);
    let a = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 0, sz, None, false, true);
    let b_allow_mem = !matches!(a, X86Opnd::Mem(_));
    let b = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 1, sz, None, true, b_allow_mem);
    cmp(ctx.cb, sz, a, b);

    match fused_if_true(ctx, instr) {
        Some(next) => {
            let t_block = ctx.target(&next, 0)?;
            let f_block = ctx.target(&next, 1)?;
            let state_t = ctx.state.clone();
            let state_f = ctx.state.clone();
            ctx.gen_branch(cc, t_block, f_block, state_t, state_f);
        }
        None => materialize_bool(ctx, instr, cc),
    }
    Ok(())
}

/// Float comparisons with IEEE unordered semantics. The relational forms
/// order their operands so one condition code suffices (unordered compares
/// set CF and fall out of the `ja`/`jae` window); equality needs the
/// parity flag and always materializes.
pub(super) fn gen_fp_cmp(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    match instr.op {
        Opcode::EqF64 | Opcode::NeF64 => {
            load_f64_arg(ctx, instr, 0, XMM0);
            load_f64_arg(ctx, instr, 1, XMM1);
            ucomisd(ctx.cb, XMM0, X86Opnd::Fpr(XMM1));

            let live_after = ctx.live_after[ctx.instr_idx].clone();
            let out = ctx
                .state
                .get_out_opnd(ctx.cb, ctx.fun, instr, Size::B64, false, &live_after);
            let r = match out {
                X86Opnd::Reg(r) => r,
                _ => SCRATCH1,
            };
            mov(ctx.cb, Size::B32, reg(r), X86Opnd::Imm(FALSE_WORD as i64));
            mov(ctx.cb, Size::B32, reg(SCRATCH2), X86Opnd::Imm(TRUE_WORD as i64));
            if instr.op == Opcode::EqF64 {
                // ZF=1 ∧ PF=0
                cmov(ctx.cb, Cc::E, Size::B32, r, reg(SCRATCH2));
                mov(ctx.cb, Size::B32, reg(SCRATCH2), X86Opnd::Imm(FALSE_WORD as i64));
                cmov(ctx.cb, Cc::P, Size::B32, r, reg(SCRATCH2));
            } else {
                // ¬(ZF=1 ∧ PF=0): not-equal or unordered
                cmov(ctx.cb, Cc::Ne, Size::B32, r, reg(SCRATCH2));
                cmov(ctx.cb, Cc::P, Size::B32, r, reg(SCRATCH2));
            }
            if !matches!(out, X86Opnd::Reg(_)) {
                mov(ctx.cb, Size::B64, out, reg(r));
            }
            ctx.state
                .set_out_type(ctx.cb, ctx.fun, instr, OutTag::Known(TypeTag::Const));
            Ok(())
        }
        _ => {
            // lt/le reverse the operands; a strict compare answers with CF=0
            let (first, second, cc) = match instr.op {
                Opcode::LtF64 => (1, 0, Cc::A),
                Opcode::LeF64 => (1, 0, Cc::Ae),
                Opcode::GtF64 => (0, 1, Cc::A),
                Opcode::GeF64 => (0, 1, Cc::Ae),
                _ => unreachable!("not a float comparison"),
            };
            load_f64_arg(ctx, instr, first, XMM0);
            load_f64_arg(ctx, instr, second, XMM1);
            ucomisd(ctx.cb, XMM0, X86Opnd::Fpr(XMM1));

            match fused_if_true(ctx, instr) {
                Some(next) => {
                    let t_block = ctx.target(&next, 0)?;
                    let f_block = ctx.target(&next, 1)?;
                    let state_t = ctx.state.clone();
                    let state_f = ctx.state.clone();
                    ctx.gen_branch(cc, t_block, f_block, state_t, state_f);
                }
                None => materialize_bool(ctx, instr, cc),
            }
            Ok(())
        }
    }
}

/// `jump`
pub(super) fn gen_jump_op(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    let target = ctx.target(instr, 0)?;
    let state = ctx.state.clone();
    ctx.gen_jump(target, state);
    Ok(())
}

/// `if_true`: conditional branch on the true constant
pub(super) fn gen_if_true(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    let t_block = ctx.target(instr, 0)?;
    let f_block = ctx.target(instr, 1)?;

    // constant conditions collapse to a jump
    let const_cond = match &instr.args[0] {
        IRArg::Const(c) => Some(const_word(ctx.vm, c).0),
        IRArg::Val(v) => match ctx.state.loc_of(*v) {
            Some(ValLoc::Imm(word, _)) => Some(word),
            _ => None,
        },
    };
    if let Some(word) = const_cond {
        let target = if word == TRUE_WORD { t_block } else { f_block };
        let state = ctx.state.clone();
        ctx.gen_jump(target, state);
        return Ok(());
    }

    let cond = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 0, Size::B8, None, false, true);
    cmp(ctx.cb, Size::B8, cond, X86Opnd::Imm(TRUE_WORD as i64));
    let state_t = ctx.state.clone();
    let state_f = ctx.state.clone();
    ctx.gen_branch(Cc::E, t_block, f_block, state_t, state_f);
    Ok(())
}
