//! Float arithmetic, conversions, and host-routed math

use crate::codegen::asm::encoder::{
    addsd, cvtsi2sd, cvttsd2si, divsd, mov, movq_from_xmm, movq_to_xmm, movsd_load,
    movsd_store, mulsd, subsd,
};
use crate::codegen::asm::regs::{reg, Size, X86Opnd, SCRATCH1, XMM0, XMM1};
use crate::codegen::bridge::gen_host_call;
use crate::codegen::state::OutTag;
use crate::codegen::CodegenError;
use crate::ir::instr::{IRInstr, Opcode};
use crate::ir::types::TypeTag;

use super::LowerCtx;

/// Load the word of argument `idx` into an SSE register
pub(super) fn load_f64_arg(ctx: &mut LowerCtx<'_>, instr: &IRInstr, idx: usize, xmm: crate::codegen::asm::regs::Xmm) {
    let opnd = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, idx, Size::B64, None, false, true);
    match opnd {
        X86Opnd::Reg(r) => movq_to_xmm(ctx.cb, xmm, r),
        X86Opnd::Mem(_) => movsd_load(ctx.cb, xmm, opnd),
        _ => unreachable!("float operand must be a register or memory"),
    }
}

/// Store xmm0 into the instruction's output and tag it `float64`
fn store_f64_out(ctx: &mut LowerCtx<'_>, instr: &IRInstr) {
    let live_after = ctx.live_after[ctx.instr_idx].clone();
    let out = ctx
        .state
        .get_out_opnd(ctx.cb, ctx.fun, instr, Size::B64, false, &live_after);
    match out {
        X86Opnd::Reg(r) => movq_from_xmm(ctx.cb, r, XMM0),
        X86Opnd::Mem(_) => movsd_store(ctx.cb, out, XMM0),
        _ => unreachable!("output must be a register or memory"),
    }
    ctx.state
        .set_out_type(ctx.cb, ctx.fun, instr, OutTag::Known(TypeTag::Float64));
}

/// `add_f64` / `sub_f64` / `mul_f64` / `div_f64` through xmm0/xmm1
pub(super) fn gen_fp_arith(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    load_f64_arg(ctx, instr, 0, XMM0);
    load_f64_arg(ctx, instr, 1, XMM1);
    let b = X86Opnd::Fpr(XMM1);
    match instr.op {
        Opcode::AddF64 => addsd(ctx.cb, XMM0, b),
        Opcode::SubF64 => subsd(ctx.cb, XMM0, b),
        Opcode::MulF64 => mulsd(ctx.cb, XMM0, b),
        Opcode::DivF64 => divsd(ctx.cb, XMM0, b),
        _ => unreachable!("not a float ALU opcode"),
    }
    store_f64_out(ctx, instr);
    Ok(())
}

fn host_math1(ctx: &LowerCtx<'_>, op: Opcode) -> usize {
    let t = &ctx.vm.host_fns;
    (match op {
        Opcode::SinF64 => t.sin,
        Opcode::CosF64 => t.cos,
        Opcode::SqrtF64 => t.sqrt,
        Opcode::CeilF64 => t.ceil,
        Opcode::FloorF64 => t.floor,
        Opcode::LogF64 => t.log,
        Opcode::ExpF64 => t.exp,
        _ => unreachable!("not a unary math opcode"),
    }) as usize
}

/// Unary math routed through a host function; the argument travels in xmm0
pub(super) fn gen_fp_host1(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    let fn_ptr = host_math1(ctx, instr.op);
    ctx.spill_for_call(instr);
    load_f64_arg(ctx, instr, 0, XMM0);
    gen_host_call(ctx.cb, fn_ptr, &[]);
    ctx.stats.host_calls += 1;
    store_f64_out(ctx, instr);
    Ok(())
}

/// Binary math (`pow_f64`, `mod_f64`) through a host function
pub(super) fn gen_fp_host2(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    let fn_ptr = (match instr.op {
        Opcode::PowF64 => ctx.vm.host_fns.pow,
        Opcode::ModF64 => ctx.vm.host_fns.fmod,
        _ => unreachable!("not a binary math opcode"),
    }) as usize;
    ctx.spill_for_call(instr);
    load_f64_arg(ctx, instr, 0, XMM0);
    load_f64_arg(ctx, instr, 1, XMM1);
    gen_host_call(ctx.cb, fn_ptr, &[]);
    ctx.stats.host_calls += 1;
    store_f64_out(ctx, instr);
    Ok(())
}

/// `i32_to_f64`
pub(super) fn gen_i32_to_f64(
    ctx: &mut LowerCtx<'_>,
    instr: &IRInstr,
) -> Result<(), CodegenError> {
    let src = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 0, Size::B32, None, false, true);
    cvtsi2sd(ctx.cb, XMM0, Size::B32, src);
    store_f64_out(ctx, instr);
    Ok(())
}

/// `f64_to_i32`, truncating
pub(super) fn gen_f64_to_i32(
    ctx: &mut LowerCtx<'_>,
    instr: &IRInstr,
) -> Result<(), CodegenError> {
    load_f64_arg(ctx, instr, 0, XMM0);
    let live_after = ctx.live_after[ctx.instr_idx].clone();
    let out = ctx
        .state
        .get_out_opnd(ctx.cb, ctx.fun, instr, Size::B32, false, &live_after);
    match out {
        X86Opnd::Reg(r) => cvttsd2si(ctx.cb, Size::B32, r, X86Opnd::Fpr(XMM0)),
        _ => {
            cvttsd2si(ctx.cb, Size::B32, SCRATCH1, X86Opnd::Fpr(XMM0));
            mov(ctx.cb, Size::B32, out, reg(SCRATCH1));
        }
    }
    ctx.state
        .set_out_type(ctx.cb, ctx.fun, instr, OutTag::Known(TypeTag::Int32));
    Ok(())
}

/// `get_time_ms`: host clock read, result in xmm0
pub(super) fn gen_get_time_ms(
    ctx: &mut LowerCtx<'_>,
    instr: &IRInstr,
) -> Result<(), CodegenError> {
    let fn_ptr = ctx.vm.host_fns.get_time_ms as usize;
    ctx.spill_for_call(instr);
    gen_host_call(ctx.cb, fn_ptr, &[]);
    ctx.stats.host_calls += 1;
    store_f64_out(ctx, instr);
    Ok(())
}
