//! FFI: library loading ops and `call_ffi` marshalling
//!
//! `call_ffi` places integer arguments in the C integer registers, float
//! arguments in the SSE registers, and overflow on the machine stack in
//! reverse order, padding when the stack-argument count is odd so the
//! 16-byte call alignment holds.

use crate::codegen::asm::encoder::{
    add, call_rm, jcc_label, mov, mov_abs, movq_from_xmm, movq_to_xmm, movsd_load, movsx,
    movzx, push, test,
};
use crate::codegen::asm::regs::{
    reg, Cc, Size, X86Opnd, Xmm, C_ARG_REGS, C_FP_ARG_COUNT, RAX, RSP, SCRATCH1, VM, XMM0,
};
use crate::codegen::bridge::{load_jit_regs, save_jit_regs};
use crate::codegen::state::OutTag;
use crate::codegen::CodegenError;
use crate::ir::instr::{IRInstr, Opcode};
use crate::ir::types::TypeTag;
use crate::runtime::ffi::{FfiSig, FfiType};
use crate::runtime::value::UNDEF_WORD;

use super::call::gen_throw_thunk;
use super::LowerCtx;

/// `load_lib` / `close_lib` / `get_sym`: host call with an inline failure
/// check that raises through the unwinder
pub(super) fn gen_lib_op(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    ctx.spill_for_call(instr);

    let t = &ctx.vm.host_fns;
    let (fn_ptr, fail_msg): (usize, &str) = match instr.op {
        Opcode::LoadLib => (t.load_lib as usize, "RuntimeError: cannot load library"),
        Opcode::CloseLib => (t.close_lib as usize, "RuntimeError: cannot close library"),
        Opcode::GetSym => (t.get_sym as usize, "RuntimeError: symbol not found"),
        _ => unreachable!("not a library opcode"),
    };

    let mut args: Vec<X86Opnd> = vec![reg(VM)];
    for i in 0..instr.args.len() {
        let w = ctx
            .state
            .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, i, Size::B64, None, true, true);
        args.push(w);
    }
    crate::codegen::bridge::gen_host_call(ctx.cb, fn_ptr, &args);
    ctx.stats.host_calls += 1;

    // load_lib/get_sym fail with a null result; close_lib with nonzero
    test(ctx.cb, Size::B64, reg(RAX), reg(RAX));
    let l_ok = ctx.cb.new_label();
    let ok_cc = if instr.op == Opcode::CloseLib { Cc::E } else { Cc::Ne };
    jcc_label(ctx.cb, ok_cc, l_ok);
    gen_throw_thunk(ctx, fail_msg);
    ctx.cb.bind_label(l_ok);

    if instr.op == Opcode::CloseLib {
        if let Some(out) = instr.out {
            ctx.state.set_imm(out, UNDEF_WORD, TypeTag::Const);
        }
    } else {
        let live_after = ctx.live_after[ctx.instr_idx].clone();
        let out = ctx
            .state
            .get_out_opnd(ctx.cb, ctx.fun, instr, Size::B64, false, &live_after);
        mov(ctx.cb, Size::B64, out, reg(RAX));
        ctx.state
            .set_out_type(ctx.cb, ctx.fun, instr, OutTag::Known(TypeTag::RawPtr));
    }
    Ok(())
}

/// Where one FFI argument travels
enum ArgSlot {
    IntReg(usize),
    FpReg(u8),
    Stack,
}

fn classify(sig: &FfiSig) -> (Vec<ArgSlot>, usize) {
    let mut int_used = 0;
    let mut fp_used = 0;
    let mut stack = 0;
    let slots = sig
        .args
        .iter()
        .map(|ty| {
            if ty.is_float() {
                if fp_used < C_FP_ARG_COUNT {
                    fp_used += 1;
                    ArgSlot::FpReg((fp_used - 1) as u8)
                } else {
                    stack += 1;
                    ArgSlot::Stack
                }
            } else if int_used < C_ARG_REGS.len() {
                int_used += 1;
                ArgSlot::IntReg(int_used - 1)
            } else {
                stack += 1;
                ArgSlot::Stack
            }
        })
        .collect();
    (slots, stack)
}

/// `call_ffi(sig, fp, args…)`
pub(super) fn gen_call_ffi(ctx: &mut LowerCtx<'_>, instr: &IRInstr) -> Result<(), CodegenError> {
    let sig_str = instr
        .arg_str(0)
        .ok_or_else(|| CodegenError::BadFfiSig("<missing signature>".to_string()))?
        .to_string();
    let sig: FfiSig = sig_str
        .parse()
        .map_err(|_| CodegenError::BadFfiSig(sig_str.clone()))?;
    if instr.args.len() - 2 != sig.args.len() {
        return Err(CodegenError::BadFfiSig(sig_str));
    }

    ctx.spill_for_call(instr);

    // fetch operands after the spill: homes and immediates only
    let fp = ctx
        .state
        .get_word_opnd(ctx.cb, ctx.vm, ctx.fun, instr, 1, Size::B64, None, true, true);
    let mut arg_opnds = Vec::with_capacity(sig.args.len());
    for i in 0..sig.args.len() {
        let w = ctx.state.get_word_opnd(
            ctx.cb, ctx.vm, ctx.fun, instr, 2 + i, Size::B64, None, true, true,
        );
        arg_opnds.push(w);
    }

    let (slots, n_stack) = classify(&sig);
    let pad = n_stack % 2;

    save_jit_regs(ctx.cb);
    if pad == 1 {
        push(ctx.cb, RAX);
    }
    // stack arguments, last first
    for (opnd, slot) in arg_opnds.iter().zip(slots.iter()).rev() {
        if let ArgSlot::Stack = slot {
            match opnd {
                X86Opnd::Imm(v) if i32::try_from(*v).is_err() => {
                    mov_abs(ctx.cb, RAX, *v as u64);
                }
                _ => mov(ctx.cb, Size::B64, reg(RAX), *opnd),
            }
            push(ctx.cb, RAX);
        }
    }
    // register arguments
    for (opnd, slot) in arg_opnds.iter().zip(slots.iter()) {
        match slot {
            ArgSlot::IntReg(i) => mov(ctx.cb, Size::B64, reg(C_ARG_REGS[*i]), *opnd),
            ArgSlot::FpReg(j) => match opnd {
                X86Opnd::Mem(_) => movsd_load(ctx.cb, Xmm(*j), *opnd),
                X86Opnd::Imm(v) => {
                    mov_abs(ctx.cb, RAX, *v as u64);
                    movq_to_xmm(ctx.cb, Xmm(*j), RAX);
                }
                X86Opnd::Reg(r) => movq_to_xmm(ctx.cb, Xmm(*j), *r),
                _ => unreachable!("bad float argument operand"),
            },
            ArgSlot::Stack => {}
        }
    }

    mov(ctx.cb, Size::B64, reg(SCRATCH1), fp);
    call_rm(ctx.cb, reg(SCRATCH1));

    if n_stack + pad > 0 {
        add(
            ctx.cb,
            Size::B64,
            reg(RSP),
            X86Opnd::Imm(8 * (n_stack + pad) as i64),
        );
    }
    load_jit_regs(ctx.cb);
    ctx.stats.host_calls += 1;

    // result: integer/pointer in rax, float in xmm0, void is undefined
    let ret_tag = sig.ret.return_tag();
    let live_after = ctx.live_after[ctx.instr_idx].clone();
    match sig.ret {
        FfiType::Void => {
            if let Some(out) = instr.out {
                ctx.state.set_imm(out, UNDEF_WORD, TypeTag::Const);
            }
            return Ok(());
        }
        FfiType::F64 => {
            let out = ctx
                .state
                .get_out_opnd(ctx.cb, ctx.fun, instr, Size::B64, false, &live_after);
            match out {
                X86Opnd::Reg(r) => movq_from_xmm(ctx.cb, r, XMM0),
                _ => {
                    movq_from_xmm(ctx.cb, SCRATCH1, XMM0);
                    mov(ctx.cb, Size::B64, out, reg(SCRATCH1));
                }
            }
        }
        _ => {
            // normalize sub-word returns: only the low bits are defined
            match sig.ret {
                FfiType::I8 => movsx(ctx.cb, Size::B32, RAX, Size::B8, reg(RAX)),
                FfiType::U8 => movzx(ctx.cb, Size::B32, RAX, Size::B8, reg(RAX)),
                FfiType::I16 => movsx(ctx.cb, Size::B32, RAX, Size::B16, reg(RAX)),
                FfiType::U16 => movzx(ctx.cb, Size::B32, RAX, Size::B16, reg(RAX)),
                _ => {}
            }
            let out = ctx
                .state
                .get_out_opnd(ctx.cb, ctx.fun, instr, Size::B64, false, &live_after);
            mov(ctx.cb, Size::B64, out, reg(RAX));
        }
    }
    ctx.state
        .set_out_type(ctx.cb, ctx.fun, instr, OutTag::Known(ret_tag));
    Ok(())
}
