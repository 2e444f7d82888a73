//! Runtime bridge
//!
//! Emission helpers for the boundary between JIT code and the host: saving
//! and restoring the reserved registers around C calls, argument
//! marshalling with the System V alignment invariant, and the entry/exit
//! trampolines that move a thread between Rust and JIT frames.
//!
//! JIT code runs with `rsp ≡ 8 (mod 16)` between instructions; the five
//! reserved-register pushes of `save_jit_regs` realign the stack for the
//! `call`.

use crate::codegen::asm::encoder::{call_rm, jmp_rm, mov, mov_abs, pop, push, ret};
use crate::codegen::asm::regs::{
    mem, reg, Size, X86Opnd, C_ARG_REGS, RET_TYPE, RET_WORD, SCRATCH0, TSP, VM, WSP,
};
use crate::codegen::asm::CodeBlock;
use crate::runtime::context::{VM_RET_TAG_OFS, VM_RET_WORD_OFS, VM_TSP_OFS, VM_WSP_OFS};

/// Push the reserved JIT registers in the fixed order
pub fn save_jit_regs(cb: &mut CodeBlock) {
    push(cb, WSP);
    push(cb, TSP);
    push(cb, VM);
    push(cb, RET_WORD);
    push(cb, RET_TYPE);
}

/// Pop the reserved JIT registers, reversing `save_jit_regs`
pub fn load_jit_regs(cb: &mut CodeBlock) {
    pop(cb, RET_TYPE);
    pop(cb, RET_WORD);
    pop(cb, VM);
    pop(cb, TSP);
    pop(cb, WSP);
}

/// Store the live stack pointers into the VM context so host helpers see
/// the current frame (unwinding, frame building, GC scanning)
pub fn sync_stacks(cb: &mut CodeBlock) {
    mov(cb, Size::B64, mem(VM, VM_WSP_OFS), reg(WSP));
    mov(cb, Size::B64, mem(VM, VM_TSP_OFS), reg(TSP));
}

/// Reload the stack pointers from the VM context; helpers that push or pop
/// frames leave the new tops there
pub fn reload_stacks(cb: &mut CodeBlock) {
    mov(cb, Size::B64, reg(WSP), mem(VM, VM_WSP_OFS));
    mov(cb, Size::B64, reg(TSP), mem(VM, VM_TSP_OFS));
}

fn arg_source_is_safe(opnd: &X86Opnd) -> bool {
    // Argument sources must survive earlier argument moves: the VM
    // register, scratch registers, immediates, and WSP/TSP-based memory
    // are all outside the C argument set.
    match opnd {
        X86Opnd::Imm(_) => true,
        X86Opnd::Reg(r) => !C_ARG_REGS.contains(r) && *r != SCRATCH0,
        X86Opnd::Fpr(_) => false,
        X86Opnd::Mem(m) => !C_ARG_REGS.contains(&m.base),
    }
}

/// Emit a call to a host function: sync the stacks, save the reserved
/// registers, marshal up to six integer arguments, call through a scratch
/// register, restore. The caller must already have spilled every value the
/// callee may observe or outlive.
pub fn gen_host_call(cb: &mut CodeBlock, fn_ptr: usize, args: &[X86Opnd]) {
    assert!(args.len() <= C_ARG_REGS.len(), "too many host-call arguments");
    tracing::trace!(fn_ptr, pos = cb.pos(), "emitting host call");
    sync_stacks(cb);
    save_jit_regs(cb);
    for (i, arg) in args.iter().enumerate() {
        debug_assert!(arg_source_is_safe(arg), "unsafe host-call argument source");
        mov(cb, Size::B64, reg(C_ARG_REGS[i]), *arg);
    }
    mov_abs(cb, SCRATCH0, fn_ptr as u64);
    call_rm(cb, reg(SCRATCH0));
    load_jit_regs(cb);
    reload_stacks(cb);
}

/// Emit the entry trampoline: `extern "C" fn(vm: *mut VmContext,
/// target: *const u8)`. Saves the callee-save registers, loads the
/// reserved registers from the context, and jumps into JIT code. The JIT
/// side returns through the exit stub, which unwinds these pushes.
pub fn gen_entry_trampoline(cb: &mut CodeBlock) -> usize {
    let start = cb.pos();
    use crate::codegen::asm::regs::{R12, R13, R14, R15, RBP, RBX, RDI, RSI};
    push(cb, RBX);
    push(cb, RBP);
    push(cb, R12);
    push(cb, R13);
    push(cb, R14);
    push(cb, R15);
    mov(cb, Size::B64, reg(VM), reg(RDI));
    mov(cb, Size::B64, reg(WSP), mem(VM, VM_WSP_OFS));
    mov(cb, Size::B64, reg(TSP), mem(VM, VM_TSP_OFS));
    jmp_rm(cb, reg(RSI));
    start
}

/// Emit the exit stub: stores the return pair and stack pointers back into
/// the context, restores the callee-save registers, and returns to the
/// entry trampoline's caller. Its address is the root frame's return
/// target.
pub fn gen_exit_stub(cb: &mut CodeBlock) -> usize {
    let start = cb.pos();
    use crate::codegen::asm::regs::{R12, R13, R14, R15, RBP, RBX};
    mov(cb, Size::B64, mem(VM, VM_RET_WORD_OFS), reg(RET_WORD));
    mov(cb, Size::B8, mem(VM, VM_RET_TAG_OFS), reg(RET_TYPE));
    sync_stacks(cb);
    pop(cb, R15);
    pop(cb, R14);
    pop(cb, R13);
    pop(cb, R12);
    pop(cb, RBP);
    pop(cb, RBX);
    ret(cb);
    start
}

/// Exit stub for unhandled exceptions: the unwinder already left the
/// exception pair in the context, so only the stacks are synced before
/// unwinding the trampoline pushes
pub fn gen_exc_exit_stub(cb: &mut CodeBlock) -> usize {
    let start = cb.pos();
    use crate::codegen::asm::regs::{R12, R13, R14, R15, RBP, RBX};
    sync_stacks(cb);
    pop(cb, R15);
    pop(cb, R14);
    pop(cb, R13);
    pop(cb, R12);
    pop(cb, RBP);
    pop(cb, RBX);
    ret(cb);
    start
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_are_inverse() {
        let mut cb = CodeBlock::new(256).unwrap();
        save_jit_regs(&mut cb);
        let save_end = cb.pos();
        load_jit_regs(&mut cb);
        // five pushes / five pops, with REX prefixes on r12/r13/r15
        let saves = cb.bytes(0, save_end).to_vec();
        assert_eq!(saves, vec![0x53, 0x55, 0x41, 0x57, 0x41, 0x54, 0x41, 0x55]);
        let loads = cb.bytes(save_end, cb.pos()).to_vec();
        assert_eq!(loads, vec![0x41, 0x5D, 0x41, 0x5C, 0x41, 0x5F, 0x5D, 0x5B]);
    }

    #[test]
    fn test_host_call_emits_indirect_call() {
        let mut cb = CodeBlock::new(512).unwrap();
        gen_host_call(&mut cb, 0x1122_3344_5566, &[reg(VM), X86Opnd::Imm(7)]);
        let bytes = cb.bytes(0, cb.pos()).to_vec();
        // the movabs of the target address appears with its immediate
        let needle = 0x1122_3344_5566u64.to_le_bytes();
        assert!(bytes
            .windows(needle.len())
            .any(|w| w == needle));
        // and an indirect call through rax
        assert!(bytes.windows(2).any(|w| w == [0xFF, 0xD0]));
    }

    #[test]
    #[should_panic(expected = "too many host-call arguments")]
    fn test_host_call_rejects_seven_args() {
        let mut cb = CodeBlock::new(512).unwrap();
        let args = vec![X86Opnd::Imm(0); 7];
        gen_host_call(&mut cb, 0x1000, &args);
    }
}
