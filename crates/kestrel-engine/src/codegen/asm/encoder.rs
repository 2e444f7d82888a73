//! Mnemonic-level x86-64 emitters
//!
//! Free functions over `CodeBlock`, one per mnemonic, covering the subset
//! the JIT emits: integer ALU, shifts, compares, conditional moves and
//! jumps, `idiv`, scalar SSE, loads/stores with extension, `lea`,
//! `call`/`ret`, `push`/`pop`. Operands are `X86Opnd` descriptors;
//! sized operations take an explicit `Size`.

use super::regs::{Cc, Gpr, Mem, Size, X86Opnd, Xmm};
use super::{CodeBlock, Label};

// --- encoding core ---

fn rm_rex_xb(rm: &X86Opnd) -> (u8, u8) {
    match rm {
        X86Opnd::Reg(r) => (0, r.0 >> 3),
        X86Opnd::Fpr(x) => (0, x.0 >> 3),
        X86Opnd::Mem(m) => {
            let x = match m.index {
                Some((idx, _)) => idx.0 >> 3,
                None => 0,
            };
            (x, m.base.0 >> 3)
        }
        X86Opnd::Imm(_) => (0, 0),
    }
}

// An 8-bit operand naming spl/bpl/sil/dil needs a REX prefix even with no
// extension bits set, otherwise the encoding means ah/ch/dh/bh.
fn byte_reg_needs_rex(opnd: &X86Opnd) -> bool {
    matches!(opnd, X86Opnd::Reg(r) if r.0 >= 4 && r.0 <= 7)
}

/// Emit prefixes + opcode + ModRM/SIB/disp for one reg, rm pair.
/// `reg` is the full register number (or opcode extension 0..7).
fn emit_rm(
    cb: &mut CodeBlock,
    mandatory: Option<u8>,
    op16: bool,
    rex_w: bool,
    force_rex: bool,
    opcode: &[u8],
    reg: u8,
    rm: &X86Opnd,
) {
    if let Some(p) = mandatory {
        cb.write_byte(p);
    }
    if op16 {
        cb.write_byte(0x66);
    }

    let (x, b) = rm_rex_xb(rm);
    let r = reg >> 3;
    let rex = 0x40 | ((rex_w as u8) << 3) | (r << 2) | (x << 1) | b;
    if rex != 0x40 || force_rex {
        cb.write_byte(rex);
    }

    cb.write_bytes(opcode);
    write_modrm(cb, reg & 7, rm);
}

fn write_modrm(cb: &mut CodeBlock, reg_low: u8, rm: &X86Opnd) {
    match rm {
        X86Opnd::Reg(r) => {
            cb.write_byte(0b1100_0000 | (reg_low << 3) | (r.0 & 7));
        }
        X86Opnd::Fpr(x) => {
            cb.write_byte(0b1100_0000 | (reg_low << 3) | (x.0 & 7));
        }
        X86Opnd::Mem(m) => write_mem(cb, reg_low, m),
        X86Opnd::Imm(_) => panic!("immediate cannot be a ModRM r/m operand"),
    }
}

fn write_mem(cb: &mut CodeBlock, reg_low: u8, m: &Mem) {
    let base_low = m.base.0 & 7;
    // rsp/r12 as base force a SIB byte
    let need_sib = m.index.is_some() || base_low == 4;

    // rbp/r13 with mod=00 would mean rip/disp32, so force disp8
    let (modv, disp): (u8, Option<Size>) = if m.disp == 0 && base_low != 5 {
        (0b00, None)
    } else if i8::try_from(m.disp).is_ok() {
        (0b01, Some(Size::B8))
    } else {
        (0b10, Some(Size::B32))
    };

    if need_sib {
        cb.write_byte((modv << 6) | (reg_low << 3) | 0b100);
        let (idx_low, scale_bits) = match m.index {
            Some((idx, scale)) => {
                assert!(idx.0 & 7 != 4 || idx.0 == 12, "rsp cannot be an index");
                let bits = match scale {
                    1 => 0,
                    2 => 1,
                    4 => 2,
                    8 => 3,
                    _ => panic!("bad scale {}", scale),
                };
                (idx.0 & 7, bits)
            }
            None => (0b100, 0),
        };
        cb.write_byte((scale_bits << 6) | (idx_low << 3) | base_low);
    } else {
        cb.write_byte((modv << 6) | (reg_low << 3) | base_low);
    }

    match disp {
        Some(Size::B8) => cb.write_byte(m.disp as i8 as u8),
        Some(Size::B32) => cb.write_i32(m.disp),
        _ => {}
    }
}

// --- mov family ---

/// `mov dst, src` at `sz`
pub fn mov(cb: &mut CodeBlock, sz: Size, dst: X86Opnd, src: X86Opnd) {
    let w = sz == Size::B64;
    let op16 = sz == Size::B16;
    match (&dst, &src) {
        (X86Opnd::Reg(d), _src_rm @ (X86Opnd::Reg(_) | X86Opnd::Mem(_))) => {
            let force = sz == Size::B8 && (byte_reg_needs_rex(&dst) || byte_reg_needs_rex(&src));
            let opcode: &[u8] = if sz == Size::B8 { &[0x8A] } else { &[0x8B] };
            emit_rm(cb, None, op16, w, force, opcode, d.0, &src);
        }
        (X86Opnd::Mem(_), X86Opnd::Reg(s)) => {
            let force = sz == Size::B8 && byte_reg_needs_rex(&src);
            let opcode: &[u8] = if sz == Size::B8 { &[0x88] } else { &[0x89] };
            emit_rm(cb, None, op16, w, force, opcode, s.0, &dst);
        }
        (X86Opnd::Reg(d), X86Opnd::Imm(val)) => match sz {
            Size::B64 => {
                if i32::try_from(*val).is_ok() {
                    emit_rm(cb, None, false, true, false, &[0xC7], 0, &dst);
                    cb.write_i32(*val as i32);
                } else {
                    mov_abs(cb, *d, *val as u64);
                }
            }
            Size::B32 => {
                if d.0 >= 8 {
                    cb.write_byte(0x41);
                }
                cb.write_byte(0xB8 | (d.0 & 7));
                cb.write_u32(*val as u32);
            }
            Size::B16 => {
                cb.write_byte(0x66);
                if d.0 >= 8 {
                    cb.write_byte(0x41);
                }
                cb.write_byte(0xB8 | (d.0 & 7));
                cb.write_bytes(&(*val as u16).to_le_bytes());
            }
            Size::B8 => {
                if d.0 >= 8 {
                    cb.write_byte(0x41);
                } else if byte_reg_needs_rex(&dst) {
                    cb.write_byte(0x40);
                }
                cb.write_byte(0xB0 | (d.0 & 7));
                cb.write_byte(*val as u8);
            }
        },
        (X86Opnd::Mem(_), X86Opnd::Imm(val)) => {
            let opcode: &[u8] = if sz == Size::B8 { &[0xC6] } else { &[0xC7] };
            emit_rm(cb, None, op16, w, false, opcode, 0, &dst);
            match sz {
                Size::B8 => cb.write_byte(*val as u8),
                Size::B16 => cb.write_bytes(&(*val as u16).to_le_bytes()),
                _ => {
                    cb.write_i32(
                        i32::try_from(*val).expect("64-bit store immediate must fit in i32"),
                    );
                }
            }
        }
        _ => panic!("unsupported mov form: {:?} <- {:?}", dst, src),
    }
}

/// `movabs dst, imm64`; returns the buffer position of the 8-byte
/// immediate so absolute references can be patched later
pub fn mov_abs(cb: &mut CodeBlock, dst: Gpr, val: u64) -> usize {
    cb.write_byte(0x48 | (dst.0 >> 3));
    cb.write_byte(0xB8 | (dst.0 & 7));
    let field = cb.pos();
    cb.write_u64(val);
    field
}

/// Zero-extending load: `movzx dst, src` from `src_sz` to `dst_sz`
pub fn movzx(cb: &mut CodeBlock, dst_sz: Size, dst: Gpr, src_sz: Size, src: X86Opnd) {
    let w = dst_sz == Size::B64;
    match src_sz {
        Size::B8 => {
            let force = byte_reg_needs_rex(&src);
            emit_rm(cb, None, false, w, force, &[0x0F, 0xB6], dst.0, &src);
        }
        Size::B16 => emit_rm(cb, None, false, w, false, &[0x0F, 0xB7], dst.0, &src),
        // 32-bit operations zero the upper half
        Size::B32 => mov(cb, Size::B32, X86Opnd::Reg(dst), src),
        Size::B64 => mov(cb, Size::B64, X86Opnd::Reg(dst), src),
    }
}

/// Sign-extending load: `movsx`/`movsxd`
pub fn movsx(cb: &mut CodeBlock, dst_sz: Size, dst: Gpr, src_sz: Size, src: X86Opnd) {
    let w = dst_sz == Size::B64;
    match src_sz {
        Size::B8 => {
            let force = byte_reg_needs_rex(&src);
            emit_rm(cb, None, false, w, force, &[0x0F, 0xBE], dst.0, &src);
        }
        Size::B16 => emit_rm(cb, None, false, w, false, &[0x0F, 0xBF], dst.0, &src),
        Size::B32 => {
            assert!(w, "movsxd needs a 64-bit destination");
            emit_rm(cb, None, false, true, false, &[0x63], dst.0, &src);
        }
        Size::B64 => mov(cb, Size::B64, X86Opnd::Reg(dst), src),
    }
}

/// `lea dst, [mem]`
pub fn lea(cb: &mut CodeBlock, dst: Gpr, src: X86Opnd) {
    assert!(matches!(src, X86Opnd::Mem(_)), "lea needs a memory operand");
    emit_rm(cb, None, false, true, false, &[0x8D], dst.0, &src);
}

// --- ALU group ---

#[derive(Clone, Copy)]
struct AluOp {
    mr: u8,
    rm: u8,
    ext: u8,
}

const ALU_ADD: AluOp = AluOp { mr: 0x01, rm: 0x03, ext: 0 };
const ALU_OR: AluOp = AluOp { mr: 0x09, rm: 0x0B, ext: 1 };
const ALU_AND: AluOp = AluOp { mr: 0x21, rm: 0x23, ext: 4 };
const ALU_SUB: AluOp = AluOp { mr: 0x29, rm: 0x2B, ext: 5 };
const ALU_XOR: AluOp = AluOp { mr: 0x31, rm: 0x33, ext: 6 };
const ALU_CMP: AluOp = AluOp { mr: 0x39, rm: 0x3B, ext: 7 };

fn alu(cb: &mut CodeBlock, sz: Size, op: AluOp, dst: X86Opnd, src: X86Opnd) {
    let w = sz == Size::B64;
    let op16 = sz == Size::B16;
    let is8 = sz == Size::B8;
    match (&dst, &src) {
        (X86Opnd::Reg(d), X86Opnd::Reg(_) | X86Opnd::Mem(_)) => {
            let force = is8 && (byte_reg_needs_rex(&dst) || byte_reg_needs_rex(&src));
            let opcode = if is8 { op.rm - 1 } else { op.rm };
            emit_rm(cb, None, op16, w, force, &[opcode], d.0, &src);
        }
        (X86Opnd::Mem(_), X86Opnd::Reg(s)) => {
            let force = is8 && byte_reg_needs_rex(&src);
            let opcode = if is8 { op.mr - 1 } else { op.mr };
            emit_rm(cb, None, op16, w, force, &[opcode], s.0, &dst);
        }
        (X86Opnd::Reg(_) | X86Opnd::Mem(_), X86Opnd::Imm(val)) => {
            let force = is8 && byte_reg_needs_rex(&dst);
            if is8 {
                emit_rm(cb, None, false, false, force, &[0x80], op.ext, &dst);
                cb.write_byte(*val as u8);
            } else if i8::try_from(*val).is_ok() {
                emit_rm(cb, None, op16, w, false, &[0x83], op.ext, &dst);
                cb.write_byte(*val as u8);
            } else {
                emit_rm(cb, None, op16, w, false, &[0x81], op.ext, &dst);
                match sz {
                    Size::B16 => cb.write_bytes(&(*val as u16).to_le_bytes()),
                    _ => cb.write_i32(
                        i32::try_from(*val).expect("ALU immediate must fit in i32"),
                    ),
                }
            }
        }
        _ => panic!("unsupported ALU form: {:?}, {:?}", dst, src),
    }
}

/// `add dst, src`
pub fn add(cb: &mut CodeBlock, sz: Size, dst: X86Opnd, src: X86Opnd) {
    alu(cb, sz, ALU_ADD, dst, src);
}

/// `sub dst, src`
pub fn sub(cb: &mut CodeBlock, sz: Size, dst: X86Opnd, src: X86Opnd) {
    alu(cb, sz, ALU_SUB, dst, src);
}

/// `and dst, src`
pub fn and(cb: &mut CodeBlock, sz: Size, dst: X86Opnd, src: X86Opnd) {
    alu(cb, sz, ALU_AND, dst, src);
}

/// `or dst, src`
pub fn or(cb: &mut CodeBlock, sz: Size, dst: X86Opnd, src: X86Opnd) {
    alu(cb, sz, ALU_OR, dst, src);
}

/// `xor dst, src`
pub fn xor(cb: &mut CodeBlock, sz: Size, dst: X86Opnd, src: X86Opnd) {
    alu(cb, sz, ALU_XOR, dst, src);
}

/// `cmp a, b`
pub fn cmp(cb: &mut CodeBlock, sz: Size, a: X86Opnd, b: X86Opnd) {
    alu(cb, sz, ALU_CMP, a, b);
}

/// `test a, b` (flags only)
pub fn test(cb: &mut CodeBlock, sz: Size, a: X86Opnd, b: X86Opnd) {
    let w = sz == Size::B64;
    let is8 = sz == Size::B8;
    match (&a, &b) {
        (X86Opnd::Reg(_) | X86Opnd::Mem(_), X86Opnd::Reg(r)) => {
            let force = is8 && (byte_reg_needs_rex(&a) || byte_reg_needs_rex(&b));
            let opcode: &[u8] = if is8 { &[0x84] } else { &[0x85] };
            emit_rm(cb, None, sz == Size::B16, w, force, opcode, r.0, &a);
        }
        (X86Opnd::Reg(_) | X86Opnd::Mem(_), X86Opnd::Imm(val)) => {
            let force = is8 && byte_reg_needs_rex(&a);
            let opcode: &[u8] = if is8 { &[0xF6] } else { &[0xF7] };
            emit_rm(cb, None, sz == Size::B16, w, force, opcode, 0, &a);
            if is8 {
                cb.write_byte(*val as u8);
            } else {
                cb.write_i32(*val as i32);
            }
        }
        _ => panic!("unsupported test form: {:?}, {:?}", a, b),
    }
}

/// Signed multiply: `imul dst, src` (32/64-bit)
pub fn imul(cb: &mut CodeBlock, sz: Size, dst: Gpr, src: X86Opnd) {
    assert!(matches!(sz, Size::B32 | Size::B64));
    emit_rm(cb, None, false, sz == Size::B64, false, &[0x0F, 0xAF], dst.0, &src);
}

/// Signed divide of rdx:rax by `src`
pub fn idiv(cb: &mut CodeBlock, sz: Size, src: X86Opnd) {
    assert!(matches!(sz, Size::B32 | Size::B64));
    emit_rm(cb, None, false, sz == Size::B64, false, &[0xF7], 7, &src);
}

/// Sign-extend eax into edx (`cdq`)
pub fn cdq(cb: &mut CodeBlock) {
    cb.write_byte(0x99);
}

/// Two's-complement negate
pub fn neg(cb: &mut CodeBlock, sz: Size, opnd: X86Opnd) {
    emit_rm(cb, None, sz == Size::B16, sz == Size::B64, false, &[0xF7], 3, &opnd);
}

/// Bitwise not
pub fn not(cb: &mut CodeBlock, sz: Size, opnd: X86Opnd) {
    emit_rm(cb, None, sz == Size::B16, sz == Size::B64, false, &[0xF7], 2, &opnd);
}

// --- shifts ---

fn shift(cb: &mut CodeBlock, sz: Size, ext: u8, opnd: X86Opnd, count: X86Opnd) {
    let w = sz == Size::B64;
    match count {
        X86Opnd::Imm(n) => {
            if n == 1 {
                emit_rm(cb, None, false, w, false, &[0xD1], ext, &opnd);
            } else {
                emit_rm(cb, None, false, w, false, &[0xC1], ext, &opnd);
                cb.write_byte(n as u8);
            }
        }
        // count in cl
        X86Opnd::Reg(super::regs::RCX) => {
            emit_rm(cb, None, false, w, false, &[0xD3], ext, &opnd);
        }
        _ => panic!("shift count must be an immediate or cl"),
    }
}

/// Arithmetic (and logical) left shift
pub fn sal(cb: &mut CodeBlock, sz: Size, opnd: X86Opnd, count: X86Opnd) {
    shift(cb, sz, 4, opnd, count);
}

/// Arithmetic right shift
pub fn sar(cb: &mut CodeBlock, sz: Size, opnd: X86Opnd, count: X86Opnd) {
    shift(cb, sz, 7, opnd, count);
}

/// Logical right shift
pub fn shr(cb: &mut CodeBlock, sz: Size, opnd: X86Opnd, count: X86Opnd) {
    shift(cb, sz, 5, opnd, count);
}

// --- stack / calls ---

/// `push r64`
pub fn push(cb: &mut CodeBlock, r: Gpr) {
    if r.0 >= 8 {
        cb.write_byte(0x41);
    }
    cb.write_byte(0x50 | (r.0 & 7));
}

/// `pop r64`
pub fn pop(cb: &mut CodeBlock, r: Gpr) {
    if r.0 >= 8 {
        cb.write_byte(0x41);
    }
    cb.write_byte(0x58 | (r.0 & 7));
}

/// Indirect `call` through a register or memory operand
pub fn call_rm(cb: &mut CodeBlock, target: X86Opnd) {
    emit_rm(cb, None, false, false, false, &[0xFF], 2, &target);
}

/// `ret`
pub fn ret(cb: &mut CodeBlock) {
    cb.write_byte(0xC3);
}

/// Indirect `jmp` through a register or memory operand
pub fn jmp_rm(cb: &mut CodeBlock, target: X86Opnd) {
    emit_rm(cb, None, false, false, false, &[0xFF], 4, &target);
}

/// `jmp rel32` with an unresolved displacement; returns the field position
pub fn jmp_rel32_field(cb: &mut CodeBlock) -> usize {
    cb.write_byte(0xE9);
    let field = cb.pos();
    cb.write_i32(0);
    field
}

/// `jcc rel32` with an unresolved displacement; returns the field position
pub fn jcc_rel32_field(cb: &mut CodeBlock, cc: Cc) -> usize {
    cb.write_byte(0x0F);
    cb.write_byte(0x80 | cc as u8);
    let field = cb.pos();
    cb.write_i32(0);
    field
}

/// `jmp` to a known buffer position
pub fn jmp_to(cb: &mut CodeBlock, target_pos: usize) {
    let field = jmp_rel32_field(cb);
    let disp = target_pos as i64 - (field as i64 + 4);
    cb.patch_i32(field, i32::try_from(disp).expect("jmp displacement overflow"));
}

/// `jcc` to a known buffer position
pub fn jcc_to(cb: &mut CodeBlock, cc: Cc, target_pos: usize) {
    let field = jcc_rel32_field(cb, cc);
    let disp = target_pos as i64 - (field as i64 + 4);
    cb.patch_i32(field, i32::try_from(disp).expect("jcc displacement overflow"));
}

/// `jmp` to a label in the current emission unit
pub fn jmp_label(cb: &mut CodeBlock, label: Label) {
    cb.write_byte(0xE9);
    cb.label_ref32(label);
}

/// `jcc` to a label in the current emission unit
pub fn jcc_label(cb: &mut CodeBlock, cc: Cc, label: Label) {
    cb.write_byte(0x0F);
    cb.write_byte(0x80 | cc as u8);
    cb.label_ref32(label);
}

/// Conditional move (32/64-bit)
pub fn cmov(cb: &mut CodeBlock, cc: Cc, sz: Size, dst: Gpr, src: X86Opnd) {
    assert!(matches!(sz, Size::B32 | Size::B64));
    emit_rm(
        cb,
        None,
        false,
        sz == Size::B64,
        false,
        &[0x0F, 0x40 | cc as u8],
        dst.0,
        &src,
    );
}

// --- scalar SSE ---

/// `movq xmm, r64`
pub fn movq_to_xmm(cb: &mut CodeBlock, dst: Xmm, src: Gpr) {
    emit_rm(cb, Some(0x66), false, true, false, &[0x0F, 0x6E], dst.0, &X86Opnd::Reg(src));
}

/// `movq r64, xmm`
pub fn movq_from_xmm(cb: &mut CodeBlock, dst: Gpr, src: Xmm) {
    emit_rm(cb, Some(0x66), false, true, false, &[0x0F, 0x7E], src.0, &X86Opnd::Reg(dst));
}

/// `movsd xmm, xmm/m64`
pub fn movsd_load(cb: &mut CodeBlock, dst: Xmm, src: X86Opnd) {
    emit_rm(cb, Some(0xF2), false, false, false, &[0x0F, 0x10], dst.0, &src);
}

/// `movsd m64, xmm`
pub fn movsd_store(cb: &mut CodeBlock, dst: X86Opnd, src: Xmm) {
    emit_rm(cb, Some(0xF2), false, false, false, &[0x0F, 0x11], src.0, &dst);
}

fn sse_arith(cb: &mut CodeBlock, opcode: u8, dst: Xmm, src: X86Opnd) {
    emit_rm(cb, Some(0xF2), false, false, false, &[0x0F, opcode], dst.0, &src);
}

/// `addsd dst, src`
pub fn addsd(cb: &mut CodeBlock, dst: Xmm, src: X86Opnd) {
    sse_arith(cb, 0x58, dst, src);
}

/// `subsd dst, src`
pub fn subsd(cb: &mut CodeBlock, dst: Xmm, src: X86Opnd) {
    sse_arith(cb, 0x5C, dst, src);
}

/// `mulsd dst, src`
pub fn mulsd(cb: &mut CodeBlock, dst: Xmm, src: X86Opnd) {
    sse_arith(cb, 0x59, dst, src);
}

/// `divsd dst, src`
pub fn divsd(cb: &mut CodeBlock, dst: Xmm, src: X86Opnd) {
    sse_arith(cb, 0x5E, dst, src);
}

/// Unordered compare: `ucomisd a, b`
pub fn ucomisd(cb: &mut CodeBlock, a: Xmm, b: X86Opnd) {
    emit_rm(cb, Some(0x66), false, false, false, &[0x0F, 0x2E], a.0, &b);
}

/// `cvtsi2sd xmm, r/m` (src size 32 or 64)
pub fn cvtsi2sd(cb: &mut CodeBlock, dst: Xmm, src_sz: Size, src: X86Opnd) {
    emit_rm(
        cb,
        Some(0xF2),
        false,
        src_sz == Size::B64,
        false,
        &[0x0F, 0x2A],
        dst.0,
        &src,
    );
}

/// Truncating convert: `cvttsd2si r, xmm/m64` (dst size 32 or 64)
pub fn cvttsd2si(cb: &mut CodeBlock, dst_sz: Size, dst: Gpr, src: X86Opnd) {
    emit_rm(
        cb,
        Some(0xF2),
        false,
        dst_sz == Size::B64,
        false,
        &[0x0F, 0x2C],
        dst.0,
        &src,
    );
}

// --- misc ---

/// Breakpoint
pub fn int3(cb: &mut CodeBlock) {
    cb.write_byte(0xCC);
}

/// Undefined instruction (unreachable paths)
pub fn ud2(cb: &mut CodeBlock) {
    cb.write_bytes(&[0x0F, 0x0B]);
}

#[cfg(test)]
mod tests {
    use super::super::regs::*;
    use super::*;

    fn enc(f: impl FnOnce(&mut CodeBlock)) -> Vec<u8> {
        let mut cb = CodeBlock::new(256).unwrap();
        f(&mut cb);
        assert!(!cb.has_dropped_bytes());
        cb.bytes(0, cb.pos()).to_vec()
    }

    #[test]
    fn test_mov_reg_reg() {
        assert_eq!(
            enc(|cb| mov(cb, Size::B64, reg(RCX), reg(RDX))),
            vec![0x48, 0x8B, 0xCA]
        );
        assert_eq!(
            enc(|cb| mov(cb, Size::B32, reg(RAX), reg(R9))),
            vec![0x41, 0x8B, 0xC1]
        );
    }

    #[test]
    fn test_mov_mem() {
        // mov rax, [rbx+16]
        assert_eq!(
            enc(|cb| mov(cb, Size::B64, reg(RAX), mem(RBX, 16))),
            vec![0x48, 0x8B, 0x43, 0x10]
        );
        // mov [rbp-8], rcx
        assert_eq!(
            enc(|cb| mov(cb, Size::B64, mem(RBP, -8), reg(RCX))),
            vec![0x48, 0x89, 0x4D, 0xF8]
        );
        // mov rax, [r12]  (SIB forced by base)
        assert_eq!(
            enc(|cb| mov(cb, Size::B64, reg(RAX), mem(R12, 0))),
            vec![0x49, 0x8B, 0x04, 0x24]
        );
        // mov rax, [r13]  (disp8 forced by base)
        assert_eq!(
            enc(|cb| mov(cb, Size::B64, reg(RAX), mem(R13, 0))),
            vec![0x49, 0x8B, 0x45, 0x00]
        );
        // mov rcx, [rbx+rax*8+4]
        assert_eq!(
            enc(|cb| mov(cb, Size::B64, reg(RCX), mem_idx(RBX, RAX, 8, 4))),
            vec![0x48, 0x8B, 0x4C, 0xC3, 0x04]
        );
    }

    #[test]
    fn test_mov_imm() {
        // mov r8d, 5
        assert_eq!(
            enc(|cb| mov(cb, Size::B32, reg(R8), imm(5))),
            vec![0x41, 0xB8, 0x05, 0x00, 0x00, 0x00]
        );
        // mov rax, 5 (sign-extended imm32 form)
        assert_eq!(
            enc(|cb| mov(cb, Size::B64, reg(RAX), imm(5))),
            vec![0x48, 0xC7, 0xC0, 0x05, 0x00, 0x00, 0x00]
        );
        // movabs
        assert_eq!(
            enc(|cb| {
                mov_abs(cb, RAX, 0x1122_3344_5566_7788);
            }),
            vec![0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
        // mov qword [rbx], -1
        assert_eq!(
            enc(|cb| mov(cb, Size::B64, mem(RBX, 0), imm(-1))),
            vec![0x48, 0xC7, 0x03, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        // mov byte [rbx+rcx], 3
        assert_eq!(
            enc(|cb| mov(cb, Size::B8, mem_idx(RBX, RCX, 1, 0), imm(3))),
            vec![0xC6, 0x04, 0x0B, 0x03]
        );
    }

    #[test]
    fn test_byte_reg_rex() {
        // mov [rbx], sil — needs bare REX
        assert_eq!(
            enc(|cb| mov(cb, Size::B8, mem(RBX, 0), reg(RSI))),
            vec![0x40, 0x88, 0x33]
        );
        // cmp sil, 3
        assert_eq!(
            enc(|cb| cmp(cb, Size::B8, reg(RSI), imm(3))),
            vec![0x40, 0x80, 0xFE, 0x03]
        );
    }

    #[test]
    fn test_alu() {
        // add ecx, edx
        assert_eq!(enc(|cb| add(cb, Size::B32, reg(RCX), reg(RDX))), vec![0x03, 0xCA]);
        // add rcx, 8
        assert_eq!(
            enc(|cb| add(cb, Size::B64, reg(RCX), imm(8))),
            vec![0x48, 0x83, 0xC1, 0x08]
        );
        // sub eax, 1000
        assert_eq!(
            enc(|cb| sub(cb, Size::B32, reg(RAX), imm(1000))),
            vec![0x81, 0xE8, 0xE8, 0x03, 0x00, 0x00]
        );
        // cmp dword [rbx+4], 7
        assert_eq!(
            enc(|cb| cmp(cb, Size::B32, mem(RBX, 4), imm(7))),
            vec![0x83, 0x7B, 0x04, 0x07]
        );
        // xor r14, r14
        assert_eq!(
            enc(|cb| xor(cb, Size::B64, reg(R14), reg(R14))),
            vec![0x4D, 0x33, 0xF6]
        );
    }

    #[test]
    fn test_mul_div() {
        // imul ecx, esi
        assert_eq!(
            enc(|cb| imul(cb, Size::B32, RCX, reg(RSI))),
            vec![0x0F, 0xAF, 0xCE]
        );
        // idiv esi ; cdq
        assert_eq!(enc(|cb| idiv(cb, Size::B32, reg(RSI))), vec![0xF7, 0xFE]);
        assert_eq!(enc(cdq), vec![0x99]);
    }

    #[test]
    fn test_shifts() {
        // sar ecx, 2
        assert_eq!(
            enc(|cb| sar(cb, Size::B32, reg(RCX), imm(2))),
            vec![0xC1, 0xF9, 0x02]
        );
        // shl rax, cl
        assert_eq!(
            enc(|cb| sal(cb, Size::B64, reg(RAX), reg(RCX))),
            vec![0x48, 0xD3, 0xE0]
        );
        // shr esi, 1
        assert_eq!(
            enc(|cb| shr(cb, Size::B32, reg(RSI), imm(1))),
            vec![0xD1, 0xEE]
        );
    }

    #[test]
    fn test_push_pop_call_ret() {
        assert_eq!(enc(|cb| push(cb, R14)), vec![0x41, 0x56]);
        assert_eq!(enc(|cb| pop(cb, RBP)), vec![0x5D]);
        assert_eq!(enc(|cb| call_rm(cb, reg(RAX))), vec![0xFF, 0xD0]);
        assert_eq!(enc(ret), vec![0xC3]);
        // jmp [r15]
        assert_eq!(enc(|cb| jmp_rm(cb, mem(R15, 0))), vec![0x41, 0xFF, 0x27]);
    }

    #[test]
    fn test_jumps_and_labels() {
        // jmp forward over one byte
        let bytes = enc(|cb| {
            let l = cb.new_label();
            jmp_label(cb, l);
            int3(cb);
            cb.bind_label(l);
            ret(cb);
            cb.link_labels();
        });
        assert_eq!(bytes, vec![0xE9, 0x01, 0x00, 0x00, 0x00, 0xCC, 0xC3]);

        // je backward to start
        let bytes = enc(|cb| {
            let l = cb.new_label();
            cb.bind_label(l);
            jcc_label(cb, Cc::E, l);
            cb.link_labels();
        });
        assert_eq!(bytes, vec![0x0F, 0x84, 0xFA, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_cmov_test() {
        // cmove ecx, eax
        assert_eq!(
            enc(|cb| cmov(cb, Cc::E, Size::B32, RCX, reg(RAX))),
            vec![0x0F, 0x44, 0xC8]
        );
        // test eax, eax
        assert_eq!(enc(|cb| test(cb, Size::B32, reg(RAX), reg(RAX))), vec![0x85, 0xC0]);
    }

    #[test]
    fn test_extension_loads() {
        // movzx ecx, byte [rbx]
        assert_eq!(
            enc(|cb| movzx(cb, Size::B32, RCX, Size::B8, mem(RBX, 0))),
            vec![0x0F, 0xB6, 0x0B]
        );
        // movzx ecx, word [rbx]
        assert_eq!(
            enc(|cb| movzx(cb, Size::B32, RCX, Size::B16, mem(RBX, 0))),
            vec![0x0F, 0xB7, 0x0B]
        );
        // movsx rcx, byte [rbx]
        assert_eq!(
            enc(|cb| movsx(cb, Size::B64, RCX, Size::B8, mem(RBX, 0))),
            vec![0x48, 0x0F, 0xBE, 0x0B]
        );
        // movsxd rcx, esi
        assert_eq!(
            enc(|cb| movsx(cb, Size::B64, RCX, Size::B32, reg(RSI))),
            vec![0x48, 0x63, 0xCE]
        );
    }

    #[test]
    fn test_lea() {
        // lea rcx, [rbx+rax*8+4]
        assert_eq!(
            enc(|cb| lea(cb, RCX, mem_idx(RBX, RAX, 8, 4))),
            vec![0x48, 0x8D, 0x4C, 0xC3, 0x04]
        );
    }

    #[test]
    fn test_sse() {
        assert_eq!(
            enc(|cb| movq_to_xmm(cb, XMM0, RAX)),
            vec![0x66, 0x48, 0x0F, 0x6E, 0xC0]
        );
        assert_eq!(
            enc(|cb| movq_from_xmm(cb, RAX, XMM0)),
            vec![0x66, 0x48, 0x0F, 0x7E, 0xC0]
        );
        assert_eq!(
            enc(|cb| addsd(cb, XMM0, X86Opnd::Fpr(XMM1))),
            vec![0xF2, 0x0F, 0x58, 0xC1]
        );
        assert_eq!(
            enc(|cb| movsd_load(cb, XMM1, mem(RBX, 8))),
            vec![0xF2, 0x0F, 0x10, 0x4B, 0x08]
        );
        assert_eq!(
            enc(|cb| movsd_store(cb, mem(RBX, 0), XMM0)),
            vec![0xF2, 0x0F, 0x11, 0x03]
        );
        assert_eq!(
            enc(|cb| ucomisd(cb, XMM0, X86Opnd::Fpr(XMM1))),
            vec![0x66, 0x0F, 0x2E, 0xC1]
        );
        assert_eq!(
            enc(|cb| cvtsi2sd(cb, XMM0, Size::B32, reg(RCX))),
            vec![0xF2, 0x0F, 0x2A, 0xC1]
        );
        assert_eq!(
            enc(|cb| cvttsd2si(cb, Size::B32, RAX, X86Opnd::Fpr(XMM0))),
            vec![0xF2, 0x0F, 0x2C, 0xC0]
        );
    }
}
