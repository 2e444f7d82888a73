//! Intermediate representation consumed by the JIT
//!
//! A linear, single-assignment IR: every value has a fixed home slot in its
//! function's stack frame, instructions carry up to two branch targets, and
//! constants cover the dynamic-language literal set plus link-table
//! placeholders and function references.

pub mod builder;
mod display;
pub mod instr;
pub mod liveness;
pub mod types;

pub use builder::IRBuilder;
pub use instr::{
    BlockId, FunId, IRArg, IRBlock, IRConst, IRFunction, IRInstr, LinkIdx, Opcode, ValueId,
    ARGC_SLOT, CLOS_SLOT, FRAME_HDR_SLOTS, RA_SLOT, THIS_SLOT,
};
pub use liveness::Liveness;
pub use types::TypeTag;
