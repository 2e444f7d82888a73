//! Kestrel Language Engine
//!
//! The JIT code-generation core of the Kestrel VM: a dynamically-typed,
//! JavaScript-like language compiled with basic-block versioning (BBV).
//! Each IR basic block gets lazily-emitted specialized versions, one per
//! distinct incoming code-generation state (operand locations plus known
//! type facts), so emitted code specializes operand layouts and type tests
//! to observed runtime shapes without a separate tracing phase.
//!
//! - **IR**: the linear single-assignment representation the generator
//!   consumes (`ir` module)
//! - **Codegen**: the x86-64 encoder, the per-point code-generation state,
//!   the per-opcode generators, the block version manager, and the runtime
//!   bridge (`codegen` module)
//! - **Runtime**: the VM context, value representation, host helpers, and
//!   FFI loading that emitted code relies on (`runtime` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use kestrel_engine::{JitEngine, JitConfig};
//! use kestrel_engine::ir::{IRFunction, IRBuilder, Opcode};
//! use kestrel_engine::runtime::TaggedVal;
//!
//! let mut engine = JitEngine::with_defaults().unwrap();
//! let mut fun = IRFunction::new("add7", 1);
//! let p = fun.param_val(0);
//! {
//!     let mut b = IRBuilder::new(&mut fun);
//!     let sum = b.emit(Opcode::AddI32, vec![b.val(p), b.int32(7)]);
//!     b.ret(b.val(sum));
//! }
//! let id = engine.vm_mut().add_fun(fun);
//! let out = engine.call(id, TaggedVal::undef(), &[TaggedVal::int32(35)]).unwrap();
//! assert_eq!(out.word.as_i32(), 42);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// IR module: instructions, blocks, functions, liveness
pub mod ir;

/// Code generation: encoder, state, versions, per-opcode generators
pub mod codegen;

/// Runtime: VM context, values, host helpers, FFI
pub mod runtime;

pub use codegen::{CodeGen, CodegenError, CodegenStats, EngineError, JitConfig, JitEngine};
pub use ir::{IRBuilder, IRFunction, Opcode, TypeTag};
pub use runtime::{TaggedVal, VmContext, Word};
