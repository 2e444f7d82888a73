//! The basic-block-versioning code generator
//!
//! `CodeGen` owns the code heap, the version registry, and the compile
//! queue. `compile_fun` interns the entry version of a function and drains
//! the queue; each drained version is realized by running the per-opcode
//! generators over its block with the version's entry state. Branches
//! intern successor versions and leave patchable references that resolve
//! when those versions are realized.

pub mod asm;
pub mod bridge;
mod lower;
pub mod registry;
pub mod state;
pub mod versions;

use std::rc::Rc;

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::codegen::asm::CodeBlock;
use crate::codegen::registry::CodeRegistry;
use crate::codegen::state::CodeGenState;
use crate::codegen::versions::{VersionId, VersionManager};
use crate::ir::instr::{FunId, IRFunction, Opcode, ValueId};
use crate::ir::liveness::Liveness;
use crate::ir::types::TypeTag;
use crate::runtime::context::VmContext;
use crate::runtime::exec_mem::MapError;
use crate::runtime::value::TaggedVal;

/// Code generator configuration
pub struct JitConfig {
    /// Compile call continuations eagerly instead of through stubs
    pub eager: bool,
    /// Consult the static type-propagation pass alongside the BBV state
    pub typeprop: bool,
    /// Per-block version cap; zero disables all type specialization
    pub max_versions: u32,
    /// Code heap size in bytes
    pub code_heap_size: usize,
    /// VM heap soft limit in bytes
    pub heap_size: usize,
    /// Word/type stack depth in slots
    pub stack_slots: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            eager: false,
            typeprop: false,
            max_versions: 20,
            code_heap_size: 1 << 22,
            heap_size: 1 << 22,
            stack_slots: 1 << 16,
        }
    }
}

/// Compilation failures. Buffer exhaustion is fatal; the rest reflect
/// malformed IR from the builder and are treated as fatal by the driver.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// The code heap is exhausted
    #[error("code buffer exhausted")]
    BufferOverflow,
    /// The code heap could not be mapped
    #[error(transparent)]
    Map(#[from] MapError),
    /// A branch instruction is missing a required target
    #[error("missing branch target on {0}")]
    MissingTarget(Opcode),
    /// A block does not end in a terminator
    #[error("block without terminator in {0}")]
    UnterminatedBlock(String),
    /// `call_prim` names an uninstalled primitive
    #[error("unknown primitive: {0}")]
    UnknownPrim(String),
    /// `call_prim` arity does not match the callee
    #[error("primitive {prim} expects {expected} arguments, got {got}")]
    ArityMismatch {
        /// Primitive name
        prim: String,
        /// Declared parameter count
        expected: u32,
        /// Call-site argument count
        got: u32,
    },
    /// Malformed `call_ffi` signature string
    #[error("bad FFI signature: {0}")]
    BadFfiSig(String),
}

/// Emission counters
#[derive(Debug, Default, Clone, Copy)]
pub struct CodegenStats {
    /// Block versions realized
    pub versions_compiled: u64,
    /// Code bytes emitted for realized versions
    pub bytes_emitted: u64,
    /// Host-call sites emitted
    pub host_calls: u64,
    /// Continuation stubs emitted (lazy mode)
    pub stubs_emitted: u64,
    /// Continuation stubs compiled on first reach
    pub stubs_compiled: u64,
}

/// A lazily-compiled continuation: the version to realize and the landing
/// pad's jump field to repoint once it exists
#[derive(Debug, Clone, Copy)]
pub struct StubEntry {
    /// Continuation version
    pub version: VersionId,
    /// Position of the pad's rel32 jump displacement
    pub patch_field: usize,
}

/// The code generator
pub struct CodeGen {
    config: JitConfig,
    cb: CodeBlock,
    vers: VersionManager,
    registry: CodeRegistry,
    stubs: Vec<StubEntry>,
    pending_entry_stubs: Vec<FunId>,
    live_cache: FxHashMap<FunId, Rc<Liveness>>,
    typeprop_cache: FxHashMap<FunId, FxHashMap<ValueId, TypeTag>>,
    stats: CodegenStats,
    entry_tramp: *const u8,
}

/// Flow-insensitive output-tag derivation: the pluggable static pass the
/// type tests consult when `typeprop` is enabled
fn compute_typeprop(fun: &IRFunction) -> FxHashMap<ValueId, TypeTag> {
    let mut map = FxHashMap::default();
    for block in &fun.blocks {
        for instr in &block.instrs {
            if let (Some(out), Some(tag)) = (instr.out, instr.op.out_tag()) {
                map.insert(out, tag);
            }
        }
    }
    map
}

impl CodeGen {
    /// Create a code generator with its code heap
    pub fn new(config: JitConfig) -> Result<CodeGen, CodegenError> {
        let cb = CodeBlock::new(config.code_heap_size)?;
        let max_versions = config.max_versions;
        Ok(CodeGen {
            config,
            cb,
            vers: VersionManager::new(max_versions),
            registry: CodeRegistry::new(),
            stubs: vec![],
            pending_entry_stubs: vec![],
            live_cache: FxHashMap::default(),
            typeprop_cache: FxHashMap::default(),
            stats: CodegenStats::default(),
            entry_tramp: std::ptr::null(),
        })
    }

    /// Wire this generator to a VM context: emit the entry trampoline and
    /// exit stubs, and install the re-entry back-pointer. The generator
    /// must stay pinned (boxed) for the lifetime of the context.
    pub fn attach(&mut self, vm: &mut VmContext) {
        let tramp = bridge::gen_entry_trampoline(&mut self.cb);
        let exit = bridge::gen_exit_stub(&mut self.cb);
        let exc_exit = bridge::gen_exc_exit_stub(&mut self.cb);
        self.entry_tramp = self.cb.ptr_at(tramp);
        vm.exit_code = self.cb.ptr_at(exit);
        vm.exc_exit_code = self.cb.ptr_at(exc_exit);
        vm.engine = self as *mut CodeGen as *mut u8;
    }

    /// Emission statistics
    pub fn stats(&self) -> CodegenStats {
        self.stats
    }

    /// The version registry (tests, diagnostics)
    pub fn versions(&self) -> &VersionManager {
        &self.vers
    }

    /// The code buffer (tests, diagnostics)
    pub fn code(&self) -> &CodeBlock {
        &self.cb
    }

    /// The compiled-function registry
    pub fn registry(&self) -> &CodeRegistry {
        &self.registry
    }

    fn liveness(&mut self, vm: &VmContext, fun_id: FunId) -> Rc<Liveness> {
        if let Some(l) = self.live_cache.get(&fun_id) {
            return l.clone();
        }
        // Safety: function records are boxed and stable for the process.
        let fun = unsafe { &*vm.fun_ptr(fun_id) };
        let live = Rc::new(Liveness::compute(fun));
        self.live_cache.insert(fun_id, live.clone());
        live
    }

    /// Compile `fun_id`'s entry version (and everything it queues),
    /// install the entry code on the function record, and return it
    pub fn compile_fun(
        &mut self,
        vm: &mut VmContext,
        fun_id: FunId,
    ) -> Result<*const u8, CodegenError> {
        if let Some(ptr) = self.registry.get(fun_id) {
            return Ok(ptr);
        }
        let live = self.liveness(vm, fun_id);
        // Safety: function records are boxed and stable.
        let fun = unsafe { &*vm.fun_ptr(fun_id) };
        let live_in = live.live_in(fun.entry);
        let entry_state = CodeGenState::entry(live_in);
        let canon = entry_state.canonicalize(live_in);
        let vid = self.vers.get_version(fun_id, fun.entry, canon);
        self.drain(vm)?;
        let start = self
            .vers
            .version(vid)
            .start
            .expect("entry version not realized by drain");
        let ptr = self.cb.ptr_at(start);
        fun.entry_code.set(ptr);
        self.registry.insert(fun_id, ptr);
        tracing::debug!(fun = %fun.name, start, "compiled function entry");
        Ok(ptr)
    }

    /// Realize a lazily-interned continuation version on first reach and
    /// repoint its landing pad
    pub fn compile_continuation(
        &mut self,
        vm: &mut VmContext,
        stub_id: u32,
    ) -> Result<*const u8, CodegenError> {
        let entry = self.stubs[stub_id as usize];
        if !self.vers.version(entry.version).is_realized() {
            self.vers.enqueue(entry.version);
            self.drain(vm)?;
        }
        let start = self
            .vers
            .version(entry.version)
            .start
            .expect("continuation not realized by drain");
        let disp = start as i64 - (entry.patch_field as i64 + 4);
        self.cb.patch_i32(
            entry.patch_field,
            i32::try_from(disp).expect("continuation displacement overflow"),
        );
        self.stats.stubs_compiled += 1;
        tracing::debug!(stub_id, start, "compiled continuation");
        Ok(self.cb.ptr_at(start))
    }

    /// Drain the pending-version queue. Entry stubs flush only between
    /// full passes: a fall-through pair must stay contiguous, so nothing
    /// may emit between a version and its promoted successor.
    fn drain(&mut self, vm: &mut VmContext) -> Result<(), CodegenError> {
        loop {
            while let Some(vid) = self.vers.pop_pending() {
                self.realize(vm, vid)?;
            }
            if self.pending_entry_stubs.is_empty() {
                break;
            }
            self.flush_entry_stubs(vm);
        }
        if self.cb.has_dropped_bytes() {
            return Err(CodegenError::BufferOverflow);
        }
        Ok(())
    }

    /// Emit compile-on-first-entry stubs for functions referenced by
    /// closures before their first call
    fn flush_entry_stubs(&mut self, vm: &mut VmContext) {
        let pending = std::mem::take(&mut self.pending_entry_stubs);
        for fun_id in pending {
            let fun = vm.fun(fun_id);
            if !fun.entry_code.get().is_null() {
                continue;
            }
            let start = self.cb.pos();
            let fun_ptr = vm.fun_ptr(fun_id) as usize;
            bridge::gen_host_call(
                &mut self.cb,
                vm.host_fns.compile_entry as usize,
                &[
                    asm::regs::reg(asm::regs::VM),
                    asm::regs::X86Opnd::Imm(fun_ptr as i64),
                ],
            );
            asm::encoder::jmp_rm(&mut self.cb, asm::regs::reg(asm::regs::RAX));
            vm.fun(fun_id).entry_code.set(self.cb.ptr_at(start));
            self.stats.stubs_emitted += 1;
        }
    }

    /// Emit one block version: patch the references waiting on it, then
    /// run the per-opcode generators over the block with the version's
    /// entry state
    fn realize(&mut self, vm: &mut VmContext, vid: VersionId) -> Result<(), CodegenError> {
        let (fun_id, block, canon) = {
            let ver = self.vers.version(vid);
            (ver.fun, ver.block, ver.state.clone())
        };
        // Safety: function records are boxed and stable; the generators
        // never add or remove functions mid-realization.
        let fun = unsafe { &*vm.fun_ptr(fun_id) };
        let live = self.liveness(vm, fun_id);
        let live_after = live.block_live_after(fun, block);

        if self.config.typeprop {
            self.typeprop_cache
                .entry(fun_id)
                .or_insert_with(|| compute_typeprop(fun));
        }

        let start = self.cb.pos();
        self.vers.mark_realized(vid, start);
        let refs = self.cb.take_refs_to(vid.0);
        for r in &refs {
            self.cb.patch_ref(r, start);
        }
        tracing::trace!(
            fun = %fun.name,
            block = block.0,
            version = vid.0,
            incoming = refs.len(),
            "realizing block version"
        );

        let mut ctx = lower::LowerCtx {
            cb: &mut self.cb,
            vm,
            vers: &mut self.vers,
            stubs: &mut self.stubs,
            pending_entry_stubs: &mut self.pending_entry_stubs,
            stats: &mut self.stats,
            config: &self.config,
            typeprop: self.typeprop_cache.get(&fun_id),
            live_cache: &mut self.live_cache,
            fun_id,
            fun,
            live,
            live_after,
            block,
            instr_idx: 0,
            state: CodeGenState::from_canon(&canon),
            finished: false,
        };

        let n_instrs = fun.block(block).instrs.len();
        for idx in 0..n_instrs {
            if ctx.finished {
                break;
            }
            ctx.instr_idx = idx;
            let instr = fun.block(block).instrs[idx].clone();
            debug_assert!(ctx.state.check_location_uniqueness());
            lower::lower_instr(&mut ctx, &instr)?;
        }
        if !ctx.finished {
            return Err(CodegenError::UnterminatedBlock(fun.name.clone()));
        }

        self.cb.link_labels();
        let end = self.cb.pos();
        self.vers.set_end(vid, end);
        self.stats.versions_compiled += 1;
        self.stats.bytes_emitted += (end - start) as u64;
        Ok(())
    }
}

/// Errors surfaced when running through the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Compilation failed
    #[error(transparent)]
    Compile(#[from] CodegenError),
    /// An exception unwound past the root frame
    #[error("unhandled exception: {0}")]
    Unhandled(String),
    /// Emitted code cannot execute on this host
    #[error("execution requires an x86-64 unix host")]
    UnsupportedHost,
}

/// The engine: a VM context wired to a code generator
pub struct JitEngine {
    vm: Box<VmContext>,
    gen: Box<CodeGen>,
}

impl JitEngine {
    /// Create an engine with the given configuration
    pub fn new(config: JitConfig) -> Result<JitEngine, CodegenError> {
        let mut vm = VmContext::new(config.heap_size, config.stack_slots);
        let mut gen = Box::new(CodeGen::new(config)?);
        gen.attach(&mut vm);
        Ok(JitEngine { vm, gen })
    }

    /// With the default configuration
    pub fn with_defaults() -> Result<JitEngine, CodegenError> {
        Self::new(JitConfig::default())
    }

    /// The VM context
    pub fn vm(&self) -> &VmContext {
        &self.vm
    }

    /// The VM context, mutably (function registration, primitives)
    pub fn vm_mut(&mut self) -> &mut VmContext {
        &mut self.vm
    }

    /// The code generator
    pub fn codegen(&self) -> &CodeGen {
        &self.gen
    }

    /// Compile a function and return its entry code
    pub fn compile(&mut self, fun_id: FunId) -> Result<*const u8, CodegenError> {
        self.gen.compile_fun(&mut self.vm, fun_id)
    }

    /// Compile (if needed) and run a function with the given `this` and
    /// arguments, returning the result value
    #[allow(unused_variables)]
    pub fn call(
        &mut self,
        fun_id: FunId,
        this: TaggedVal,
        args: &[TaggedVal],
    ) -> Result<TaggedVal, EngineError> {
        let entry = self.gen.compile_fun(&mut self.vm, fun_id)?;

        #[cfg(all(target_arch = "x86_64", unix))]
        {
            self.vm.unhandled = false;
            self.vm.cur_fun = fun_id.0;
            let exit = self.vm.exit_code;
            self.vm.push_frame(fun_id, exit, 0, this, args);

            let tramp: unsafe extern "C" fn(*mut VmContext, *const u8) =
                unsafe { std::mem::transmute(self.gen.entry_tramp) };
            // Safety: the trampoline and all reachable code were emitted
            // into this engine's code heap; the VM context outlives the
            // call, and the single-threaded model holds.
            unsafe { tramp(&mut *self.vm as *mut VmContext, entry) };

            if self.vm.unhandled {
                let exc = self.vm.return_value();
                let msg = if exc.tag == TypeTag::String {
                    self.vm.read_str(exc.word.0)
                } else {
                    format!("{:?}", exc)
                };
                return Err(EngineError::Unhandled(msg));
            }
            Ok(self.vm.return_value())
        }

        #[cfg(not(all(target_arch = "x86_64", unix)))]
        {
            let _ = entry;
            Err(EngineError::UnsupportedHost)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IRBuilder;
    use crate::ir::instr::IRFunction;

    #[test]
    fn test_engine_creation() {
        let engine = JitEngine::with_defaults().unwrap();
        assert!(!engine.vm().exit_code.is_null());
        assert_eq!(engine.codegen().stats().versions_compiled, 0);
    }

    #[test]
    fn test_compile_trivial_function() {
        let mut engine = JitEngine::with_defaults().unwrap();
        let mut fun = IRFunction::new("three", 0);
        {
            let mut b = IRBuilder::new(&mut fun);
            b.ret(b.int32(3));
        }
        let id = engine.vm_mut().add_fun(fun);
        assert!(!engine.codegen().registry().contains(id));
        let entry = engine.compile(id).unwrap();
        assert!(!entry.is_null());
        assert!(engine.codegen().stats().versions_compiled >= 1);
        assert!(engine.codegen().stats().bytes_emitted > 0);
        // entry code installed on the record and registered
        assert_eq!(engine.vm().fun(id).entry_code.get(), entry);
        assert_eq!(engine.codegen().registry().get(id), Some(entry));
    }

    #[test]
    fn test_compile_is_idempotent() {
        let mut engine = JitEngine::with_defaults().unwrap();
        let mut fun = IRFunction::new("f", 1);
        let p = fun.param_val(0);
        {
            let mut b = IRBuilder::new(&mut fun);
            let s = b.emit(crate::ir::instr::Opcode::AddI32, vec![b.val(p), b.int32(1)]);
            b.ret(b.val(s));
        }
        let id = engine.vm_mut().add_fun(fun);
        let a = engine.compile(id).unwrap();
        let before = engine.codegen().stats().versions_compiled;
        let b = engine.compile(id).unwrap();
        assert_eq!(a, b);
        assert_eq!(engine.codegen().stats().versions_compiled, before);
    }

    #[test]
    fn test_typeprop_pass_derives_tags() {
        let mut fun = IRFunction::new("f", 1);
        let p = fun.param_val(0);
        let out = {
            let mut b = IRBuilder::new(&mut fun);
            let s = b.emit(crate::ir::instr::Opcode::AddI32, vec![b.val(p), b.int32(1)]);
            b.ret(b.val(s));
            s
        };
        let map = compute_typeprop(&fun);
        assert_eq!(map.get(&out), Some(&TypeTag::Int32));
        assert_eq!(map.get(&p), None);
    }
}
