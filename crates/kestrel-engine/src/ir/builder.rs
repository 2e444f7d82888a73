//! IR construction helpers
//!
//! Used by tests and by the host-installed primitive registry to build IR
//! functions programmatically. Tracks definition sites so the `has_uses`
//! flag on producing instructions stays accurate.

use rustc_hash::FxHashMap;

use super::instr::{
    BlockId, IRArg, IRConst, IRFunction, IRInstr, Opcode, ValueId,
};

/// Builder with a current-block cursor
pub struct IRBuilder<'a> {
    fun: &'a mut IRFunction,
    cur: BlockId,
    def_sites: FxHashMap<ValueId, (BlockId, usize)>,
}

impl<'a> IRBuilder<'a> {
    /// Create a builder over `fun`, adding an entry block if it has none
    pub fn new(fun: &'a mut IRFunction) -> Self {
        if fun.blocks.is_empty() {
            let entry = fun.add_block(Some("entry".to_string()));
            fun.entry = entry;
        }
        let cur = fun.entry;
        IRBuilder {
            fun,
            cur,
            def_sites: FxHashMap::default(),
        }
    }

    /// Create a new block
    pub fn block(&mut self, name: &str) -> BlockId {
        self.fun.add_block(Some(name.to_string()))
    }

    /// Switch the cursor to `block`
    pub fn switch_to(&mut self, block: BlockId) {
        self.cur = block;
    }

    /// The block under the cursor
    pub fn current_block(&self) -> BlockId {
        self.cur
    }

    /// Access the function being built
    pub fn fun(&self) -> &IRFunction {
        self.fun
    }

    /// Emit an instruction with explicit targets; returns the produced
    /// value for value-producing opcodes
    pub fn emit_full(
        &mut self,
        op: Opcode,
        args: Vec<IRArg>,
        targets: [Option<BlockId>; 2],
        produces: bool,
    ) -> Option<ValueId> {
        // Mark used values on their defining instructions
        for arg in &args {
            if let IRArg::Val(v) = arg {
                if let Some(&(block, idx)) = self.def_sites.get(v) {
                    self.fun.block_mut(block).instrs[idx].has_uses = true;
                }
            }
        }

        let out = if produces {
            Some(self.fun.alloc_value())
        } else {
            None
        };
        let instr = IRInstr {
            op,
            args,
            out,
            targets,
            has_uses: false,
        };
        let block = self.cur;
        let idx = self.fun.block(block).instrs.len();
        self.fun.block_mut(block).instrs.push(instr);
        if let Some(v) = out {
            self.def_sites.insert(v, (block, idx));
        }
        out
    }

    /// Emit a straight-line value-producing instruction
    pub fn emit(&mut self, op: Opcode, args: Vec<IRArg>) -> ValueId {
        self.emit_full(op, args, [None, None], true)
            .expect("opcode produces a value")
    }

    /// Emit a straight-line effect-only instruction
    pub fn emit_effect(&mut self, op: Opcode, args: Vec<IRArg>) {
        self.emit_full(op, args, [None, None], false);
    }

    /// Wrap a value id as an argument
    pub fn val(&self, v: ValueId) -> IRArg {
        IRArg::Val(v)
    }

    /// Int32 constant argument
    pub fn int32(&self, i: i32) -> IRArg {
        IRArg::Const(IRConst::Int32(i))
    }

    /// Float64 constant argument
    pub fn float64(&self, f: f64) -> IRArg {
        IRArg::Const(IRConst::Float64(f))
    }

    /// String constant argument
    pub fn string(&self, s: &str) -> IRArg {
        IRArg::Const(IRConst::Str(s.into()))
    }

    /// Boolean constant argument
    pub fn boolean(&self, b: bool) -> IRArg {
        IRArg::Const(if b { IRConst::True } else { IRConst::False })
    }

    /// The undefined constant
    pub fn undef(&self) -> IRArg {
        IRArg::Const(IRConst::Undef)
    }

    /// Unconditional jump to `target`
    pub fn jump(&mut self, target: BlockId) {
        self.emit_full(Opcode::Jump, vec![], [Some(target), None], false);
    }

    /// Conditional branch: `on_true` if `cond` is the true constant
    pub fn if_true(&mut self, cond: ValueId, on_true: BlockId, on_false: BlockId) {
        self.emit_full(
            Opcode::IfTrue,
            vec![IRArg::Val(cond)],
            [Some(on_true), Some(on_false)],
            false,
        );
    }

    /// Return `arg` from the function
    pub fn ret(&mut self, arg: IRArg) {
        self.emit_full(Opcode::Ret, vec![arg], [None, None], false);
    }

    /// Overflow-checked int32 op branching to `ok` / `ovf`
    pub fn arith_ovf(
        &mut self,
        op: Opcode,
        lhs: IRArg,
        rhs: IRArg,
        ok: BlockId,
        ovf: BlockId,
    ) -> ValueId {
        self.emit_full(op, vec![lhs, rhs], [Some(ok), Some(ovf)], true)
            .expect("overflow arithmetic produces a value")
    }

    /// Call of a named host-installed primitive, continuing at `cont`
    pub fn call_prim(
        &mut self,
        name: &str,
        args: Vec<IRArg>,
        cont: BlockId,
        exc: Option<BlockId>,
    ) -> ValueId {
        let mut all = vec![self.string(name)];
        all.extend(args);
        self.emit_full(Opcode::CallPrim, all, [Some(cont), exc], true)
            .expect("call produces a value")
    }

    /// Generic closure call, continuing at `cont`
    pub fn call(
        &mut self,
        clos: IRArg,
        this: IRArg,
        args: Vec<IRArg>,
        cont: BlockId,
        exc: Option<BlockId>,
    ) -> ValueId {
        let mut all = vec![clos, this];
        all.extend(args);
        self.emit_full(Opcode::Call, all, [Some(cont), exc], true)
            .expect("call produces a value")
    }
}
