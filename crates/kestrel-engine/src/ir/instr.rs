//! IR instructions, blocks, and functions
//!
//! The linear single-assignment IR consumed by the code generator. Every
//! value has a fixed home slot in its function's stack frame; instructions
//! reference values or constants and carry up to two branch targets
//! (fall-through / overflow / exception edges).

use std::cell::Cell;
use std::rc::Rc;

use super::types::TypeTag;

/// IR value identifier, dense per function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

impl std::fmt::Display for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Basic block identifier, dense per function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Function identifier in the VM's function arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunId(pub u32);

/// Link-table placeholder constant. The cell starts unallocated and the
/// code generator assigns a link-table index on first use.
#[derive(Debug, Clone)]
pub struct LinkIdx(Rc<Cell<u32>>);

/// Sentinel for a link placeholder that has not been allocated yet
pub const LINK_NONE: u32 = u32::MAX;

impl LinkIdx {
    /// Fresh unallocated placeholder
    pub fn new() -> Self {
        LinkIdx(Rc::new(Cell::new(LINK_NONE)))
    }

    /// The allocated index, if any
    pub fn get(&self) -> Option<u32> {
        let idx = self.0.get();
        if idx == LINK_NONE {
            None
        } else {
            Some(idx)
        }
    }

    /// Record the allocated index
    pub fn set(&self, idx: u32) {
        debug_assert!(idx != LINK_NONE);
        self.0.set(idx);
    }
}

impl Default for LinkIdx {
    fn default() -> Self {
        Self::new()
    }
}

/// IR constant operand
#[derive(Debug, Clone)]
pub enum IRConst {
    /// 32-bit signed integer
    Int32(i32),
    /// 64-bit float
    Float64(f64),
    /// Boolean true
    True,
    /// Boolean false
    False,
    /// The null value
    Null,
    /// The undefined value
    Undef,
    /// Interned string literal
    Str(Rc<str>),
    /// Reference to an IR function
    Fun(FunId),
    /// Link-table placeholder
    Link(LinkIdx),
}

impl IRConst {
    /// The dynamic tag of this constant, if it is value-like.
    /// `Str` is `String` after interning; `Fun` has no tag of its own
    /// (it lowers to the function record pointer).
    pub fn tag(&self) -> Option<TypeTag> {
        match self {
            IRConst::Int32(_) => Some(TypeTag::Int32),
            IRConst::Float64(_) => Some(TypeTag::Float64),
            IRConst::True | IRConst::False | IRConst::Null | IRConst::Undef => {
                Some(TypeTag::Const)
            }
            IRConst::Str(_) => Some(TypeTag::String),
            IRConst::Fun(_) => None,
            IRConst::Link(_) => None,
        }
    }
}

/// An instruction argument: a value reference or a constant
#[derive(Debug, Clone)]
pub enum IRArg {
    /// Reference to the value produced by another instruction or a parameter
    Val(ValueId),
    /// Inline constant
    Const(IRConst),
}

/// IR opcodes, one lowering generator per variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Opcode {
    // int32 arithmetic
    AddI32,
    SubI32,
    MulI32,
    AndI32,
    OrI32,
    XorI32,
    NotI32,
    AddI32Ovf,
    SubI32Ovf,
    MulI32Ovf,
    DivI32,
    ModI32,
    LsftI32,
    RsftI32,
    UrsftI32,

    // float64 arithmetic
    AddF64,
    SubF64,
    MulF64,
    DivF64,
    SinF64,
    CosF64,
    SqrtF64,
    CeilF64,
    FloorF64,
    LogF64,
    ExpF64,
    PowF64,
    ModF64,
    I32ToF64,
    F64ToI32,

    // memory
    LoadU8,
    LoadU16,
    LoadU32,
    LoadU64,
    LoadI8,
    LoadI16,
    LoadF64,
    LoadRefPtr,
    LoadRawPtr,
    LoadFunPtr,
    LoadShapePtr,
    StoreU8,
    StoreU16,
    StoreU32,
    StoreU64,
    StoreF64,

    // type tests
    IsI32,
    IsI64,
    IsF64,
    IsConst,
    IsRawPtr,
    IsRefPtr,
    IsObject,
    IsArray,
    IsClosure,
    IsString,
    IsShapePtr,

    // comparisons
    EqI8,
    EqI32,
    NeI32,
    LtI32,
    LeI32,
    GtI32,
    GeI32,
    EqI64,
    EqConst,
    EqF64,
    NeF64,
    LtF64,
    LeF64,
    GtF64,
    GeF64,

    // control
    Jump,
    IfTrue,
    Move,

    // calls
    CallPrim,
    Call,
    CallApply,
    Ret,
    Throw,

    // heap allocation
    AllocObject,
    AllocArray,
    AllocClosure,
    AllocString,
    GcCollect,

    // closures
    NewClos,
    ClosSetCell,
    ClosGetCell,
    MakeCell,

    // shape-based property access
    ShapeGetDef,
    ShapeSetProp,
    ShapeGetProp,
    ShapeDefConst,
    ShapeSetAttrs,
    ShapeParent,
    ShapePropName,
    ShapeGetAttrs,

    // link table and interning
    GetLink,
    SetLink,
    GetStr,

    // misc host services
    GetTimeMs,
    LoadFile,
    EvalStr,

    // FFI
    LoadLib,
    CloseLib,
    GetSym,
    CallFfi,
}

impl Opcode {
    /// Lowercase mnemonic used by the IR printer
    pub fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            AddI32 => "add_i32",
            SubI32 => "sub_i32",
            MulI32 => "mul_i32",
            AndI32 => "and_i32",
            OrI32 => "or_i32",
            XorI32 => "xor_i32",
            NotI32 => "not_i32",
            AddI32Ovf => "add_i32_ovf",
            SubI32Ovf => "sub_i32_ovf",
            MulI32Ovf => "mul_i32_ovf",
            DivI32 => "div_i32",
            ModI32 => "mod_i32",
            LsftI32 => "lsft_i32",
            RsftI32 => "rsft_i32",
            UrsftI32 => "ursft_i32",
            AddF64 => "add_f64",
            SubF64 => "sub_f64",
            MulF64 => "mul_f64",
            DivF64 => "div_f64",
            SinF64 => "sin_f64",
            CosF64 => "cos_f64",
            SqrtF64 => "sqrt_f64",
            CeilF64 => "ceil_f64",
            FloorF64 => "floor_f64",
            LogF64 => "log_f64",
            ExpF64 => "exp_f64",
            PowF64 => "pow_f64",
            ModF64 => "mod_f64",
            I32ToF64 => "i32_to_f64",
            F64ToI32 => "f64_to_i32",
            LoadU8 => "load_u8",
            LoadU16 => "load_u16",
            LoadU32 => "load_u32",
            LoadU64 => "load_u64",
            LoadI8 => "load_i8",
            LoadI16 => "load_i16",
            LoadF64 => "load_f64",
            LoadRefPtr => "load_refptr",
            LoadRawPtr => "load_rawptr",
            LoadFunPtr => "load_funptr",
            LoadShapePtr => "load_shapeptr",
            StoreU8 => "store_u8",
            StoreU16 => "store_u16",
            StoreU32 => "store_u32",
            StoreU64 => "store_u64",
            StoreF64 => "store_f64",
            IsI32 => "is_i32",
            IsI64 => "is_i64",
            IsF64 => "is_f64",
            IsConst => "is_const",
            IsRawPtr => "is_rawptr",
            IsRefPtr => "is_refptr",
            IsObject => "is_object",
            IsArray => "is_array",
            IsClosure => "is_closure",
            IsString => "is_string",
            IsShapePtr => "is_shapeptr",
            EqI8 => "eq_i8",
            EqI32 => "eq_i32",
            NeI32 => "ne_i32",
            LtI32 => "lt_i32",
            LeI32 => "le_i32",
            GtI32 => "gt_i32",
            GeI32 => "ge_i32",
            EqI64 => "eq_i64",
            EqConst => "eq_const",
            EqF64 => "eq_f64",
            NeF64 => "ne_f64",
            LtF64 => "lt_f64",
            LeF64 => "le_f64",
            GtF64 => "gt_f64",
            GeF64 => "ge_f64",
            Jump => "jump",
            IfTrue => "if_true",
            Move => "move",
            CallPrim => "call_prim",
            Call => "call",
            CallApply => "call_apply",
            Ret => "ret",
            Throw => "throw",
            AllocObject => "alloc_object",
            AllocArray => "alloc_array",
            AllocClosure => "alloc_closure",
            AllocString => "alloc_string",
            GcCollect => "gc_collect",
            NewClos => "new_clos",
            ClosSetCell => "clos_set_cell",
            ClosGetCell => "clos_get_cell",
            MakeCell => "make_cell",
            ShapeGetDef => "shape_get_def",
            ShapeSetProp => "shape_set_prop",
            ShapeGetProp => "shape_get_prop",
            ShapeDefConst => "shape_def_const",
            ShapeSetAttrs => "shape_set_attrs",
            ShapeParent => "shape_parent",
            ShapePropName => "shape_prop_name",
            ShapeGetAttrs => "shape_get_attrs",
            GetLink => "get_link",
            SetLink => "set_link",
            GetStr => "get_str",
            GetTimeMs => "get_time_ms",
            LoadFile => "load_file",
            EvalStr => "eval_str",
            LoadLib => "load_lib",
            CloseLib => "close_lib",
            GetSym => "get_sym",
            CallFfi => "call_ffi",
        }
    }

    /// Statically-known output tag, where the opcode fixes it
    pub fn out_tag(self) -> Option<TypeTag> {
        use Opcode::*;
        match self {
            AddI32 | SubI32 | MulI32 | AndI32 | OrI32 | XorI32 | NotI32 | AddI32Ovf
            | SubI32Ovf | MulI32Ovf | DivI32 | ModI32 | LsftI32 | RsftI32 | UrsftI32
            | F64ToI32 | LoadU8 | LoadU16 | LoadU32 | LoadI8 | LoadI16 => Some(TypeTag::Int32),
            LoadU64 => Some(TypeTag::Int64),
            AddF64 | SubF64 | MulF64 | DivF64 | SinF64 | CosF64 | SqrtF64 | CeilF64
            | FloorF64 | LogF64 | ExpF64 | PowF64 | ModF64 | I32ToF64 | LoadF64 | GetTimeMs => {
                Some(TypeTag::Float64)
            }
            LoadRefPtr => Some(TypeTag::RefPtr),
            LoadRawPtr | GetSym => Some(TypeTag::RawPtr),
            LoadFunPtr => Some(TypeTag::FunPtr),
            LoadShapePtr | ShapeGetDef | ShapeParent => Some(TypeTag::ShapePtr),
            IsI32 | IsI64 | IsF64 | IsConst | IsRawPtr | IsRefPtr | IsObject | IsArray
            | IsClosure | IsString | IsShapePtr | EqI8 | EqI32 | NeI32 | LtI32 | LeI32
            | GtI32 | GeI32 | EqI64 | EqConst | EqF64 | NeF64 | LtF64 | LeF64 | GtF64
            | GeF64 => Some(TypeTag::Const),
            AllocObject => Some(TypeTag::Object),
            AllocArray => Some(TypeTag::Array),
            AllocClosure | NewClos => Some(TypeTag::Closure),
            AllocString | ShapePropName | GetStr => Some(TypeTag::String),
            MakeCell => Some(TypeTag::RefPtr),
            ShapeGetAttrs => Some(TypeTag::Int32),
            LoadLib => Some(TypeTag::RawPtr),
            _ => None,
        }
    }

    /// For type-test opcodes, the tag being tested
    pub fn tested_tag(self) -> Option<TypeTag> {
        use Opcode::*;
        match self {
            IsI32 => Some(TypeTag::Int32),
            IsI64 => Some(TypeTag::Int64),
            IsF64 => Some(TypeTag::Float64),
            IsConst => Some(TypeTag::Const),
            IsRawPtr => Some(TypeTag::RawPtr),
            IsRefPtr => Some(TypeTag::RefPtr),
            IsObject => Some(TypeTag::Object),
            IsArray => Some(TypeTag::Array),
            IsClosure => Some(TypeTag::Closure),
            IsString => Some(TypeTag::String),
            IsShapePtr => Some(TypeTag::ShapePtr),
            _ => None,
        }
    }

    /// Whether this opcode terminates its block
    pub fn is_terminator(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Jump | IfTrue | AddI32Ovf | SubI32Ovf | MulI32Ovf | Ret | Throw
                | Call | CallPrim | CallApply | LoadFile | EvalStr
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One IR instruction
#[derive(Debug, Clone)]
pub struct IRInstr {
    /// The opcode
    pub op: Opcode,
    /// Ordered arguments
    pub args: Vec<IRArg>,
    /// The produced value, if the instruction has one
    pub out: Option<ValueId>,
    /// Branch targets: `[0]` is the fall-through / no-overflow / normal
    /// continuation, `[1]` the overflow or exception edge
    pub targets: [Option<BlockId>; 2],
    /// Whether any later instruction uses the produced value
    pub has_uses: bool,
}

impl IRInstr {
    /// The value referenced by argument `idx`, if it is a value reference
    pub fn arg_val(&self, idx: usize) -> Option<ValueId> {
        match self.args.get(idx) {
            Some(IRArg::Val(v)) => Some(*v),
            _ => None,
        }
    }

    /// The constant in argument `idx`, if it is a constant
    pub fn arg_const(&self, idx: usize) -> Option<&IRConst> {
        match self.args.get(idx) {
            Some(IRArg::Const(c)) => Some(c),
            _ => None,
        }
    }

    /// The string constant in argument `idx` (primitive names, FFI
    /// signatures, property names)
    pub fn arg_str(&self, idx: usize) -> Option<&Rc<str>> {
        match self.arg_const(idx) {
            Some(IRConst::Str(s)) => Some(s),
            _ => None,
        }
    }
}

/// A basic block: a straight-line run of instructions ending in a terminator
#[derive(Debug, Clone)]
pub struct IRBlock {
    /// Block id, equal to its index in the function
    pub id: BlockId,
    /// Optional label for the printer
    pub name: Option<String>,
    /// The instructions; the last one must satisfy `Opcode::is_terminator`
    pub instrs: Vec<IRInstr>,
}

/// Per-value metadata: the home slot in the stack frame
#[derive(Debug, Clone, Copy)]
pub struct ValueInfo {
    /// Fixed stack slot index in the owning function's frame
    pub slot: u32,
}

/// Number of hidden header slots at the bottom of every frame:
/// return address, closure, `this`, argument count
pub const FRAME_HDR_SLOTS: u32 = 4;

/// Slot of the saved return address
pub const RA_SLOT: u32 = 0;
/// Slot of the callee closure
pub const CLOS_SLOT: u32 = 1;
/// Slot of the `this` value
pub const THIS_SLOT: u32 = 2;
/// Slot of the argument count
pub const ARGC_SLOT: u32 = 3;

/// An IR function: the JIT-visible header fields come first and at fixed
/// offsets, because emitted code jumps through `entry_code` and reads
/// `num_params` / `num_locals` when building frames for dynamic callees.
#[repr(C)]
#[derive(Debug)]
pub struct IRFunction {
    /// Native entry point. Starts as the lazy-compilation stub; replaced
    /// with the realized entry version.
    pub entry_code: Cell<*const u8>,
    /// Number of declared formals
    pub num_params: u32,
    /// Total frame slots: header + formals + locals/temps
    pub num_locals: u32,
    /// Function name, for diagnostics
    pub name: String,
    /// Basic blocks; `BlockId` indexes this vector
    pub blocks: Vec<IRBlock>,
    /// Per-value home slots; `ValueId` indexes this vector
    pub values: Vec<ValueInfo>,
    /// The entry block
    pub entry: BlockId,
    /// Fixed-arity callee (host-installed primitive): the return sequence
    /// skips the extra-argument computation
    pub fixed_arity: bool,
}

/// Byte offset of `entry_code` inside `IRFunction`
pub const FUN_ENTRY_OFS: i32 = 0;
/// Byte offset of `num_params` inside `IRFunction`
pub const FUN_NUM_PARAMS_OFS: i32 = 8;
/// Byte offset of `num_locals` inside `IRFunction`
pub const FUN_NUM_LOCALS_OFS: i32 = 12;

impl IRFunction {
    /// Create a function with its parameter values pre-allocated.
    /// Values 0..3+num_params are: closure, this, argc, then the formals.
    pub fn new(name: impl Into<String>, num_params: u32) -> Self {
        let mut values = vec![
            ValueInfo { slot: CLOS_SLOT },
            ValueInfo { slot: THIS_SLOT },
            ValueInfo { slot: ARGC_SLOT },
        ];
        for i in 0..num_params {
            values.push(ValueInfo {
                slot: FRAME_HDR_SLOTS + i,
            });
        }
        IRFunction {
            entry_code: Cell::new(std::ptr::null()),
            num_params,
            num_locals: FRAME_HDR_SLOTS + num_params,
            name: name.into(),
            blocks: vec![],
            values,
            entry: BlockId(0),
            fixed_arity: false,
        }
    }

    /// The closure parameter value
    pub fn clos_val(&self) -> ValueId {
        ValueId(0)
    }

    /// The `this` parameter value
    pub fn this_val(&self) -> ValueId {
        ValueId(1)
    }

    /// The argument-count parameter value
    pub fn argc_val(&self) -> ValueId {
        ValueId(2)
    }

    /// The `idx`-th formal parameter value
    pub fn param_val(&self, idx: u32) -> ValueId {
        debug_assert!(idx < self.num_params);
        ValueId(3 + idx)
    }

    /// Allocate a fresh temporary value with its own frame slot
    pub fn alloc_value(&mut self) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueInfo {
            slot: self.num_locals,
        });
        self.num_locals += 1;
        id
    }

    /// Home slot of a value
    pub fn slot_of(&self, val: ValueId) -> u32 {
        self.values[val.0 as usize].slot
    }

    /// Append an empty block
    pub fn add_block(&mut self, name: Option<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(IRBlock {
            id,
            name,
            instrs: vec![],
        });
        id
    }

    /// Get a block by id
    pub fn block(&self, id: BlockId) -> &IRBlock {
        &self.blocks[id.0 as usize]
    }

    /// Get a mutable block by id
    pub fn block_mut(&mut self, id: BlockId) -> &mut IRBlock {
        &mut self.blocks[id.0 as usize]
    }

    /// Total instruction count, across blocks
    pub fn instr_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len()).sum()
    }
}

// Raw code pointers are only dereferenced by the executing thread; the
// compiler and the emitted code share one thread (cooperative model).
unsafe impl Send for IRFunction {}
