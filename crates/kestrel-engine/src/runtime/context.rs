//! VM context: stacks, heap arena, link table, function registry
//!
//! `VmContext` owns everything the emitted code touches at run time. Its
//! leading fields are `repr(C)` at fixed offsets because JIT code addresses
//! them directly off the reserved VM register: the bump-allocator pair, the
//! link-table base, and the saved stack pointers / return pair used by the
//! entry and exit trampolines and by host helpers that unwind or build
//! frames.

use rustc_hash::FxHashMap;

use crate::ir::instr::{FunId, IRFunction, ARGC_SLOT, CLOS_SLOT, RA_SLOT, THIS_SLOT};
use crate::ir::types::TypeTag;
use crate::runtime::value::{TaggedVal, Word, UNDEF_WORD};

/// One link-table cell: a word plus its tag, addressed by index
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct LinkCell {
    /// The stashed word
    pub word: u64,
    /// Its tag byte
    pub tag: u8,
    _pad: [u8; 7],
}

/// Size of a link cell in bytes (index scaling in emitted code)
pub const LINK_CELL_SIZE: i32 = 16;
/// Offset of the tag byte inside a cell
pub const LINK_TAG_OFS: i32 = 8;

// --- byte offsets of the JIT-visible VmContext header ---

/// `alloc_ptr`
pub const VM_ALLOC_PTR_OFS: i32 = 0;
/// `heap_limit`
pub const VM_HEAP_LIMIT_OFS: i32 = 8;
/// `link_base`
pub const VM_LINK_BASE_OFS: i32 = 16;
/// `wsp` (saved word-stack pointer)
pub const VM_WSP_OFS: i32 = 24;
/// `tsp` (saved type-stack pointer)
pub const VM_TSP_OFS: i32 = 32;
/// `ret_word`
pub const VM_RET_WORD_OFS: i32 = 40;
/// `ret_tag`
pub const VM_RET_TAG_OFS: i32 = 48;
/// `cur_fun` (function id of the frame that may throw next)
pub const VM_CUR_FUN_OFS: i32 = 52;

// --- heap object layouts (read by emitted fast paths) ---

/// Object: shape pointer
pub const OBJ_SHAPE_OFS: i32 = 0;
/// Object: inline slot capacity (u32)
pub const OBJ_CAP_OFS: i32 = 8;
/// Object: extension-table pointer (null when none)
pub const OBJ_NEXT_OFS: i32 = 16;
/// Object: first inline word slot; tag bytes follow the `cap` words
pub const OBJ_WORDS_OFS: i32 = 24;

/// Closure: IR function record pointer
pub const CLOS_FUN_OFS: i32 = 8;
/// Closure: capture-cell count (u32)
pub const CLOS_NCELLS_OFS: i32 = 16;
/// Closure: first capture-cell pointer slot
pub const CLOS_CELLS_OFS: i32 = 24;

/// Cell: the boxed word
pub const CELL_WORD_OFS: i32 = 0;
/// Cell: the boxed tag byte
pub const CELL_TAG_OFS: i32 = 8;
/// Cell allocation size
pub const CELL_SIZE: u64 = 16;

/// String: length in bytes (u32); data follows at +8
pub const STR_LEN_OFS: i32 = 0;
/// String: first data byte
pub const STR_DATA_OFS: i32 = 8;

/// Array: element count (u32)
pub const ARR_LEN_OFS: i32 = 8;
/// Array: first element word; tag bytes follow the `len` words
pub const ARR_WORDS_OFS: i32 = 16;

/// Shape record: parent shape pointer
pub const SHAPE_PARENT_OFS: i32 = 0;
/// Shape record: property-name string word
pub const SHAPE_NAME_OFS: i32 = 8;
/// Shape record: slot index (u32)
pub const SHAPE_SLOT_OFS: i32 = 16;
/// Shape record: attribute bits (u32)
pub const SHAPE_ATTRS_OFS: i32 = 20;
/// Shape allocation size
pub const SHAPE_SIZE: u64 = 24;

/// Frame metadata for one call site, keyed by its return address.
/// `throw_exc` walks these when unwinding.
#[derive(Debug, Clone, Copy)]
pub struct RetEntry {
    /// Function containing the call
    pub fun: FunId,
    /// Exception landing pad, when the call carries an exception edge
    pub exc_addr: Option<usize>,
}

/// The VM context
#[repr(C)]
pub struct VmContext {
    // JIT-visible header: field order is ABI
    /// Heap bump pointer
    pub alloc_ptr: *mut u8,
    /// Heap soft limit; the inline allocation fast path checks against this
    pub heap_limit: *mut u8,
    /// Link-table base pointer
    pub link_base: *mut LinkCell,
    /// Saved word-stack pointer (synced around host calls)
    pub wsp: *mut u64,
    /// Saved type-stack pointer
    pub tsp: *mut u8,
    /// Return / exception value word
    pub ret_word: u64,
    /// Return / exception value tag
    pub ret_tag: u8,
    /// Function id of the topmost frame, set by potentially-throwing call
    /// sites so the unwinder knows where to start
    pub cur_fun: u32,

    // host-side state
    heap: Vec<u8>,
    word_stack: Vec<u64>,
    type_stack: Vec<u8>,
    links: Vec<LinkCell>,
    strings: FxHashMap<String, u64>,
    funs: Vec<Box<IRFunction>>,
    prims: FxHashMap<String, FunId>,
    units: FxHashMap<String, FunId>,
    /// Return-address map for the unwinder
    pub ret_addr_map: FxHashMap<usize, RetEntry>,
    /// Set when an exception reached the top level
    pub unhandled: bool,
    /// Exit-stub address, the root frame's return target
    pub exit_code: *const u8,
    /// Exit stub that preserves the exception pair already in `ret_word` /
    /// `ret_tag`; the unwinder returns it when no frame catches
    pub exc_exit_code: *const u8,
    /// Back-pointer to the owning code generator, for lazy-compilation
    /// re-entry from emitted stubs
    pub engine: *mut u8,
    /// Host helper table embedded into emitted call sites
    pub host_fns: crate::runtime::host::HostFns,
}

/// Fixed link-table capacity; the base pointer is embedded in emitted code
/// and must never move
const LINK_CAPACITY: usize = 4096;

impl VmContext {
    /// Create a context with the given heap and stack sizes.
    /// `heap_size` is the soft limit; a slack region beyond it keeps the
    /// allocation fallback serviceable without a collector.
    pub fn new(heap_size: usize, stack_slots: usize) -> Box<VmContext> {
        let mut vm = Box::new(VmContext {
            alloc_ptr: std::ptr::null_mut(),
            heap_limit: std::ptr::null_mut(),
            link_base: std::ptr::null_mut(),
            wsp: std::ptr::null_mut(),
            tsp: std::ptr::null_mut(),
            ret_word: 0,
            ret_tag: 0,
            cur_fun: 0,
            heap: vec![0u8; heap_size + heap_size / 2 + 4096],
            word_stack: vec![0u64; stack_slots],
            type_stack: vec![0u8; stack_slots],
            links: Vec::with_capacity(LINK_CAPACITY),
            strings: FxHashMap::default(),
            funs: vec![],
            prims: FxHashMap::default(),
            units: FxHashMap::default(),
            ret_addr_map: FxHashMap::default(),
            unhandled: false,
            exit_code: std::ptr::null(),
            exc_exit_code: std::ptr::null(),
            engine: std::ptr::null_mut(),
            host_fns: *crate::runtime::host::HOST_FNS,
        });

        vm.alloc_ptr = vm.heap.as_mut_ptr();
        vm.heap_limit = unsafe { vm.heap.as_mut_ptr().add(heap_size) };
        vm.link_base = vm.links.as_mut_ptr();
        // empty stack: pointers one past the end
        vm.wsp = unsafe { vm.word_stack.as_mut_ptr().add(stack_slots) };
        vm.tsp = unsafe { vm.type_stack.as_mut_ptr().add(stack_slots) };
        vm
    }

    // --- heap ---

    /// Bump-allocate `size` bytes, 8-byte aligned. Ignores the soft limit;
    /// exhausting the backing arena is fatal (the collector is an external
    /// collaborator).
    pub fn heap_alloc(&mut self, size: u64) -> *mut u8 {
        let ptr = self.alloc_ptr;
        let end = unsafe { self.heap.as_mut_ptr().add(self.heap.len()) };
        let new_ptr = unsafe { ptr.add(size as usize) };
        let aligned = ((new_ptr as usize) + 7) & !7;
        assert!(aligned <= end as usize, "heap arena exhausted");
        self.alloc_ptr = aligned as *mut u8;
        ptr
    }

    /// Whether `ptr` points into the heap arena
    pub fn owns_heap_ptr(&self, ptr: *const u8) -> bool {
        let base = self.heap.as_ptr() as usize;
        let end = base + self.heap.len();
        (ptr as usize) >= base && (ptr as usize) < end
    }

    // --- strings ---

    /// Intern a string, returning the heap word of its string object
    pub fn intern_str(&mut self, s: &str) -> u64 {
        if let Some(&w) = self.strings.get(s) {
            return w;
        }
        let obj = self.heap_alloc(STR_DATA_OFS as u64 + s.len() as u64);
        unsafe {
            *(obj.offset(STR_LEN_OFS as isize) as *mut u32) = s.len() as u32;
            std::ptr::copy_nonoverlapping(
                s.as_ptr(),
                obj.offset(STR_DATA_OFS as isize),
                s.len(),
            );
        }
        let word = obj as u64;
        self.strings.insert(s.to_string(), word);
        word
    }

    /// Allocate an array object holding `elems`
    pub fn new_array(&mut self, elems: &[TaggedVal]) -> u64 {
        let len = elems.len();
        let size = ARR_WORDS_OFS as u64 + 9 * len as u64;
        let arr = self.heap_alloc(size);
        unsafe {
            *(arr.offset(ARR_LEN_OFS as isize) as *mut u32) = len as u32;
            let words = arr.offset(ARR_WORDS_OFS as isize) as *mut u64;
            let tags = (words as *mut u8).add(8 * len);
            for (i, v) in elems.iter().enumerate() {
                *words.add(i) = v.word.0;
                *tags.add(i) = v.tag as u8;
            }
        }
        arr as u64
    }

    /// Read an element of an array object
    pub fn array_elem(&self, arr: u64, idx: usize) -> TaggedVal {
        unsafe {
            let base = arr as usize as *const u8;
            let len = *(base.offset(ARR_LEN_OFS as isize) as *const u32) as usize;
            assert!(idx < len);
            let words = base.offset(ARR_WORDS_OFS as isize) as *const u64;
            let tags = (words as *const u8).add(8 * len);
            TaggedVal::new(Word(*words.add(idx)), tag_from_byte(*tags.add(idx)))
        }
    }

    /// Read back an interned string object
    pub fn read_str(&self, word: u64) -> String {
        unsafe {
            let ptr = word as usize as *const u8;
            let len = *(ptr.offset(STR_LEN_OFS as isize) as *const u32) as usize;
            let bytes = std::slice::from_raw_parts(ptr.offset(STR_DATA_OFS as isize), len);
            String::from_utf8_lossy(bytes).into_owned()
        }
    }

    // --- link table ---

    /// Allocate a fresh link-table cell, initially null
    pub fn alloc_link(&mut self) -> u32 {
        assert!(self.links.len() < LINK_CAPACITY, "link table full");
        let idx = self.links.len() as u32;
        self.links.push(LinkCell {
            word: crate::runtime::value::NULL_WORD,
            tag: TypeTag::Const as u8,
            _pad: [0; 7],
        });
        idx
    }

    /// Write a link cell
    pub fn set_link(&mut self, idx: u32, word: u64, tag: TypeTag) {
        let cell = &mut self.links[idx as usize];
        cell.word = word;
        cell.tag = tag as u8;
    }

    /// Read a link cell
    pub fn get_link(&self, idx: u32) -> (u64, TypeTag) {
        let cell = &self.links[idx as usize];
        (cell.word, tag_from_byte(cell.tag))
    }

    // --- functions ---

    /// Register an IR function, returning its id
    pub fn add_fun(&mut self, fun: IRFunction) -> FunId {
        let id = FunId(self.funs.len() as u32);
        self.funs.push(Box::new(fun));
        id
    }

    /// Look up a function
    pub fn fun(&self, id: FunId) -> &IRFunction {
        &self.funs[id.0 as usize]
    }

    /// Stable address of a function record (embedded in emitted code)
    pub fn fun_ptr(&self, id: FunId) -> *const IRFunction {
        &*self.funs[id.0 as usize] as *const IRFunction
    }

    /// Find the id of a function record by address
    pub fn fun_id_of(&self, ptr: *const IRFunction) -> Option<FunId> {
        self.funs
            .iter()
            .position(|f| &**f as *const IRFunction == ptr)
            .map(|i| FunId(i as u32))
    }

    /// Install a named primitive on the global object
    pub fn add_prim(&mut self, name: &str, mut fun: IRFunction) -> FunId {
        fun.fixed_arity = true;
        let id = self.add_fun(fun);
        self.prims.insert(name.to_string(), id);
        id
    }

    /// Resolve a named primitive at compile time
    pub fn resolve_prim(&self, name: &str) -> Option<FunId> {
        self.prims.get(name).copied()
    }

    /// Register a compilation unit for `load_file` / `eval_str`
    pub fn add_unit(&mut self, key: &str, fun: IRFunction) -> FunId {
        let id = self.add_fun(fun);
        self.units.insert(key.to_string(), id);
        id
    }

    /// Resolve a unit by source key
    pub fn resolve_unit(&self, key: &str) -> Option<FunId> {
        self.units.get(key).copied()
    }

    // --- stacks ---

    /// Base of the word stack (lowest address)
    pub fn word_stack_base(&self) -> *const u64 {
        self.word_stack.as_ptr()
    }

    /// Slots still free below the current word-stack pointer
    pub fn stack_space_left(&self) -> usize {
        let base = self.word_stack.as_ptr() as usize;
        ((self.wsp as usize) - base) / 8
    }

    /// Read frame slot `slot` of the current (topmost) frame
    pub fn frame_word(&self, slot: u32) -> u64 {
        unsafe { *self.wsp.add(slot as usize) }
    }

    /// Read the tag byte of frame slot `slot`
    pub fn frame_tag(&self, slot: u32) -> u8 {
        unsafe { *self.tsp.add(slot as usize) }
    }

    /// Push a frame for `fun` with the given call metadata and arguments.
    /// Missing formals are filled with `undefined`; extra arguments land
    /// above the fixed frame. Used by the host entry path and `call_apply`.
    pub fn push_frame(
        &mut self,
        fun: FunId,
        ra: *const u8,
        clos_word: u64,
        this: TaggedVal,
        args: &[TaggedVal],
    ) {
        let (num_params, num_locals) = {
            let f = self.fun(fun);
            (f.num_params, f.num_locals)
        };
        let argc = args.len() as u32;
        let extra = argc.saturating_sub(num_params);
        let total = (num_locals + extra) as usize;
        assert!(self.stack_space_left() >= total, "stack overflow");

        self.wsp = unsafe { self.wsp.sub(total) };
        self.tsp = unsafe { self.tsp.sub(total) };

        let write = |vm: &mut VmContext, slot: u32, word: u64, tag: TypeTag| unsafe {
            *vm.wsp.add(slot as usize) = word;
            *vm.tsp.add(slot as usize) = tag as u8;
        };

        write(self, RA_SLOT, ra as u64, TypeTag::RawPtr);
        write(self, CLOS_SLOT, clos_word, TypeTag::Closure);
        write(self, THIS_SLOT, this.word.0, this.tag);
        write(self, ARGC_SLOT, argc as u64, TypeTag::Int32);
        for i in 0..num_params {
            match args.get(i as usize) {
                Some(v) => write(self, 4 + i, v.word.0, v.tag),
                None => write(self, 4 + i, UNDEF_WORD, TypeTag::Const),
            }
        }
        // extra args above the frame, continuing the formal ordering
        for k in num_params..argc {
            let v = args[k as usize];
            write(self, num_locals + (k - num_params), v.word.0, v.tag);
        }
    }

    /// The return pair most recently stored by the exit stub or unwinder
    pub fn return_value(&self) -> TaggedVal {
        TaggedVal::new(Word(self.ret_word), tag_from_byte(self.ret_tag))
    }
}

/// Decode a tag byte back into a `TypeTag`
pub fn tag_from_byte(byte: u8) -> TypeTag {
    TypeTag::ALL
        .get(byte as usize)
        .copied()
        .unwrap_or_else(|| panic!("bad type tag byte: {}", byte))
}
