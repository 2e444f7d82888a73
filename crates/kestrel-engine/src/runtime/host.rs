//! Host helpers callable from emitted code
//!
//! C-ABI functions the JIT brackets with `save_jit_regs` / `load_jit_regs`:
//! heap allocation, string interning, the shape-based property runtime, the
//! exception unwinder, closures, FFI library loading, and the
//! lazy-compilation re-entry points. The addresses are collected in
//! `HostFns`, which call sites embed as 64-bit immediates.

use once_cell::sync::Lazy;

use crate::ir::instr::{FunId, IRFunction, ARGC_SLOT, RA_SLOT};
use crate::ir::types::TypeTag;
use crate::runtime::context::{
    tag_from_byte, VmContext, ARR_LEN_OFS, ARR_WORDS_OFS, CELL_SIZE, CLOS_CELLS_OFS,
    CLOS_FUN_OFS, CLOS_NCELLS_OFS, OBJ_CAP_OFS, OBJ_NEXT_OFS, OBJ_SHAPE_OFS, OBJ_WORDS_OFS,
    SHAPE_ATTRS_OFS, SHAPE_NAME_OFS, SHAPE_PARENT_OFS, SHAPE_SIZE, SHAPE_SLOT_OFS,
};
use crate::runtime::value::{TaggedVal, Word, UNDEF_WORD};

/// Table of host helper addresses, embedded into emitted call sites
#[derive(Debug, Clone, Copy)]
#[allow(missing_docs)]
pub struct HostFns {
    pub heap_alloc: unsafe extern "C" fn(*mut VmContext, u64) -> *mut u8,
    pub gc_collect: unsafe extern "C" fn(*mut VmContext, u64),
    pub get_str: unsafe extern "C" fn(*mut VmContext, u64) -> u64,
    pub throw_exc: unsafe extern "C" fn(*mut VmContext, u64, u8) -> *const u8,
    pub shape_get_def: unsafe extern "C" fn(*mut VmContext, u64, u64) -> u64,
    pub shape_set_prop: unsafe extern "C" fn(*mut VmContext, u64, u64, u64, u8) -> u64,
    pub shape_def_const: unsafe extern "C" fn(*mut VmContext, u64, u64, u64, u8) -> u64,
    pub shape_set_attrs: unsafe extern "C" fn(*mut VmContext, u64, u32),
    pub shape_parent: unsafe extern "C" fn(*mut VmContext, u64) -> u64,
    pub shape_prop_name: unsafe extern "C" fn(*mut VmContext, u64) -> u64,
    pub shape_get_attrs: unsafe extern "C" fn(*mut VmContext, u64) -> u32,
    pub new_clos: unsafe extern "C" fn(*mut VmContext, *const IRFunction, u32) -> u64,
    pub make_cell: unsafe extern "C" fn(*mut VmContext) -> u64,
    pub call_apply:
        unsafe extern "C" fn(*mut VmContext, *const u8, u64, u64, u8, u64) -> *const u8,
    pub load_file: unsafe extern "C" fn(*mut VmContext, *const u8, u64) -> *const u8,
    pub eval_str: unsafe extern "C" fn(*mut VmContext, *const u8, u64) -> *const u8,
    pub get_time_ms: unsafe extern "C" fn() -> f64,
    pub load_lib: unsafe extern "C" fn(*mut VmContext, u64) -> u64,
    pub close_lib: unsafe extern "C" fn(*mut VmContext, u64) -> u64,
    pub get_sym: unsafe extern "C" fn(*mut VmContext, u64, u64) -> u64,
    pub compile_entry: unsafe extern "C" fn(*mut VmContext, *const IRFunction) -> *const u8,
    pub compile_stub: unsafe extern "C" fn(*mut VmContext, u32) -> *const u8,
    pub sin: unsafe extern "C" fn(f64) -> f64,
    pub cos: unsafe extern "C" fn(f64) -> f64,
    pub sqrt: unsafe extern "C" fn(f64) -> f64,
    pub ceil: unsafe extern "C" fn(f64) -> f64,
    pub floor: unsafe extern "C" fn(f64) -> f64,
    pub log: unsafe extern "C" fn(f64) -> f64,
    pub exp: unsafe extern "C" fn(f64) -> f64,
    pub pow: unsafe extern "C" fn(f64, f64) -> f64,
    pub fmod: unsafe extern "C" fn(f64, f64) -> f64,
}

/// Process-wide helper table; contexts copy it at construction
pub static HOST_FNS: Lazy<HostFns> = Lazy::new(HostFns::table);

impl HostFns {
    /// The default helper table
    pub fn table() -> HostFns {
        HostFns {
            heap_alloc: host_heap_alloc,
            gc_collect: host_gc_collect,
            get_str: host_get_str,
            throw_exc: host_throw_exc,
            shape_get_def: host_shape_get_def,
            shape_set_prop: host_shape_set_prop,
            shape_def_const: host_shape_def_const,
            shape_set_attrs: host_shape_set_attrs,
            shape_parent: host_shape_parent,
            shape_prop_name: host_shape_prop_name,
            shape_get_attrs: host_shape_get_attrs,
            new_clos: host_new_clos,
            make_cell: host_make_cell,
            call_apply: host_call_apply,
            load_file: host_load_file,
            eval_str: host_eval_str,
            get_time_ms: host_get_time_ms,
            load_lib: host_load_lib,
            close_lib: host_close_lib,
            get_sym: host_get_sym,
            compile_entry: host_compile_entry,
            compile_stub: host_compile_stub,
            sin: host_sin,
            cos: host_cos,
            sqrt: host_sqrt,
            ceil: host_ceil,
            floor: host_floor,
            log: host_log,
            exp: host_exp,
            pow: host_pow,
            fmod: host_fmod,
        }
    }
}

// --- allocation ---

unsafe extern "C" fn host_heap_alloc(vm: *mut VmContext, size: u64) -> *mut u8 {
    let vm = &mut *vm;
    tracing::trace!(size, "allocation fallback");
    vm.heap_alloc(size)
}

unsafe extern "C" fn host_gc_collect(vm: *mut VmContext, size: u64) {
    // The collector is an external collaborator; the arena keeps slack
    // beyond the soft limit so fallback allocations stay serviceable.
    let vm = &mut *vm;
    let _ = (vm, size);
    tracing::debug!(size, "gc_collect requested");
}

// --- strings ---

unsafe extern "C" fn host_get_str(vm: *mut VmContext, str_w: u64) -> u64 {
    let vm = &mut *vm;
    let s = vm.read_str(str_w);
    vm.intern_str(&s)
}

// --- exceptions ---

/// Unwind JIT frames looking for the nearest exception edge. Leaves the
/// exception pair in `ret_word`/`ret_tag` and the stacks positioned at the
/// handler's frame. Returns the handler landing pad, or the exit stub with
/// `unhandled` set when no frame catches.
unsafe extern "C" fn host_throw_exc(vm: *mut VmContext, word: u64, tag: u8) -> *const u8 {
    let vm = &mut *vm;
    vm.ret_word = word;
    vm.ret_tag = tag;
    let mut cur_fun = FunId(vm.cur_fun);
    loop {
        let ra = vm.frame_word(RA_SLOT) as usize;
        let (num_params, num_locals) = {
            let f = vm.fun(cur_fun);
            (f.num_params, f.num_locals)
        };
        let argc = vm.frame_word(ARGC_SLOT) as u32;
        let extra = argc.saturating_sub(num_params);
        let total = (num_locals + extra) as usize;
        vm.wsp = vm.wsp.add(total);
        vm.tsp = vm.tsp.add(total);

        match vm.ret_addr_map.get(&ra).copied() {
            None => {
                // only the root frame returns outside the map
                vm.unhandled = true;
                return vm.exc_exit_code;
            }
            Some(entry) => {
                if let Some(pad) = entry.exc_addr {
                    vm.cur_fun = entry.fun.0;
                    return pad as *const u8;
                }
                cur_fun = entry.fun;
            }
        }
    }
}

// --- shapes ---

unsafe fn read_u64(base: u64, ofs: i32) -> u64 {
    *((base as usize as *const u8).offset(ofs as isize) as *const u64)
}

unsafe fn write_u64(base: u64, ofs: i32, val: u64) {
    *((base as usize as *mut u8).offset(ofs as isize) as *mut u64) = val;
}

unsafe fn read_u32(base: u64, ofs: i32) -> u32 {
    *((base as usize as *const u8).offset(ofs as isize) as *const u32)
}

unsafe fn write_u32(base: u64, ofs: i32, val: u32) {
    *((base as usize as *mut u8).offset(ofs as isize) as *mut u32) = val;
}

/// Walk the shape chain of `obj_w` for the shape defining `name_w`
unsafe fn find_shape(obj_w: u64, name_w: u64) -> u64 {
    let mut shape = read_u64(obj_w, OBJ_SHAPE_OFS);
    while shape != 0 {
        if read_u64(shape, SHAPE_NAME_OFS) == name_w {
            return shape;
        }
        shape = read_u64(shape, SHAPE_PARENT_OFS);
    }
    0
}

unsafe fn chain_len(obj_w: u64) -> u32 {
    let mut n = 0;
    let mut shape = read_u64(obj_w, OBJ_SHAPE_OFS);
    while shape != 0 {
        n += 1;
        shape = read_u64(shape, SHAPE_PARENT_OFS);
    }
    n
}

unsafe extern "C" fn host_shape_get_def(vm: *mut VmContext, obj_w: u64, name_w: u64) -> u64 {
    let vm = &mut *vm;
    // property names are interned, so identity comparison suffices
    let name = {
        let s = vm.read_str(name_w);
        vm.intern_str(&s)
    };
    find_shape(obj_w, name)
}

/// Write a property value; extends the hidden class when the name is new.
/// Returns the defining shape.
unsafe extern "C" fn host_shape_set_prop(
    vm: *mut VmContext,
    obj_w: u64,
    name_w: u64,
    val_w: u64,
    val_tag: u8,
) -> u64 {
    let vm = &mut *vm;
    let mut shape = find_shape(obj_w, name_w);
    if shape == 0 {
        let new_shape = vm.heap_alloc(SHAPE_SIZE) as u64;
        write_u64(new_shape, SHAPE_PARENT_OFS, read_u64(obj_w, OBJ_SHAPE_OFS));
        write_u64(new_shape, SHAPE_NAME_OFS, name_w);
        write_u32(new_shape, SHAPE_SLOT_OFS, chain_len(obj_w));
        write_u32(new_shape, SHAPE_ATTRS_OFS, 0);
        write_u64(obj_w, OBJ_SHAPE_OFS, new_shape);
        shape = new_shape;
    }

    let idx = read_u32(shape, SHAPE_SLOT_OFS);
    let cap = read_u32(obj_w, OBJ_CAP_OFS);
    if idx < cap {
        write_u64(obj_w, OBJ_WORDS_OFS + 8 * idx as i32, val_w);
        let tags = obj_w + OBJ_WORDS_OFS as u64 + 8 * cap as u64;
        *((tags + idx as u64) as usize as *mut u8) = val_tag;
    } else {
        let mut ext = read_u64(obj_w, OBJ_NEXT_OFS);
        let ext_cap = if ext != 0 { read_u32(ext, OBJ_CAP_OFS) } else { 0 };
        if ext == 0 || ext_cap <= idx {
            let new_cap = idx + 4;
            let new_ext =
                vm.heap_alloc(OBJ_WORDS_OFS as u64 + 9 * new_cap as u64) as u64;
            write_u64(new_ext, OBJ_SHAPE_OFS, 0);
            write_u32(new_ext, OBJ_CAP_OFS, new_cap);
            write_u64(new_ext, OBJ_NEXT_OFS, 0);
            for i in 0..ext_cap {
                let w = read_u64(ext, OBJ_WORDS_OFS + 8 * i as i32);
                write_u64(new_ext, OBJ_WORDS_OFS + 8 * i as i32, w);
                let t = *((ext + OBJ_WORDS_OFS as u64 + 8 * ext_cap as u64 + i as u64)
                    as usize as *const u8);
                *((new_ext + OBJ_WORDS_OFS as u64 + 8 * new_cap as u64 + i as u64)
                    as usize as *mut u8) = t;
            }
            write_u64(obj_w, OBJ_NEXT_OFS, new_ext);
            ext = new_ext;
        }
        let ext_cap = read_u32(ext, OBJ_CAP_OFS);
        write_u64(ext, OBJ_WORDS_OFS + 8 * idx as i32, val_w);
        *((ext + OBJ_WORDS_OFS as u64 + 8 * ext_cap as u64 + idx as u64) as usize
            as *mut u8) = val_tag;
    }
    shape
}

unsafe extern "C" fn host_shape_def_const(
    vm: *mut VmContext,
    obj_w: u64,
    name_w: u64,
    val_w: u64,
    val_tag: u8,
) -> u64 {
    // constant properties share the set path with the non-writable bit
    let shape = host_shape_set_prop(vm, obj_w, name_w, val_w, val_tag);
    write_u32(shape, SHAPE_ATTRS_OFS, 1);
    shape
}

unsafe extern "C" fn host_shape_set_attrs(_vm: *mut VmContext, shape_w: u64, attrs: u32) {
    write_u32(shape_w, SHAPE_ATTRS_OFS, attrs);
}

unsafe extern "C" fn host_shape_parent(_vm: *mut VmContext, shape_w: u64) -> u64 {
    read_u64(shape_w, SHAPE_PARENT_OFS)
}

unsafe extern "C" fn host_shape_prop_name(_vm: *mut VmContext, shape_w: u64) -> u64 {
    read_u64(shape_w, SHAPE_NAME_OFS)
}

unsafe extern "C" fn host_shape_get_attrs(_vm: *mut VmContext, shape_w: u64) -> u32 {
    read_u32(shape_w, SHAPE_ATTRS_OFS)
}

// --- closures ---

unsafe extern "C" fn host_new_clos(
    vm: *mut VmContext,
    fun: *const IRFunction,
    num_cells: u32,
) -> u64 {
    let vm = &mut *vm;
    let size = CLOS_CELLS_OFS as u64 + 8 * num_cells as u64;
    let clos = vm.heap_alloc(size) as u64;
    write_u64(clos, OBJ_SHAPE_OFS, 0);
    write_u64(clos, CLOS_FUN_OFS, fun as u64);
    write_u32(clos, CLOS_NCELLS_OFS, num_cells);
    for i in 0..num_cells {
        write_u64(clos, CLOS_CELLS_OFS + 8 * i as i32, 0);
    }
    clos
}

unsafe extern "C" fn host_make_cell(vm: *mut VmContext) -> u64 {
    let vm = &mut *vm;
    let cell = vm.heap_alloc(CELL_SIZE) as u64;
    write_u64(cell, 0, UNDEF_WORD);
    *((cell + 8) as usize as *mut u8) = TypeTag::Const as u8;
    cell
}

// --- lazy compilation re-entry ---

/// Entry code of `fun_id`, compiling it first if necessary
unsafe fn ensure_entry(vm: &mut VmContext, fun_id: FunId) -> *const u8 {
    let code = vm.fun(fun_id).entry_code.get();
    if !code.is_null() {
        return code;
    }
    let engine = vm.engine as *mut crate::codegen::CodeGen;
    assert!(!engine.is_null(), "no code generator attached");
    (*engine)
        .compile_fun(&mut *(vm as *mut VmContext), fun_id)
        .expect("lazy function compilation failed")
}

unsafe extern "C" fn host_compile_entry(
    vm: *mut VmContext,
    fun: *const IRFunction,
) -> *const u8 {
    let vm = &mut *vm;
    let fun_id = vm
        .fun_id_of(fun)
        .expect("entry stub for unregistered function");
    tracing::debug!(fun = %(*fun).name, "compiling on first entry");
    ensure_entry(vm, fun_id)
}

unsafe extern "C" fn host_compile_stub(vm: *mut VmContext, stub_id: u32) -> *const u8 {
    let vm = &mut *vm;
    let engine = vm.engine as *mut crate::codegen::CodeGen;
    assert!(!engine.is_null(), "no code generator attached");
    (*engine)
        .compile_continuation(&mut *(vm as *mut VmContext), stub_id)
        .expect("continuation compilation failed")
}

// --- frame-building helpers ---

unsafe extern "C" fn host_call_apply(
    vm: *mut VmContext,
    ra: *const u8,
    clos_w: u64,
    this_w: u64,
    this_tag: u8,
    arr_w: u64,
) -> *const u8 {
    let vm = &mut *vm;
    let fun_ptr = read_u64(clos_w, CLOS_FUN_OFS) as *const IRFunction;
    let fun_id = vm
        .fun_id_of(fun_ptr)
        .expect("closure references unregistered function");

    let len = read_u32(arr_w, ARR_LEN_OFS) as usize;
    let words = (arr_w + ARR_WORDS_OFS as u64) as usize as *const u64;
    let tags = (words as *const u8).add(8 * len);
    let mut args = Vec::with_capacity(len);
    for i in 0..len {
        args.push(TaggedVal::new(
            Word(*words.add(i)),
            tag_from_byte(*tags.add(i)),
        ));
    }

    let this = TaggedVal::new(Word(this_w), tag_from_byte(this_tag));
    vm.push_frame(fun_id, ra, clos_w, this, &args);
    ensure_entry(vm, fun_id)
}

unsafe fn enter_unit(vm: &mut VmContext, ra: *const u8, key: &str, what: &str) -> *const u8 {
    match vm.resolve_unit(key) {
        Some(fun_id) => {
            vm.push_frame(fun_id, ra, 0, TaggedVal::undef(), &[]);
            ensure_entry(vm, fun_id)
        }
        None => {
            let msg = vm.intern_str(&format!("RuntimeError: cannot {} {:?}", what, key));
            host_throw_exc(vm as *mut VmContext, msg, TypeTag::String as u8)
        }
    }
}

unsafe extern "C" fn host_load_file(
    vm: *mut VmContext,
    ra: *const u8,
    path_w: u64,
) -> *const u8 {
    let vm = &mut *vm;
    let path = vm.read_str(path_w);
    enter_unit(vm, ra, &path, "load")
}

unsafe extern "C" fn host_eval_str(
    vm: *mut VmContext,
    ra: *const u8,
    src_w: u64,
) -> *const u8 {
    let vm = &mut *vm;
    let src = vm.read_str(src_w);
    enter_unit(vm, ra, &src, "eval")
}

// --- misc services ---

unsafe extern "C" fn host_get_time_ms() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64() * 1000.0,
        Err(_) => 0.0,
    }
}

// --- FFI ---

#[cfg(unix)]
unsafe extern "C" fn host_load_lib(vm: *mut VmContext, path_w: u64) -> u64 {
    let vm = &mut *vm;
    let path = vm.read_str(path_w);
    match crate::runtime::ffi::dlopen_raw(&path) {
        Ok(handle) => handle as u64,
        Err(_) => 0,
    }
}

#[cfg(not(unix))]
unsafe extern "C" fn host_load_lib(_vm: *mut VmContext, _path_w: u64) -> u64 {
    0
}

#[cfg(unix)]
unsafe extern "C" fn host_close_lib(_vm: *mut VmContext, handle: u64) -> u64 {
    if handle == 0 || !crate::runtime::ffi::dlclose_raw(handle as usize as *mut _) {
        1
    } else {
        0
    }
}

#[cfg(not(unix))]
unsafe extern "C" fn host_close_lib(_vm: *mut VmContext, _handle: u64) -> u64 {
    1
}

#[cfg(unix)]
unsafe extern "C" fn host_get_sym(vm: *mut VmContext, handle: u64, name_w: u64) -> u64 {
    let vm = &mut *vm;
    let name = vm.read_str(name_w);
    match crate::runtime::ffi::dlsym_raw(handle as usize as *mut _, &name) {
        Ok(ptr) => ptr as u64,
        Err(_) => 0,
    }
}

#[cfg(not(unix))]
unsafe extern "C" fn host_get_sym(_vm: *mut VmContext, _handle: u64, _name_w: u64) -> u64 {
    0
}

// --- float math, routed through the host per the float op table ---

unsafe extern "C" fn host_sin(x: f64) -> f64 {
    x.sin()
}

unsafe extern "C" fn host_cos(x: f64) -> f64 {
    x.cos()
}

unsafe extern "C" fn host_sqrt(x: f64) -> f64 {
    x.sqrt()
}

unsafe extern "C" fn host_ceil(x: f64) -> f64 {
    x.ceil()
}

unsafe extern "C" fn host_floor(x: f64) -> f64 {
    x.floor()
}

unsafe extern "C" fn host_log(x: f64) -> f64 {
    x.ln()
}

unsafe extern "C" fn host_exp(x: f64) -> f64 {
    x.exp()
}

unsafe extern "C" fn host_pow(x: f64, y: f64) -> f64 {
    x.powf(y)
}

unsafe extern "C" fn host_fmod(x: f64, y: f64) -> f64 {
    x % y
}
