//! Registry of compiled function entry points
//!
//! Maps function ids to their realized entry code behind a read-write
//! lock, so the host re-entry paths (entry stubs, `call_apply`, unit
//! loading) can consult it without exclusive access to the code
//! generator. Entries are never removed; a function's code lives for the
//! process.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::ir::instr::FunId;

/// Thread-safe table of function entry points
pub struct CodeRegistry {
    entries: RwLock<FxHashMap<FunId, usize>>,
}

impl CodeRegistry {
    /// Empty registry
    pub fn new() -> CodeRegistry {
        CodeRegistry {
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    /// Record the entry code of a compiled function
    pub fn insert(&self, fun: FunId, entry: *const u8) {
        self.entries.write().insert(fun, entry as usize);
    }

    /// Entry code of `fun`, if it has been compiled
    pub fn get(&self, fun: FunId) -> Option<*const u8> {
        self.entries.read().get(&fun).map(|p| *p as *const u8)
    }

    /// Whether `fun` has been compiled
    pub fn contains(&self, fun: FunId) -> bool {
        self.entries.read().contains_key(&fun)
    }

    /// Number of compiled functions
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing has been compiled yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
