//! Runtime surface the emitted code touches
//!
//! The VM context (stacks, heap arena, link table, function registry), the
//! word/tag value representation, executable memory, the C-ABI host helper
//! table, and FFI library loading.

pub mod context;
pub mod exec_mem;
pub mod ffi;
pub mod host;
pub mod value;

pub use context::{VmContext, RetEntry};
pub use exec_mem::ExecMem;
pub use ffi::{FfiSig, FfiType, Library, LoadError};
pub use host::HostFns;
pub use value::{TaggedVal, Word};
