//! FFI support: dynamic library loading and call signatures
//!
//! `call_ffi` sites carry a signature string `"ret,arg0,arg1,…"` over the
//! token set `{i8,i16,i32,i64,u8,u16,u32,u64,f64,*,void}`. Libraries load
//! through `dlopen` with `RTLD_NOW | RTLD_LOCAL`.

use std::ffi::CString;
use std::os::raw::c_void;
use std::str::FromStr;

use thiserror::Error;

use crate::ir::types::TypeTag;

/// Errors from library loading and symbol resolution
#[derive(Debug, Error)]
pub enum LoadError {
    /// Library file not found or could not be loaded
    #[error("library not found: {path}")]
    NotFound {
        /// Path that was attempted
        path: String,
    },

    /// Symbol missing from the library
    #[error("symbol not found: {symbol}")]
    SymbolNotFound {
        /// Symbol name
        symbol: String,
    },

    /// Path contained an interior NUL
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

/// Open a shared library, returning the raw handle
#[cfg(unix)]
pub fn dlopen_raw(path: &str) -> Result<*mut c_void, LoadError> {
    let c_path =
        CString::new(path).map_err(|_| LoadError::InvalidPath(path.to_string()))?;
    let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
    if handle.is_null() {
        return Err(LoadError::NotFound {
            path: path.to_string(),
        });
    }
    Ok(handle)
}

/// Resolve a symbol from a raw handle
#[cfg(unix)]
pub fn dlsym_raw(handle: *mut c_void, symbol: &str) -> Result<*const c_void, LoadError> {
    let c_sym = CString::new(symbol)
        .map_err(|_| LoadError::InvalidPath(symbol.to_string()))?;
    let ptr = unsafe { libc::dlsym(handle, c_sym.as_ptr()) };
    if ptr.is_null() {
        return Err(LoadError::SymbolNotFound {
            symbol: symbol.to_string(),
        });
    }
    Ok(ptr)
}

/// Close a raw library handle; true on success
#[cfg(unix)]
pub fn dlclose_raw(handle: *mut c_void) -> bool {
    unsafe { libc::dlclose(handle) == 0 }
}

/// An owned library handle, for host-side (Rust) users
pub struct Library {
    handle: *mut c_void,
    path: String,
}

#[cfg(unix)]
impl Library {
    /// Load a library from `path`
    pub fn open(path: &str) -> Result<Library, LoadError> {
        Ok(Library {
            handle: dlopen_raw(path)?,
            path: path.to_string(),
        })
    }

    /// Resolve `symbol`
    pub fn sym(&self, symbol: &str) -> Result<*const c_void, LoadError> {
        dlsym_raw(self.handle, symbol)
    }

    /// The load path
    pub fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(unix)]
impl Drop for Library {
    fn drop(&mut self) {
        dlclose_raw(self.handle);
    }
}

/// One FFI type token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum FfiType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F64,
    Ptr,
    Void,
}

impl FfiType {
    fn parse(tok: &str) -> Option<FfiType> {
        Some(match tok {
            "i8" => FfiType::I8,
            "i16" => FfiType::I16,
            "i32" => FfiType::I32,
            "i64" => FfiType::I64,
            "u8" => FfiType::U8,
            "u16" => FfiType::U16,
            "u32" => FfiType::U32,
            "u64" => FfiType::U64,
            "f64" => FfiType::F64,
            "*" => FfiType::Ptr,
            "void" => FfiType::Void,
            _ => return None,
        })
    }

    /// Whether the value travels in an SSE register
    pub fn is_float(self) -> bool {
        self == FfiType::F64
    }

    /// Tag of the value produced when this is the return type
    pub fn return_tag(self) -> TypeTag {
        match self {
            FfiType::I64 | FfiType::U64 => TypeTag::Int64,
            FfiType::F64 => TypeTag::Float64,
            FfiType::Ptr => TypeTag::RawPtr,
            FfiType::Void => TypeTag::Const,
            _ => TypeTag::Int32,
        }
    }
}

/// Bad signature string
#[derive(Debug, Error)]
#[error("bad FFI signature: {0}")]
pub struct SigError(pub String);

/// Parsed FFI signature: return type then argument types
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfiSig {
    /// Return type
    pub ret: FfiType,
    /// Argument types, in call order
    pub args: Vec<FfiType>,
}

impl FromStr for FfiSig {
    type Err = SigError;

    fn from_str(s: &str) -> Result<FfiSig, SigError> {
        let mut toks = s.split(',');
        let ret = toks
            .next()
            .and_then(FfiType::parse)
            .ok_or_else(|| SigError(s.to_string()))?;
        let mut args = vec![];
        for tok in toks {
            let ty = FfiType::parse(tok).ok_or_else(|| SigError(s.to_string()))?;
            if ty == FfiType::Void {
                return Err(SigError(s.to_string()));
            }
            args.push(ty);
        }
        Ok(FfiSig { ret, args })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_sig() {
        let sig: FfiSig = "i32,i32,i32".parse().unwrap();
        assert_eq!(sig.ret, FfiType::I32);
        assert_eq!(sig.args, vec![FfiType::I32, FfiType::I32]);
    }

    #[test]
    fn test_parse_mixed_sig() {
        let sig: FfiSig = "f64,*,u8,f64".parse().unwrap();
        assert_eq!(sig.ret, FfiType::F64);
        assert_eq!(sig.args, vec![FfiType::Ptr, FfiType::U8, FfiType::F64]);
        assert!(sig.args[2].is_float());
    }

    #[test]
    fn test_parse_void_ret() {
        let sig: FfiSig = "void".parse().unwrap();
        assert_eq!(sig.ret, FfiType::Void);
        assert!(sig.args.is_empty());
        assert_eq!(sig.ret.return_tag(), TypeTag::Const);
    }

    #[test]
    fn test_reject_bad_sigs() {
        assert!("".parse::<FfiSig>().is_err());
        assert!("i32,banana".parse::<FfiSig>().is_err());
        // void is not a valid argument type
        assert!("i32,void".parse::<FfiSig>().is_err());
    }

    #[test]
    fn test_return_tags() {
        assert_eq!("i32".parse::<FfiSig>().unwrap().ret.return_tag(), TypeTag::Int32);
        assert_eq!("i64".parse::<FfiSig>().unwrap().ret.return_tag(), TypeTag::Int64);
        assert_eq!("*".parse::<FfiSig>().unwrap().ret.return_tag(), TypeTag::RawPtr);
    }

    #[cfg(unix)]
    #[test]
    fn test_dlopen_missing_library_fails() {
        assert!(Library::open("/nonexistent/libdefinitely_missing.so").is_err());
    }
}
