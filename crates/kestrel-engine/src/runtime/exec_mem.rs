//! Executable memory for the code heap
//!
//! One fixed-size RWX mapping per engine. Reference patching rewrites bytes
//! in ranges that have not executed yet; the VM is single-threaded, so no
//! writer can race an executing thread.

use thiserror::Error;

/// Mapping failure
#[derive(Debug, Error)]
pub enum MapError {
    /// The OS refused the mapping
    #[error("executable mapping of {size} bytes failed: {errno}")]
    MapFailed {
        /// Requested size
        size: usize,
        /// OS errno
        errno: i32,
    },
}

/// An owned run of executable memory
pub struct ExecMem {
    ptr: *mut u8,
    size: usize,
}

#[cfg(unix)]
impl ExecMem {
    /// Map `size` bytes readable, writable, and executable
    pub fn new(size: usize) -> Result<Self, MapError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MapError::MapFailed {
                size,
                errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
            });
        }
        Ok(ExecMem {
            ptr: ptr as *mut u8,
            size,
        })
    }
}

#[cfg(not(unix))]
impl ExecMem {
    /// Fallback heap allocation: code can be generated and inspected but
    /// not executed on this platform
    pub fn new(size: usize) -> Result<Self, MapError> {
        let mut buf = vec![0u8; size].into_boxed_slice();
        let ptr = buf.as_mut_ptr();
        std::mem::forget(buf);
        Ok(ExecMem { ptr, size })
    }
}

impl ExecMem {
    /// Base pointer
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Mutable base pointer
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    /// Mapping size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Read one byte
    pub fn read_byte(&self, pos: usize) -> u8 {
        assert!(pos < self.size);
        unsafe { *self.ptr.add(pos) }
    }

    /// Write one byte
    pub fn write_byte(&mut self, pos: usize, byte: u8) {
        assert!(pos < self.size);
        unsafe {
            *self.ptr.add(pos) = byte;
        }
    }

    /// View a range as a slice
    pub fn slice(&self, start: usize, end: usize) -> &[u8] {
        assert!(start <= end && end <= self.size);
        unsafe { std::slice::from_raw_parts(self.ptr.add(start), end - start) }
    }
}

impl Drop for ExecMem {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
        #[cfg(not(unix))]
        unsafe {
            drop(Box::from_raw(std::slice::from_raw_parts_mut(
                self.ptr, self.size,
            )));
        }
    }
}

// The mapping is owned; the single-threaded engine is the only writer.
unsafe impl Send for ExecMem {}
