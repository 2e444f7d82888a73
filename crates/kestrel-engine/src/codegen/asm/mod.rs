//! Code buffer and x86-64 encoder
//!
//! `CodeBlock` owns the executable code heap and the book-keeping the block
//! version manager relies on: labels with forward references for
//! intra-version jumps, and a reference table for branches whose target
//! version has not been emitted yet. The mnemonic-level emitters live in
//! `encoder`.

pub mod encoder;
pub mod regs;

use crate::runtime::exec_mem::{ExecMem, MapError};

/// Intra-version label handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

/// How a recorded reference rewrites its bytes once the target is known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// 4-byte displacement relative to the end of the field
    Rel32,
    /// 8-byte absolute address
    Abs64,
}

/// A reference from emitted code to a not-yet-emitted block version
#[derive(Debug, Clone, Copy)]
pub struct VersionRef {
    /// Target version index (assigned by the version manager)
    pub target: u32,
    /// Buffer position of the displacement/address field
    pub pos: usize,
    /// Patch kind
    pub kind: RefKind,
}

/// The code buffer
pub struct CodeBlock {
    mem: ExecMem,
    pos: usize,
    dropped: bool,
    labels: Vec<Option<usize>>,
    label_refs: Vec<(usize, Label)>,
    version_refs: Vec<VersionRef>,
}

impl CodeBlock {
    /// Allocate a code heap of `size` bytes
    pub fn new(size: usize) -> Result<Self, MapError> {
        Ok(CodeBlock {
            mem: ExecMem::new(size)?,
            pos: 0,
            dropped: false,
            labels: vec![],
            label_refs: vec![],
            version_refs: vec![],
        })
    }

    /// Current write position
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Base address of the heap
    pub fn base_ptr(&self) -> *const u8 {
        self.mem.as_ptr()
    }

    /// Address of a buffer position
    pub fn ptr_at(&self, pos: usize) -> *const u8 {
        debug_assert!(pos <= self.mem.size());
        unsafe { self.mem.as_ptr().add(pos) }
    }

    /// Whether emission overflowed the heap. Once set, writes are dropped;
    /// the caller reports `BufferOverflow` and aborts compilation.
    pub fn has_dropped_bytes(&self) -> bool {
        self.dropped
    }

    /// Emit one byte
    pub fn write_byte(&mut self, byte: u8) {
        if self.pos >= self.mem.size() {
            self.dropped = true;
            return;
        }
        self.mem.write_byte(self.pos, byte);
        self.pos += 1;
    }

    /// Emit a run of bytes
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.write_byte(*b);
        }
    }

    /// Emit a little-endian u32
    pub fn write_u32(&mut self, val: u32) {
        self.write_bytes(&val.to_le_bytes());
    }

    /// Emit a little-endian i32
    pub fn write_i32(&mut self, val: i32) {
        self.write_bytes(&val.to_le_bytes());
    }

    /// Emit a little-endian u64
    pub fn write_u64(&mut self, val: u64) {
        self.write_bytes(&val.to_le_bytes());
    }

    /// Overwrite a previously-emitted i32 field
    pub fn patch_i32(&mut self, pos: usize, val: i32) {
        for (i, b) in val.to_le_bytes().iter().enumerate() {
            self.mem.write_byte(pos + i, *b);
        }
    }

    /// Overwrite a previously-emitted u64 field
    pub fn patch_u64(&mut self, pos: usize, val: u64) {
        for (i, b) in val.to_le_bytes().iter().enumerate() {
            self.mem.write_byte(pos + i, *b);
        }
    }

    /// Read back a range (tests, disassembly dumps)
    pub fn bytes(&self, start: usize, end: usize) -> &[u8] {
        self.mem.slice(start, end)
    }

    // --- labels ---

    /// Create an unbound label
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(None);
        label
    }

    /// Bind `label` to the current position
    pub fn bind_label(&mut self, label: Label) {
        debug_assert!(self.labels[label.0 as usize].is_none(), "label bound twice");
        self.labels[label.0 as usize] = Some(self.pos);
    }

    /// Emit a 4-byte displacement field referring to `label`
    pub fn label_ref32(&mut self, label: Label) {
        self.label_refs.push((self.pos, label));
        self.write_i32(0);
    }

    /// Resolve all label references. Every referenced label must be bound;
    /// an unbound label is an emitter bug.
    pub fn link_labels(&mut self) {
        let refs = std::mem::take(&mut self.label_refs);
        for (pos, label) in refs {
            let target = self.labels[label.0 as usize]
                .unwrap_or_else(|| panic!("unbound label l{}", label.0));
            let disp = target as i64 - (pos as i64 + 4);
            self.patch_i32(pos, i32::try_from(disp).expect("label displacement overflow"));
        }
        self.labels.clear();
    }

    // --- inter-version references ---

    /// Record that the field at `pos` must be patched to the address of
    /// version `target` when it is realized
    pub fn record_ref(&mut self, target: u32, pos: usize, kind: RefKind) {
        self.version_refs.push(VersionRef { target, pos, kind });
    }

    /// Remove and return every pending reference to `target`
    pub fn take_refs_to(&mut self, target: u32) -> Vec<VersionRef> {
        let mut taken = vec![];
        self.version_refs.retain(|r| {
            if r.target == target {
                taken.push(*r);
                false
            } else {
                true
            }
        });
        taken
    }

    /// Pending reference count (patching-completeness checks)
    pub fn pending_ref_count(&self) -> usize {
        self.version_refs.len()
    }

    /// Patch one reference to point at buffer position `target_pos`
    pub fn patch_ref(&mut self, vref: &VersionRef, target_pos: usize) {
        match vref.kind {
            RefKind::Rel32 => {
                let disp = target_pos as i64 - (vref.pos as i64 + 4);
                self.patch_i32(
                    vref.pos,
                    i32::try_from(disp).expect("rel32 displacement overflow"),
                );
            }
            RefKind::Abs64 => {
                let addr = self.ptr_at(target_pos) as u64;
                self.patch_u64(vref.pos, addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_pos() {
        let mut cb = CodeBlock::new(64).unwrap();
        cb.write_byte(0x90);
        cb.write_u32(0xDEADBEEF);
        assert_eq!(cb.pos(), 5);
        assert_eq!(cb.bytes(0, 5), &[0x90, 0xEF, 0xBE, 0xAD, 0xDE]);
        assert!(!cb.has_dropped_bytes());
    }

    #[test]
    fn test_overflow_sets_dropped() {
        let mut cb = CodeBlock::new(4).unwrap();
        cb.write_u32(1);
        assert!(!cb.has_dropped_bytes());
        cb.write_byte(0x90);
        assert!(cb.has_dropped_bytes());
        assert_eq!(cb.pos(), 4);
    }

    #[test]
    fn test_label_linking() {
        let mut cb = CodeBlock::new(64).unwrap();
        let label = cb.new_label();
        // jmp-shaped: opcode byte then disp32
        cb.write_byte(0xE9);
        cb.label_ref32(label);
        cb.write_byte(0x90);
        cb.bind_label(label);
        cb.link_labels();
        // disp = 6 - (1 + 4) = 1
        assert_eq!(cb.bytes(1, 5), &1i32.to_le_bytes());
    }

    #[test]
    fn test_version_ref_patching() {
        let mut cb = CodeBlock::new(64).unwrap();
        cb.write_byte(0xE9);
        let field = cb.pos();
        cb.write_i32(0);
        cb.record_ref(3, field, RefKind::Rel32);
        cb.write_byte(0x90);

        let target_pos = cb.pos();
        let refs = cb.take_refs_to(3);
        assert_eq!(refs.len(), 1);
        for r in &refs {
            cb.patch_ref(r, target_pos);
        }
        assert_eq!(cb.pending_ref_count(), 0);
        // disp = 6 - (1 + 4) = 1
        assert_eq!(cb.bytes(1, 5), &1i32.to_le_bytes());
    }
}
