//! The two executable code arenas and the label machinery shared by the
//! instruction encoders in [x86_64].

use std::fmt;
use std::mem;

use crate::virtualmem::{CodePtr, VirtualMem, WriteError};

// Hand-aligned tables below; rustfmt would mangle them.
#[rustfmt::skip]
pub mod x86_64;

/// Handle for a label created with [CodeBlock::new_label]
#[derive(Clone, Copy, Debug)]
pub struct Label(usize);

/// Re-encodes a label reference once the label address is known. Receives
/// the address just past the reference, the label address, and the payload
/// byte the emitter stashed (eg: a condition code).
type LabelEncoder = fn(cb: &mut CodeBlock, end_addr: i64, label_addr: i64, payload: u8);

/// A forward or backward reference to a label, recorded at emission time
/// and patched by [CodeBlock::link_labels].
struct LabelRef {
    /// Position where the referencing instruction starts
    pos: usize,

    /// The label being referenced
    label: Label,

    /// Size of the reference in bytes. Patching must write back exactly
    /// this many bytes so surrounding code is untouched.
    num_bytes: usize,

    /// Extra byte the encoder needs, eg: a condition code
    payload: u8,

    encode: LabelEncoder,
}

/// One of the two growable executable buffers (inline or outlined).
/// Instructions are appended at `write_pos`; the cursor can be rewound to
/// patch previously emitted code, except below the frozen watermark.
pub struct CodeBlock {
    // Executable memory backing this arena
    mem: VirtualMem,

    // Total arena size in bytes
    capacity: usize,

    // Current write cursor
    write_pos: usize,

    // Anything below this offset has been patched by tracing invalidation
    // and may be executing on another thread, so it can never change again.
    frozen_bytes: usize,

    // Resolved label positions, if written yet
    label_addrs: Vec<Option<usize>>,

    // Label names, for debugging
    label_names: Vec<String>,

    // Label references waiting for link_labels()
    label_refs: Vec<LabelRef>,

    // Per-position assembly comments
    #[cfg(feature = "asm_comments")]
    comments: std::collections::BTreeMap<usize, Vec<String>>,

    // Set when an instruction could not be written out, either because the
    // arena is full or because a jump target was out of range.
    dropped_bytes: bool,
}

impl CodeBlock {
    pub fn new(mem: VirtualMem) -> Self {
        Self {
            capacity: mem.region_size(),
            mem,
            write_pos: 0,
            frozen_bytes: 0,
            label_addrs: Vec::new(),
            label_names: Vec::new(),
            label_refs: Vec::new(),
            #[cfg(feature = "asm_comments")]
            comments: std::collections::BTreeMap::new(),
            dropped_bytes: false,
        }
    }

    pub fn get_mem_size(&self) -> usize {
        self.capacity
    }

    pub fn get_write_pos(&self) -> usize {
        self.write_pos
    }

    /// True when at least `num_bytes` more can be written
    pub fn has_capacity(&self, num_bytes: usize) -> bool {
        self.write_pos + num_bytes < self.capacity
    }

    /// Move the write cursor. Out-of-bounds positions are accepted so a
    /// full arena can be restored after patching something in the middle.
    pub fn set_pos(&mut self, pos: usize) {
        self.write_pos = pos;
    }

    /// Move the write cursor to an absolute code address
    pub fn set_write_ptr(&mut self, code_ptr: CodePtr) {
        self.write_pos = code_ptr.into_usize() - self.mem.start_ptr().into_usize();
    }

    /// Get a (possibly dangling) pointer to an offset in the arena
    pub fn get_ptr(&self, offset: usize) -> CodePtr {
        self.mem.start_ptr().add_bytes(offset)
    }

    /// Get a (possibly dangling) pointer to the write cursor
    pub fn get_write_ptr(&self) -> CodePtr {
        self.get_ptr(self.write_pos)
    }

    /// Patch a single byte at an absolute address, without moving the cursor
    pub fn write_mem(&mut self, write_ptr: CodePtr, byte: u8) -> Result<(), WriteError> {
        self.mem.write_byte(write_ptr, byte)
    }

    /// Append one byte at the write cursor
    pub fn write_byte(&mut self, byte: u8) {
        // Frozen code may be executing on other threads without
        // synchronization, so writes below the watermark are rejected.
        if self.write_pos < self.frozen_bytes {
            self.dropped_bytes = true;
            return;
        }

        let write_ptr = self.get_write_ptr();
        if self.has_capacity(1) && self.mem.write_byte(write_ptr, byte).is_ok() {
            self.write_pos += 1;
        } else {
            self.dropped_bytes = true;
        }
    }

    /// Append a byte slice at the write cursor
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.write_byte(*byte);
        }
    }

    /// Append the low `num_bits` of an integer, little-endian
    pub fn write_int(&mut self, val: u64, num_bits: u32) {
        debug_assert!(num_bits > 0 && num_bits % 8 == 0 && num_bits <= 64);
        let le_bytes = val.to_le_bytes();
        self.write_bytes(&le_bytes[..(num_bits as usize / 8)]);
    }

    /// Advance the cursor to the next multiple of `alignment`, measured
    /// from the start of the address space
    pub fn align_pos(&mut self, alignment: usize) {
        let addr = self.get_write_ptr().into_usize();
        let rem = addr % alignment;
        if rem != 0 {
            self.write_pos += alignment - rem;
        }
    }

    pub fn has_dropped_bytes(&self) -> bool {
        self.dropped_bytes
    }

    pub fn set_dropped_bytes(&mut self, dropped_bytes: bool) {
        self.dropped_bytes = dropped_bytes;
    }

    /// The monotically growing prefix of the arena that may never change again
    pub fn get_frozen_bytes(&self) -> usize {
        self.frozen_bytes
    }

    /// Raise the frozen watermark. It only ever moves forward.
    pub fn set_frozen_bytes(&mut self, frozen_bytes: usize) {
        assert!(
            frozen_bytes >= self.frozen_bytes,
            "frozen bytes should increase monotonically"
        );
        assert!(frozen_bytes <= self.write_pos);
        self.frozen_bytes = frozen_bytes;
    }

    /// Allocate a label. Its address is unknown until write_label().
    pub fn new_label(&mut self, name: &str) -> Label {
        assert!(!name.contains(' '), "use underscores in label names, not spaces");

        self.label_addrs.push(None);
        self.label_names.push(name.to_string());
        Label(self.label_addrs.len() - 1)
    }

    /// Pin a label to the current write position
    pub fn write_label(&mut self, label: Label) {
        self.label_addrs[label.0] = Some(self.write_pos);
    }

    /// Record a fixed-size reference to a label at the current position and
    /// skip over it. The encoder runs when the labels are linked.
    pub fn label_ref(&mut self, label: Label, num_bytes: usize, payload: u8, encode: LabelEncoder) {
        assert!(label.0 < self.label_addrs.len());

        self.label_refs.push(LabelRef {
            pos: self.write_pos,
            label,
            num_bytes,
            payload,
            encode,
        });

        if self.has_capacity(num_bytes) {
            self.write_pos += num_bytes;
        } else {
            self.dropped_bytes = true;
        }
    }

    /// Resolve every pending label reference, then forget all labels.
    /// References may point forwards or backwards.
    pub fn link_labels(&mut self) {
        let end_pos = self.write_pos;

        for label_ref in mem::take(&mut self.label_refs) {
            let referenced = self.label_addrs[label_ref.label.0]
                .unwrap_or_else(|| panic!("unplaced label: {}", self.label_names[label_ref.label.0]));
            assert!(label_ref.pos < self.capacity);
            assert!(referenced < self.capacity);

            self.set_pos(label_ref.pos);
            let ref_end = (label_ref.pos + label_ref.num_bytes) as i64;
            (label_ref.encode)(self, ref_end, referenced as i64, label_ref.payload);

            // The patch must fill the reference exactly
            assert!(self.write_pos == label_ref.pos + label_ref.num_bytes);
        }

        self.write_pos = end_pos;
        self.label_addrs.clear();
        self.label_names.clear();
    }

    /// Record a comment against the current position when the feature is on
    #[cfg(feature = "asm_comments")]
    pub fn add_comment(&mut self, comment: &str) {
        let cur_ptr = self.get_write_ptr().into_usize();
        let line_comments = self.comments.entry(cur_ptr).or_default();

        // Skip duplicates, which can happen when code gets regenerated
        if line_comments.last().map(String::as_str) != Some(comment) {
            line_comments.push(comment.to_string());
        }
    }
    #[cfg(not(feature = "asm_comments"))]
    #[inline]
    pub fn add_comment(&mut self, _: &str) {}

    #[cfg(feature = "asm_comments")]
    pub fn comments_at(&self, pos: usize) -> Option<&Vec<String>> {
        self.comments.get(&pos)
    }

    pub fn mark_all_executable(&mut self) {
        self.mem.mark_all_executable();
    }
}

#[cfg(test)]
impl CodeBlock {
    /// Arena backed by plain heap memory for testing. The generated code
    /// can be inspected but not executed.
    pub fn new_dummy(mem_size: usize) -> Self {
        use crate::virtualmem::tests::TestingAllocator;
        use crate::virtualmem::VirtualMemory;
        use std::ptr::NonNull;

        let alloc = TestingAllocator::new(mem_size);
        let mem_start = NonNull::new(alloc.mem_start() as *mut u8).unwrap();
        Self::new(VirtualMemory::new(alloc, 1, mem_start, mem_size))
    }
}

/// Hex dump of everything emitted so far, for test assertions
impl fmt::LowerHex for CodeBlock {
    fn fmt(&self, fmtr: &mut fmt::Formatter) -> fmt::Result {
        for pos in 0..self.write_pos {
            let byte = unsafe { self.get_ptr(pos).raw_ptr().read() };
            write!(fmtr, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Newtype wrapper so the type system keeps the inlined and outlined
/// arenas apart
pub struct OutlinedCb {
    // Kept private so every write goes through the watermark check
    cb: CodeBlock,
}

impl OutlinedCb {
    pub fn wrap(cb: CodeBlock) -> Self {
        OutlinedCb { cb: cb }
    }

    pub fn unwrap(&mut self) -> &mut CodeBlock {
        &mut self.cb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_rewind() {
        let mut cb = CodeBlock::new_dummy(64);
        cb.write_bytes(&[0x90, 0x90, 0x90]);
        assert_eq!(cb.get_write_pos(), 3);

        // Patch the middle byte, then restore the cursor
        let end = cb.get_write_pos();
        cb.set_pos(1);
        cb.write_byte(0xcc);
        cb.set_pos(end);
        assert_eq!(format!("{:x}", cb), "90cc90");
    }

    #[test]
    fn test_write_int_widths() {
        let mut cb = CodeBlock::new_dummy(64);
        cb.write_int(0x11, 8);
        cb.write_int(0x2233, 16);
        cb.write_int(-2i64 as u64, 32);
        assert_eq!(format!("{:x}", cb), "113322feffffff");
    }

    #[test]
    fn test_label_payload() {
        let mut cb = CodeBlock::new_dummy(64);
        let target = cb.new_label("target");
        cb.write_label(target);

        // A fictional two-byte instruction: payload opcode plus a rel8
        cb.label_ref(target, 2, 0xeb, |cb, end, dst, payload| {
            cb.write_byte(payload);
            cb.write_int((dst - end) as u64, 8);
        });
        cb.link_labels();

        assert_eq!(format!("{:x}", cb), "ebfe");
    }

    #[test]
    fn test_frozen_bytes_reject_writes() {
        let mut cb = CodeBlock::new_dummy(64);
        cb.write_bytes(&[0x01, 0x02, 0x03, 0x04]);
        cb.set_frozen_bytes(4);

        // Rewinding into the frozen region drops the write
        cb.set_pos(2);
        cb.write_byte(0xff);
        assert!(cb.has_dropped_bytes());
        cb.set_pos(4);
        cb.set_dropped_bytes(false);

        // Writes at or above the watermark still land
        cb.write_byte(0x05);
        assert!(!cb.has_dropped_bytes());
        assert_eq!(format!("{:x}", cb), "0102030405");
    }

    #[test]
    #[should_panic]
    fn test_frozen_bytes_monotonic() {
        let mut cb = CodeBlock::new_dummy(64);
        cb.write_bytes(&[0x90; 8]);
        cb.set_frozen_bytes(8);
        cb.set_frozen_bytes(4);
    }
}
