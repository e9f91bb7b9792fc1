//! Virtual memory management for the code arenas.
//!
//! Address space for an arena is reserved up front and backed by physical
//! pages on demand, so unused arena capacity costs no memory. On Linux the
//! reservation is an `mmap` with `PROT_NONE` and committing is `mprotect`
//! with `PROT_READ|PROT_WRITE`.
//!
//! W^X is handled semi-automatically: writing makes the touched page
//! writable, and a [VirtualMemory::mark_all_executable] call at the end of
//! a write session flips the whole mapped range back to executable.

use std::ptr::NonNull;

use crate::utils::IntoUsize;

#[cfg(not(test))]
pub type VirtualMem = VirtualMemory<sys::SystemAllocator>;

#[cfg(test)]
pub type VirtualMem = VirtualMemory<tests::TestingAllocator>;

/// The two memory-protection syscalls the region needs, plus page release
/// for completeness. Grouped behind a trait so tests can run against plain
/// heap memory.
pub trait PageAllocator {
    #[must_use]
    fn make_writable(&mut self, ptr: *const u8, size: u32) -> bool;

    fn make_executable(&mut self, ptr: *const u8, size: u32);

    fn release(&mut self, ptr: *const u8, size: u32) -> bool;
}

/// A reserved span of address space with on-demand physical backing
pub struct VirtualMemory<A: PageAllocator> {
    /// First address of the reservation
    start: NonNull<u8>,

    /// Total reserved bytes
    size_bytes: usize,

    /// Protection granularity. Must match the system page size.
    page_bytes: usize,

    /// How much of the reservation has physical backing, from the start
    committed_bytes: usize,

    /// Page currently open for writing, as an absolute page-aligned
    /// address. Tracked to avoid one mprotect per byte written.
    writable_page: Option<usize>,

    /// Syscall provider. Zero-sized in production; owns the backing
    /// buffer in tests.
    allocator: A,
}

/// Pointer into a [VirtualMemory] region.
/// There is no null CodePtr; use Option<CodePtr> when absence is possible.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(C, packed)]
pub struct CodePtr(NonNull<u8>);

/// Ways a write into the region can fail
#[derive(Debug, PartialEq)]
pub enum WriteError {
    OutOfBounds,
    FailedPageMapping,
}

impl<A: PageAllocator> VirtualMemory<A> {
    /// Bring a reserved span of address space under management
    pub fn new(allocator: A, page_size: u32, start: NonNull<u8>, size_bytes: usize) -> Self {
        assert_ne!(0, page_size);

        Self {
            start,
            size_bytes,
            page_bytes: page_size.as_usize(),
            committed_bytes: 0,
            writable_page: None,
            allocator,
        }
    }

    /// First address of the region. May be dangling if nothing has been
    /// written yet; dereference with care.
    pub fn start_ptr(&self) -> CodePtr {
        CodePtr(self.start)
    }

    /// Total size of the reservation in bytes
    pub fn region_size(&self) -> usize {
        self.size_bytes
    }

    /// Write one byte, committing and unprotecting pages as required
    pub fn write_byte(&mut self, write_ptr: CodePtr, byte: u8) -> Result<(), WriteError> {
        let addr = write_ptr.into_usize();
        let page_addr = addr - (addr % self.page_bytes);

        // Fast path: the target page is already open for writing
        if self.writable_page != Some(page_addr) {
            self.open_page_for_writing(addr, page_addr)?;
        }

        unsafe { (addr as *mut u8).write(byte) };
        Ok(())
    }

    /// Slow path of [Self::write_byte]: flip protection on a committed
    /// page, or commit everything up to and including the target page.
    fn open_page_for_writing(&mut self, addr: usize, page_addr: usize) -> Result<(), WriteError> {
        let start = self.start.as_ptr() as usize;
        let committed_end = start + self.committed_bytes;
        let region_end = start + self.size_bytes;

        if !(start..region_end).contains(&addr) {
            return Err(WriteError::OutOfBounds);
        }

        if addr < committed_end {
            // Already backed by memory, just make the one page writable
            let page_size: u32 = self.page_bytes.try_into().unwrap();
            if !self.allocator.make_writable(page_addr as *const u8, page_size) {
                return Err(WriteError::FailedPageMapping);
            }
        } else {
            // Commit every page from the end of the backed range through
            // the target page
            let commit_size = page_addr + self.page_bytes - committed_end;
            assert_eq!(0, committed_end % self.page_bytes, "commit boundary should be page aligned");
            assert_eq!(0, commit_size % self.page_bytes, "commit size should be page aligned");

            let commit_size_u32: u32 = commit_size.try_into().unwrap();
            if !self.allocator.make_writable(committed_end as *const u8, commit_size_u32) {
                return Err(WriteError::FailedPageMapping);
            }

            // Seed fresh pages with a trapping byte (PUSH DS, illegal in
            // 64-bit mode) so jumps into never-written memory fault loudly
            // instead of sliding through zeroes.
            unsafe {
                std::slice::from_raw_parts_mut(committed_end as *mut u8, commit_size).fill(0x1e);
            }

            self.committed_bytes += commit_size;
        }

        self.writable_page = Some(page_addr);
        Ok(())
    }

    /// End a write session: every committed page becomes executable and
    /// no page is left writable.
    pub fn mark_all_executable(&mut self) {
        self.writable_page = None;

        let mapped: u32 = self.committed_bytes.try_into().unwrap();
        self.allocator.make_executable(self.start.as_ptr(), mapped);
    }
}

impl CodePtr {
    /// The raw pointer, possibly dangling when nothing has been written
    /// through the owning [VirtualMemory] yet
    pub fn raw_ptr(self) -> *const u8 {
        let CodePtr(ptr) = self;
        ptr.as_ptr()
    }

    /// A pointer `bytes` further into the region. May dangle.
    pub fn add_bytes(self, bytes: usize) -> Self {
        let CodePtr(ptr) = self;
        CodePtr(NonNull::new(ptr.as_ptr().wrapping_add(bytes)).unwrap())
    }

    pub fn into_i64(self) -> i64 {
        let CodePtr(ptr) = self;
        ptr.as_ptr() as i64
    }

    pub fn into_usize(self) -> usize {
        let CodePtr(ptr) = self;
        ptr.as_ptr() as usize
    }
}

impl From<*mut u8> for CodePtr {
    fn from(value: *mut u8) -> Self {
        CodePtr(NonNull::new(value).expect("null is not a code pointer"))
    }
}

/// Production allocator: thin wrappers over the protection syscalls the
/// host exposes. Only links when building against the VM.
#[cfg(not(test))]
mod sys {
    use crate::cruby::*;

    pub struct SystemAllocator;

    type VoidPtr = *mut std::os::raw::c_void;

    impl super::PageAllocator for SystemAllocator {
        fn make_writable(&mut self, ptr: *const u8, size: u32) -> bool {
            unsafe { rb_bbjit_mark_writable(ptr as VoidPtr, size) }
        }

        fn make_executable(&mut self, ptr: *const u8, size: u32) {
            unsafe { rb_bbjit_mark_executable(ptr as VoidPtr, size) }
        }

        fn release(&mut self, ptr: *const u8, size: u32) -> bool {
            unsafe { rb_bbjit_mark_unused(ptr as VoidPtr, size) }
        }
    }
}

#[cfg(not(test))]
pub(crate) use sys::*;

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::utils::IntoUsize;

    /// Testing allocator owning plain heap memory. Records every request
    /// so tests can assert on the protection traffic; generated code is
    /// never executed under test.
    pub struct TestingAllocator {
        requests: Vec<ProtRequest>,
        memory: Vec<u8>,
    }

    #[derive(Debug, PartialEq)]
    enum ProtRequest {
        Write { offset: usize, len: usize },
        Exec { offset: usize, len: usize },
        Release,
    }
    use ProtRequest::*;

    impl TestingAllocator {
        pub fn new(mem_size: usize) -> Self {
            Self {
                requests: Vec::default(),
                memory: vec![0; mem_size],
            }
        }

        pub fn mem_start(&self) -> *const u8 {
            self.memory.as_ptr()
        }

        // Every request must stay inside the backing buffer; return the
        // pointer as an offset for recording.
        fn offset_of(&self, ptr: *const u8, len: u32) -> usize {
            let offset = ptr as usize - self.memory.as_ptr() as usize;
            assert!(offset < self.memory.len());
            assert!(offset + len.as_usize() <= self.memory.len());
            offset
        }
    }

    impl super::PageAllocator for TestingAllocator {
        fn make_writable(&mut self, ptr: *const u8, len: u32) -> bool {
            let offset = self.offset_of(ptr, len);
            self.requests.push(Write { offset, len: len.as_usize() });
            true
        }

        fn make_executable(&mut self, ptr: *const u8, len: u32) {
            let offset = self.offset_of(ptr, len);
            self.requests.push(Exec { offset, len: len.as_usize() });
            // No protection change; tests never run the code
        }

        fn release(&mut self, ptr: *const u8, len: u32) -> bool {
            self.offset_of(ptr, len);
            self.requests.push(Release);
            true
        }
    }

    // A tiny fictional page size keeps the scenarios readable
    const PAGE: usize = 4;

    fn new_region(pages: usize) -> VirtualMemory<TestingAllocator> {
        let size = PAGE * pages;
        let alloc = TestingAllocator::new(size);
        let start = NonNull::new(alloc.mem_start() as *mut u8).unwrap();
        VirtualMemory::new(alloc, PAGE as u32, start, size)
    }

    #[test]
    fn fresh_pages_get_filled_with_trap_bytes() {
        let mut virt = new_region(10);

        virt.write_byte(virt.start_ptr(), 1).unwrap();
        assert!(
            virt.allocator.memory[1..PAGE].iter().all(|&b| b == 0x1e),
            "rest of the page should hold trap bytes",
        );

        // Skipping ahead commits (and fills) the gap too
        virt.write_byte(virt.start_ptr().add_bytes(3 * PAGE), 1).unwrap();
        assert!(virt.allocator.memory[PAGE..3 * PAGE].iter().all(|&b| b == 0x1e));
    }

    #[test]
    fn same_page_needs_one_protection_change() {
        let mut virt = new_region(10);

        virt.write_byte(virt.start_ptr(), 1).unwrap();
        virt.write_byte(virt.start_ptr(), 0).unwrap();
        virt.write_byte(virt.start_ptr().add_bytes(1), 2).unwrap();

        assert_eq!(virt.allocator.requests, vec![Write { offset: 0, len: PAGE }]);
    }

    #[test]
    fn reopening_a_committed_page_flips_only_that_page() {
        let mut virt = new_region(10);

        // Commit two pages, then seal them
        virt.write_byte(virt.start_ptr().add_bytes(PAGE), 1).unwrap();
        virt.mark_all_executable();

        // Patching the first page makes just that page writable again
        virt.write_byte(virt.start_ptr(), 2).unwrap();
        assert_eq!(
            virt.allocator.requests,
            vec![
                Write { offset: 0, len: 2 * PAGE },
                Exec { offset: 0, len: 2 * PAGE },
                Write { offset: 0, len: PAGE },
            ]
        );
    }

    #[test]
    fn bounds_are_checked() {
        let mut virt = new_region(10);

        let past_end = virt.start_ptr().add_bytes(virt.region_size());
        assert_eq!(Err(WriteError::OutOfBounds), virt.write_byte(past_end, 0));

        let far_away = CodePtr(NonNull::new(usize::MAX as *mut u8).unwrap());
        assert_eq!(Err(WriteError::OutOfBounds), virt.write_byte(far_away, 0));
    }

    #[test]
    fn only_committed_pages_become_executable() {
        let mut virt = new_region(10);

        virt.write_byte(virt.start_ptr().add_bytes(2 * PAGE), 1).unwrap();
        virt.mark_all_executable();

        // Three pages were committed, and exactly those became executable
        assert_eq!(
            virt.allocator.requests,
            vec![
                Write { offset: 0, len: 3 * PAGE },
                Exec { offset: 0, len: 3 * PAGE },
            ]
        );
    }
}
