//! Per-node physical memory: the page-frame arena.
//!
//! Each node owns a fixed arena of 4 KiB frames addressed by 32-bit
//! physical addresses (byte offsets into the arena). Frame 0 is never
//! handed out, so a physical address of zero always means "nothing",
//! and frame 1 is the permanent all-zero sentinel page.
//!
//! Page contents are reached through a raw base pointer, the moral
//! equivalent of a kernel's physical-memory window. All accessors take
//! `&self`; exclusivity of page contents is the VM layer's problem
//! (refcounts and hardware-writable bits), not the type system's.

pub mod address_space;
pub mod frame_allocator;
pub mod frame_metadata;
pub mod layout;
pub mod paging;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::ptr;
use spin::Mutex;

use self::frame_metadata::PageInfo;
use self::layout::{Pa, PAGE_SHIFT, PAGE_SIZE};
use self::paging::Rr;

/// Physical address of the zero sentinel page (frame 1).
pub const ZERO_PAGE: Pa = PAGE_SIZE as Pa;

/// Frames below this are never allocated: frame 0 (null confusion) and
/// frame 1 (the zero sentinel).
const FIRST_USABLE_FRAME: usize = 2;

/// A node's physical page-frame arena.
pub struct PhysMem {
    base: *mut u8,
    npages: usize,
    info: Box<[PageInfo]>,
    free: Mutex<Vec<u32>>,
    /// Remote-reference cache: key ([`paging::rr_key`]) to the local
    /// frame holding a pulled copy. The cache holds one reference on
    /// every tracked frame.
    rr_frames: Mutex<BTreeMap<u32, Pa>>,
    #[cfg(any(test, feature = "testing"))]
    simulate_oom: core::sync::atomic::AtomicBool,
}

// The raw base pointer is only ever dereferenced through &self methods;
// the arena is owned and its extent fixed for the struct's lifetime.
unsafe impl Send for PhysMem {}
unsafe impl Sync for PhysMem {}

impl PhysMem {
    /// Build an arena of `npages` frames, all zeroed. The remote
    /// reference encoding caps an arena at 4096 frames (16 MiB).
    pub fn new(npages: usize) -> Self {
        assert!(npages > FIRST_USABLE_FRAME, "arena too small");
        assert!(npages <= 4096, "arena exceeds remote-reference address range");

        let storage: Vec<u8> = vec![0u8; npages * PAGE_SIZE];
        let mut storage = core::mem::ManuallyDrop::new(storage);
        let base = storage.as_mut_ptr();

        let mut info = Vec::with_capacity(npages);
        for _ in 0..npages {
            info.push(PageInfo::new());
        }
        // The sentinel is permanently referenced so it can never be freed.
        info[(ZERO_PAGE >> PAGE_SHIFT) as usize].set_refcount(1);

        // Free list is popped from the back; push high frames first so
        // allocation hands out low frames in ascending order.
        let mut free = Vec::with_capacity(npages - FIRST_USABLE_FRAME);
        for pfn in (FIRST_USABLE_FRAME..npages).rev() {
            free.push(pfn as u32);
        }

        PhysMem {
            base,
            npages,
            info: info.into_boxed_slice(),
            free: Mutex::new(free),
            rr_frames: Mutex::new(BTreeMap::new()),
            #[cfg(any(test, feature = "testing"))]
            simulate_oom: core::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn npages(&self) -> usize {
        self.npages
    }

    /// Frame number of a physical address; asserts page alignment and
    /// range. Out-of-range inputs are caller bugs.
    #[inline]
    pub fn pfn(&self, pa: Pa) -> usize {
        debug_assert_eq!(pa as usize % PAGE_SIZE, 0, "unaligned frame address {pa:#x}");
        let pfn = (pa >> PAGE_SHIFT) as usize;
        assert!(pfn < self.npages, "frame address {pa:#x} out of range");
        pfn
    }

    #[inline]
    pub fn pfn_to_pa(&self, pfn: usize) -> Pa {
        assert!(pfn < self.npages);
        (pfn << PAGE_SHIFT) as Pa
    }

    /// True if `pa` names an allocatable frame of this arena (the zero
    /// sentinel and frame 0 excluded).
    pub fn is_valid_frame(&self, pa: Pa) -> bool {
        pa as usize % PAGE_SIZE == 0
            && ((pa >> PAGE_SHIFT) as usize) < self.npages
            && ((pa >> PAGE_SHIFT) as usize) >= FIRST_USABLE_FRAME
    }

    #[inline]
    pub(crate) fn info(&self, pa: Pa) -> &PageInfo {
        &self.info[self.pfn(pa)]
    }

    #[inline]
    fn byte_ptr(&self, pa: Pa, len: usize) -> *mut u8 {
        let pa = pa as usize;
        assert!(pa + len <= self.npages * PAGE_SIZE, "physical access out of range");
        // Accesses never straddle a frame boundary.
        debug_assert!(pa % PAGE_SIZE + len <= PAGE_SIZE);
        unsafe { self.base.add(pa) }
    }

    pub fn read_u8(&self, pa: Pa) -> u8 {
        unsafe { ptr::read_volatile(self.byte_ptr(pa, 1)) }
    }

    pub fn write_u8(&self, pa: Pa, v: u8) {
        debug_assert_ne!(layout::pgaddr(pa), ZERO_PAGE, "write to the zero sentinel");
        unsafe { ptr::write_volatile(self.byte_ptr(pa, 1), v) }
    }

    pub fn read_u32(&self, pa: Pa) -> u32 {
        debug_assert_eq!(pa % 4, 0);
        unsafe { ptr::read_volatile(self.byte_ptr(pa, 4) as *const u32) }
    }

    pub fn write_u32(&self, pa: Pa, v: u32) {
        debug_assert_eq!(pa % 4, 0);
        debug_assert_ne!(layout::pgaddr(pa), ZERO_PAGE, "write to the zero sentinel");
        unsafe { ptr::write_volatile(self.byte_ptr(pa, 4) as *mut u32, v) }
    }

    /// Read entry `idx` of the page table or directory at `table`.
    #[inline]
    pub fn read_entry(&self, table: Pa, idx: usize) -> u32 {
        debug_assert!(idx < layout::NPTENTRIES);
        self.read_u32(table + (idx as u32) * 4)
    }

    /// Write entry `idx` of the page table or directory at `table`.
    #[inline]
    pub fn write_entry(&self, table: Pa, idx: usize, v: u32) {
        debug_assert!(idx < layout::NPTENTRIES);
        self.write_u32(table + (idx as u32) * 4, v)
    }

    pub fn copy_out(&self, pa: Pa, buf: &mut [u8]) {
        let src = self.byte_ptr(pa, buf.len());
        unsafe { ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) }
    }

    pub fn copy_in(&self, pa: Pa, buf: &[u8]) {
        debug_assert_ne!(layout::pgaddr(pa), ZERO_PAGE, "write to the zero sentinel");
        let dst = self.byte_ptr(pa, buf.len());
        unsafe { ptr::copy_nonoverlapping(buf.as_ptr(), dst, buf.len()) }
    }

    /// Copy a whole frame. Copying from the zero sentinel zero-fills.
    pub fn copy_page(&self, dst: Pa, src: Pa) {
        assert_ne!(dst, src);
        debug_assert_ne!(dst, ZERO_PAGE, "write to the zero sentinel");
        let s = self.byte_ptr(src, PAGE_SIZE);
        let d = self.byte_ptr(dst, PAGE_SIZE);
        unsafe { ptr::copy_nonoverlapping(s, d, PAGE_SIZE) }
    }

    pub fn zero_page(&self, pa: Pa) {
        debug_assert_ne!(pa, ZERO_PAGE, "write to the zero sentinel");
        let d = self.byte_ptr(pa, PAGE_SIZE);
        unsafe { ptr::write_bytes(d, 0, PAGE_SIZE) }
    }

    /// Record a pulled copy of `rr` at local frame `pa`. Sets the
    /// frame's home and takes the cache's reference on it.
    pub fn rrtrack(&self, rr: Rr, pa: Pa) {
        self.info(pa).set_home(paging::rr_key(rr));
        self.incref(pa);
        let prev = self.rr_frames.lock().insert(paging::rr_key(rr), pa);
        debug_assert!(prev.is_none(), "remote reference tracked twice");
    }

    /// Look up a previously pulled copy of `rr`.
    pub fn rrlookup(&self, rr: Rr) -> Option<Pa> {
        self.rr_frames.lock().get(&paging::rr_key(rr)).copied()
    }

    /// Number of remote references with locally cached copies.
    pub fn rr_tracked(&self) -> usize {
        self.rr_frames.lock().len()
    }
}

impl Drop for PhysMem {
    fn drop(&mut self) {
        let len = self.npages * PAGE_SIZE;
        unsafe {
            drop(Vec::from_raw_parts(self.base, len, len));
        }
    }
}

/// Allocation and refcount statistics, for diagnostics and leak checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_frames: usize,
    pub free_frames: usize,
    /// Frames with a nonzero refcount (the zero sentinel included).
    pub live_frames: usize,
}

impl PhysMem {
    pub fn stats(&self) -> MemoryStats {
        let free = self.free.lock().len();
        let live = self.info.iter().filter(|pi| pi.refcount() > 0).count();
        MemoryStats {
            total_frames: self.npages,
            free_frames: free,
            live_frames: live,
        }
    }
}
