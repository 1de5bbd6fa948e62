//! Frame allocation from the arena free list.
//!
//! A single locked free list of frame numbers. Allocation hands out
//! frames with refcount 0 and undefined contents; callers that need a
//! clean page zero it themselves. `None` means the arena is exhausted;
//! there are no internal retries and callers must propagate.

use alloc::vec::Vec;

use super::layout::{Pa, PAGE_SHIFT};
use super::PhysMem;

impl PhysMem {
    /// Allocate one frame. Returns `None` on exhaustion (or while OOM
    /// simulation is active in test builds).
    pub fn alloc(&self) -> Option<Pa> {
        #[cfg(any(test, feature = "testing"))]
        if self.simulate_oom.load(core::sync::atomic::Ordering::SeqCst) {
            log::trace!("frame allocator: OOM simulation active");
            return None;
        }

        let pfn = self.free.lock().pop()?;
        let pa = (pfn as Pa) << PAGE_SHIFT;
        debug_assert_eq!(self.refcount(pa), 0, "allocated frame still referenced");
        log::trace!("frame allocator: handing out frame {:#x}", pa);
        Some(pa)
    }

    /// Return a frame to the free list. Internal: reached only through
    /// `decref` hitting zero.
    pub(super) fn free_frame(&self, pa: Pa) {
        debug_assert_eq!(self.refcount(pa), 0);
        debug_assert!(self.is_valid_frame(pa), "freeing invalid frame {:#x}", pa);
        let mut free = self.free.lock();
        debug_assert!(!free.contains(&(pa >> PAGE_SHIFT)), "double free of {:#x}", pa);
        free.push(pa >> PAGE_SHIFT);
    }

    /// Drain the free list, leaving the arena artificially exhausted.
    /// Returns the stolen frame numbers; hand them back with
    /// [`PhysMem::restore_free_list`]. Test hook.
    #[cfg(any(test, feature = "testing"))]
    pub fn steal_free_list(&self) -> Vec<u32> {
        core::mem::take(&mut *self.free.lock())
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn restore_free_list(&self, mut frames: Vec<u32>) {
        self.free.lock().append(&mut frames);
    }

    /// Make all subsequent allocations fail, to exercise OOM paths.
    #[cfg(any(test, feature = "testing"))]
    pub fn set_simulate_oom(&self, on: bool) {
        if on {
            log::warn!("frame allocator: OOM simulation enabled");
        }
        self.simulate_oom.store(on, core::sync::atomic::Ordering::SeqCst);
    }
}
