//! Copies between kernel buffers and user address spaces.
//!
//! Every transfer first validates the whole `[uva, uva + len)` range
//! against the user window with overflow-checked arithmetic, then
//! moves data page by page through the process's page directory. A
//! store into a copy-on-write or zero mapping goes through the write
//! fault handler exactly as a user store would; a page the handler
//! disowns aborts the whole copy with a page fault for the caller to
//! reflect. That early-exit is this model's form of the per-CPU
//! recovery callback a real kernel arms around copyin/copyout.

use core::cmp::min;

use crate::memory::address_space::{pagefault, walk};
use crate::memory::layout::{pgaddr, pgoff, Pa, Va, PAGE_SIZE, USER_HI, USER_LO};
use crate::memory::paging::{flags, PteFlags};
use crate::memory::PhysMem;
use crate::trap::Fault;

/// Check that `[uva, uva + size)` lies inside the user window.
pub fn check_uva(uva: Va, size: u32) -> Result<(), Fault> {
    let end = uva.checked_add(size).ok_or(Fault::PageFault(uva))?;
    if uva < USER_LO || uva > USER_HI || end > USER_HI {
        return Err(Fault::PageFault(uva));
    }
    Ok(())
}

fn resolve_read(mem: &PhysMem, pdir: Pa, va: Va) -> Result<Pa, Fault> {
    let slot = walk(mem, pdir, va, false).ok_or(Fault::PageFault(va))?;
    let e = slot.get(mem);
    if !flags(e).contains(PteFlags::P) {
        return Err(Fault::PageFault(va));
    }
    Ok(pgaddr(e) + pgoff(va))
}

fn resolve_write(mem: &PhysMem, pdir: Pa, va: Va) -> Result<Pa, Fault> {
    if let Some(slot) = walk(mem, pdir, va, false) {
        let e = slot.get(mem);
        if flags(e).contains(PteFlags::P | PteFlags::W) {
            return Ok(pgaddr(e) + pgoff(va));
        }
    }
    // One shot for the copy-on-write machinery, like the hardware
    // fault path.
    if pagefault(mem, pdir, va) {
        if let Some(slot) = walk(mem, pdir, va, false) {
            let e = slot.get(mem);
            if flags(e).contains(PteFlags::P | PteFlags::W) {
                return Ok(pgaddr(e) + pgoff(va));
            }
        }
    }
    Err(Fault::PageFault(va))
}

/// Copy `buf.len()` bytes in from user memory.
pub fn copy_from_user(mem: &PhysMem, pdir: Pa, uva: Va, buf: &mut [u8]) -> Result<(), Fault> {
    check_uva(uva, buf.len() as u32)?;
    let mut off = 0usize;
    while off < buf.len() {
        let va = uva + off as u32;
        let chunk = min(PAGE_SIZE - pgoff(va) as usize, buf.len() - off);
        let pa = resolve_read(mem, pdir, va)?;
        mem.copy_out(pa, &mut buf[off..off + chunk]);
        off += chunk;
    }
    Ok(())
}

/// Copy `buf.len()` bytes out to user memory.
pub fn copy_to_user(mem: &PhysMem, pdir: Pa, uva: Va, buf: &[u8]) -> Result<(), Fault> {
    check_uva(uva, buf.len() as u32)?;
    let mut off = 0usize;
    while off < buf.len() {
        let va = uva + off as u32;
        let chunk = min(PAGE_SIZE - pgoff(va) as usize, buf.len() - off);
        let pa = resolve_write(mem, pdir, va)?;
        mem.copy_in(pa, &buf[off..off + chunk]);
        off += chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::address_space::{make_boot_pdir, new_pdir, setperm};

    #[test]
    fn range_checks_are_wrap_safe() {
        assert!(check_uva(USER_LO, 16).is_ok());
        assert!(check_uva(USER_HI - 16, 16).is_ok());
        // Crossing the top of the window.
        assert!(check_uva(USER_HI - 8, 16).is_err());
        // Below the window.
        assert!(check_uva(USER_LO - 4, 16).is_err());
        // Address + size wraps 32 bits.
        assert!(check_uva(USER_LO + 0x100, u32::MAX - 0x80).is_err());
        // Empty transfer at the very top is harmless.
        assert!(check_uva(USER_HI, 0).is_ok());
    }

    #[test]
    fn copy_roundtrip_through_cow() {
        let mem = crate::memory::PhysMem::new(64);
        let boot = make_boot_pdir();
        let pdir = new_pdir(&mem, &boot).unwrap();
        // Grant read-write over one page; nothing is mapped yet, so
        // the copy-out must fault in a private zero copy.
        assert!(setperm(&mem, pdir, USER_LO, PAGE_SIZE as u32, PteFlags::SYS_RW));

        let msg = b"rendezvous";
        copy_to_user(&mem, pdir, USER_LO + 64, msg).unwrap();
        let mut back = [0u8; 10];
        copy_from_user(&mem, pdir, USER_LO + 64, &mut back).unwrap();
        assert_eq!(&back, msg);
    }

    #[test]
    fn copy_to_readonly_faults() {
        let mem = crate::memory::PhysMem::new(64);
        let boot = make_boot_pdir();
        let pdir = new_pdir(&mem, &boot).unwrap();
        assert!(setperm(&mem, pdir, USER_LO, PAGE_SIZE as u32, PteFlags::SYS_READ));
        // Reads of the zero mapping succeed...
        let mut buf = [1u8; 8];
        copy_from_user(&mem, pdir, USER_LO, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 8]);
        // ...but writes are not the kernel's to fix.
        assert!(copy_to_user(&mem, pdir, USER_LO, &[1, 2, 3]).is_err());
    }

    #[test]
    fn unmapped_read_faults() {
        let mem = crate::memory::PhysMem::new(64);
        let boot = make_boot_pdir();
        let pdir = new_pdir(&mem, &boot).unwrap();
        let mut buf = [0u8; 4];
        assert!(copy_from_user(&mem, pdir, USER_LO, &mut buf).is_err());
    }
}
