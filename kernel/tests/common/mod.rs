//! Shared scaffolding for the end-to-end scenarios.
#![allow(dead_code)] // each test binary uses its own subset

use kernel::memory::layout::{PTSIZE, USER_LO};
use kernel::trap::ProcState;

/// Ferry span: the 4 MiB region the scenarios copy between parent and
/// children.
pub const U: u32 = USER_LO;

/// Staging span for register-state images, one table span above the
/// ferry region so copies never touch it.
pub const SREGS: u32 = USER_LO + PTSIZE;

pub fn init_logger() {
    kernel::logger::init(log::LevelFilter::Warn);
}

/// A register-state image whose only interesting field is the entry
/// point, as staged into a parent's memory for PUT with SYS_REGS.
pub fn state_entering(eip: u32) -> [u8; kernel::trap::PROCSTATE_SIZE] {
    let mut st = ProcState::default();
    st.tf.eip = eip;
    st.encode()
}
