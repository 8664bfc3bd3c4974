// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recording stand-in for the ARM-M support module, used when the kernel is
//! built for the host (i.e. for unit tests).
//!
//! MPU mask loads and pended switches are recorded instead of performed, so
//! tests can assert on them; "frame synthesis" is plain stack-pointer
//! arithmetic, because fabricated stack addresses must never be
//! dereferenced here. State is thread-local so the parallel test harness
//! doesn't cross wires.

use core::cell::Cell;

use crate::time::Timestamp;

macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

std::thread_local! {
    static LAST_SRD_MASK: Cell<u32> = const { Cell::new(0) };
    static SWITCH_PENDED: Cell<bool> = const { Cell::new(false) };
    static NOW: Cell<u64> = const { Cell::new(0) };
}

pub fn now() -> Timestamp {
    Timestamp::from(NOW.with(|c| c.get()))
}

pub fn pend_context_switch() {
    SWITCH_PENDED.with(|c| c.set(true));
}

/// Test accessor: reports and clears the pended-switch flag.
pub fn take_pended_switch() -> bool {
    SWITCH_PENDED.with(|c| c.replace(false))
}

pub fn reset() -> ! {
    panic!("SYSTEM RESET");
}

pub fn init_mpu() {}

pub fn apply_srd_mask(mask: u32) {
    LAST_SRD_MASK.with(|c| c.set(mask));
}

/// Test accessor: the most recently loaded SRD mask.
pub fn current_srd_mask() -> u32 {
    LAST_SRD_MASK.with(|c| c.get())
}

/// Same stack-pointer movement as the real frame synthesis (eight hardware
/// words plus eight callee-saved words below an 8-byte-aligned top), without
/// touching the fabricated addresses.
pub fn initialize_task_frame(stack_top: u32, _entry: u32) -> u32 {
    (stack_top & !0x7) - 16 * 4
}

pub fn read_task_name(_addr: u32) -> Option<crate::task::TaskName> {
    None
}

pub unsafe fn start_first_task(_tick_divisor: u32, _sp: u32, _entry: u32) -> ! {
    panic!("entering userland");
}
