// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel crashes/failures such that they can be
//! found by tooling.
//!
//! This module defines the following binary interface to debuggers:
//!
//! - `kern::fail::KERNEL_HAS_FAILED` is a `bool`. It is cleared to zero
//!   (false) before entry to kernel main, and set to one (true) if the
//!   kernel reaches the `die` function (either explicitly or as a result of
//!   a `panic!`). If it contains any other value, the kernel has either not
//!   yet booted, or has corrupted memory on the way down.
//!
//! - `kern::fail::KERNEL_EPITAPH` is an array of `u8`. The `die` routine
//!   writes as much of the failure reason into this buffer (as UTF-8) as
//!   possible, truncating if the buffer fills. For printing, trim trailing
//!   NUL bytes.
//!
//! On the host (tests), `die` just panics so the harness can observe it.

use core::fmt::Display;
#[cfg(target_os = "none")]
use core::fmt::Write;

#[used]
static mut KERNEL_HAS_FAILED: bool = false;

const EPITAPH_LEN: usize = 128;

/// The "epitaph" buffer records up to `EPITAPH_LEN` bytes of description of
/// the event that caused the kernel to fail, padded with NULs.
#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

#[cfg(target_os = "none")]
fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    // Safety: we only access this from this one site, and never from a
    // context where concurrency or interrupts are enabled.
    let previous_fail = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if previous_fail {
        // Welp, you've called begin_epitaph twice, suggesting a recursive
        // panic. We can't very well panic in response to this since it'll
        // just make the problem worse.
        loop {
            // Platform-independent NOP
            core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        }
    }

    // Safety: we can get a mutable reference to the epitaph because only
    // one execution of this function will successfully set that flag.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

/// Records the reason the kernel is going down and parks the CPU. Also
/// echoes the reason to the diagnostic sink, where one is installed.
#[cfg(target_os = "none")]
#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[cfg(target_os = "none")]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    let _ = write!(crate::diag::writer(), "\nkernel: {msg}\n");

    let buf = begin_epitaph();
    let mut writer = Eulogist { dest: buf };
    write!(writer, "{msg}").ok();

    loop {
        // Platform-independent NOP
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

/// Host rendition: surface the failure to the test harness instead of
/// spinning it.
#[cfg(not(target_os = "none"))]
pub fn die(msg: impl Display) -> ! {
    panic!("{msg}");
}

#[cfg(target_os = "none")]
struct Eulogist {
    dest: &'static mut [u8],
}

#[cfg(target_os = "none")]
impl Write for Eulogist {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

/// The kernel owns the panic handler on real targets; anything that panics
/// in kernel context is a kernel bug and gets the same treatment as an
/// explicit `die`.
#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
