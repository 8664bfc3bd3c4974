// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task-side support library: supervisor-call stubs and re-exported ABI
//! types.
//!
//! Each stub is a thin wrapper around one `svc` instruction. The service
//! number rides in the instruction's immediate byte -- the kernel digs it
//! back out of the trapping instruction -- and arguments go in r0/r1, which
//! the hardware stacks where the dispatcher can see them. The one service
//! with a result, `pidof`, gets it by the same route: the dispatcher edits
//! the stacked r0 and the exception return pops it into our hands.
//!
//! On anything other than the target, the stubs panic; they exist there
//! only so host builds of task code link.

#![no_std]

pub use abi::*;

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod stubs {
    use core::arch::asm;

    use abi::Pid;

    /// Gives up the CPU; the scheduler may hand it right back.
    #[inline(always)]
    pub fn sys_yield() {
        unsafe { asm!("svc #0") }
    }

    /// Suspends the caller for at least `ticks` milliseconds.
    #[inline(always)]
    pub fn sleep(ticks: u32) {
        unsafe { asm!("svc #1", in("r0") ticks) }
    }

    /// Acquires a mutex, blocking in FIFO order while it's held.
    /// Out-of-range ids are ignored.
    #[inline(always)]
    pub fn lock(mutex: u32) {
        unsafe { asm!("svc #2", in("r0") mutex) }
    }

    /// Releases a mutex. Ignored unless the caller is the owner.
    #[inline(always)]
    pub fn unlock(mutex: u32) {
        unsafe { asm!("svc #3", in("r0") mutex) }
    }

    /// Takes a semaphore token, blocking in FIFO order when none are
    /// available.
    #[inline(always)]
    pub fn wait(semaphore: u32) {
        unsafe { asm!("svc #4", in("r0") semaphore) }
    }

    /// Returns a semaphore token, waking the head waiter if any.
    #[inline(always)]
    pub fn post(semaphore: u32) {
        unsafe { asm!("svc #5", in("r0") semaphore) }
    }

    /// Looks up a task's pid by name. `Pid::NONE` when no task matches.
    pub fn pidof(name: &str) -> Pid {
        // The kernel reads a NUL-terminated copy out of our memory.
        let mut buf = [0u8; abi::TASK_NAME_LEN + 1];
        let n = name.len().min(abi::TASK_NAME_LEN);
        buf[..n].copy_from_slice(&name.as_bytes()[..n]);

        let mut r0 = buf.as_ptr() as u32;
        unsafe { asm!("svc #6", inlateout("r0") r0) };
        Pid(r0)
    }

    /// Requests a system reset.
    pub fn reboot() -> ! {
        unsafe { asm!("svc #7", options(noreturn)) }
    }

    /// Kills the named task. Killing yourself does not return.
    #[inline(always)]
    pub fn kill(pid: Pid) {
        unsafe { asm!("svc #8", in("r0") pid.0) }
    }

    /// Rebuilds a (typically killed) task with a fresh stack.
    #[inline(always)]
    pub fn restart(pid: Pid) {
        unsafe { asm!("svc #9", in("r0") pid.0) }
    }

    /// Reassigns a task's priority; values out of range are clamped.
    #[inline(always)]
    pub fn set_priority(pid: Pid, priority: u8) {
        unsafe { asm!("svc #10", in("r0") pid.0, in("r1") priority as u32) }
    }

    /// Writes the task table to the diagnostic sink.
    #[inline(always)]
    pub fn ps() {
        unsafe { asm!("svc #11") }
    }

    /// Writes non-idle semaphores and held/contended mutexes to the
    /// diagnostic sink.
    #[inline(always)]
    pub fn ipcs() {
        unsafe { asm!("svc #12") }
    }

    /// Toggles priority inheritance on mutex contention.
    #[inline(always)]
    pub fn set_priority_inheritance(on: bool) {
        unsafe { asm!("svc #13", in("r0") on as u32) }
    }

    /// Toggles tick-driven preemption.
    #[inline(always)]
    pub fn set_preemption(on: bool) {
        unsafe { asm!("svc #14", in("r0") on as u32) }
    }

    /// Chooses the priority scheduler (true) or round-robin (false).
    #[inline(always)]
    pub fn set_priority_scheduler(on: bool) {
        unsafe { asm!("svc #15", in("r0") on as u32) }
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
mod stubs {
    use abi::Pid;

    fn unsupported() -> ! {
        panic!("kernel services exist only on the target")
    }

    pub fn sys_yield() {
        unsupported()
    }
    pub fn sleep(_ticks: u32) {
        unsupported()
    }
    pub fn lock(_mutex: u32) {
        unsupported()
    }
    pub fn unlock(_mutex: u32) {
        unsupported()
    }
    pub fn wait(_semaphore: u32) {
        unsupported()
    }
    pub fn post(_semaphore: u32) {
        unsupported()
    }
    pub fn pidof(_name: &str) -> Pid {
        unsupported()
    }
    pub fn reboot() -> ! {
        unsupported()
    }
    pub fn kill(_pid: Pid) {
        unsupported()
    }
    pub fn restart(_pid: Pid) {
        unsupported()
    }
    pub fn set_priority(_pid: Pid, _priority: u8) {
        unsupported()
    }
    pub fn ps() {
        unsupported()
    }
    pub fn ipcs() {
        unsupported()
    }
    pub fn set_priority_inheritance(_on: bool) {
        unsupported()
    }
    pub fn set_preemption(_on: bool) {
        unsupported()
    }
    pub fn set_priority_scheduler(_on: bool) {
        unsupported()
    }
}

pub use stubs::*;
