// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.
//!
//! An application's `main` does its hardware bring-up, installs the
//! diagnostic sink, registers mutexes/semaphores/tasks through the wrappers
//! below, and finally calls [`start_kernel`], which never returns.

use abi::{Pid, Priority, TaskState};

use crate::arch;
use crate::fail;
use crate::kernel::{with_kernel, TaskCreateError, NO_TASK};
use crate::task;

/// Readies a mutex for use. Returns false only for an out-of-range id.
pub fn init_mutex(id: usize) -> bool {
    with_kernel(|k| k.init_mutex(id))
}

/// Readies a semaphore with `count` initial tokens. Returns false only for
/// an out-of-range id.
pub fn init_semaphore(id: usize, count: u16) -> bool {
    with_kernel(|k| k.init_semaphore(id, count))
}

/// Registers a task before start. The entry function is the task's durable
/// identity; priority is clamped into range; the stack is carved from the
/// block heap.
pub fn create_task(
    entry: fn(),
    name: &str,
    priority: u8,
    stack_bytes: u32,
) -> Result<(), TaskCreateError> {
    with_kernel(|k| {
        k.create_task(
            Pid(entry as usize as u32),
            name,
            Priority::clamped(u32::from(priority)),
            stack_bytes,
        )
    })
}

/// The main kernel entry point.
///
/// `tick_divisor` is CPU cycles per kernel tick; a tick is a millisecond,
/// so this is the core clock in kHz.
///
/// The application must have registered at least one task that is always
/// runnable (an idle task); the scheduler treats an empty ready set as
/// fatal, both here and at runtime.
///
/// # Safety
///
/// This can be called exactly once per boot, from privileged Thread mode,
/// after all tasks have been created.
pub unsafe fn start_kernel(tick_divisor: u32) -> ! {
    klog!("starting: tables");
    arch::init_mpu();

    let (sp, entry, srd) = with_kernel(|k| {
        if !k.tasks.iter().any(|t| t.is_valid()) {
            fail::die("no tasks registered");
        }
        let first = match task::select(&k.tasks, NO_TASK, &mut k.sched) {
            Some(first) => first,
            None => fail::die("no runnable tasks"),
        };
        k.current = first;

        // The first task is entered by a plain jump rather than through the
        // deferred switch, so it skips the Unrun frame synthesis: its first
        // suspension will push the first frames onto a pristine stack.
        let t = &mut k.tasks[first];
        t.state = TaskState::Ready;
        (t.sp, t.entry.0, t.srd_mask)
    });

    arch::apply_srd_mask(srd);
    klog!("starting: first task");
    // Safety: single boot path, task chosen by the scheduler above.
    unsafe { arch::start_first_task(tick_divisor, sp, entry) }
}
