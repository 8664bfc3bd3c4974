// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel aggregate.
//!
//! All mutable kernel state -- task table, mutex and semaphore tables, the
//! block heap, scheduler rotation state, tick bookkeeping -- lives in one
//! [`Kernel`] value. The trap entry points in `arch` borrow it exclusively
//! through [`with_kernel`] for the duration of a trap; tasks never hold a
//! reference to any of it. Nothing here needs a lock: the exception
//! priority scheme serializes every path that can reach this state.

use abi::{Pid, Priority, TaskState, MAX_MUTEXES, MAX_SEMAPHORES, MAX_TASKS};
use static_assertions::const_assert_eq;

use crate::arch;
use crate::fail;
use crate::heap::{BlockHeap, HEAP_SIZE};
use crate::ipc::{Mutex, Semaphore};
use crate::mpu;
use crate::task::{self, SchedPolicy, Tcb};

/// SRAM reserved below the heap for kernel globals and the main (handler)
/// stack.
pub const KERNEL_RAM_RESERVED: u32 = 4 * 1024;

/// Base of the block heap that task stacks are carved from.
pub const HEAP_BASE: u32 = mpu::SRAM_BASE + KERNEL_RAM_RESERVED;

// The kernel reservation plus the heap must exactly cover the 32 KiB of
// SRAM the four MPU regions describe.
const_assert_eq!(KERNEL_RAM_RESERVED + HEAP_SIZE, 32 * 1024);

/// `current` value meaning "no task has been dispatched yet."
pub const NO_TASK: usize = usize::MAX;

/// Ways `create_task` can fail. The table is left untouched in every case.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskCreateError {
    /// All task slots are occupied.
    TableFull,
    /// A task with this entry point is already registered; entry addresses
    /// are identities and must be unique.
    DuplicateEntry,
    /// The heap has no contiguous run large enough for the stack.
    OutOfMemory,
    /// The zero entry address can never name a task.
    InvalidEntry,
}

pub struct Kernel {
    pub tasks: [Tcb; MAX_TASKS],
    pub mutexes: [Mutex; MAX_MUTEXES],
    pub semaphores: [Semaphore; MAX_SEMAPHORES],
    pub heap: BlockHeap,
    pub sched: SchedPolicy,
    /// Index of the task the CPU is (or is about to be) running, or
    /// [`NO_TASK`] before the first dispatch.
    pub current: usize,
    /// SysTick may pend a switch when a sleeper wakes.
    pub preemption: bool,
    /// Mutex priority-inheritance policy.
    pub priority_inheritance: bool,
    /// Milliseconds into the current usage-normalization window.
    pub(crate) ms_counter: u32,
}

static mut KERNEL: Kernel = Kernel::new();

/// Manufactures an exclusive reference to the kernel aggregate and hands it
/// to `body`. Because the lifetime of the reference is anonymous, it can't
/// easily be stored, which is deliberate.
///
/// Soundness rests on the trap architecture: every caller is either the
/// single-threaded boot path or one of the kernel's exception handlers, and
/// those all run at one NVIC priority, so no two borrows can be live at
/// once.
pub fn with_kernel<R>(body: impl FnOnce(&mut Kernel) -> R) -> R {
    unsafe { body(&mut *core::ptr::addr_of_mut!(KERNEL)) }
}

impl Kernel {
    pub const fn new() -> Self {
        const TCB: Tcb = Tcb::new();
        const MUTEX: Mutex = Mutex::new();
        const SEM: Semaphore = Semaphore::new();
        Self {
            tasks: [TCB; MAX_TASKS],
            mutexes: [MUTEX; MAX_MUTEXES],
            semaphores: [SEM; MAX_SEMAPHORES],
            heap: BlockHeap::new(HEAP_BASE),
            sched: SchedPolicy::new(),
            current: NO_TASK,
            preemption: true,
            priority_inheritance: false,
            ms_counter: 0,
        }
    }

    /// Readies a mutex for use. Fails (only) on an out-of-range id.
    pub fn init_mutex(&mut self, id: usize) -> bool {
        match self.mutexes.get_mut(id) {
            Some(m) => {
                m.reset();
                true
            }
            None => false,
        }
    }

    /// Readies a semaphore with an initial token count. Fails (only) on an
    /// out-of-range id.
    pub fn init_semaphore(&mut self, id: usize, count: u16) -> bool {
        match self.semaphores.get_mut(id) {
            Some(s) => {
                s.reset(count);
                true
            }
            None => false,
        }
    }

    /// Registers a task: occupies the lowest-index free slot, carves its
    /// stack from the heap (tagged `slot + 1`), and leaves it `Unrun` for
    /// the scheduler to find.
    ///
    /// The name is truncated to the ABI length; the stack top is aligned
    /// down to 8 bytes as the hardware requires.
    pub fn create_task(
        &mut self,
        entry: Pid,
        name: &str,
        priority: Priority,
        stack_bytes: u32,
    ) -> Result<(), TaskCreateError> {
        if entry.is_none() {
            return Err(TaskCreateError::InvalidEntry);
        }
        if task::find_by_entry(&self.tasks, entry).is_some() {
            return Err(TaskCreateError::DuplicateEntry);
        }
        let slot = self
            .tasks
            .iter()
            .position(|t| t.state == TaskState::Invalid)
            .ok_or(TaskCreateError::TableFull)?;

        let stack_base = self
            .heap
            .allocate(stack_bytes, slot as u16 + 1)
            .ok_or(TaskCreateError::OutOfMemory)?;
        let stack_top = (stack_base + stack_bytes) & !0x7;

        let t = &mut self.tasks[slot];
        t.state = TaskState::Unrun;
        t.entry = entry;
        t.sp = stack_top;
        t.base_priority = priority;
        t.current_priority = priority;
        t.ticks_remaining = 0;
        t.srd_mask = mpu::srd_for_stack(stack_base, stack_bytes);
        t.name.clear();
        for c in name.chars() {
            if !c.is_ascii() || t.name.push(c).is_err() {
                break;
            }
        }
        t.held_mutex = None;
        t.awaited_semaphore = None;
        t.stack_base = stack_base;
        t.stack_bytes = stack_bytes;
        t.run_time_ms = 0;
        t.cpu_percent_centi = 0;
        Ok(())
    }

    /// The running task's identity, for fault reports.
    pub fn current_pid(&self) -> Pid {
        match self.tasks.get(self.current) {
            Some(t) => t.entry,
            None => Pid::NONE,
        }
    }

    /// The deferred-switch body: records the outgoing task's stack pointer,
    /// runs the scheduler, loads the incoming task's MPU mask, and -- for a
    /// task that has never run -- synthesizes the initial frame it will
    /// "return" into. Returns the stack pointer to resume from.
    ///
    /// This is the only place the running task is replaced.
    pub fn switch_context(&mut self, old_psp: u32) -> u32 {
        if let Some(t) = self.tasks.get_mut(self.current) {
            t.sp = old_psp;
        }

        let next = match task::select(&self.tasks, self.current, &mut self.sched) {
            Some(next) => next,
            None => fail::die("no runnable tasks"),
        };
        self.current = next;

        let t = &mut self.tasks[next];
        uassert!(t.is_runnable());
        arch::apply_srd_mask(t.srd_mask);
        if t.state == TaskState::Unrun {
            t.sp = arch::initialize_task_frame(t.sp, t.entry.0);
            t.state = TaskState::Ready;
        }
        t.sp
    }
}
