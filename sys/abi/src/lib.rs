// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and applications.
//!
//! Everything in here is stable: service numbers are baked into `svc`
//! immediates in task text, and the shell's observable behavior depends on
//! the state set and capacity constants.

#![no_std]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Capacity of the task table. The task set is fixed at this bound; there is
/// no dynamic task creation after the kernel starts.
pub const MAX_TASKS: usize = 12;

/// Number of scheduling priorities. Numerically lower is more important.
pub const NUM_PRIORITIES: usize = 8;

/// Capacity of the mutex table.
pub const MAX_MUTEXES: usize = 4;

/// Capacity of the semaphore table.
pub const MAX_SEMAPHORES: usize = 4;

/// Wait queues are sized so that every task in the system can be enqueued on
/// the same primitive at once. A task waits on at most one primitive, so a
/// bounded enqueue can never fail and FIFO order is exact.
pub const MAX_MUTEX_QUEUE_SIZE: usize = MAX_TASKS;
pub const MAX_SEMAPHORE_QUEUE_SIZE: usize = MAX_TASKS;

/// Maximum length of a task name, in bytes, not counting any terminator.
pub const TASK_NAME_LEN: usize = 15;

/// Durable task identity: the address of the task's entry point.
///
/// The entry address outlives kill/restart cycles (a killed descriptor keeps
/// it so the task can be rebuilt in place), which makes it the natural "pid"
/// to hand to users. Zero is never a valid entry point and doubles as the
/// "no such task" result of name lookup.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable,
    KnownLayout, Default,
)]
#[repr(transparent)]
pub struct Pid(pub u32);

impl Pid {
    pub const NONE: Self = Self(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Indicates priority of a task.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so priority 0 is the most likely to be
/// scheduled, followed by 1, and so forth.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means numerically
/// greater / less important, or more important / numerically smaller.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable,
    KnownLayout, Unaligned, Default,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }

    /// Clamps an arbitrary user-supplied value into the valid range.
    pub fn clamped(raw: u32) -> Self {
        if raw >= NUM_PRIORITIES as u32 {
            Priority(NUM_PRIORITIES as u8 - 1)
        } else {
            Priority(raw as u8)
        }
    }
}

/// Scheduling state of a task descriptor.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum TaskState {
    /// Slot holds no task.
    #[default]
    Invalid,
    /// Task has never been dispatched; its stack holds no saved frames yet.
    Unrun,
    /// Task has run and can be resumed at any time.
    Ready,
    /// Task is waiting out a sleep, counted down by the tick handler.
    Delayed,
    /// Task is enqueued on a semaphore.
    BlockedOnSemaphore,
    /// Task is enqueued on (or waiting for) a mutex.
    BlockedOnMutex,
    /// Task has been killed; identity and sizing are retained for restart.
    Killed,
}

impl TaskState {
    /// Checks whether a task in this state may be chosen by the scheduler.
    pub fn is_runnable(self) -> bool {
        matches!(self, TaskState::Ready | TaskState::Unrun)
    }

    /// Fixed label used in the `ps` table.
    pub fn label(self) -> &'static str {
        match self {
            TaskState::Unrun => "UNRUN",
            TaskState::Ready => "READY",
            TaskState::Delayed => "DELAYED",
            TaskState::BlockedOnSemaphore => "SEM_BLK",
            TaskState::BlockedOnMutex => "MTX_BLK",
            TaskState::Killed => "KILLED",
            TaskState::Invalid => "INVLD",
        }
    }
}

/// Service numbers, as encoded in the immediate byte of the trapping `svc`
/// instruction. These are ABI: renumbering them breaks every compiled task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Sysnum {
    Yield = 0,
    Sleep = 1,
    Lock = 2,
    Unlock = 3,
    Wait = 4,
    Post = 5,
    Pidof = 6,
    Reboot = 7,
    Kill = 8,
    Restart = 9,
    SetPriority = 10,
    Ps = 11,
    Ipcs = 12,
    PriorityInheritance = 13,
    Preempt = 14,
    SchedPolicy = 15,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the kernel doesn't currently depend on
/// `num-traits` and this seems okay.
impl core::convert::TryFrom<u8> for Sysnum {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Yield),
            1 => Ok(Self::Sleep),
            2 => Ok(Self::Lock),
            3 => Ok(Self::Unlock),
            4 => Ok(Self::Wait),
            5 => Ok(Self::Post),
            6 => Ok(Self::Pidof),
            7 => Ok(Self::Reboot),
            8 => Ok(Self::Kill),
            9 => Ok(Self::Restart),
            10 => Ok(Self::SetPriority),
            11 => Ok(Self::Ps),
            12 => Ok(Self::Ipcs),
            13 => Ok(Self::PriorityInheritance),
            14 => Ok(Self::Preempt),
            15 => Ok(Self::SchedPolicy),
            _ => Err(()),
        }
    }
}
