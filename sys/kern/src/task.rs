// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task descriptors and the scheduler.

use abi::{Pid, Priority, TaskState, MAX_TASKS, NUM_PRIORITIES};

/// A task name, bounded at the ABI's 15 bytes.
pub type TaskName = heapless::String<{ abi::TASK_NAME_LEN }>;

/// Task control block.
///
/// One of these per slot in the fixed task table. A `Killed` descriptor is
/// not vacated: it keeps `entry`, `name`, priorities, and `stack_bytes` so
/// the task can be rebuilt in place by `restart`.
#[derive(Debug)]
pub struct Tcb {
    /// Scheduling state.
    pub state: TaskState,
    /// Entry point address; doubles as the task's durable identity.
    pub entry: Pid,
    /// Saved top-of-stack pointer. Only meaningful when the task is not
    /// running: for a suspended task it points at eight callee-saved words
    /// followed by the eight-word hardware frame; for an `Unrun` task it is
    /// the (aligned) stack top the first dispatch will build a frame under.
    pub sp: u32,
    /// Priority assigned at creation (or by `setpriority`).
    pub base_priority: Priority,
    /// Effective priority; differs from `base_priority` only while boosted
    /// by priority inheritance.
    pub current_priority: Priority,
    /// Remaining milliseconds of a sleep, counted down by the tick handler
    /// while `Delayed`.
    pub ticks_remaining: u32,
    /// MPU sub-region-disable mask loaded whenever this task is dispatched.
    pub srd_mask: u32,
    /// Printable identifier, used by the shell and the diagnostic tables.
    pub name: TaskName,
    /// Mutex currently owned, if any.
    pub held_mutex: Option<u8>,
    /// Semaphore currently waited on, if any.
    pub awaited_semaphore: Option<u8>,
    /// Base address of the stack allocation, zero when none is held.
    pub stack_base: u32,
    /// Requested stack size, retained for restart.
    pub stack_bytes: u32,
    /// Milliseconds of CPU charged since the last normalization window.
    pub run_time_ms: u32,
    /// Share of CPU over the last window, in hundredths of a percent.
    pub cpu_percent_centi: u32,
}

impl Tcb {
    pub const fn new() -> Self {
        Self {
            state: TaskState::Invalid,
            entry: Pid::NONE,
            sp: 0,
            base_priority: Priority(0),
            current_priority: Priority(0),
            ticks_remaining: 0,
            srd_mask: 0,
            name: TaskName::new(),
            held_mutex: None,
            awaited_semaphore: None,
            stack_base: 0,
            stack_bytes: 0,
            run_time_ms: 0,
            cpu_percent_centi: 0,
        }
    }

    /// Checks whether this slot holds a task at all (in any lifecycle
    /// state, including `Killed`).
    pub fn is_valid(&self) -> bool {
        self.state != TaskState::Invalid && !self.entry.is_none()
    }

    /// Checks whether the scheduler may pick this task.
    pub fn is_runnable(&self) -> bool {
        self.is_valid() && self.state.is_runnable()
    }
}

/// Return value for operations that can have scheduling implications. This
/// is marked `must_use` because forgetting to actually pend the deferred
/// switch after performing an operation that requires it would be Bad.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextTask {
    /// It's fine to keep running whatever task we were just running.
    Same,
    /// We need to switch tasks; the scheduler will figure out which.
    Other,
}

impl NextTask {
    pub fn combine(self, other: Self) -> Self {
        match (self, other) {
            (NextTask::Same, NextTask::Same) => NextTask::Same,
            _ => NextTask::Other,
        }
    }
}

/// Scheduler mode and rotation state.
#[derive(Debug)]
pub struct SchedPolicy {
    /// Priority mode (true, the default) or plain round-robin.
    pub priority_based: bool,
    /// Per-priority rotation cursor: the index the next scan at that
    /// priority starts from.
    pub cursors: [u8; NUM_PRIORITIES],
    /// Last index dispatched by the round-robin mode.
    pub rr_cursor: u8,
}

impl SchedPolicy {
    pub const fn new() -> Self {
        Self {
            priority_based: true,
            cursors: [0; NUM_PRIORITIES],
            // One before slot zero, so the first round-robin scan starts at
            // the top of the table.
            rr_cursor: (MAX_TASKS - 1) as u8,
        }
    }
}

/// Picks the next task to run, or `None` if nothing is runnable (the caller
/// decides how loudly to die).
///
/// In priority mode: find the most important priority with a runnable task,
/// then rotate within that priority starting from its cursor, skipping the
/// currently running task so equal-priority peers take turns. If no other
/// candidate exists, the current task keeps the CPU. The cursor advances to
/// just past the picked slot, which is what makes the rotation fair rather
/// than oscillating between two peers.
///
/// In round-robin mode: a single cursor walks the whole table.
pub fn select(
    tasks: &[Tcb; MAX_TASKS],
    current: usize,
    policy: &mut SchedPolicy,
) -> Option<usize> {
    if !policy.priority_based {
        let start = policy.rr_cursor as usize;
        for j in 1..=MAX_TASKS {
            let i = (start + j) % MAX_TASKS;
            if tasks[i].is_runnable() {
                policy.rr_cursor = i as u8;
                return Some(i);
            }
        }
        return None;
    }

    // Most important priority among runnable tasks.
    let best = tasks
        .iter()
        .filter(|t| t.is_runnable())
        .map(|t| t.current_priority.0)
        .min()?;

    let start = policy.cursors[best as usize] as usize;
    for j in 0..MAX_TASKS {
        let i = (start + j) % MAX_TASKS;
        if i == current {
            continue;
        }
        if tasks[i].is_runnable() && tasks[i].current_priority.0 == best {
            policy.cursors[best as usize] = ((i + 1) % MAX_TASKS) as u8;
            return Some(i);
        }
    }

    // No candidate other than the current task; keep it if it can still
    // run.
    if current < MAX_TASKS && tasks[current].is_runnable() {
        Some(current)
    } else {
        None
    }
}

/// Looks up a task slot by its durable identity (entry address).
pub fn find_by_entry(tasks: &[Tcb; MAX_TASKS], pid: Pid) -> Option<usize> {
    if pid.is_none() {
        return None;
    }
    tasks
        .iter()
        .position(|t| t.state != TaskState::Invalid && t.entry == pid)
}

/// Looks up a task slot by name. Exact match only.
pub fn find_by_name(tasks: &[Tcb; MAX_TASKS], name: &str) -> Option<usize> {
    tasks
        .iter()
        .position(|t| t.is_valid() && t.name.as_str() == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(entries: &[(usize, u8, TaskState)]) -> [Tcb; MAX_TASKS] {
        let mut tasks = core::array::from_fn(|_| Tcb::new());
        for &(i, prio, state) in entries {
            tasks[i].entry = Pid(0x100 + i as u32);
            tasks[i].state = state;
            tasks[i].base_priority = Priority(prio);
            tasks[i].current_priority = Priority(prio);
        }
        tasks
    }

    #[test]
    fn priority_mode_prefers_more_important() {
        let tasks = table_with(&[
            (0, 5, TaskState::Ready),
            (1, 1, TaskState::Ready),
            (2, 3, TaskState::Ready),
        ]);
        let mut policy = SchedPolicy::new();
        assert_eq!(select(&tasks, 0, &mut policy), Some(1));
    }

    #[test]
    fn equal_priority_peers_rotate_in_cursor_order() {
        // Property: peers at one priority are picked in (c, c+1, ...) mod N
        // order across a round.
        let tasks = table_with(&[
            (1, 2, TaskState::Ready),
            (4, 2, TaskState::Ready),
            (7, 2, TaskState::Ready),
        ]);
        let mut policy = SchedPolicy::new();
        let mut current = usize::MAX;
        let mut order = Vec::new();
        for _ in 0..6 {
            current = select(&tasks, current, &mut policy).unwrap();
            order.push(current);
        }
        assert_eq!(order, vec![1, 4, 7, 1, 4, 7]);
    }

    #[test]
    fn two_peers_do_not_starve_each_other() {
        let tasks = table_with(&[
            (2, 0, TaskState::Ready),
            (9, 0, TaskState::Ready),
        ]);
        let mut policy = SchedPolicy::new();
        let mut current = 2;
        for expected in [9, 2, 9, 2] {
            current = select(&tasks, current, &mut policy).unwrap();
            assert_eq!(current, expected);
        }
    }

    #[test]
    fn sole_runnable_task_keeps_cpu() {
        let tasks = table_with(&[(3, 4, TaskState::Ready)]);
        let mut policy = SchedPolicy::new();
        assert_eq!(select(&tasks, 3, &mut policy), Some(3));
    }

    #[test]
    fn unrun_tasks_are_candidates() {
        let tasks = table_with(&[(5, 6, TaskState::Unrun)]);
        let mut policy = SchedPolicy::new();
        assert_eq!(select(&tasks, usize::MAX, &mut policy), Some(5));
    }

    #[test]
    fn blocked_and_killed_are_skipped() {
        let tasks = table_with(&[
            (0, 1, TaskState::BlockedOnMutex),
            (1, 1, TaskState::Killed),
            (2, 7, TaskState::Ready),
        ]);
        let mut policy = SchedPolicy::new();
        assert_eq!(select(&tasks, usize::MAX, &mut policy), Some(2));
    }

    #[test]
    fn empty_ready_set_yields_none() {
        let tasks = table_with(&[(0, 1, TaskState::Delayed)]);
        let mut policy = SchedPolicy::new();
        assert_eq!(select(&tasks, 0, &mut policy), None);
    }

    #[test]
    fn round_robin_walks_the_whole_table() {
        let tasks = table_with(&[
            (0, 0, TaskState::Ready),
            (3, 7, TaskState::Ready),
            (6, 3, TaskState::Ready),
        ]);
        let mut policy = SchedPolicy::new();
        policy.priority_based = false;
        let mut current = usize::MAX;
        let mut order = Vec::new();
        for _ in 0..6 {
            current = select(&tasks, current, &mut policy).unwrap();
            order.push(current);
        }
        // Priorities are ignored; slots take turns in index order.
        assert_eq!(order, vec![0, 3, 6, 0, 3, 6]);
    }

    #[test]
    fn lookup_by_entry_and_name() {
        let mut tasks = table_with(&[(2, 1, TaskState::Ready)]);
        tasks[2].name.push_str("shell").unwrap();
        assert_eq!(find_by_entry(&tasks, Pid(0x102)), Some(2));
        assert_eq!(find_by_entry(&tasks, Pid(0xdead)), None);
        assert_eq!(find_by_entry(&tasks, Pid::NONE), None);
        assert_eq!(find_by_name(&tasks, "shell"), Some(2));
        assert_eq!(find_by_name(&tasks, "shel"), None);
    }

    #[test]
    fn killed_slots_remain_findable_by_entry() {
        let tasks = table_with(&[(4, 1, TaskState::Killed)]);
        assert_eq!(find_by_entry(&tasks, Pid(0x104)), Some(4));
    }
}
