// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The supervisor-call dispatcher: one entry point, sixteen services.
//!
//! Every service runs to completion inside the trap with exclusive access
//! to the [`Kernel`]. A service either finishes synchronously (a free
//! semaphore token, a table lookup) or marks the caller non-runnable and
//! asks for a deferred switch; the returned [`NextTask`] is the only
//! channel for that request, and the actual switch happens later, in
//! PendSV.
//!
//! Arguments live in the caller's hardware-stacked frame (R0/R1), which is
//! the only safe place to read them -- the dispatcher's own locals are in
//! kernel memory the caller never sees. `pidof` writes its result back the
//! same way.
//!
//! Error posture at this boundary, by design: out-of-range ids, unknown
//! pids, and ownership violations are silently ignored. Tasks observe
//! kernel services as infallible.

use core::fmt::{self, Write};

use abi::{Pid, Priority, Sysnum, TaskState, MAX_TASKS};

use crate::arch::{self, ExceptionFrame};
use crate::diag;
use crate::kernel::{with_kernel, Kernel};
use crate::mpu;
use crate::task::{self, NextTask, Tcb};

/// Entry point from the architecture's SVC handler.
///
/// `nr` is the immediate byte decoded from the trapping instruction;
/// numbers that don't name a service are ignored.
pub fn service_entry(nr: u8, frame: &mut ExceptionFrame) {
    let Ok(service) = Sysnum::try_from(nr) else {
        return;
    };
    let next = with_kernel(|k| k.service(service, frame));
    if next == NextTask::Other {
        arch::pend_context_switch();
    }
}

impl Kernel {
    /// Executes one service on behalf of the current task.
    pub fn service(&mut self, service: Sysnum, frame: &mut ExceptionFrame) -> NextTask {
        match service {
            Sysnum::Yield => NextTask::Other,
            Sysnum::Sleep => self.sleep(frame.r0),
            Sysnum::Lock => self.lock(frame.r0),
            Sysnum::Unlock => self.unlock(frame.r0),
            Sysnum::Wait => self.wait(frame.r0),
            Sysnum::Post => self.post(frame.r0),
            Sysnum::Pidof => {
                frame.r0 = self.pidof(frame.r0).0;
                NextTask::Same
            }
            Sysnum::Reboot => arch::reset(),
            Sysnum::Kill => self.kill(Pid(frame.r0)),
            Sysnum::Restart => self.restart(Pid(frame.r0)),
            Sysnum::SetPriority => self.set_priority(Pid(frame.r0), frame.r1),
            Sysnum::Ps => {
                let _full = mpu::FullAccess::raise(self.current_srd());
                let _ = write_ps(&self.tasks, &mut diag::writer());
                NextTask::Same
            }
            Sysnum::Ipcs => {
                let _full = mpu::FullAccess::raise(self.current_srd());
                let _ = write_ipcs(self, &mut diag::writer());
                NextTask::Same
            }
            Sysnum::PriorityInheritance => self.set_pi(frame.r0 != 0),
            Sysnum::Preempt => self.set_preempt(frame.r0 != 0),
            Sysnum::SchedPolicy => self.set_sched(frame.r0 != 0),
        }
    }

    /// The caller's mask, for services that widen their own access and must
    /// put it back.
    fn current_srd(&self) -> u32 {
        match self.tasks.get(self.current) {
            Some(t) => t.srd_mask,
            None => mpu::SRD_FULL_ACCESS,
        }
    }

    /// Service 1: delay the caller for `ticks` milliseconds. A zero-tick
    /// sleep degenerates to yield rather than stranding the caller in
    /// `Delayed` with nothing to count down.
    fn sleep(&mut self, ticks: u32) -> NextTask {
        if ticks > 0 {
            let t = &mut self.tasks[self.current];
            t.ticks_remaining = ticks;
            t.state = TaskState::Delayed;
        }
        NextTask::Other
    }

    /// Service 2: take a mutex, or join its FIFO wait queue. Under the
    /// priority-inheritance policy, a blocked attempt lends the attacker's
    /// priority to the owner if it's stricter.
    fn lock(&mut self, id: u32) -> NextTask {
        let cur = self.current;
        let Some(m) = self.mutexes.get_mut(id as usize) else {
            return NextTask::Same;
        };

        if !m.locked {
            m.locked = true;
            m.owner = Some(cur as u8);
            self.tasks[cur].held_mutex = Some(id as u8);
            return NextTask::Same;
        }

        self.tasks[cur].state = TaskState::BlockedOnMutex;
        // Cannot fail: the queue holds MAX_TASKS and each task waits on at
        // most one primitive.
        let _ = m.wait_queue.push(cur as u8);

        if self.priority_inheritance {
            if let Some(owner) = m.owner {
                let attacker = self.tasks[cur].current_priority;
                let owner = &mut self.tasks[owner as usize];
                if attacker.is_more_important_than(owner.current_priority) {
                    owner.current_priority = attacker;
                }
            }
        }
        NextTask::Other
    }

    /// Service 3: release a mutex. Only the owner may unlock; ownership
    /// transfers directly to the head waiter, which becomes Ready. The
    /// unlocker's priority drops back to base, ending any inheritance
    /// boost.
    fn unlock(&mut self, id: u32) -> NextTask {
        let cur = self.current;
        let Some(m) = self.mutexes.get_mut(id as usize) else {
            return NextTask::Same;
        };
        if !m.locked || m.owner != Some(cur as u8) {
            return NextTask::Same;
        }

        if let Some(next) = m.pop_waiter() {
            m.owner = Some(next);
            let next = &mut self.tasks[next as usize];
            next.held_mutex = Some(id as u8);
            next.state = TaskState::Ready;
        } else {
            m.locked = false;
            m.owner = None;
        }

        let t = &mut self.tasks[cur];
        t.held_mutex = None;
        t.current_priority = t.base_priority;
        NextTask::Other
    }

    /// Service 4: take a semaphore token or join the FIFO wait queue.
    fn wait(&mut self, id: u32) -> NextTask {
        let cur = self.current;
        let Some(s) = self.semaphores.get_mut(id as usize) else {
            return NextTask::Same;
        };

        if s.count > 0 {
            s.count -= 1;
            return NextTask::Same;
        }

        self.tasks[cur].state = TaskState::BlockedOnSemaphore;
        self.tasks[cur].awaited_semaphore = Some(id as u8);
        let _ = s.wait_queue.push(cur as u8);
        NextTask::Other
    }

    /// Service 5: return a token. With waiters present the token is handed
    /// straight to the head of the queue; the count never observably
    /// rises.
    fn post(&mut self, id: u32) -> NextTask {
        let Some(s) = self.semaphores.get_mut(id as usize) else {
            return NextTask::Same;
        };

        s.count += 1;
        if let Some(next) = s.pop_waiter() {
            s.count -= 1;
            let next = &mut self.tasks[next as usize];
            next.state = TaskState::Ready;
            next.awaited_semaphore = None;
            return NextTask::Other;
        }
        NextTask::Same
    }

    /// Service 6: name -> pid. The name is read out of caller memory,
    /// bounded at the ABI length.
    fn pidof(&mut self, name_ptr: u32) -> Pid {
        let Some(name) = arch::read_task_name(name_ptr) else {
            return Pid::NONE;
        };
        match task::find_by_name(&self.tasks, name.as_str()) {
            Some(idx) => self.tasks[idx].entry,
            None => Pid::NONE,
        }
    }

    /// Service 8: kill a task by pid. The victim is pulled out of every
    /// wait queue; a mutex it owned is handed to the head waiter (or
    /// freed); its stack is released unless it is killing itself, in which
    /// case it keeps standing on the stack until the pended switch and
    /// `restart` reclaims it later. The descriptor keeps its identity and
    /// sizing so `restart` can rebuild it.
    fn kill(&mut self, pid: Pid) -> NextTask {
        let Some(idx) = task::find_by_entry(&self.tasks, pid) else {
            return NextTask::Same;
        };

        self.detach_from_ipc(idx);

        if idx != self.current && self.tasks[idx].stack_base != 0 {
            let base = self.tasks[idx].stack_base;
            self.heap.free(base, idx as u16 + 1);
            self.tasks[idx].stack_base = 0;
        }

        let t = &mut self.tasks[idx];
        t.state = TaskState::Killed;
        t.sp = 0;
        t.ticks_remaining = 0;
        t.run_time_ms = 0;
        t.cpu_percent_centi = 0;

        if idx == self.current {
            NextTask::Other
        } else {
            NextTask::Same
        }
    }

    /// Service 9: rebuild a task in place -- fresh stack of the recorded
    /// size, fresh SRD mask, counters cleared, state `Unrun`. Runs with
    /// full memory access since it touches the heap and another task's
    /// descriptor. If the heap cannot satisfy the stack, the task is left
    /// `Killed`.
    fn restart(&mut self, pid: Pid) -> NextTask {
        let _full = mpu::FullAccess::raise(self.current_srd());

        let Some(idx) = task::find_by_entry(&self.tasks, pid) else {
            return NextTask::Same;
        };

        // A stale queue entry must not wake the rebuilt task.
        self.detach_from_ipc(idx);

        if self.tasks[idx].stack_base != 0 {
            let base = self.tasks[idx].stack_base;
            self.heap.free(base, idx as u16 + 1);
            self.tasks[idx].stack_base = 0;
        }

        let bytes = self.tasks[idx].stack_bytes;
        match self.heap.allocate(bytes, idx as u16 + 1) {
            Some(base) => {
                let t = &mut self.tasks[idx];
                t.stack_base = base;
                t.sp = (base + bytes) & !0x7;
                t.srd_mask = mpu::srd_for_stack(base, bytes);
                t.ticks_remaining = 0;
                t.run_time_ms = 0;
                t.cpu_percent_centi = 0;
                t.state = TaskState::Unrun;
            }
            None => {
                // No stack, no task.
                self.tasks[idx].sp = 0;
                self.tasks[idx].state = TaskState::Killed;
            }
        }
        NextTask::Same
    }

    /// Service 10: reassign both base and current priority, clamped into
    /// range. Killed tasks keep their recorded priority untouched.
    fn set_priority(&mut self, pid: Pid, raw: u32) -> NextTask {
        let _full = mpu::FullAccess::raise(self.current_srd());

        let Some(idx) = task::find_by_entry(&self.tasks, pid) else {
            return NextTask::Same;
        };
        if self.tasks[idx].state == TaskState::Killed {
            return NextTask::Same;
        }

        let p = Priority::clamped(raw);
        self.tasks[idx].base_priority = p;
        self.tasks[idx].current_priority = p;

        if self.sched.priority_based && self.preemption {
            NextTask::Other
        } else {
            NextTask::Same
        }
    }

    /// Service 13: toggle the mutex priority-inheritance policy.
    fn set_pi(&mut self, on: bool) -> NextTask {
        let _full = mpu::FullAccess::raise(self.current_srd());
        self.priority_inheritance = on;
        let _ = write!(diag::writer(), "pi {}\n", if on { "on" } else { "off" });
        NextTask::Same
    }

    /// Service 14: toggle tick-driven preemption.
    fn set_preempt(&mut self, on: bool) -> NextTask {
        let _full = mpu::FullAccess::raise(self.current_srd());
        self.preemption = on;
        let _ = write!(
            diag::writer(),
            "preempt {}\n",
            if on { "on" } else { "off" }
        );
        NextTask::Same
    }

    /// Service 15: pick the priority scheduler or plain round-robin.
    fn set_sched(&mut self, priority_on: bool) -> NextTask {
        let _full = mpu::FullAccess::raise(self.current_srd());
        self.sched.priority_based = priority_on;
        let _ = write!(
            diag::writer(),
            "sched {}\n",
            if priority_on { "prio" } else { "rr" }
        );
        NextTask::Same
    }

    /// Pulls a task out of every semaphore and mutex wait queue, and passes
    /// on (or frees) any mutex it owns. Shared by kill and restart.
    fn detach_from_ipc(&mut self, idx: usize) {
        let victim = idx as u8;

        for s in &mut self.semaphores {
            s.remove_waiter(victim);
        }

        for (mid, m) in self.mutexes.iter_mut().enumerate() {
            m.remove_waiter(victim);

            if m.locked && m.owner == Some(victim) {
                if let Some(next) = m.pop_waiter() {
                    m.owner = Some(next);
                    let next = &mut self.tasks[next as usize];
                    next.held_mutex = Some(mid as u8);
                    next.state = TaskState::Ready;
                } else {
                    m.locked = false;
                    m.owner = None;
                }
            }
        }

        self.tasks[idx].held_mutex = None;
        self.tasks[idx].awaited_semaphore = None;
    }
}

/// Service 11: the task table, formatted for humans.
///
/// Columns are fixed: 15 name bytes, 8 state bytes, priority, then %CPU as
/// `whole.XX` with the hundredths always two digits.
pub fn write_ps(tasks: &[Tcb; MAX_TASKS], w: &mut impl fmt::Write) -> fmt::Result {
    write!(w, "\nNAME            STATE     PRIO  %CPU\n")?;
    write!(w, "--------------------------------------\n")?;
    for t in tasks {
        if !t.is_valid() {
            continue;
        }
        let whole = t.cpu_percent_centi / 100;
        let frac = t.cpu_percent_centi % 100;
        write!(
            w,
            "{:<15}{:<8}{}   {}.{:02}\n",
            t.name.as_str(),
            t.state.label(),
            t.base_priority.0,
            whole,
            frac
        )?;
    }
    Ok(())
}

/// Service 12: non-idle semaphores and held or contended mutexes, one line
/// each, wait queues listed in FIFO order by task name.
pub fn write_ipcs(k: &Kernel, w: &mut impl fmt::Write) -> fmt::Result {
    write!(w, "\nIPC TYPE  ID   STATE/INFO\n")?;
    write!(w, "--------------------------------------\n")?;

    for (i, s) in k.semaphores.iter().enumerate() {
        if s.is_idle() {
            continue;
        }
        write!(
            w,
            "SEM      {}   count={}  waiting={}",
            i,
            s.count,
            s.wait_queue.len()
        )?;
        write_queue(&s.wait_queue, &k.tasks, w)?;
        writeln!(w)?;
    }

    for (i, m) in k.mutexes.iter().enumerate() {
        if m.is_idle() {
            continue;
        }
        write!(w, "MUTEX    {}   locked={}  by=", i, m.locked as u32)?;
        match m.owner.filter(|_| m.locked) {
            Some(o) => write!(w, "{}", k.tasks[o as usize].name.as_str())?,
            None => write!(w, "---")?,
        }
        write!(w, "  waiting={}", m.wait_queue.len())?;
        write_queue(&m.wait_queue, &k.tasks, w)?;
        writeln!(w)?;
    }
    Ok(())
}

fn write_queue(
    queue: &[u8],
    tasks: &[Tcb; MAX_TASKS],
    w: &mut impl fmt::Write,
) -> fmt::Result {
    if queue.is_empty() {
        return Ok(());
    }
    write!(w, "  [")?;
    for (j, &t) in queue.iter().enumerate() {
        if j > 0 {
            write!(w, ", ")?;
        }
        write!(w, "{}", tasks[t as usize].name.as_str())?;
    }
    write!(w, "]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::MAX_BLOCKS;
    use crate::kernel::HEAP_BASE;

    fn frame_with(r0: u32, r1: u32) -> ExceptionFrame {
        ExceptionFrame {
            r0,
            r1,
            ..Default::default()
        }
    }

    /// Builds a kernel with the named tasks created, every task flipped to
    /// Ready (as if it had been dispatched once), and task 0 current.
    fn booted_kernel(specs: &[(&str, u8)]) -> Kernel {
        let mut k = Kernel::new();
        for (i, &(name, prio)) in specs.iter().enumerate() {
            k.create_task(Pid(0x1000 + i as u32), name, Priority(prio), 1024)
                .unwrap();
            k.tasks[i].state = TaskState::Ready;
        }
        k.current = 0;
        k
    }

    fn run_service(k: &mut Kernel, who: usize, service: Sysnum, r0: u32) -> NextTask {
        k.current = who;
        let mut frame = frame_with(r0, 0);
        k.service(service, &mut frame)
    }

    #[test]
    fn yield_changes_no_task_state() {
        let mut k = booted_kernel(&[("a", 2), ("b", 2)]);
        let mut frame = frame_with(7, 13);
        let next = k.service(Sysnum::Yield, &mut frame);
        assert_eq!(next, NextTask::Other);
        assert_eq!(frame.r0, 7);
        assert_eq!(k.tasks[0].state, TaskState::Ready);
        assert_eq!(k.tasks[1].state, TaskState::Ready);
    }

    #[test]
    fn sleep_delays_the_caller() {
        let mut k = booted_kernel(&[("a", 2)]);
        let next = run_service(&mut k, 0, Sysnum::Sleep, 100);
        assert_eq!(next, NextTask::Other);
        assert_eq!(k.tasks[0].state, TaskState::Delayed);
        assert_eq!(k.tasks[0].ticks_remaining, 100);
    }

    #[test]
    fn sleep_zero_is_just_a_yield() {
        let mut k = booted_kernel(&[("a", 2)]);
        let next = run_service(&mut k, 0, Sysnum::Sleep, 0);
        assert_eq!(next, NextTask::Other);
        assert_eq!(k.tasks[0].state, TaskState::Ready);
    }

    #[test]
    fn mutex_handoff_is_fifo() {
        // Three equal-priority tasks contend; ownership must follow
        // attempt order.
        let mut k = booted_kernel(&[("A", 2), ("B", 2), ("C", 2)]);
        k.init_mutex(0);

        assert_eq!(run_service(&mut k, 0, Sysnum::Lock, 0), NextTask::Same);
        assert_eq!(run_service(&mut k, 1, Sysnum::Lock, 0), NextTask::Other);
        assert_eq!(run_service(&mut k, 2, Sysnum::Lock, 0), NextTask::Other);
        assert_eq!(k.tasks[1].state, TaskState::BlockedOnMutex);
        assert_eq!(k.tasks[2].state, TaskState::BlockedOnMutex);

        let mut out = String::new();
        write_ipcs(&k, &mut out).unwrap();
        assert!(
            out.contains("MUTEX    0   locked=1  by=A  waiting=2  [B, C]"),
            "unexpected ipcs output:\n{out}"
        );

        assert_eq!(run_service(&mut k, 0, Sysnum::Unlock, 0), NextTask::Other);
        assert_eq!(k.mutexes[0].owner, Some(1));
        assert_eq!(k.tasks[1].state, TaskState::Ready);
        assert_eq!(k.tasks[1].held_mutex, Some(0));
        assert_eq!(k.tasks[0].held_mutex, None);

        assert_eq!(run_service(&mut k, 1, Sysnum::Unlock, 0), NextTask::Other);
        assert_eq!(k.mutexes[0].owner, Some(2));
        assert_eq!(k.tasks[2].state, TaskState::Ready);

        assert_eq!(run_service(&mut k, 2, Sysnum::Unlock, 0), NextTask::Other);
        assert!(!k.mutexes[0].locked);
        assert_eq!(k.mutexes[0].owner, None);
    }

    #[test]
    fn unlock_by_non_owner_is_ignored() {
        let mut k = booted_kernel(&[("A", 2), ("B", 2)]);
        k.init_mutex(0);
        let _ = run_service(&mut k, 0, Sysnum::Lock, 0);
        assert_eq!(run_service(&mut k, 1, Sysnum::Unlock, 0), NextTask::Same);
        assert!(k.mutexes[0].locked);
        assert_eq!(k.mutexes[0].owner, Some(0));
    }

    #[test]
    fn out_of_range_ids_are_ignored() {
        let mut k = booted_kernel(&[("A", 2)]);
        for service in [Sysnum::Lock, Sysnum::Unlock, Sysnum::Wait, Sysnum::Post] {
            assert_eq!(run_service(&mut k, 0, service, 99), NextTask::Same);
        }
        assert_eq!(k.tasks[0].state, TaskState::Ready);
    }

    #[test]
    fn priority_inheritance_boosts_and_restores() {
        let mut k = booted_kernel(&[("owner", 5), ("attacker", 1)]);
        k.init_mutex(0);
        k.priority_inheritance = true;

        let _ = run_service(&mut k, 0, Sysnum::Lock, 0);
        let _ = run_service(&mut k, 1, Sysnum::Lock, 0);
        // The owner now runs at the attacker's priority...
        assert_eq!(k.tasks[0].current_priority, Priority(1));
        assert_eq!(k.tasks[0].base_priority, Priority(5));

        let _ = run_service(&mut k, 0, Sysnum::Unlock, 0);
        // ...and drops back to base at unlock, with ownership handed over.
        assert_eq!(k.tasks[0].current_priority, Priority(5));
        assert_eq!(k.mutexes[0].owner, Some(1));
    }

    #[test]
    fn no_boost_when_policy_is_off() {
        let mut k = booted_kernel(&[("owner", 5), ("attacker", 1)]);
        k.init_mutex(0);
        let _ = run_service(&mut k, 0, Sysnum::Lock, 0);
        let _ = run_service(&mut k, 1, Sysnum::Lock, 0);
        assert_eq!(k.tasks[0].current_priority, Priority(5));
    }

    #[test]
    fn semaphore_tokens_then_fifo_wakeups() {
        let mut k = booted_kernel(&[("A", 2), ("B", 2), ("C", 2)]);
        k.init_semaphore(0, 1);

        // A drains the initial token.
        assert_eq!(run_service(&mut k, 0, Sysnum::Wait, 0), NextTask::Same);
        assert_eq!(k.semaphores[0].count, 0);
        // B and C block in order.
        assert_eq!(run_service(&mut k, 1, Sysnum::Wait, 0), NextTask::Other);
        assert_eq!(run_service(&mut k, 2, Sysnum::Wait, 0), NextTask::Other);
        assert_eq!(k.tasks[1].awaited_semaphore, Some(0));

        // Each post wakes exactly one waiter, FIFO, without the count ever
        // observably rising.
        assert_eq!(run_service(&mut k, 0, Sysnum::Post, 0), NextTask::Other);
        assert_eq!(k.tasks[1].state, TaskState::Ready);
        assert_eq!(k.tasks[2].state, TaskState::BlockedOnSemaphore);
        assert_eq!(k.semaphores[0].count, 0);

        assert_eq!(run_service(&mut k, 0, Sysnum::Post, 0), NextTask::Other);
        assert_eq!(k.tasks[2].state, TaskState::Ready);
        assert_eq!(k.semaphores[0].count, 0);

        // A post with nobody waiting banks a token.
        assert_eq!(run_service(&mut k, 0, Sysnum::Post, 0), NextTask::Same);
        assert_eq!(k.semaphores[0].count, 1);
    }

    #[test]
    fn ipcs_shows_non_idle_semaphores() {
        let mut k = booted_kernel(&[("A", 2), ("B", 2)]);
        k.init_semaphore(0, 0);
        k.init_semaphore(1, 3);
        let _ = run_service(&mut k, 1, Sysnum::Wait, 0);

        let mut out = String::new();
        write_ipcs(&k, &mut out).unwrap();
        assert!(out.contains("SEM      0   count=0  waiting=1  [B]"));
        assert!(out.contains("SEM      1   count=3  waiting=0"));
    }

    #[test]
    fn kill_frees_stack_and_wait_queue_entries() {
        // Scenario: T1 holds two blocks, T2 three; killing T1 releases
        // exactly T1's blocks.
        let mut k = Kernel::new();
        k.create_task(Pid(0x10), "T1", Priority(2), 2048).unwrap();
        k.create_task(Pid(0x20), "T2", Priority(2), 3072).unwrap();
        k.tasks[0].state = TaskState::Ready;
        k.tasks[1].state = TaskState::Ready;
        k.current = 1;
        assert_eq!(k.heap.free_blocks(), MAX_BLOCKS - 5);

        assert_eq!(run_service(&mut k, 1, Sysnum::Kill, 0x10), NextTask::Same);
        assert_eq!(k.tasks[0].state, TaskState::Killed);
        assert_eq!(k.tasks[0].stack_base, 0);
        assert_eq!(k.heap.free_blocks(), MAX_BLOCKS - 3);
        // T1's old blocks are immediately reusable; T2's are not.
        assert_eq!(k.heap.allocate(2048, 9), Some(HEAP_BASE));
    }

    #[test]
    fn kill_detaches_the_victim_from_queues() {
        let mut k = booted_kernel(&[("A", 2), ("B", 2)]);
        k.init_mutex(0);
        let _ = run_service(&mut k, 0, Sysnum::Lock, 0);
        let _ = run_service(&mut k, 1, Sysnum::Lock, 0);

        // B dies while queued; the later unlock must wake nobody.
        let _ = run_service(&mut k, 0, Sysnum::Kill, 0x1001);
        assert!(k.mutexes[0].wait_queue.is_empty());
        let _ = run_service(&mut k, 0, Sysnum::Unlock, 0);
        assert!(!k.mutexes[0].locked);
        assert_eq!(k.tasks[1].state, TaskState::Killed);
    }

    #[test]
    fn killing_an_owner_hands_the_mutex_over() {
        let mut k = booted_kernel(&[("A", 2), ("B", 2), ("C", 2)]);
        k.init_mutex(0);
        let _ = run_service(&mut k, 0, Sysnum::Lock, 0);
        let _ = run_service(&mut k, 1, Sysnum::Lock, 0);

        let _ = run_service(&mut k, 2, Sysnum::Kill, 0x1000);
        assert_eq!(k.mutexes[0].owner, Some(1));
        assert_eq!(k.tasks[1].state, TaskState::Ready);
        assert_eq!(k.tasks[0].state, TaskState::Killed);
    }

    #[test]
    fn self_kill_pends_a_switch_and_keeps_the_stack() {
        let mut k = booted_kernel(&[("A", 2), ("B", 2)]);
        let base = k.tasks[0].stack_base;
        assert_eq!(run_service(&mut k, 0, Sysnum::Kill, 0x1000), NextTask::Other);
        assert_eq!(k.tasks[0].state, TaskState::Killed);
        // Still standing on it until the pended switch; restart reclaims.
        assert_eq!(k.tasks[0].stack_base, base);
    }

    #[test]
    fn restart_rebuilds_a_killed_task() {
        // Scenario: counters cleared, fresh stack, Unrun; the next
        // dispatch takes it to Ready.
        let mut k = booted_kernel(&[("A", 2), ("B", 2)]);
        k.tasks[0].run_time_ms = 1234;
        k.tasks[0].cpu_percent_centi = 4321;
        let _ = run_service(&mut k, 1, Sysnum::Kill, 0x1000);

        assert_eq!(run_service(&mut k, 1, Sysnum::Restart, 0x1000), NextTask::Same);
        let t = &k.tasks[0];
        assert_eq!(t.state, TaskState::Unrun);
        assert_eq!(t.run_time_ms, 0);
        assert_eq!(t.cpu_percent_centi, 0);
        assert_ne!(t.stack_base, 0);
        assert_eq!(t.sp % 8, 0);
        assert_eq!(t.srd_mask, mpu::srd_for_stack(t.stack_base, t.stack_bytes));

        // Dispatch completes the Killed -> Unrun -> Ready round trip.
        k.current = crate::kernel::NO_TASK;
        k.tasks[1].state = TaskState::BlockedOnMutex; // park the other task
        k.switch_context(0);
        assert_eq!(k.current, 0);
        assert_eq!(k.tasks[0].state, TaskState::Ready);
    }

    #[test]
    fn restart_failure_leaves_the_task_killed() {
        let mut k = booted_kernel(&[("A", 2), ("B", 2)]);
        let _ = run_service(&mut k, 1, Sysnum::Kill, 0x1000);
        // Somebody eats the whole heap before the restart.
        assert!(k.heap.allocate(1024, 99).is_some());
        assert!(k.heap.allocate(26 * 1024, 99).is_some());
        assert_eq!(k.heap.free_blocks(), 0);
        let _ = run_service(&mut k, 1, Sysnum::Restart, 0x1000);
        assert_eq!(k.tasks[0].state, TaskState::Killed);
        assert_eq!(k.tasks[0].stack_base, 0);
    }

    #[test]
    fn restart_widens_access_and_restores_the_callers_mask() {
        let mut k = booted_kernel(&[("A", 2), ("B", 2)]);
        let _ = run_service(&mut k, 1, Sysnum::Kill, 0x1000);
        arch::apply_srd_mask(k.tasks[1].srd_mask);
        let _ = run_service(&mut k, 1, Sysnum::Restart, 0x1000);
        assert_eq!(arch::current_srd_mask(), k.tasks[1].srd_mask);
    }

    #[test]
    fn set_priority_clamps_and_updates_both_priorities() {
        let mut k = booted_kernel(&[("A", 2), ("B", 5)]);
        let next = {
            k.current = 0;
            let mut frame = frame_with(0x1001, 99);
            k.service(Sysnum::SetPriority, &mut frame)
        };
        // priority scheduler + preemption are both on by default
        assert_eq!(next, NextTask::Other);
        assert_eq!(k.tasks[1].base_priority, Priority(7));
        assert_eq!(k.tasks[1].current_priority, Priority(7));
    }

    #[test]
    fn set_priority_ignores_killed_tasks() {
        let mut k = booted_kernel(&[("A", 2), ("B", 5)]);
        let _ = run_service(&mut k, 0, Sysnum::Kill, 0x1001);
        k.current = 0;
        let mut frame = frame_with(0x1001, 1);
        let _ = k.service(Sysnum::SetPriority, &mut frame);
        assert_eq!(k.tasks[1].base_priority, Priority(5));
    }

    #[test]
    fn mode_toggles_flip_kernel_flags() {
        let mut k = booted_kernel(&[("A", 2)]);
        let _ = run_service(&mut k, 0, Sysnum::PriorityInheritance, 1);
        assert!(k.priority_inheritance);
        let _ = run_service(&mut k, 0, Sysnum::Preempt, 0);
        assert!(!k.preemption);
        let _ = run_service(&mut k, 0, Sysnum::SchedPolicy, 0);
        assert!(!k.sched.priority_based);
    }

    #[test]
    fn wakeup_preempts_a_less_important_task() {
        // Scenario: A (prio 5) runs while B (prio 1) sleeps 100 ms; at the
        // 100th tick B becomes Ready and the next pick is B.
        let mut k = Kernel::new();
        k.create_task(Pid(0xA), "A", Priority(5), 1024).unwrap();
        k.create_task(Pid(0xB), "B", Priority(1), 1024).unwrap();

        // First dispatch goes to B, the more important task.
        k.switch_context(0);
        assert_eq!(k.current, 1);

        // B sleeps; the deferred switch hands the CPU to A.
        assert_eq!(run_service(&mut k, 1, Sysnum::Sleep, 100), NextTask::Other);
        let sp = k.switch_context(0);
        assert_eq!(k.current, 0);

        // 99 quiet ticks, then the wakeup tick requests a switch...
        for _ in 0..99 {
            assert_eq!(k.tick(), NextTask::Same);
        }
        assert_eq!(k.tick(), NextTask::Other);
        // ...and the scheduler picks B, not A.
        k.switch_context(sp);
        assert_eq!(k.current, 1);
    }

    #[test]
    fn ps_formats_the_task_table() {
        let mut k = booted_kernel(&[("idle", 7), ("shell", 4)]);
        k.tasks[0].cpu_percent_centi = 905; // 9.05%
        k.tasks[1].cpu_percent_centi = 7; // 0.07%
        k.tasks[1].state = TaskState::Delayed;

        let mut out = String::new();
        write_ps(&k.tasks, &mut out).unwrap();
        assert!(out.contains("NAME            STATE     PRIO  %CPU"));
        assert!(out.contains("idle           READY   7   9.05\n"));
        assert!(out.contains("shell          DELAYED 4   0.07\n"));
    }

    #[test]
    fn ps_shows_killed_tasks_and_skips_empty_slots() {
        let mut k = booted_kernel(&[("A", 2)]);
        let _ = run_service(&mut k, 0, Sysnum::Kill, 0x1000);
        let mut out = String::new();
        write_ps(&k.tasks, &mut out).unwrap();
        assert!(out.contains("A              KILLED"));
        // Two header lines plus exactly one task line.
        assert_eq!(out.lines().filter(|l| !l.is_empty()).count(), 3);
    }

    #[test]
    fn unknown_service_numbers_are_ignored() {
        assert!(Sysnum::try_from(16).is_err());
        assert!(Sysnum::try_from(0xFF).is_err());
    }

    #[test]
    fn dispatch_pends_the_deferred_switch_for_yield() {
        // Through the real entry point: service number 0 pends a switch and
        // touches no task state; an unknown number does nothing at all.
        let _ = arch::take_pended_switch();
        let mut frame = frame_with(0, 0);
        service_entry(0, &mut frame);
        assert!(arch::take_pended_switch());

        service_entry(42, &mut frame);
        assert!(!arch::take_pended_switch());
    }

    #[test]
    fn full_percent_formats_with_two_digits() {
        let mut k = booted_kernel(&[("hog", 0)]);
        k.tasks[0].cpu_percent_centi = 10_000;
        let mut out = String::new();
        write_ps(&k.tasks, &mut out).unwrap();
        assert!(out.contains("hog            READY   0   100.00\n"));
    }
}
