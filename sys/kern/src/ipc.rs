// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mutexes and counting semaphores.
//!
//! Both are fixed tables of kernel objects addressed by small integer ids
//! that tasks bake into their code. Wait queues are strict FIFO; exactly
//! one waiter is made ready per unlock or post. The state transitions live
//! in `syscalls`, next to the task-table bookkeeping they entangle with;
//! this module is the data and the queue mechanics.

use abi::{MAX_MUTEX_QUEUE_SIZE, MAX_SEMAPHORE_QUEUE_SIZE};
use heapless::Vec;

/// A non-recursive mutex with FIFO handoff: unlock transfers ownership
/// directly to the head waiter rather than racing the queue.
#[derive(Debug)]
pub struct Mutex {
    pub locked: bool,
    /// Task index of the owner, meaningful only while `locked`.
    pub owner: Option<u8>,
    pub wait_queue: Vec<u8, MAX_MUTEX_QUEUE_SIZE>,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            locked: false,
            owner: None,
            wait_queue: Vec::new(),
        }
    }

    /// Restores the boot state. `true` is the only possible outcome for an
    /// in-range id; the bool mirrors the table-bounds check at the call
    /// site.
    pub fn reset(&mut self) {
        self.locked = false;
        self.owner = None;
        self.wait_queue.clear();
    }

    /// FIFO dequeue.
    pub fn pop_waiter(&mut self) -> Option<u8> {
        if self.wait_queue.is_empty() {
            None
        } else {
            Some(self.wait_queue.remove(0))
        }
    }

    /// Drops `task` from the queue. A task waits on at most one primitive,
    /// so it can appear at most once.
    pub fn remove_waiter(&mut self, task: u8) {
        if let Some(pos) = self.wait_queue.iter().position(|&t| t == task) {
            self.wait_queue.remove(pos);
        }
    }

    /// A mutex is worth a line in `ipcs` only when held or contended.
    pub fn is_idle(&self) -> bool {
        !self.locked && self.wait_queue.is_empty()
    }
}

/// A counting semaphore. A post with waiters hands the token straight to
/// the head of the queue; the count never observably rises while somebody
/// is waiting.
#[derive(Debug)]
pub struct Semaphore {
    pub count: u16,
    pub wait_queue: Vec<u8, MAX_SEMAPHORE_QUEUE_SIZE>,
}

impl Semaphore {
    pub const fn new() -> Self {
        Self {
            count: 0,
            wait_queue: Vec::new(),
        }
    }

    pub fn reset(&mut self, count: u16) {
        self.count = count;
        self.wait_queue.clear();
    }

    /// FIFO dequeue.
    pub fn pop_waiter(&mut self) -> Option<u8> {
        if self.wait_queue.is_empty() {
            None
        } else {
            Some(self.wait_queue.remove(0))
        }
    }

    /// Drops `task` from the queue. A task waits on at most one primitive,
    /// so it can appear at most once.
    pub fn remove_waiter(&mut self, task: u8) {
        if let Some(pos) = self.wait_queue.iter().position(|&t| t == task) {
            self.wait_queue.remove(pos);
        }
    }

    /// A semaphore with no tokens and no waiters is not worth printing.
    pub fn is_idle(&self) -> bool {
        self.count == 0 && self.wait_queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex_queue_is_fifo() {
        let mut m = Mutex::new();
        for t in [3, 1, 7] {
            m.wait_queue.push(t).unwrap();
        }
        assert_eq!(m.pop_waiter(), Some(3));
        assert_eq!(m.pop_waiter(), Some(1));
        assert_eq!(m.pop_waiter(), Some(7));
        assert_eq!(m.pop_waiter(), None);
    }

    #[test]
    fn remove_waiter_preserves_order_of_the_rest() {
        let mut s = Semaphore::new();
        for t in [2, 5, 9] {
            s.wait_queue.push(t).unwrap();
        }
        s.remove_waiter(5);
        assert_eq!(s.pop_waiter(), Some(2));
        assert_eq!(s.pop_waiter(), Some(9));
    }

    #[test]
    fn idleness() {
        let mut m = Mutex::new();
        assert!(m.is_idle());
        m.locked = true;
        m.owner = Some(0);
        assert!(!m.is_idle());

        let mut s = Semaphore::new();
        assert!(s.is_idle());
        s.count = 1;
        assert!(!s.is_idle());
    }
}
