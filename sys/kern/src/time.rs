// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel timekeeping: the millisecond tick and what rides on it.
//!
//! The tick handler itself lives in `arch` (it owns the hardware timer and
//! the monotonic tick counter); the per-tick bookkeeping on kernel state is
//! here, as a `Kernel` method, so the host test harness can drive time by
//! hand.

use abi::TaskState;

use crate::kernel::Kernel;
use crate::task::NextTask;

/// In-kernel timestamp representation: milliseconds since boot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord, Default)]
pub struct Timestamp(u64);

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Conversion from the split low/high tick words the ARM port maintains,
/// since it has no 64-bit atomics.
impl From<[u32; 2]> for Timestamp {
    fn from(v: [u32; 2]) -> Self {
        Self(u64::from(v[0]) | u64::from(v[1]) << 32)
    }
}

impl From<Timestamp> for u64 {
    fn from(t: Timestamp) -> Self {
        t.0
    }
}

/// Length of the CPU-usage accounting window.
pub const NORMALIZE_WINDOW_MS: u32 = 2000;

impl Kernel {
    /// Per-millisecond bookkeeping. Charges the running task, counts down
    /// sleepers (waking those that reach zero), and once per window folds
    /// accumulated run time into `cpu_percent_centi`.
    ///
    /// Returns `Other` only when a sleeper woke *and* preemption is
    /// enabled; the timer never preempts on time-slice expiry alone.
    pub fn tick(&mut self) -> NextTask {
        let mut woke = false;

        if let Some(t) = self.tasks.get_mut(self.current) {
            if t.state == TaskState::Ready {
                t.run_time_ms += 1;
            }
        }

        for t in &mut self.tasks {
            if t.state == TaskState::Delayed && t.ticks_remaining > 0 {
                t.ticks_remaining -= 1;
                if t.ticks_remaining == 0 {
                    t.state = TaskState::Ready;
                    woke = true;
                }
            }
        }

        self.ms_counter += 1;
        if self.ms_counter >= NORMALIZE_WINDOW_MS {
            self.ms_counter = 0;
            self.normalize_usage();
        }

        if woke && self.preemption {
            NextTask::Other
        } else {
            NextTask::Same
        }
    }

    /// Converts each task's accumulated run time into hundredths of a
    /// percent of the total, then clears the accumulators for the next
    /// window. Killed tasks still hold a slot and are included (at zero
    /// accumulation), so `ps` shows them fading to 0.00.
    fn normalize_usage(&mut self) {
        let total: u32 = self
            .tasks
            .iter()
            .filter(|t| t.is_valid())
            .map(|t| t.run_time_ms)
            .sum();
        let total = total.max(1);

        for t in &mut self.tasks {
            if t.is_valid() {
                t.cpu_percent_centi = t.run_time_ms * 10_000 / total;
                t.run_time_ms = 0;
            }
        }
    }
}
