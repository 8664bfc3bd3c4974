// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The diagnostic text sink.
//!
//! The kernel produces human-readable output in a few places: the `ps` and
//! `ipcs` tables, fault reports, and mode announcements. All of it funnels
//! through a single byte sink that the application installs at boot --
//! typically a busy-wait UART transmit routine.
//!
//! The sink contract is deliberately thin: it takes one byte, it must not
//! suspend (it is called from trap handlers), and it gets no say about
//! privilege. With no sink installed, output is dropped, which is the right
//! behavior for a headless build.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

static SINK: AtomicUsize = AtomicUsize::new(0);

/// Installs the byte sink. Call once at boot, before starting the kernel;
/// installing from a task would race nothing, but there is no reason to.
pub fn set_sink(sink: fn(u8)) {
    SINK.store(sink as usize, Ordering::Relaxed);
}

fn emit(b: u8) {
    let raw = SINK.load(Ordering::Relaxed);
    if raw != 0 {
        // Safety: the only non-zero value ever stored is a `fn(u8)`, stored
        // by `set_sink` above.
        let f: fn(u8) = unsafe { core::mem::transmute(raw) };
        f(b);
    }
}

/// `fmt::Write` adapter over the sink, so kernel code can use `write!`.
pub struct DiagWriter;

impl fmt::Write for DiagWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            emit(b);
        }
        Ok(())
    }
}

pub fn writer() -> DiagWriter {
    DiagWriter
}
