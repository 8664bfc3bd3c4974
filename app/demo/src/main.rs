// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Demo application: a small task set over the kernel, with diagnostics on
//! the semihosting console.
//!
//! Intended for a Cortex-M machine under QEMU (semihosting from
//! unprivileged tasks relies on the emulator; on real hardware you would
//! back [`shell::Console`] and the diag sink with a UART instead).
//!
//! The host build is a stub so `cargo test --workspace` stays green; the
//! real program is target-only.

#![cfg_attr(all(target_arch = "arm", target_os = "none"), no_std)]
#![cfg_attr(all(target_arch = "arm", target_os = "none"), no_main)]

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod target {
    use cortex_m_rt::entry;
    use cortex_m_semihosting::hio;
    use kern::startup;
    use shell::{Console, Shell, UserApi};

    /// System clock in kHz, i.e. core cycles per millisecond tick.
    const CLOCK_KHZ: u32 = 40_000;

    const RESOURCE_MUTEX: u32 = 0;
    const WORK_SEM: u32 = 0;

    /// Diagnostic sink: one byte at a time over semihosting. Slow, but the
    /// contract only asks that it never suspends.
    fn diag_byte(b: u8) {
        if let Ok(mut out) = hio::hstdout() {
            let _ = out.write_all(&[b]);
        }
    }

    /// Write-only console for the shell; input needs a real UART.
    struct SemihostConsole;

    impl Console for SemihostConsole {
        fn getc(&mut self) -> Option<u8> {
            None
        }
        fn putc(&mut self, byte: u8) {
            diag_byte(byte);
        }
    }

    /// The always-runnable task the scheduler requires.
    fn idle() {
        loop {
            userlib::sys_yield();
        }
    }

    /// Periodically hands out work.
    fn producer() {
        loop {
            userlib::sleep(500);
            userlib::post(WORK_SEM);
        }
    }

    /// Consumes work items under the shared-resource mutex.
    fn consumer() {
        loop {
            userlib::wait(WORK_SEM);
            userlib::lock(RESOURCE_MUTEX);
            for _ in 0..10_000 {
                cortex_m::asm::nop();
            }
            userlib::unlock(RESOURCE_MUTEX);
        }
    }

    /// Burns CPU so `ps` has something to show, then lets go.
    fn spinner() {
        loop {
            for _ in 0..100_000 {
                cortex_m::asm::nop();
            }
            userlib::sys_yield();
        }
    }

    fn shell_main() {
        Shell::new(SemihostConsole, UserApi).run()
    }

    #[entry]
    fn main() -> ! {
        kern::diag::set_sink(diag_byte);

        startup::init_mutex(RESOURCE_MUTEX as usize);
        startup::init_semaphore(WORK_SEM as usize, 0);

        startup::create_task(idle, "idle", 7, 1024).unwrap();
        startup::create_task(producer, "producer", 2, 1024).unwrap();
        startup::create_task(consumer, "consumer", 2, 1536).unwrap();
        startup::create_task(spinner, "spinner", 5, 1024).unwrap();
        startup::create_task(shell_main, "shell", 4, 2048).unwrap();

        // Safety: called once, from privileged thread mode, tasks created.
        unsafe { startup::start_kernel(CLOCK_KHZ) }
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
fn main() {
    eprintln!("the demo application only runs on the target");
}
