// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M.
//!
//! # Notes on ARM-M interrupts
//!
//! This implementation uses three interrupt service routines:
//!
//! - `SVCall` implements the `SVC` instruction used to request kernel
//!   services.
//! - `SysTick` handles the 1 ms system timer, which drives sleep timeouts
//!   and CPU usage accounting.
//! - `PendSV` handles deferred context switches.
//!
//! The first two are expected; the last one deserves an explanation.
//!
//! On any exception, the processor stacks a small subset of machine state
//! (R0-R3, R12, LR, PC, xPSR) onto the interrupted stack and then calls our
//! ISR, which is a normal Rust function. That's fine as long as the code you
//! return to is the same code that trapped -- but for a context switch it
//! isn't, and the callee-saved registers (R4-R11) still hold the outgoing
//! task's values.
//!
//! So no handler replaces the running task directly. A handler that decides
//! a switch is needed pokes the PendSV pend bit; PendSV is configured at the
//! same (lowest) priority as the other kernel entry points, so it runs after
//! the current handler chain finishes, does the full callee-saved
//! save/restore around the scheduler, and returns into the incoming task.
//! This serialization is also what lets the rest of the kernel mutate its
//! tables without locks.
//!
//! A task's saved stack pointer always points at eight callee-saved words
//! followed by the eight-word hardware frame; the PendSV sequence below is
//! the only producer of that layout.

use core::arch::{self, global_asm};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::ExceptionFrame;
use crate::task::NextTask;
use crate::time::Timestamp;

/// Log things from kernel context. This macro is made visible to the rest of
/// the kernel by a chain of `#[macro_use]` attributes, but its implementation
/// is very architecture-specific at the moment.
///
/// There are two ways to log: via semihosting (configured via the
/// "klog-semihosting" feature) or via the ARM's Instrumentation Trace
/// Macrocell (configured via the "klog-itm" feature). If neither of these
/// features is enabled, klog! will be stubbed out.
#[cfg(not(any(feature = "klog-semihosting", feature = "klog-itm")))]
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

#[cfg(feature = "klog-itm")]
macro_rules! klog {
    ($s:expr) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR).stim[0];
            cortex_m::iprintln!(stim, $s);
        }
    };
    ($s:expr, $($tt:tt)*) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR).stim[0];
            cortex_m::iprintln!(stim, $s, $($tt)*);
        }
    };
}

#[cfg(feature = "klog-semihosting")]
macro_rules! klog {
    ($s:expr) => { let _ = cortex_m_semihosting::hprintln!($s); };
    ($s:expr, $($tt:tt)*) => { let _ = cortex_m_semihosting::hprintln!($s, $($tt)*); };
}

/// Initially we just set the Thumb Mode bit, the minimum required.
const INITIAL_PSR: u32 = 1 << 24;

/// EXC_RETURN value meaning "return to Thread mode, using the process
/// stack." Every kernel entry is taken from a task in that configuration, so
/// this is the only magic return value we ever need.
const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// Kernel global for tracking the current timestamp, measured in ticks.
///
/// This is a pair of `AtomicU32` because (1) we want the interior mutability
/// of the atomic types but (2) ARMv7-M doesn't have any 64-bit atomic
/// operations. We access this only from contexts where we can't be
/// preempted, so the fact that it's split across two words is ok.
///
/// `TICKS[0]` is the least significant part, `TICKS[1]` the most
/// significant.
static TICKS: [AtomicU32; 2] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const ZERO: AtomicU32 = AtomicU32::new(0);
    [ZERO; 2]
};

/// Reads the tick counter.
pub fn now() -> Timestamp {
    // The systick interrupt cannot preempt kernel code, so we're safe to
    // read this in two nonatomic parts here.
    Timestamp::from([
        TICKS[0].load(Ordering::Relaxed),
        TICKS[1].load(Ordering::Relaxed),
    ])
}

/// Requests a deferred context switch. It will occur once the active handler
/// chain unwinds, not before.
pub fn pend_context_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
}

/// Requests a system reset.
pub fn reset() -> ! {
    cortex_m::peripheral::SCB::sys_reset()
}

/// Fabricates the state a task needs in order to be entered "for the first
/// time" by the deferred-switch return path: a hardware frame that resumes
/// at `entry` in Thumb mode, below it the eight dummy callee-saved words the
/// restore sequence will pop. Returns the resulting stack pointer.
///
/// The entry address comes from a Rust `fn` pointer, which on this target
/// already carries the Thumb bit; nothing outside this module needs to know
/// that bit exists.
pub fn initialize_task_frame(stack_top: u32, entry: u32) -> u32 {
    // Hardware requires 8-byte alignment of the stack at exception entry.
    let frame_addr = (stack_top & !0x7) - 8 * 4;

    // Safety: the caller hands us the top of a stack freshly carved from the
    // kernel's own heap; nothing else refers to it, and ExceptionFrame is
    // plain bytes.
    unsafe {
        core::ptr::write(
            frame_addr as *mut ExceptionFrame,
            ExceptionFrame {
                r0: 0,
                r1: 0,
                r2: 0,
                r3: 0,
                r12: 0,
                lr: EXC_RETURN_THREAD_PSP,
                pc: entry,
                xpsr: INITIAL_PSR,
            },
        );
    }

    // Below that, the eight callee-saved words the PendSV epilogue pops.
    let sp = frame_addr - 8 * 4;
    for i in 0..8 {
        // Safety: same stack, still exclusively ours.
        unsafe {
            core::ptr::write((sp + i * 4) as *mut u32, 0);
        }
    }
    sp
}

/// Copies a NUL-terminated task name out of caller memory.
///
/// The kernel runs with `PRIVDEFENA` set, so this read is not subject to the
/// caller's MPU mask; the bound keeps a malformed pointer from walking
/// memory. Anything unprintable, unterminated, or longer than a legal task
/// name yields `None`, which callers treat the same as "no match."
pub fn read_task_name(addr: u32) -> Option<crate::task::TaskName> {
    if addr == 0 {
        return None;
    }
    let mut name = crate::task::TaskName::new();
    for i in 0..=abi::TASK_NAME_LEN as u32 {
        // Safety: byte-sized read from an address the caller could have read
        // itself; bounded by TASK_NAME_LEN + 1.
        let b = unsafe { core::ptr::read_volatile((addr + i) as *const u8) };
        if b == 0 {
            return Some(name);
        }
        if !(0x20..0x7F).contains(&b) {
            return None;
        }
        if name.push(b as char).is_err() {
            return None;
        }
    }
    None
}

/// Installs the static MPU layout: flash, peripheral space, and the four
/// SRAM regions whose sub-region disable bytes the context switcher rewrites
/// on every dispatch. Leaves the MPU enabled with `PRIVDEFENA`, so
/// privileged code keeps the default map regardless of task masks.
pub fn init_mpu() {
    // We are manufacturing authority to interact with the MPU here, because
    // we can't thread a cortex-specific peripheral through an
    // architecture-independent API.
    let mpu = unsafe {
        // At least by not taking a &mut we're confident we're not violating
        // aliasing....
        &*cortex_m::peripheral::MPU::PTR
    };

    const ENABLE: u32 = 0b001;
    const PRIVDEFENA: u32 = 0b100;

    // Region attribute and size register fields. Sizes are encoded as log2
    // minus one, so an 8 KiB region carries 12 and 128 KiB carries 16.
    const fn rasr(xn: bool, tex_scb: u32, srd: u32, l2size_m1: u32) -> u32 {
        // AP = 0b011: full access from both privilege levels; the SRD byte
        // is what takes access away per task.
        (xn as u32) << 28 | 0b011 << 24 | tex_scb << 16 | srd << 8 | l2size_m1 << 1 | 1
    }
    // TEX/S/C/B for ordinary memory: outer and inner write-back, read and
    // write allocate, not shared.
    const NORMAL: u32 = 0b001_0_1_1;
    // Device memory.
    const DEVICE: u32 = 0b000_0_0_1;

    // With the MPU off, there are no particular constraints on the order in
    // which we write these registers.
    //
    // Safety: we're messing with memory protection, so from the API's point
    // of view this is very unsafe. But the values describe the fixed layout
    // this kernel is built around, and privileged code is exempted via
    // PRIVDEFENA below.
    unsafe {
        mpu.ctrl.write(0);

        // Four adjacent 8 KiB SRAM regions, each split into eight 1 KiB
        // sub-regions. All sub-regions start disabled; dispatch loads each
        // task's mask.
        for i in 0..4 {
            mpu.rnr.write(i);
            mpu.rbar.write(crate::mpu::SRAM_BASE + i * crate::mpu::MPU_REGION_SIZE);
            mpu.rasr.write(rasr(false, NORMAL, 0xFF, 12));
        }

        // Flash: 128 KiB at zero, executable.
        mpu.rnr.write(4);
        mpu.rbar.write(0x0000_0000);
        mpu.rasr.write(rasr(false, NORMAL, 0, 16));

        // Peripherals: 512 MiB at 0x4000_0000, execute-never.
        mpu.rnr.write(5);
        mpu.rbar.write(0x4000_0000);
        mpu.rasr.write(rasr(true, DEVICE, 0, 28));

        mpu.ctrl.write(ENABLE | PRIVDEFENA);
    }
}

/// Loads a per-task sub-region-disable mask into the four SRAM regions,
/// eight bits apiece, little-endian across regions 0..3.
///
/// Because a region consists of several registers, there is no order in
/// which we can update them with the MPU enabled that doesn't risk a task
/// briefly seeing a half-written region. Disabling and re-enabling the MPU
/// is single-digit cycles, so do the correct thing.
pub fn apply_srd_mask(mask: u32) {
    let mpu = unsafe {
        // At least by not taking a &mut we're confident we're not violating
        // aliasing....
        &*cortex_m::peripheral::MPU::PTR
    };

    const ENABLE: u32 = 0b001;
    const PRIVDEFENA: u32 = 0b100;

    // Safety: same considerations as init_mpu; only the SRD bytes change.
    unsafe {
        mpu.ctrl.write(0);
        for region in 0..4 {
            mpu.rnr.write(region);
            let attr = mpu.rasr.read();
            let srd = (mask >> (region * 8)) & 0xFF;
            mpu.rasr.write((attr & !(0xFF << 8)) | srd << 8);
        }
        mpu.ctrl.write(ENABLE | PRIVDEFENA);
    }
}

/// Starts the kernel: configures exception priorities and the system timer,
/// then drops to unprivileged Thread mode on the process stack and enters
/// the first task.
///
/// # Safety
///
/// This must be called exactly once per boot, from privileged Thread mode on
/// the main stack, after `init_mpu` and with `sp`/`entry` describing a task
/// the scheduler has chosen.
pub unsafe fn start_first_task(tick_divisor: u32, sp: u32, entry: u32) -> ! {
    // Enable faults and set fault/exception priorities to reasonable
    // settings. Our goal here is to keep the kernel non-preemptive, which
    // means the kernel entry points (SVCall, PendSV, SysTick, interrupt
    // handlers) must be at one priority level. Fault handlers need to be
    // higher priority, however, so that we can detect faults in the kernel.
    //
    // Safety: this is actually fairly safe. We're purely lowering priorities
    // from their defaults, so it can't cause any surprise preemption or
    // anything. But these operations are `unsafe` in the `cortex_m` crate.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // Distinguish MEMFAULT, BUSFAULT, and USGFAULT from HardFault.
        scb.shcsr.modify(|x| x | 0b111 << 16);

        // Set priority of Usage, Bus, MemManage to 0 (highest configurable).
        scb.shpr[0].write(0x00);
        scb.shpr[1].write(0x00);
        scb.shpr[2].write(0x00);
        // Set priority of SVCall to 0xFF (lowest configurable).
        scb.shpr[7].write(0xFF);
        // PendSV and SysTick also to 0xFF.
        scb.shpr[10].write(0xFF);
        scb.shpr[11].write(0xFF);

        // ARM's default disposition is that division by zero doesn't
        // actually fail, but rather returns 0. (!) We explicitly configure
        // ourselves to trap on any divide by zero.
        const DIV_0_TRP: u32 = 1 << 4;
        scb.ccr.modify(|x| x | DIV_0_TRP);

        // Configure the priority of all external interrupts so that they
        // can't preempt the kernel.
        let nvic = &*cortex_m::peripheral::NVIC::PTR;
        let icb = &*cortex_m::peripheral::ICB::PTR;
        let ictr = icb.ictr.read();
        // This gives interrupt count in blocks of 32, minus 1, so there are
        // always at least 32 interrupts.
        let irq_block_count = (ictr as usize & 0xF) + 1;
        let irq_count = irq_block_count * 32;
        for i in 0..irq_count {
            nvic.ipr[i].write(0xFFu8);
        }
    }

    // Safety: this, too, is safe in practice but unsafe in API.
    unsafe {
        // Configure the timer.
        let syst = &*cortex_m::peripheral::SYST::PTR;
        // Program reload value.
        syst.rvr.write(tick_divisor - 1);
        // Clear current value.
        syst.cvr.write(0);
        // Enable counter and interrupt.
        syst.csr.modify(|v| v | 0b111);
    }

    // Move Thread mode onto the process stack, shed privileges, and jump
    // into the task. After the CONTROL write we are a guest in our own
    // machine; every further kernel entry comes through an exception.
    //
    // Safety: `entry` is a task entry point (with Thumb bit) and `sp` its
    // private stack top; the caller vouches for both.
    unsafe {
        arch::asm!(
            "
            msr PSP, {sp}
            msr CONTROL, {control}
            isb
            bx {entry}
            ",
            sp = in(reg) sp,
            control = in(reg) 0b11u32, // SPSEL | nPRIV
            entry = in(reg) entry,
            options(noreturn),
        )
    }
}

// Handler that gets linked into the vector table for the Supervisor Call
// (SVC) instruction.
//
// No context switch happens here -- services that need one pend PendSV --
// so a plain Rust handler is sufficient: the hardware has already stacked
// everything the dispatcher is allowed to touch onto the caller's private
// stack.
#[allow(non_snake_case)]
#[no_mangle]
unsafe extern "C" fn SVCall() {
    let psp = cortex_m::register::psp::read();

    // Safety: an SVC only arrives from Thread mode on the process stack, so
    // PSP points at the caller's hardware-stacked frame, and ExceptionFrame
    // accepts any bit pattern.
    let frame = unsafe { &mut *(psp as *mut ExceptionFrame) };

    // The service number is the immediate byte of the trapping instruction.
    // The stacked PC is the return address, so the `svc` opcode's low byte
    // sits two bytes below it.
    //
    // Safety: the stacked PC points into task text that just executed.
    let nr = unsafe { core::ptr::read_volatile((frame.pc - 2) as *const u8) };

    crate::syscalls::service_entry(nr, frame);
}

// Handler that gets linked into the vector table for PendSV, the deferred
// context switch.
//
// The hardware has stacked the outgoing task's volatile state; we stack the
// callee-saved registers below it, hand the resulting stack pointer to the
// scheduler, and unstack the same layout from whatever stack pointer comes
// back. EXC_RETURN rides in LR and must survive the excursion into Rust.
global_asm! {"
    .section .text.PendSV
    .globl PendSV
    .type PendSV,function
    PendSV:
        mrs r0, psp
        stmdb r0!, {{r4-r11}}
        @ EXC_RETURN must survive the call; r4 is already saved and rides
        @ along to keep the handler stack 8-byte aligned at the call.
        push {{r4, lr}}
        bl pendsv_entry
        pop {{r4, lr}}
        @ r0 is now the incoming task's saved stack pointer.
        ldmia r0!, {{r4-r11}}
        msr psp, r0
        bx lr
"}

/// The Rust side of the PendSV handler, after the callee-saved registers
/// have been parked on the outgoing task's stack.
#[no_mangle]
unsafe extern "C" fn pendsv_entry(old_psp: u32) -> u32 {
    crate::kernel::with_kernel(|k| k.switch_context(old_psp))
}

/// Handler that gets linked into the vector table for the System Tick Timer
/// overflow interrupt.
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    // Load the time before this tick event.
    let t0 = TICKS[0].load(Ordering::Relaxed);
    let t1 = TICKS[1].load(Ordering::Relaxed);

    // Advance the kernel's notion of time by adding 1. Laboriously.
    if let Some(t0p) = t0.checked_add(1) {
        TICKS[0].store(t0p, Ordering::Relaxed);
    } else {
        // Incrementing t0 overflowed. We use normal checked addition for
        // t1, not wrapping, because overflow here would indicate state
        // corruption that we'd like to discover.
        TICKS[0].store(0, Ordering::Relaxed);
        TICKS[1].store(t1 + 1, Ordering::Relaxed);
    }

    // Run the per-tick bookkeeping: usage accounting, sleep countdowns, the
    // periodic usage normalization.
    let switch = crate::kernel::with_kernel(|k| k.tick());

    // If a sleeper woke (and preemption is on), defer a context switch; the
    // entry sequence to this ISR doesn't save state for one.
    if switch != NextTask::Same {
        pend_context_switch();
    }
}

#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn DefaultHandler() {
    // We can cheaply get the identity of the interrupt that called us from
    // the bottom 9 bits of IPSR.
    //
    // Safety: we're just reading the PSR.
    let exception_num = unsafe {
        let ipsr: u32;
        arch::asm!(
            "mrs {}, IPSR",
            out(reg) ipsr,
            options(pure, nomem, preserves_flags, nostack),
        );
        ipsr & 0x1FF
    };
    panic!("unhandled exception {}", exception_num);
}

/// Reads the fault status registers, gated by their valid bits the way the
/// reporters want them.
fn fault_regs() -> crate::fault::FaultRegs {
    // Safety: shared reference to a static-scoped register block.
    let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };
    crate::fault::FaultRegs {
        cfsr: scb.cfsr.read(),
        mmfar: scb.mmfar.read(),
        bfar: scb.bfar.read(),
        msp: cortex_m::register::msp::read(),
        psp: cortex_m::register::psp::read(),
    }
}

// Fault handlers. The fatal three report and never return; the MemManage
// handler implements the best-effort skip-and-reschedule recovery, so it
// patches the stacked frame and comes back like any other handler.

#[allow(non_snake_case)]
#[no_mangle]
unsafe extern "C" fn HardFault() {
    let regs = fault_regs();
    // Safety: frames of faulted tasks stay readable; if the fault came from
    // the kernel the PSP still names the last task frame, which is the most
    // useful thing we can print.
    let frame = unsafe { &*(regs.psp as *const ExceptionFrame) };
    crate::fault::report_fatal(crate::fault::FaultKind::Hard, frame, &regs);
}

#[allow(non_snake_case)]
#[no_mangle]
unsafe extern "C" fn BusFault() {
    let regs = fault_regs();
    // Safety: as in HardFault.
    let frame = unsafe { &*(regs.psp as *const ExceptionFrame) };
    crate::fault::report_fatal(crate::fault::FaultKind::Bus, frame, &regs);
}

#[allow(non_snake_case)]
#[no_mangle]
unsafe extern "C" fn UsageFault() {
    let regs = fault_regs();
    // Safety: as in HardFault.
    let frame = unsafe { &*(regs.psp as *const ExceptionFrame) };
    crate::fault::report_fatal(crate::fault::FaultKind::Usage, frame, &regs);
}

#[allow(non_snake_case)]
#[no_mangle]
unsafe extern "C" fn MemoryManagement() {
    let regs = fault_regs();
    // Safety: a memory-protection fault is taken from a task, so PSP points
    // at its stacked frame, which we are about to patch.
    let frame = unsafe { &mut *(regs.psp as *mut ExceptionFrame) };

    // First halfword of the faulting instruction, for the skip-width
    // decision. The stacked PC of a precise MemManage fault addresses the
    // instruction itself.
    //
    // Safety: the PC points into task text; instruction fetch of it just
    // succeeded or the fault would be a bus error instead.
    let opcode = unsafe { core::ptr::read_volatile(frame.pc as *const u16) };

    crate::fault::recover_memory_fault(frame, &regs, opcode);

    // Clear the MemManage status bits (write-one-to-clear) so the next
    // fault reports fresh state, then hand the CPU to somebody else.
    //
    // Safety: writing CFSR only acknowledges the fault.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        scb.cfsr.write(regs.cfsr & 0xFF);
    }
    pend_context_switch();
}
