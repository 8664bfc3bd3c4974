// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fault reporting and the memory-protection recovery path.
//!
//! Hard, bus, and usage faults are development aids: they identify the
//! offending task, dump its stacked registers and the fault status, and
//! park the CPU. A production system would hang a watchdog reset off this
//! instead.
//!
//! Memory-protection faults get a weak, best-effort recovery: report, skip
//! the faulting instruction, and let the scheduler hand the CPU to someone
//! else. A task that keeps faulting just keeps getting scheduled out; it is
//! expected to be killed from the shell.

use core::fmt::Write;

use crate::arch::ExceptionFrame;
use crate::diag;
use crate::fail;
use crate::kernel::with_kernel;

bitflags::bitflags! {
    /// Bits in the Configurable Fault Status Register.
    #[repr(transparent)]
    pub struct Cfsr: u32 {
        // Bits 0-7: MMFSR (Memory Management Fault Status Register)
        const IACCVIOL = 1 << 0;
        const DACCVIOL = 1 << 1;
        // MMFSR bit 2 reserved
        const MUNSTKERR = 1 << 3;
        const MSTKERR = 1 << 4;
        const MLSPERR = 1 << 5;
        // MMFSR bit 6 reserved
        const MMARVALID = 1 << 7;

        // Bits 8-15: BFSR (Bus Fault Status Register)
        const IBUSERR = 1 << (8 + 0);
        const PRECISERR = 1 << (8 + 1);
        const IMPRECISERR = 1 << (8 + 2);
        const UNSTKERR = 1 << (8 + 3);
        const STKERR = 1 << (8 + 4);
        const LSPERR = 1 << (8 + 5);
        // BFSR bit 6 reserved
        const BFARVALID = 1 << (8 + 7);

        // Bits 16-31: UFSR (Usage Fault Status Register)
        const UNDEFINSTR = 1 << (16 + 0);
        const INVSTATE = 1 << (16 + 1);
        const INVPC = 1 << (16 + 2);
        const NOCP = 1 << (16 + 3);
        const UNALIGNED = 1 << (16 + 8);
        const DIVBYZERO = 1 << (16 + 9);
    }
}

/// Which handler fired. MemManage is absent because it takes the recovery
/// path rather than the fatal one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultKind {
    Hard,
    Bus,
    Usage,
}

impl FaultKind {
    fn label(self) -> &'static str {
        match self {
            FaultKind::Hard => "Hard",
            FaultKind::Bus => "Bus",
            FaultKind::Usage => "Usage",
        }
    }
}

/// Raw status captured at handler entry, collected by `arch` so this module
/// stays free of register access.
#[derive(Copy, Clone, Debug)]
pub struct FaultRegs {
    pub cfsr: u32,
    pub mmfar: u32,
    pub bfar: u32,
    pub msp: u32,
    pub psp: u32,
}

/// How far to advance past a faulting instruction: 4 bytes when the first
/// halfword carries one of the three 32-bit Thumb-2 prefixes (top five bits
/// 11101, 11110, or 11111), else 2. Exotic encodings outside these rules
/// may be mis-skipped; this is a development aid, not an architecture
/// simulator.
pub fn instruction_width(first_halfword: u16) -> u32 {
    match first_halfword >> 11 {
        0b11101 | 0b11110 | 0b11111 => 4,
        _ => 2,
    }
}

fn dump_frame(w: &mut impl Write, frame: &ExceptionFrame) {
    let _ = write!(
        w,
        "PC:   {:#010X}\nxPSR: {:#010X}\nLR:   {:#010X}\n\
         R0:   {:#010X}\nR1:   {:#010X}\nR2:   {:#010X}\n\
         R3:   {:#010X}\nR12:  {:#010X}\n",
        frame.pc,
        frame.xpsr,
        frame.lr,
        frame.r0,
        frame.r1,
        frame.r2,
        frame.r3,
        frame.r12,
    );
}

fn dump_status(w: &mut impl Write, regs: &FaultRegs) {
    let cfsr = Cfsr::from_bits_truncate(regs.cfsr);
    let _ = write!(w, "CFSR: {:#010X}\n", regs.cfsr);
    if cfsr.contains(Cfsr::MMARVALID) {
        let _ = write!(w, "MMFAR: {:#010X}\n", regs.mmfar);
    } else {
        let _ = write!(w, "MMFAR: INVALID\n");
    }
    if cfsr.contains(Cfsr::BFARVALID) {
        let _ = write!(w, "BFAR: {:#010X}\n", regs.bfar);
    } else {
        let _ = write!(w, "BFAR: INVALID\n");
    }
}

/// Fatal path: report everything we know about the stopped task, then die.
pub fn report_fatal(kind: FaultKind, frame: &ExceptionFrame, regs: &FaultRegs) -> ! {
    let pid = with_kernel(|k| k.current_pid());
    let mut w = diag::writer();
    let _ = write!(w, "\n{} fault in process {}\n", kind.label(), pid.0);
    let _ = write!(w, "MSP: {:#010X}\nPSP: {:#010X}\n", regs.msp, regs.psp);
    dump_status(&mut w, regs);
    dump_frame(&mut w, frame);
    fail::die("fatal fault");
}

/// Recovery path for memory-protection faults: report, then advance the
/// stacked PC past the faulting instruction so the task can be scheduled
/// again (and fault again, if it insists). The caller clears the fault
/// status and pends the deferred switch.
pub fn recover_memory_fault(
    frame: &mut ExceptionFrame,
    regs: &FaultRegs,
    first_halfword: u16,
) {
    let pid = with_kernel(|k| k.current_pid());
    let cfsr = Cfsr::from_bits_truncate(regs.cfsr);
    let mut w = diag::writer();
    let _ = write!(w, "\nMPU fault in process {}\n", pid.0);
    let _ = write!(w, "CFSR: {:#010X}\n", regs.cfsr);
    if cfsr.contains(Cfsr::MMARVALID) {
        let _ = write!(w, "MMFAR: {:#010X}\n", regs.mmfar);
    }
    dump_frame(&mut w, frame);

    frame.pc += instruction_width(first_halfword);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halfword_widths() {
        // 16-bit encodings.
        assert_eq!(instruction_width(0x6800), 2); // ldr r0, [r0]
        assert_eq!(instruction_width(0x2000), 2); // movs
        assert_eq!(instruction_width(0x4770), 2); // bx lr
        // 32-bit prefixes: 0b11101, 0b11110, 0b11111.
        assert_eq!(instruction_width(0xE800), 4);
        assert_eq!(instruction_width(0xF000), 4);
        assert_eq!(instruction_width(0xF800), 4);
        // Unconditional branch 0b11100 stays 16-bit.
        assert_eq!(instruction_width(0xE000), 2);
    }

    #[test]
    fn recovery_skips_the_faulting_instruction() {
        let mut frame = ExceptionFrame {
            pc: 0x0000_1000,
            ..Default::default()
        };
        let regs = FaultRegs {
            cfsr: Cfsr::DACCVIOL.bits(),
            mmfar: 0,
            bfar: 0,
            msp: 0,
            psp: 0,
        };
        recover_memory_fault(&mut frame, &regs, 0x6800);
        assert_eq!(frame.pc, 0x0000_1002);
        recover_memory_fault(&mut frame, &regs, 0xF8D0);
        assert_eq!(frame.pc, 0x0000_1006);
    }
}
