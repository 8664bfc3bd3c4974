// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same
//! set of names. On anything that isn't a 32-bit ARM M-profile target we
//! substitute `fake`, a recording test double that lets the rest of the
//! kernel build and run under the host test harness.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

/// The eight words the hardware stacks on exception entry, in stacking
/// order. On an SVC from a task, this sits at the top of the task's private
/// stack and is the only safe place to read the caller's arguments or write
/// its results.
///
/// The context switcher also fabricates one of these (below eight dummy
/// callee-saved words) when dispatching a task that has never run.
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Default)]
#[repr(C)]
pub struct ExceptionFrame {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub pc: u32,
    pub xpsr: u32,
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "arm", target_os = "none"))] {
        #[macro_use]
        pub mod arm_m;
        pub use arm_m::*;
    } else {
        #[macro_use]
        pub mod fake;
        pub use fake::*;
    }
}
