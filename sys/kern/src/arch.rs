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
//! Each implementation exports the same names: the interrupt-mask register
//! operations backing the gate in `irq`, the kernel clock, context-switch
//! requests, new-thread stack initialization, and the boot hand-off into the
//! first thread.

cfg_if::cfg_if! {
    if #[cfg(any(armv6m, armv7m, armv8m))] {
        #[macro_use]
        pub mod arm_m;
        pub use arm_m::*;
    } else if #[cfg(target_os = "none")] {
        compile_error!("support for this architecture not implemented");
    } else {
        // Not a bare-metal build: this is the host, building for tests.
        #[macro_use]
        pub mod fake;
        pub use fake::*;
    }
}
