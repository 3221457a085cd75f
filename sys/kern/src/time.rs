// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of kernel time.

/// Nanoseconds of kernel time added per system tick (the tick timer runs at
/// 1 kHz).
pub const NANOS_PER_TICK: u64 = 1_000_000;

/// In-kernel timestamp representation: nanoseconds since boot.
///
/// The value only ever advances in `NANOS_PER_TICK` steps, but deadlines may
/// land between ticks; comparisons take care of rounding sleepers up to the
/// tick that satisfies them.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Timestamp(0);

    /// Deadline arithmetic saturates rather than wraps; a deadline past the
    /// end of a u64 of nanoseconds (585 years) is as good as forever.
    pub fn saturating_add_nanos(self, nanos: u64) -> Self {
        Timestamp(self.0.saturating_add(nanos))
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<[u32; 2]> for Timestamp {
    fn from(v: [u32; 2]) -> Self {
        Self::from(u64::from(v[0]) | u64::from(v[1]) << 32)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}
