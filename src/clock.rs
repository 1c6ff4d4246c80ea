//! Time values derived from the Posix `clock_gettime` functions.
//!
//! - [`monotonic_ms`] - monotonic time in milliseconds, for tick channels
//! - [`monotonic_ns`] - monotonic time in nanoseconds, for deadline pacing
//! - [`epoch`] - wall clock seconds since the Unix epoch

use std::mem::MaybeUninit;

fn gettime(clock: libc::clockid_t) -> libc::timespec {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    // clock_gettime cannot fail for the clocks used here
    unsafe {
        libc::clock_gettime(clock, ts.as_mut_ptr());
        ts.assume_init()
    }
}

/// Monotonic time in milliseconds. Arbitrary reference point, wraps every
/// ~49 days; consumers align on the epoch channel.
#[inline]
pub fn monotonic_ms() -> u32 {
    let ts = gettime(libc::CLOCK_MONOTONIC);
    (ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000) as u32
}

/// Monotonic time in nanoseconds.
#[inline]
pub fn monotonic_ns() -> u64 {
    let ts = gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Wall clock seconds since the Unix epoch.
#[inline]
pub fn epoch() -> i64 {
    gettime(libc::CLOCK_REALTIME).tv_sec as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_is_nondecreasing() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }

    #[test]
    fn epoch_is_post_2020() {
        assert!(epoch() > 1_577_836_800);
    }
}
