//! Small helpers shared across the engine.

use std::time::Duration;

/// Monotonic, wall-clock-free timestamp in milliseconds, as required for all
/// `HOLD_TTL`/`INITIAL_WINDOW` comparisons (§9 "Time"). Callers pass the
/// resulting value down explicitly (see `Keystroke::at_millis`,
/// `HostEvent::at_millis`) rather than having deeper components read the
/// clock themselves, which is what keeps the Correlator's decision
/// functions pure and trivially testable.
pub fn monotonic_millis() -> u64 {
    // SAFETY: `clock_gettime` with `CLOCK_MONOTONIC` only writes into `ts`
    // and never fails for this clock id on a supported target.
    let ts = unsafe {
        let mut ts: libc::timespec = std::mem::zeroed();
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        ts
    };
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32).as_millis() as u64
}

/// Crate version string, as reported by the `VersionRequest` control command.
pub fn version() -> String {
    env!("CARGO_PKG_VERSION").to_owned()
}
