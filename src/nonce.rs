//! Nonce and timestamp utilities for the wire protocol.

use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

// Per-process sequence mixed into nonces so rapid calls never collide.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Gets the current Unix timestamp (seconds since January 1, 1970 00:00:00 UTC).
///
/// # Panics
///
/// If the system clock is set to a time before the Unix epoch
/// (January 1, 1970), which is extremely unlikely on modern systems.
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time is before the Unix epoch")
        .as_secs() as i64
}

/// Generates a 64-bit nonce for use in bitcoin p2p version and ping messages.
///
/// This function creates a reasonably unique nonce without requiring a `rand`
/// crate. While *not* cryptographically secure, it is suitable for the
/// protocol's connection loop detection and ping/pong matching.
pub fn generate_nonce() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_nanos() as u64;

    // Mix in the process ID and a sequence counter for additional entropy.
    let pid = process::id() as u64;
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);

    mix(now ^ pid.rotate_left(32) ^ sequence.rotate_left(48))
}

/// Picks a pseudo-random index below `upper`.
///
/// Used for address pool sampling, where uniformity matters more than
/// unpredictability.
pub(crate) fn random_index(upper: usize) -> usize {
    debug_assert!(upper > 0);
    (generate_nonce() % upper as u64) as usize
}

// xorshift finalizer, spreads low-entropy time bits across the word.
fn mix(mut value: u64) -> u64 {
    value ^= value >> 33;
    value = value.wrapping_mul(0xff51_afd7_ed55_8ccd);
    value ^= value >> 33;
    value = value.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    value ^ (value >> 33)
}
