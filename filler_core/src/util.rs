//! Poll-window helpers shared by every wait loop.

use std::time::Duration;

/// Number of milliseconds in one second.
pub const MILLIS_PER_SEC: u64 = 1_000;

/// Default poll increment for device waits.
pub const DEFAULT_POLL: Duration = Duration::from_millis(100);

/// Upper bound for the payload line that follows a payload-bearing opcode.
pub const PAYLOAD_LINE_TIMEOUT: Duration = Duration::from_millis(MILLIS_PER_SEC);

/// Longest line kept from a device before the rest is dropped.
pub const MAX_LINE_LEN: usize = 256;

/// Total wall-clock window covered by `attempts` polls of `poll`.
#[inline]
pub fn window(poll: Duration, attempts: u32) -> Duration {
    poll.saturating_mul(attempts)
}
