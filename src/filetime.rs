//! Conversion between [`SystemTime`] and the Windows `FILETIME` 64-bit ticks
//! (100ns intervals since 1601-01-01 UTC) stored in [`crate::format::Entry`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Number of 100ns ticks between the Windows epoch (1601-01-01) and the Unix
/// epoch (1970-01-01).
const TICKS_TO_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

/// Converts a `SystemTime` to Windows FILETIME ticks. Times before the Unix
/// epoch saturate to 0.
pub fn to_filetime(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since_epoch) => {
            let ticks = since_epoch.as_nanos() / 100;
            (ticks as u64).saturating_add(TICKS_TO_UNIX_EPOCH)
        }
        Err(_) => 0,
    }
}

/// Converts Windows FILETIME ticks to a `SystemTime`.
pub fn from_filetime(ticks: u64) -> SystemTime {
    let unix_ticks = ticks.saturating_sub(TICKS_TO_UNIX_EPOCH);
    UNIX_EPOCH + Duration::from_nanos(unix_ticks * 100)
}
