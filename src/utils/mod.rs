pub mod stream;

use matrixon_timeline_core::TimelineError;
use ruma::MilliSecondsSinceUnixEpoch;

use crate::Result;

pub fn millis_since_unix_epoch() -> u64 {
    MilliSecondsSinceUnixEpoch::now().get().into()
}

/// Parses the bytes into an u64.
pub fn u64_from_bytes(bytes: &[u8]) -> Result<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| TimelineError::bad_database("Expected 8 bytes for a u64."))?;
    Ok(u64::from_be_bytes(array))
}

/// Parses the bytes into a string.
pub fn string_from_bytes(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| TimelineError::bad_database("Invalid unicode bytes in database."))
}
