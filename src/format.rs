//! Wire formats for probe records.
//!
//! Two layouts exist, both little-endian:
//!
//! * Default: `[i32 count][i64 timestamp_millis]`, 12 bytes per record, no
//!   file header.
//! * Compressed: an 8-byte file header `[i64 cycle_start_millis | sign bit]`
//!   followed by `[i32 count][i32 delta_millis]` records of 8 bytes, where a
//!   zero count or zero delta has its sign bit forced on.
//!
//! The sign-bit forcing guarantees that no live record is all-zero, which is
//! the sentinel crash recovery relies on: unwritten mapped memory is always
//! zero-filled, so the first all-zero slot marks the end of valid data.

use serde::{Deserialize, Serialize};

use crate::error::{ProbeError, ProbeResult};

pub(crate) const DEFAULT_RECORD_SIZE: usize = 12;
pub(crate) const COMPRESSED_RECORD_SIZE: usize = 8;
pub(crate) const COMPRESSED_HEADER_SIZE: usize = 8;

const SIGN_BIT_I32: i32 = i32::MIN;
const SIGN_BIT_I64: i64 = i64::MIN;

/// One sampled `(size, timestamp)` observation of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Probe {
    pub count: i32,
    pub timestamp_millis: i64,
}

/// On-disk record layout selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// Absolute timestamps, 12 bytes per record.
    Default,
    /// Cycle-relative timestamp deltas, 8 bytes per record plus an 8-byte
    /// file header.
    Compressed,
}

impl WireFormat {
    pub fn from_config(disable_compression: bool) -> Self {
        if disable_compression {
            WireFormat::Default
        } else {
            WireFormat::Compressed
        }
    }

    #[inline]
    pub const fn record_size(self) -> usize {
        match self {
            WireFormat::Default => DEFAULT_RECORD_SIZE,
            WireFormat::Compressed => COMPRESSED_RECORD_SIZE,
        }
    }

    #[inline]
    pub const fn header_size(self) -> usize {
        match self {
            WireFormat::Default => 0,
            WireFormat::Compressed => COMPRESSED_HEADER_SIZE,
        }
    }

    /// Encodes one probe into `buf` (which must be `record_size()` long).
    pub fn encode(self, count: i32, timestamp_millis: i64, cycle_start: i64, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), self.record_size());
        match self {
            WireFormat::Default => {
                buf[0..4].copy_from_slice(&count.to_le_bytes());
                buf[4..12].copy_from_slice(&timestamp_millis.to_le_bytes());
            }
            WireFormat::Compressed => {
                let delta = (timestamp_millis - cycle_start).clamp(0, i32::MAX as i64) as i32;
                buf[0..4].copy_from_slice(&force_nonzero_i32(count).to_le_bytes());
                buf[4..8].copy_from_slice(&force_nonzero_i32(delta).to_le_bytes());
            }
        }
    }

    /// Decodes one record from `bytes` into `probe`.
    pub fn decode(self, bytes: &[u8], cycle_start: i64, probe: &mut Probe) {
        debug_assert_eq!(bytes.len(), self.record_size());
        match self {
            WireFormat::Default => {
                probe.count = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
                probe.timestamp_millis = i64::from_le_bytes(bytes[4..12].try_into().unwrap());
            }
            WireFormat::Compressed => {
                let raw_count = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
                let raw_delta = i32::from_le_bytes(bytes[4..8].try_into().unwrap());
                probe.count = strip_sign_i32(raw_count);
                probe.timestamp_millis = cycle_start + strip_sign_i32(raw_delta) as i64;
            }
        }
    }

    /// Whether the trailing record slot holds a syntactically complete
    /// record. Used during recovery to validate the boundary found by the
    /// free-slot search.
    ///
    /// Default format: the count field may legitimately be zero, so only the
    /// timestamp field is required to be non-zero (a torn write leaves it
    /// zeroed). Compressed format: both fields carry forced sign bits, so
    /// both must be non-zero.
    pub fn trailing_record_valid(self, bytes: &[u8]) -> bool {
        debug_assert_eq!(bytes.len(), self.record_size());
        match self {
            WireFormat::Default => bytes[4..12] != [0u8; 8],
            WireFormat::Compressed => bytes[0..4] != [0u8; 4] && bytes[4..8] != [0u8; 4],
        }
    }
}

#[inline]
fn force_nonzero_i32(value: i32) -> i32 {
    if value == 0 { SIGN_BIT_I32 } else { value }
}

#[inline]
fn strip_sign_i32(raw: i32) -> i32 {
    if raw & SIGN_BIT_I32 != 0 {
        raw & i32::MAX
    } else {
        raw
    }
}

/// Encodes the compressed-file header: the cycle start timestamp with its
/// sign bit forced on, marking the file as compressed.
pub fn encode_compressed_header(cycle_start_millis: i64) -> [u8; COMPRESSED_HEADER_SIZE] {
    (cycle_start_millis | SIGN_BIT_I64).to_le_bytes()
}

/// Decodes a compressed-file header, returning the cycle start timestamp.
pub fn decode_compressed_header(bytes: &[u8]) -> ProbeResult<i64> {
    if bytes.len() < COMPRESSED_HEADER_SIZE {
        return Err(ProbeError::corruption("file too small for compressed header"));
    }
    let raw = i64::from_le_bytes(bytes[0..COMPRESSED_HEADER_SIZE].try_into().unwrap());
    if raw & SIGN_BIT_I64 == 0 {
        return Err(ProbeError::corruption("not a compressed probe file"));
    }
    Ok(raw & i64::MAX)
}
