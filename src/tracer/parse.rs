//! Event parsing for raw syscall event frames.
//!
//! Decodes byte slices into typed [`SyscallEvent`] values. The length check
//! happens once per frame, then fixed-width reads use unaligned loads.

use thiserror::Error;

use super::event::{SyscallEvent, EVENT_FRAME_SIZE};

/// Errors that can occur during event parsing.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("event too short: {size} bytes")]
    Truncated { size: usize },

    #[error("event stream has {trailing} trailing bytes after the last whole frame")]
    TrailingBytes { trailing: usize },
}

/// Parse one raw frame into a [`SyscallEvent`].
///
/// Bytes beyond the first frame are ignored.
pub fn parse_event(data: &[u8]) -> Result<SyscallEvent, ParseError> {
    if data.len() < EVENT_FRAME_SIZE {
        return Err(ParseError::Truncated { size: data.len() });
    }

    Ok(SyscallEvent {
        timestamp_ns: read_u64_le(data, 0),
        handle: read_u64_le(data, 8),
        context: read_u64_le(data, 16),
        value: read_u64_le(data, 24),
    })
}

/// Parse a contiguous run of frames.
///
/// Fails without yielding anything if the buffer is not a whole number of
/// frames.
pub fn parse_events(data: &[u8]) -> Result<impl Iterator<Item = SyscallEvent> + '_, ParseError> {
    let trailing = data.len() % EVENT_FRAME_SIZE;
    if trailing != 0 {
        return Err(ParseError::TrailingBytes { trailing });
    }

    Ok(data.chunks_exact(EVENT_FRAME_SIZE).map(|frame| SyscallEvent {
        timestamp_ns: read_u64_le(frame, 0),
        handle: read_u64_le(frame, 8),
        context: read_u64_le(frame, 16),
        value: read_u64_le(frame, 24),
    }))
}

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_fixed::<8>(data, offset))
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    debug_assert!(offset + N <= data.len());
    // Safety: callers ensure `offset + N <= data.len()` via the upfront frame check.
    unsafe { (data.as_ptr().add(offset) as *const [u8; N]).read_unaligned() }
}
