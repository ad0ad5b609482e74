use std::fmt;

/// Size of one raw event frame in bytes: four little-endian `u64` fields.
pub const EVENT_FRAME_SIZE: usize = 32;

/// A single observed syscall occurrence.
///
/// Field order matches the raw frame layout: timestamp, handle, context, value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyscallEvent {
    /// Monotonic timestamp in nanoseconds, non-decreasing per context.
    pub timestamp_ns: u64,
    /// Handle id the syscall operated on (e.g. a file descriptor).
    pub handle: u64,
    /// Execution context that observed the call (e.g. a CPU id).
    pub context: u64,
    /// Value carried by the call (e.g. the requested byte count).
    pub value: u64,
}

impl SyscallEvent {
    pub const fn new(timestamp_ns: u64, handle: u64, context: u64, value: u64) -> Self {
        Self {
            timestamp_ns,
            handle,
            context,
            value,
        }
    }

    /// Returns the aggregation bucket this event belongs to.
    #[inline]
    pub const fn key(&self) -> GroupKey {
        GroupKey {
            handle: self.handle,
            context: self.context,
        }
    }

    /// Encodes the event as a little-endian raw frame.
    pub fn to_frame(&self) -> [u8; EVENT_FRAME_SIZE] {
        let mut frame = [0u8; EVENT_FRAME_SIZE];
        frame[0..8].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        frame[8..16].copy_from_slice(&self.handle.to_le_bytes());
        frame[16..24].copy_from_slice(&self.context.to_le_bytes());
        frame[24..32].copy_from_slice(&self.value.to_le_bytes());
        frame
    }
}

/// Group-by key identifying one aggregation bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct GroupKey {
    pub handle: u64,
    pub context: u64,
}

impl GroupKey {
    pub const fn new(handle: u64, context: u64) -> Self {
        Self { handle, context }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.handle, self.context)
    }
}
